mod boxed;
mod udpsocket;

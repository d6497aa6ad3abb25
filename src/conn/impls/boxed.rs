use std::net::SocketAddr;

use crate::conn::Connection;

impl<E> Connection for Box<dyn Connection<Error = E>> {
    type Error = E;

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Self::Error> {
        (**self).recv(buf)
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), Self::Error> {
        (**self).send_to(buf, addr)
    }

    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        (**self).on_session_start()
    }
}

impl<E> Connection for Box<dyn Connection<Error = E> + Send> {
    type Error = E;

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Self::Error> {
        (**self).recv(buf)
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), Self::Error> {
        (**self).send_to(buf, addr)
    }

    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        (**self).on_session_start()
    }
}

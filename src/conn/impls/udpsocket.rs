use std::io;
use std::net::{SocketAddr, UdpSocket};

use crate::conn::Connection;

impl Connection for UdpSocket {
    type Error = io::Error;

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Self::Error> {
        match self.recv_from(buf) {
            Ok(res) => Ok(Some(res)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from an earlier send, on some platforms
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), Self::Error> {
        let n = UdpSocket::send_to(self, buf, addr)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram was truncated",
            ));
        }
        Ok(())
    }

    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        self.set_nonblocking(true)
    }
}

//! Traits to send and receive KDP datagrams.

mod impls;

use std::net::SocketAddr;

/// A datagram transport for KDP packets.
///
/// This trait is automatically implemented for
/// [`UdpSocket`](std::net::UdpSocket), and for boxed `dyn Connection` trait
/// objects.
pub trait Connection {
    /// Transport-specific error type.
    type Error;

    /// Receive a single datagram into `buf`, returning its length and source
    /// address.
    ///
    /// This MUST be a **non-blocking** operation, returning `None` if no
    /// datagram is available. Datagrams larger than `buf` may be truncated.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Self::Error>;

    /// Send `buf` as a single datagram to `addr`.
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), Self::Error>;

    /// Called at the start of a debugging session _before_ any KDP packets
    /// have been sent/received.
    ///
    /// This method's default implementation is a no-op.
    ///
    /// # Example
    ///
    /// The `on_session_start` implementation for `UdpSocket` switches the
    /// socket to non-blocking mode, as required by [`Connection::recv`].
    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

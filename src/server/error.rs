use core::fmt::{self, Debug, Display};

use crate::protocol::{Direction, Kind, PacketError};
use crate::target::TargetError;

use super::SessionState;

/// An error which ends a KDP session.
#[derive(Debug)]
#[non_exhaustive]
pub enum ServerError<C> {
    /// Connection Error while initializing the session.
    ConnectionInit(C),
    /// Connection Error while receiving a request.
    ConnectionRead(C),
    /// Connection Error while sending a reply or a notification.
    ConnectionWrite(C),
}

impl<C: Debug> Display for ServerError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::ServerError::*;
        match self {
            ConnectionInit(e) => {
                write!(f, "Connection Error while initializing the session: {:?}", e)
            }
            ConnectionRead(e) => write!(f, "Connection Error while receiving request: {:?}", e),
            ConnectionWrite(e) => write!(f, "Connection Error while sending packet: {:?}", e),
        }
    }
}

impl<C: Debug> std::error::Error for ServerError<C> {}

/// Why a single datagram was dropped without a reply.
///
/// These never end the session: the server logs them, and counts them in
/// [`KdpServer::dropped_packets`](super::KdpServer::dropped_packets).
#[derive(Debug)]
#[non_exhaustive]
pub enum RequestError<E> {
    /// The datagram could not be decoded.
    Malformed(PacketError),
    /// The request is not legal in the current session state.
    ProtocolViolation {
        /// Request kind.
        kind: Kind,
        /// Session state when the request arrived.
        state: SessionState,
    },
    /// The request is well-formed, but not served.
    Unsupported {
        /// Packet direction.
        direction: Direction,
        /// Packet kind.
        kind: Kind,
    },
    /// The target failed to carry out the request.
    Target(TargetError<E>),
}

impl<E> From<PacketError> for RequestError<E> {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::Unsupported { direction, kind } => {
                RequestError::Unsupported { direction, kind }
            }
            e => RequestError::Malformed(e),
        }
    }
}

impl<E> From<TargetError<E>> for RequestError<E> {
    fn from(e: TargetError<E>) -> Self {
        RequestError::Target(e)
    }
}

impl<E: Debug> Display for RequestError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::RequestError::*;
        match self {
            Malformed(e) => write!(f, "malformed packet: {}", e),
            ProtocolViolation { kind, state } => {
                write!(f, "{} is not allowed while {:?}", kind, state)
            }
            Unsupported { direction, kind } => write!(f, "unsupported {} {:?}", kind, direction),
            Target(e) => write!(f, "target error: {}", e),
        }
    }
}

impl<E: Debug> std::error::Error for RequestError<E> {}

use core::fmt::{self, Display};
use std::time::Duration;

use crate::conn::Connection;
use crate::protocol::{HEADER_SIZE, MAX_KDP_DATA_SIZE, MAX_KDP_PKT_SIZE};

use super::session::Session;
use super::KdpServer;

/// Session key stamped on `EXCEPTION` notifications.
pub const DEFAULT_SESSION_KEY: u32 = 0x1337;

/// Fixed fields preceding the payload of a `WRITEMEM64` request.
const WRITEMEM64_FIELDS: usize = 8 + 4;

/// An error which may occur when building a [`KdpServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderError {
    /// The receive buffer cannot hold a `WRITEMEM64` request carrying the
    /// maximum payload.
    BufferTooSmall {
        /// Configured buffer size.
        size: usize,
        /// Smallest acceptable buffer size.
        required: usize,
    },
    /// The maximum payload exceeds what KDP clients may request.
    PayloadTooLarge(usize),
}

impl Display for BuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::BuilderError::*;
        match self {
            BufferTooSmall { size, required } => write!(
                f,
                "receive buffer of {} bytes is too small (need at least {})",
                size, required
            ),
            PayloadTooLarge(size) => write!(
                f,
                "maximum payload of {} bytes is larger than {}",
                size, MAX_KDP_DATA_SIZE
            ),
        }
    }
}

impl std::error::Error for BuilderError {}

/// Helper to construct and customize [`KdpServer`].
pub struct KdpServerBuilder<C: Connection> {
    conn: C,
    session_key: u32,
    poll_interval: Duration,
    buffer_size: usize,
    max_payload: usize,
}

impl<C: Connection> KdpServerBuilder<C> {
    /// Create a new `KdpServerBuilder` using the provided Connection.
    pub fn new(conn: C) -> KdpServerBuilder<C> {
        KdpServerBuilder {
            conn,
            session_key: DEFAULT_SESSION_KEY,
            poll_interval: Duration::from_millis(10),
            buffer_size: MAX_KDP_PKT_SIZE,
            max_payload: MAX_KDP_DATA_SIZE,
        }
    }

    /// Key stamped on `EXCEPTION` notifications. Defaults to `0x1337`.
    pub fn session_key(mut self, key: u32) -> Self {
        self.session_key = key;
        self
    }

    /// How long to sleep between polls when idle. Defaults to 10ms.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Size of the receive buffer. Defaults to 1200 bytes.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Largest `READMEM64` / `WRITEMEM64` payload served. Defaults to 1024
    /// bytes.
    pub fn max_payload(mut self, size: usize) -> Self {
        self.max_payload = size;
        self
    }

    /// Build the KdpServer, returning an error if something went wrong.
    pub fn build(self) -> Result<KdpServer<C>, BuilderError> {
        if self.max_payload > MAX_KDP_DATA_SIZE {
            return Err(BuilderError::PayloadTooLarge(self.max_payload));
        }

        let required = HEADER_SIZE + WRITEMEM64_FIELDS + self.max_payload;
        if self.buffer_size < required {
            return Err(BuilderError::BufferTooSmall {
                size: self.buffer_size,
                required,
            });
        }

        Ok(KdpServer {
            conn: self.conn,
            buf: vec![0; self.buffer_size],
            session_key: self.session_key,
            poll_interval: self.poll_interval,
            max_payload: self.max_payload,
            session: Session::new(),
            dropped_packets: 0,
        })
    }
}

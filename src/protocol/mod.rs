//! The KDP wire format: header layout, request kinds, reply error codes and
//! the per-kind body tables.
//!
//! Source: <https://github.com/apple/darwin-xnu/blob/xnu-4903.221.2/osfmk/kdp/kdp_protocol.h>

use core::fmt;

use crate::internal::LeBytes;

mod bodies;
mod fields;
mod packet;

pub use bodies::*;
pub use packet::{Packet, PacketError, HEADER_SIZE};

/// UDP port a KDP-speaking kernel listens on.
pub const KDP_REMOTE_PORT: u16 = 41139;

/// Protocol version reported in `VERSION` replies.
pub const KDP_VERSION: u32 = 12;

/// Largest datagram a KDP peer is expected to send.
pub const MAX_KDP_PKT_SIZE: usize = 1200;

/// Largest memory payload carried by `READMEM64` / `WRITEMEM64`.
pub const MAX_KDP_DATA_SIZE: usize = 1024;

/// Direction of a packet, encoded in the top bit of the header's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the side initiating an exchange.
    Request,
    /// Sent in answer to a request.
    Reply,
}

impl Direction {
    fn bit(self) -> u8 {
        match self {
            Direction::Request => 0,
            Direction::Reply => 1 << 7,
        }
    }

    fn from_type_byte(ty: u8) -> Direction {
        if ty & (1 << 7) != 0 {
            Direction::Reply
        } else {
            Direction::Request
        }
    }
}

macro_rules! kinds {
    ($($kind:ident = $val:literal => $name:literal,)*) => {
        /// KDP operation kind, encoded in the low 7 bits of the header's type
        /// byte.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum Kind {
            $($kind = $val,)*
        }

        impl Kind {
            /// Parse a kind from its 7-bit wire value.
            pub fn from_u8(val: u8) -> Option<Kind> {
                match val {
                    $($val => Some(Kind::$kind),)*
                    _ => None,
                }
            }

            /// The protocol's name for this kind (e.g: `KDP_CONNECT`).
            pub fn name(self) -> &'static str {
                match self {
                    $(Kind::$kind => $name,)*
                }
            }
        }
    };
}

kinds! {
    Connect = 0 => "KDP_CONNECT",
    Disconnect = 1 => "KDP_DISCONNECT",
    HostInfo = 2 => "KDP_HOSTINFO",
    Version = 3 => "KDP_VERSION",
    MaxBytes = 4 => "KDP_MAXBYTES",
    ReadMem = 5 => "KDP_READMEM",
    WriteMem = 6 => "KDP_WRITEMEM",
    ReadRegs = 7 => "KDP_READREGS",
    WriteRegs = 8 => "KDP_WRITEREGS",
    Load = 9 => "KDP_LOAD",
    ImagePath = 10 => "KDP_IMAGEPATH",
    Suspend = 11 => "KDP_SUSPEND",
    ResumeCpus = 12 => "KDP_RESUMECPUS",
    Exception = 13 => "KDP_EXCEPTION",
    Termination = 14 => "KDP_TERMINATION",
    BreakpointSet = 15 => "KDP_BREAKPOINT_SET",
    BreakpointRemove = 16 => "KDP_BREAKPOINT_REMOVE",
    Regions = 17 => "KDP_REGIONS",
    Reattach = 18 => "KDP_REATTACH",
    HostReboot = 19 => "KDP_HOSTREBOOT",
    ReadMem64 = 20 => "KDP_READMEM64",
    WriteMem64 = 21 => "KDP_WRITEMEM64",
    Breakpoint64Set = 22 => "KDP_BREAKPOINT64_SET",
    Breakpoint64Remove = 23 => "KDP_BREAKPOINT64_REMOVE",
    KernelVersion = 24 => "KDP_KERNELVERSION",
    ReadPhysMem64 = 25 => "KDP_READPHYSMEM64",
    WritePhysMem64 = 26 => "KDP_WRITEPHYSMEM64",
    ReadIoPort = 27 => "KDP_READIOPORT",
    WriteIoPort = 28 => "KDP_WRITEIOPORT",
    ReadMsr64 = 29 => "KDP_READMSR64",
    WriteMsr64 = 30 => "KDP_WRITEMSR64",
    DumpInfo = 31 => "KDP_DUMPINFO",
    InvalidRequest = 32 => "KDP_INVALID_REQUEST",
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error code carried by KDP replies.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct KdpError(pub u32);

#[allow(missing_docs)]
#[rustfmt::skip]
impl KdpError {
    pub const NO_ERROR:               Self = Self(0);
    pub const ALREADY_CONNECTED:      Self = Self(1);
    pub const BAD_NBYTES:             Self = Self(2);
    pub const BAD_FLAVOR:             Self = Self(3);
    pub const BAD_ACCESS:             Self = Self(4);
    pub const MAX_BREAKPOINTS:        Self = Self(100);
    pub const BREAKPOINT_NOT_FOUND:   Self = Self(101);
    pub const BREAKPOINT_ALREADY_SET: Self = Self(102);
}

impl fmt::Display for KdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            KdpError::NO_ERROR => "KDPERR_NO_ERROR",
            KdpError::ALREADY_CONNECTED => "KDPERR_ALREADY_CONNECTED",
            KdpError::BAD_NBYTES => "KDPERR_BAD_NBYTES",
            KdpError::BAD_FLAVOR => "KDPERR_BADFLAVOR",
            KdpError::BAD_ACCESS => "KDPERR_BAD_ACCESS",
            KdpError::MAX_BREAKPOINTS => "KDPERR_MAX_BREAKPOINTS",
            KdpError::BREAKPOINT_NOT_FOUND => "KDPERR_BREAKPOINT_NOT_FOUND",
            KdpError::BREAKPOINT_ALREADY_SET => "KDPERR_BREAKPOINT_ALREADY_SET",
            KdpError(other) => return write!(f, "KDPERR_UNKNOWN({})", other),
        };
        f.write_str(name)
    }
}

impl LeBytes for KdpError {
    const SIZE: usize = 4;

    fn write_le(&self, out: &mut Vec<u8>) {
        self.0.write_le(out)
    }

    fn read_le(buf: &[u8]) -> Option<Self> {
        u32::read_le(buf).map(KdpError)
    }
}

bitflags::bitflags! {
    /// Feature bits advertised in `VERSION` replies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// The stub manages breakpoints itself.
        const BP = 1 << 0;
    }
}

impl LeBytes for Features {
    const SIZE: usize = 4;

    fn write_le(&self, out: &mut Vec<u8>) {
        self.bits().write_le(out)
    }

    fn read_le(buf: &[u8]) -> Option<Self> {
        u32::read_le(buf).map(Features::from_bits_retain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_values() {
        assert_eq!(Kind::from_u8(0), Some(Kind::Connect));
        assert_eq!(Kind::from_u8(18), Some(Kind::Reattach));
        assert_eq!(Kind::from_u8(24), Some(Kind::KernelVersion));
        assert_eq!(Kind::from_u8(32), Some(Kind::InvalidRequest));
        assert_eq!(Kind::from_u8(33), None);
        assert_eq!(Kind::Breakpoint64Remove as u8, 23);
    }

    #[test]
    fn error_names() {
        assert_eq!(KdpError::BAD_FLAVOR.to_string(), "KDPERR_BADFLAVOR");
        assert_eq!(KdpError(7).to_string(), "KDPERR_UNKNOWN(7)");
    }

    #[test]
    fn features_keep_unknown_bits() {
        let features = Features::read_le(&[0x03, 0, 0, 0]).unwrap();
        assert!(features.contains(Features::BP));
        assert_eq!(features.bits(), 3);
    }
}

use core::convert::TryFrom;
use core::fmt;

use super::fields::{Reader, Writer};
use super::{Body, Direction, Kind};

/// Size of the fixed packet header: type, seq, len and key.
pub const HEADER_SIZE: usize = 8;

/// Reasons a datagram could not be decoded into (or encoded from) a
/// [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PacketError {
    /// The datagram ended before a field (or the header) was complete.
    Truncated,
    /// The header's `len` does not match the datagram size.
    LengthMismatch {
        /// Length declared in the header.
        declared: usize,
        /// Size of the received datagram.
        actual: usize,
    },
    /// The type byte names no known kind.
    UnknownKind(u8),
    /// The kind is known, but has no body layout for this direction.
    Unsupported {
        /// Direction of the offending packet.
        direction: Direction,
        /// Kind of the offending packet.
        kind: Kind,
    },
    /// A NUL-terminated string field is missing its terminator.
    UnterminatedString,
    /// A string field to be encoded contains a NUL byte.
    InteriorNul,
    /// The body decoded cleanly, but bytes were left over.
    TrailingBytes(usize),
    /// The encoded packet would not fit in the header's `len` field.
    TooLarge(usize),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::PacketError::*;
        match self {
            Truncated => write!(f, "packet is truncated"),
            LengthMismatch { declared, actual } => write!(
                f,
                "header declares {} bytes, but the datagram holds {}",
                declared, actual
            ),
            UnknownKind(kind) => write!(f, "unknown packet kind {}", kind),
            Unsupported { direction, kind } => {
                write!(f, "no body layout for {:?} {}", direction, kind)
            }
            UnterminatedString => write!(f, "string field is missing its NUL terminator"),
            InteriorNul => write!(f, "string field contains a NUL byte"),
            TrailingBytes(n) => write!(f, "{} trailing bytes after packet body", n),
            TooLarge(n) => write!(f, "packet of {} bytes does not fit in a u16 length", n),
        }
    }
}

impl std::error::Error for PacketError {}

/// A KDP packet: header fields plus a typed body.
///
/// The body determines both the packet's kind and its direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number. Replies echo the request's.
    pub seq: u8,
    /// Session key, big endian on the wire.
    pub key: u32,
    /// Kind-specific body.
    pub body: Body,
}

impl Packet {
    /// Create a new packet.
    pub fn new(seq: u8, key: u32, body: impl Into<Body>) -> Packet {
        Packet {
            seq,
            key,
            body: body.into(),
        }
    }

    /// The packet's kind.
    pub fn kind(&self) -> Kind {
        self.body.kind()
    }

    /// The packet's direction.
    pub fn direction(&self) -> Direction {
        self.body.direction()
    }

    /// Exact size of the encoded packet, header included.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.encoded_size()
    }

    /// Serialize the packet into a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let size = self.size();
        let len = u16::try_from(size).map_err(|_| PacketError::TooLarge(size))?;

        let mut w = Writer::with_capacity(size);
        w.put_le(&(self.direction().bit() | self.kind() as u8))?;
        w.put_le(&self.seq)?;
        w.put_le(&len)?;
        w.put_be(&self.key)?;
        self.body.encode(&mut w)?;
        Ok(w.into_inner())
    }

    /// Parse a datagram into a packet.
    ///
    /// The datagram must hold exactly one packet: the header's `len` must
    /// equal `buf.len()`, and the body must consume every byte.
    pub fn decode(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < HEADER_SIZE {
            return Err(PacketError::Truncated);
        }

        let mut r = Reader::new(buf);
        let ty: u8 = r.get_le()?;
        let seq: u8 = r.get_le()?;
        let len: u16 = r.get_le()?;
        let key: u32 = r.get_be()?;

        if len as usize != buf.len() {
            return Err(PacketError::LengthMismatch {
                declared: len as usize,
                actual: buf.len(),
            });
        }

        let direction = Direction::from_type_byte(ty);
        let kind = Kind::from_u8(ty & 0x7f).ok_or(PacketError::UnknownKind(ty & 0x7f))?;
        let body = Body::decode(direction, kind, &mut r)?;

        match r.remaining() {
            0 => Ok(Packet { seq, key, body }),
            n => Err(PacketError::TrailingBytes(n)),
        }
    }
}

/// One-line summary, as used by the `trace-pkt` logs.
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {{seq: {:#x}, key: {:#x}, {:?}}}",
            self.kind(),
            self.seq,
            self.key,
            self.body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::arch::x86_64::ThreadState64;
    use crate::protocol::*;

    fn roundtrip(body: Body) {
        let packet = Packet::new(0x2a, 0x1337, body);
        let buf = packet.encode().unwrap();
        assert_eq!(buf.len(), packet.size());
        assert_eq!(Packet::decode(&buf).unwrap(), packet);
    }

    #[test]
    fn connect_request_layout() {
        let packet = Packet::new(
            3,
            0xdead_beef,
            ConnectRequest {
                req_reply_port: 0x1234,
                exc_note_port: 0x5678,
                greeting: b"hi".to_vec(),
            },
        );

        #[rustfmt::skip]
        let expected = [
            0x00, 0x03, 0x0f, 0x00, 0xde, 0xad, 0xbe, 0xef,
            0x12, 0x34, 0x56, 0x78, b'h', b'i', 0x00,
        ];
        assert_eq!(packet.encode().unwrap(), expected);
    }

    #[test]
    fn reply_direction_bit() {
        let packet = Packet::new(
            0,
            0,
            ConnectReply {
                error: KdpError::NO_ERROR,
            },
        );
        let buf = packet.encode().unwrap();
        assert_eq!(buf[0], 0x80);
        assert_eq!(Packet::decode(&buf).unwrap().direction(), Direction::Reply);
    }

    #[test]
    fn every_body_roundtrips() {
        let state = ThreadState64 {
            rax: 1,
            rip: 0xffff_ff80_0020_1000,
            gs: 0x10,
            ..Default::default()
        };

        let bodies: Vec<Body> = vec![
            ConnectRequest {
                req_reply_port: 55000,
                exc_note_port: 55001,
                greeting: b"lldb".to_vec(),
            }
            .into(),
            ConnectReply {
                error: KdpError::ALREADY_CONNECTED,
            }
            .into(),
            DisconnectRequest {}.into(),
            DisconnectReply {}.into(),
            ReattachRequest {
                req_reply_port: 55000,
            }
            .into(),
            ReattachReply {}.into(),
            HostInfoRequest {}.into(),
            HostInfoReply {
                cpus_mask: 1,
                cpu_type: 0x0100_0007,
                cpu_subtype: 4,
            }
            .into(),
            VersionRequest {}.into(),
            VersionReply {
                version: KDP_VERSION,
                feature: Features::BP,
                pad0: 0,
                pad1: 0,
            }
            .into(),
            ReadMem64Request {
                address: 0xffff_ff80_0000_2010,
                nbytes: 8,
            }
            .into(),
            ReadMem64Reply {
                error: KdpError::NO_ERROR,
                data: vec![1, 2, 3, 0, 5],
            }
            .into(),
            ReadMem64Reply {
                error: KdpError::BAD_ACCESS,
                data: Vec::new(),
            }
            .into(),
            WriteMem64Request {
                address: 0x1000,
                nbytes: 3,
                data: vec![0, 0, 0],
            }
            .into(),
            WriteMem64Reply {
                error: KdpError::NO_ERROR,
            }
            .into(),
            ReadMsr64Request {
                address: 0xc000_0101,
                lcpu: 0,
            }
            .into(),
            ReadMsr64Reply {
                error: KdpError::NO_ERROR,
                data: b"\x01\x02".to_vec(),
            }
            .into(),
            WriteMsr64Request {
                address: 0xc000_0102,
                lcpu: 0,
                data: b"\xff".to_vec(),
            }
            .into(),
            WriteMsr64Reply {
                error: KdpError::NO_ERROR,
            }
            .into(),
            ReadRegsRequest { cpu: 0, flavor: 4 }.into(),
            ReadRegsReply {
                error: KdpError::NO_ERROR,
                state,
            }
            .into(),
            WriteRegsRequest {
                cpu: 0,
                flavor: 4,
                state,
            }
            .into(),
            WriteRegsReply {
                error: KdpError::BAD_FLAVOR,
            }
            .into(),
            ResumeCpusRequest { cpu_mask: 1 }.into(),
            ResumeCpusReply {}.into(),
            Breakpoint64SetRequest { address: 0x4242 }.into(),
            Breakpoint64SetReply {
                error: KdpError::BREAKPOINT_ALREADY_SET,
            }
            .into(),
            Breakpoint64RemoveRequest { address: 0x4242 }.into(),
            Breakpoint64RemoveReply {
                error: KdpError::BREAKPOINT_NOT_FOUND,
            }
            .into(),
            ExceptionRequest {
                n_exc_info: 1,
                cpu: 0,
                exception: 6,
                code: 3,
                subcode: 0,
            }
            .into(),
            ExceptionReply {}.into(),
            KernelVersionRequest {}.into(),
            KernelVersionReply {
                version: b"Darwin Kernel Version 18.0.0; stext=0x0".to_vec(),
            }
            .into(),
        ];

        for body in bodies {
            roundtrip(body);
        }
    }

    #[test]
    fn forged_len() {
        let mut buf = Packet::new(0, 0, HostInfoRequest {}).encode().unwrap();
        buf[2] = 9;
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketError::LengthMismatch {
                declared: 9,
                actual: 8
            })
        );

        // a valid header followed by junk the header does not account for
        buf[2] = 8;
        buf.push(0);
        assert!(matches!(
            Packet::decode(&buf),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn trailing_bytes() {
        let mut buf = Packet::new(0, 0, HostInfoRequest {}).encode().unwrap();
        buf.extend_from_slice(&[0, 0]);
        buf[2] = 10;
        assert_eq!(Packet::decode(&buf), Err(PacketError::TrailingBytes(2)));
    }

    #[test]
    fn truncated_body() {
        let mut buf = Packet::new(0, 0, ReadMem64Request { address: 0, nbytes: 0 })
            .encode()
            .unwrap();
        buf.truncate(12);
        buf[2] = 12;
        assert_eq!(Packet::decode(&buf), Err(PacketError::Truncated));
        assert_eq!(Packet::decode(&buf[..4]), Err(PacketError::Truncated));
    }

    #[test]
    fn unterminated_cstr() {
        let mut buf = Packet::new(0, 0, KernelVersionReply { version: b"x".to_vec() })
            .encode()
            .unwrap();
        buf.pop();
        buf[2] -= 1;
        assert_eq!(Packet::decode(&buf), Err(PacketError::UnterminatedString));
    }

    #[test]
    fn unknown_and_unsupported_kinds() {
        let buf = [0x7f, 0, 8, 0, 0, 0, 0, 0];
        assert_eq!(Packet::decode(&buf), Err(PacketError::UnknownKind(0x7f)));

        let buf = [Kind::Load as u8, 0, 8, 0, 0, 0, 0, 0];
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketError::Unsupported {
                direction: Direction::Request,
                kind: Kind::Load
            })
        );
    }

    #[test]
    fn too_large() {
        let packet = Packet::new(
            0,
            0,
            ReadMem64Reply {
                error: KdpError::NO_ERROR,
                data: vec![0; 0x10000],
            },
        );
        assert_eq!(packet.encode(), Err(PacketError::TooLarge(0x10000 + 12)));
    }
}

use crate::arch::x86_64::ThreadState64;

use super::fields::{self, Reader, Writer};
use super::{Direction, Features, KdpError, Kind, PacketError};

macro_rules! body_struct {
    ($kind:ident $dir:literal $name:ident { $($field:ident : $ty:ty => $enc:ident),* }) => {
        paste::paste! {
            #[doc = concat!("Body of a `", stringify!($kind), "` ", $dir, ".")]
            #[derive(Debug, Clone, PartialEq, Eq)]
            #[allow(missing_docs)]
            pub struct $name {
                $(pub $field: $ty,)*
            }

            impl $name {
                fn encoded_size(&self) -> usize {
                    0 $(+ fields::[<size_ $enc>](&self.$field))*
                }

                #[allow(unused_variables)]
                fn encode(&self, w: &mut Writer) -> Result<(), PacketError> {
                    $(w.[<put_ $enc>](&self.$field)?;)*
                    Ok(())
                }

                #[allow(unused_variables)]
                fn decode(r: &mut Reader<'_>) -> Result<$name, PacketError> {
                    Ok($name {
                        $($field: r.[<get_ $enc>]()?,)*
                    })
                }
            }

            impl From<$name> for Body {
                fn from(body: $name) -> Body {
                    Body::$name(body)
                }
            }
        }
    };
}

/// Declares the body layout of every supported `(direction, kind)` pair.
///
/// Fields are listed in wire order as `name: type => encoding`, where the
/// encoding is one of the `fields` module's `le`, `be`, `bytes` or `cstr`.
macro_rules! bodies {
    ($(
        $kind:ident {
            request $req:ident { $($req_field:ident : $req_ty:ty => $req_enc:ident),* $(,)? }
            reply $rep:ident { $($rep_field:ident : $rep_ty:ty => $rep_enc:ident),* $(,)? }
        }
    )*) => {
        $(
            body_struct!($kind "request" $req { $($req_field: $req_ty => $req_enc),* });
            body_struct!($kind "reply" $rep { $($rep_field: $rep_ty => $rep_enc),* });
        )*

        /// A decoded packet body.
        #[derive(Debug, Clone, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub enum Body {
            $(
                $req($req),
                $rep($rep),
            )*
        }

        impl Body {
            /// The kind of packet this body belongs to.
            pub fn kind(&self) -> Kind {
                match self {
                    $(Body::$req(_) | Body::$rep(_) => Kind::$kind,)*
                }
            }

            /// Whether this body is carried by a request or a reply.
            pub fn direction(&self) -> Direction {
                match self {
                    $(
                        Body::$req(_) => Direction::Request,
                        Body::$rep(_) => Direction::Reply,
                    )*
                }
            }

            pub(super) fn encoded_size(&self) -> usize {
                match self {
                    $(
                        Body::$req(body) => body.encoded_size(),
                        Body::$rep(body) => body.encoded_size(),
                    )*
                }
            }

            pub(super) fn encode(&self, w: &mut Writer) -> Result<(), PacketError> {
                match self {
                    $(
                        Body::$req(body) => body.encode(w),
                        Body::$rep(body) => body.encode(w),
                    )*
                }
            }

            pub(super) fn decode(
                direction: Direction,
                kind: Kind,
                r: &mut Reader<'_>,
            ) -> Result<Body, PacketError> {
                let body = match (direction, kind) {
                    $(
                        (Direction::Request, Kind::$kind) => Body::$req($req::decode(r)?),
                        (Direction::Reply, Kind::$kind) => Body::$rep($rep::decode(r)?),
                    )*
                    (direction, kind) => return Err(PacketError::Unsupported { direction, kind }),
                };
                Ok(body)
            }
        }
    };
}

bodies! {
    Connect {
        request ConnectRequest {
            req_reply_port: u16 => be,
            exc_note_port: u16 => be,
            greeting: Vec<u8> => cstr,
        }
        reply ConnectReply { error: KdpError => le }
    }
    Disconnect {
        request DisconnectRequest {}
        reply DisconnectReply {}
    }
    Reattach {
        request ReattachRequest { req_reply_port: u16 => be }
        reply ReattachReply {}
    }
    HostInfo {
        request HostInfoRequest {}
        reply HostInfoReply {
            cpus_mask: u32 => le,
            cpu_type: u32 => le,
            cpu_subtype: u32 => le,
        }
    }
    Version {
        request VersionRequest {}
        reply VersionReply {
            version: u32 => le,
            feature: Features => le,
            pad0: u32 => le,
            pad1: u32 => le,
        }
    }
    ReadMem64 {
        request ReadMem64Request { address: u64 => le, nbytes: u32 => le }
        reply ReadMem64Reply { error: KdpError => le, data: Vec<u8> => bytes }
    }
    WriteMem64 {
        request WriteMem64Request {
            address: u64 => le,
            nbytes: u32 => le,
            data: Vec<u8> => bytes,
        }
        reply WriteMem64Reply { error: KdpError => le }
    }
    ReadMsr64 {
        request ReadMsr64Request { address: u32 => le, lcpu: u16 => le }
        reply ReadMsr64Reply { error: KdpError => le, data: Vec<u8> => cstr }
    }
    WriteMsr64 {
        request WriteMsr64Request {
            address: u32 => le,
            lcpu: u16 => le,
            data: Vec<u8> => cstr,
        }
        reply WriteMsr64Reply { error: KdpError => le }
    }
    ReadRegs {
        request ReadRegsRequest { cpu: u32 => le, flavor: u32 => le }
        reply ReadRegsReply { error: KdpError => le, state: ThreadState64 => le }
    }
    WriteRegs {
        request WriteRegsRequest {
            cpu: u32 => le,
            flavor: u32 => le,
            state: ThreadState64 => le,
        }
        reply WriteRegsReply { error: KdpError => le }
    }
    ResumeCpus {
        request ResumeCpusRequest { cpu_mask: u32 => le }
        reply ResumeCpusReply {}
    }
    Breakpoint64Set {
        request Breakpoint64SetRequest { address: u64 => le }
        reply Breakpoint64SetReply { error: KdpError => le }
    }
    Breakpoint64Remove {
        request Breakpoint64RemoveRequest { address: u64 => le }
        reply Breakpoint64RemoveReply { error: KdpError => le }
    }
    Exception {
        request ExceptionRequest {
            n_exc_info: u32 => le,
            cpu: u32 => le,
            exception: u32 => le,
            code: u32 => le,
            subcode: u32 => le,
        }
        reply ExceptionReply {}
    }
    KernelVersion {
        request KernelVersionRequest {}
        reply KernelVersionReply { version: Vec<u8> => cstr }
    }
}

use std::net::SocketAddr;

use log::{debug, error, info};

use crate::arch::x86_64::{flavor, ThreadState64};
use crate::conn::Connection;
use crate::protocol::*;
use crate::provider::Provider;
use crate::target::{DebugTarget, TargetError, TargetResult};

use super::error::RequestError;
use super::KdpServer;

type HandlerResult<E> = Result<Option<Body>, RequestError<E>>;

impl<C: Connection> KdpServer<C> {
    /// Serve a single decoded packet, returning the reply body (if any).
    ///
    /// The caller holds the target lock for the whole call.
    pub(super) fn handle_packet<P: Provider>(
        &mut self,
        target: &mut DebugTarget<P>,
        body: Body,
        src: SocketAddr,
    ) -> HandlerResult<P::Error> {
        let kind = body.kind();

        if body.direction() == Direction::Reply {
            return match body {
                Body::ExceptionReply(_) if self.session.is_connected() => Ok(None),
                _ => Err(RequestError::Unsupported {
                    direction: Direction::Reply,
                    kind,
                }),
            };
        }

        if !self.session.allows(kind) {
            return Err(RequestError::ProtocolViolation {
                kind,
                state: self.session.state(),
            });
        }

        let reply: Body = match body {
            Body::ReattachRequest(_) => {
                debug!("client at {}", src);
                self.session.reattach(src);
                ReattachReply {}.into()
            }

            Body::ConnectRequest(req) => {
                target.halt()?;
                target.unset_all_breakpoints()?;
                self.session.connect(req.exc_note_port);
                info!(
                    "client connected: {:?}",
                    String::from_utf8_lossy(&req.greeting)
                );
                ConnectReply {
                    error: KdpError::NO_ERROR,
                }
                .into()
            }

            Body::DisconnectRequest(_) => {
                self.session.disconnect();
                if let Err(e) = clear_breakpoints(target) {
                    error!("could not clear breakpoints on disconnect: {}", e);
                }
                info!("client disconnected");
                DisconnectReply {}.into()
            }

            Body::HostInfoRequest(_) => {
                let info = target.host_info()?;
                HostInfoReply {
                    cpus_mask: info.cpus_mask,
                    cpu_type: info.cpu_type,
                    cpu_subtype: info.cpu_subtype,
                }
                .into()
            }

            Body::VersionRequest(_) => VersionReply {
                version: KDP_VERSION,
                feature: Features::BP,
                pad0: 0,
                pad1: 0,
            }
            .into(),

            Body::ReadRegsRequest(req) => {
                let reply = if req.flavor != flavor::x86_THREAD_STATE64 {
                    debug!("unsupported register flavor {:#x}", req.flavor);
                    ReadRegsReply {
                        error: KdpError::BAD_FLAVOR,
                        state: ThreadState64::default(),
                    }
                } else {
                    ReadRegsReply {
                        error: KdpError::NO_ERROR,
                        state: target.read_thread_state()?,
                    }
                };
                reply.into()
            }

            Body::WriteRegsRequest(req) => {
                let error = if req.flavor != flavor::x86_THREAD_STATE64 {
                    debug!("unsupported register flavor {:#x}", req.flavor);
                    KdpError::BAD_FLAVOR
                } else {
                    target.write_thread_state(&req.state)?;
                    KdpError::NO_ERROR
                };
                WriteRegsReply { error }.into()
            }

            Body::ResumeCpusRequest(_) => {
                target.resume()?;
                ResumeCpusReply {}.into()
            }

            Body::ReadMem64Request(req) => self.read_mem(target, req).into(),
            Body::WriteMem64Request(req) => self.write_mem(target, req).into(),

            Body::Breakpoint64SetRequest(req) => {
                let error = match target.set_soft_breakpoint(req.address) {
                    Ok(_) => KdpError::NO_ERROR,
                    Err(TargetError::BreakpointAlreadySet(_)) => KdpError::BREAKPOINT_ALREADY_SET,
                    Err(TargetError::NoBreakpointRoom) => KdpError::MAX_BREAKPOINTS,
                    Err(e) => return Err(e.into()),
                };
                Breakpoint64SetReply { error }.into()
            }

            Body::Breakpoint64RemoveRequest(req) => {
                let error = match target.unset_soft_breakpoint(req.address) {
                    Ok(()) => KdpError::NO_ERROR,
                    Err(TargetError::BreakpointNotFound(_)) => KdpError::BREAKPOINT_NOT_FOUND,
                    Err(e) => return Err(e.into()),
                };
                Breakpoint64RemoveReply { error }.into()
            }

            Body::KernelVersionRequest(_) => KernelVersionReply {
                version: target.kernel_version()?.into_bytes(),
            }
            .into(),

            _ => {
                return Err(RequestError::Unsupported {
                    direction: Direction::Request,
                    kind,
                })
            }
        };

        Ok(Some(reply))
    }

    fn read_mem<P: Provider>(
        &self,
        target: &mut DebugTarget<P>,
        req: ReadMem64Request,
    ) -> ReadMem64Reply {
        let nbytes = req.nbytes as usize;
        if nbytes > self.max_payload {
            debug!("refusing to read {:#x} bytes", nbytes);
            return ReadMem64Reply {
                error: KdpError::BAD_NBYTES,
                data: Vec::new(),
            };
        }

        match target.read_virtual_memory(req.address, nbytes) {
            Ok(Some(data)) if data.len() == nbytes => ReadMem64Reply {
                error: KdpError::NO_ERROR,
                data,
            },
            Ok(data) => {
                debug!("could not read {:#x} bytes at {:#018x}", nbytes, req.address);
                ReadMem64Reply {
                    error: KdpError::BAD_ACCESS,
                    data: data.unwrap_or_default(),
                }
            }
            Err(e) => {
                error!("reading {:#018x}: {}", req.address, e);
                ReadMem64Reply {
                    error: KdpError::BAD_ACCESS,
                    data: Vec::new(),
                }
            }
        }
    }

    fn write_mem<P: Provider>(
        &self,
        target: &mut DebugTarget<P>,
        req: WriteMem64Request,
    ) -> WriteMem64Reply {
        let nbytes = req.nbytes as usize;
        if nbytes > self.max_payload || nbytes != req.data.len() {
            debug!(
                "refusing to write {:#x} bytes ({:#x} provided)",
                nbytes,
                req.data.len()
            );
            return WriteMem64Reply {
                error: KdpError::BAD_NBYTES,
            };
        }

        let error = match target.write_virtual_memory(req.address, &req.data) {
            Ok(true) => KdpError::NO_ERROR,
            Ok(false) => {
                debug!("could not write {:#x} bytes at {:#018x}", nbytes, req.address);
                KdpError::BAD_ACCESS
            }
            Err(e) => {
                error!("writing {:#018x}: {}", req.address, e);
                KdpError::BAD_ACCESS
            }
        };
        WriteMem64Reply { error }
    }
}

/// Clear every breakpoint, pausing the VM for the duration if it is running.
fn clear_breakpoints<P: Provider>(target: &mut DebugTarget<P>) -> TargetResult<(), P> {
    let running = !target.is_halted()?;
    if running {
        target.halt()?;
    }
    target.unset_all_breakpoints()?;
    if running {
        target.resume()?;
    }
    Ok(())
}

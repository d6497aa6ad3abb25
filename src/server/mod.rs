//! The KDP session server.
//!
//! [`KdpServer`] receives KDP requests over a [`Connection`], serves them
//! using a [`SharedTarget`], and relays the target's exceptions to the client
//! as unsolicited `EXCEPTION` requests.
//!
//! Clients are expected to open the session with `REATTACH` followed by
//! `CONNECT`, as LLDB does. Anything else arriving outside of a connected
//! session is dropped.

use std::net::SocketAddr;
use std::time::Duration;

use log::{error, warn};

use crate::conn::Connection;
use crate::protocol::{ExceptionRequest, Packet};
use crate::provider::Provider;
use crate::target::{DebugTarget, SharedTarget, TargetResult};
use crate::xnu::Exception;

mod builder;
mod core_impl;
mod error;
mod session;

pub use builder::{BuilderError, KdpServerBuilder, DEFAULT_SESSION_KEY};
pub use error::{RequestError, ServerError};
pub use session::SessionState;

use session::Session;

/// Serve a single KDP client over a given [`Connection`].
pub struct KdpServer<C: Connection> {
    conn: C,
    buf: Vec<u8>,
    session_key: u32,
    poll_interval: Duration,
    max_payload: usize,
    session: Session,
    dropped_packets: usize,
}

impl<C: Connection> KdpServer<C> {
    /// Create a [`KdpServerBuilder`] using the provided Connection.
    pub fn builder(conn: C) -> KdpServerBuilder<C> {
        KdpServerBuilder::new(conn)
    }

    /// Returns a mutable reference to the underlying connection.
    pub fn borrow_conn(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Current session state.
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Number of datagrams dropped without a reply so far: malformed packets,
    /// protocol violations, unsupported requests and failed requests.
    pub fn dropped_packets(&self) -> usize {
        self.dropped_packets
    }

    /// Serve the client until it disconnects.
    ///
    /// Each iteration handles at most one inbound packet, and relays at most
    /// one exception. The loop sleeps for the configured poll interval
    /// whenever no datagram was waiting.
    pub fn run<P: Provider>(
        &mut self,
        target: &SharedTarget<P>,
    ) -> Result<(), ServerError<C::Error>> {
        self.conn
            .on_session_start()
            .map_err(ServerError::ConnectionInit)?;

        while !self.session.is_finished() {
            if !self.poll(target)? {
                std::thread::sleep(self.poll_interval);
            }
        }
        Ok(())
    }

    /// Run a single iteration of the server loop, without blocking.
    ///
    /// Returns `true` if a datagram was received.
    pub fn poll<P: Provider>(
        &mut self,
        target: &SharedTarget<P>,
    ) -> Result<bool, ServerError<C::Error>> {
        let received = match self
            .conn
            .recv(&mut self.buf)
            .map_err(ServerError::ConnectionRead)?
        {
            Some((len, src)) => {
                self.process_datagram(target, len, src)?;
                true
            }
            None => false,
        };

        self.relay_exception(target)?;
        Ok(received)
    }

    fn process_datagram<P: Provider>(
        &mut self,
        target: &SharedTarget<P>,
        len: usize,
        src: SocketAddr,
    ) -> Result<(), ServerError<C::Error>> {
        let pkt = match Packet::decode(&self.buf[..len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                self.drop_packet(RequestError::<P::Error>::from(e));
                return Ok(());
            }
        };
        log_packet("<--", &pkt);

        let (seq, key) = (pkt.seq, pkt.key);
        let res = {
            let mut target = target.lock();
            self.handle_packet(&mut target, pkt.body, src)
        };

        match res {
            Ok(Some(body)) => {
                let dst = self.session.reply_addr().unwrap_or(src);
                self.send(dst, &Packet::new(seq, key, body))
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.drop_packet(e);
                Ok(())
            }
        }
    }

    fn relay_exception<P: Provider>(
        &mut self,
        target: &SharedTarget<P>,
    ) -> Result<(), ServerError<C::Error>> {
        if !self.session.is_connected() {
            return Ok(());
        }

        let exception = match pending_exception(&mut target.lock()) {
            Ok(Some(exception)) => exception,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!("could not query target state: {}", e);
                return Ok(());
            }
        };

        let dst = match self.session.exception_addr() {
            Some(dst) => dst,
            None => return Ok(()),
        };
        let seq = self.session.next_exception_seq();
        let body = ExceptionRequest {
            n_exc_info: 1,
            cpu: 0,
            exception: exception.exception,
            code: exception.code,
            subcode: exception.subcode,
        };
        self.send(dst, &Packet::new(seq, self.session_key, body))
    }

    fn send(&mut self, dst: SocketAddr, pkt: &Packet) -> Result<(), ServerError<C::Error>> {
        let buf = match pkt.encode() {
            Ok(buf) => buf,
            Err(e) => {
                warn!("could not encode {}: {}", pkt.kind(), e);
                self.dropped_packets += 1;
                return Ok(());
            }
        };
        log_packet("-->", pkt);
        self.conn
            .send_to(&buf, dst)
            .map_err(ServerError::ConnectionWrite)
    }

    fn drop_packet<E: core::fmt::Debug>(&mut self, e: RequestError<E>) {
        self.dropped_packets += 1;
        match e {
            RequestError::Target(e) => error!("dropping request: {}", e),
            e => warn!("dropping packet: {}", e),
        }
    }
}

/// The exception to report, if the target changed state since the last call.
fn pending_exception<P: Provider>(
    target: &mut DebugTarget<P>,
) -> TargetResult<Option<Exception>, P> {
    if !target.is_state_changed()? {
        return Ok(None);
    }
    let (_, exception) = target.state()?;
    Ok(exception)
}

fn log_packet(direction: &str, pkt: &Packet) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "trace-pkt")] {
            log::trace!("{} {}", direction, pkt);
        } else {
            let _ = (direction, pkt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::convert::Infallible;

    use crate::arch::x86_64::{flavor, Register, ThreadState64};
    use crate::protocol::*;
    use crate::provider::sim::{SimVm, Step};
    use crate::target::fixtures::*;

    const CLIENT: &str = "127.0.0.1:50000";
    const EXC_PORT: u16 = 50001;

    #[derive(Default)]
    struct MockConn {
        inbox: VecDeque<(Vec<u8>, SocketAddr)>,
        sent: Vec<(SocketAddr, Packet)>,
        started: bool,
    }

    impl Connection for MockConn {
        type Error = Infallible;

        fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Infallible> {
            Ok(self.inbox.pop_front().map(|(data, src)| {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                (len, src)
            }))
        }

        fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), Infallible> {
            self.sent.push((addr, Packet::decode(buf).unwrap()));
            Ok(())
        }

        fn on_session_start(&mut self) -> Result<(), Infallible> {
            self.started = true;
            Ok(())
        }
    }

    struct Harness {
        server: KdpServer<MockConn>,
        target: SharedTarget<SimVm>,
        seq: u8,
    }

    impl Harness {
        fn new(target: DebugTarget<SimVm>) -> Harness {
            let _ = pretty_env_logger::try_init();
            Harness {
                server: KdpServer::builder(MockConn::default()).build().unwrap(),
                target: SharedTarget::new(target),
                seq: 0,
            }
        }

        fn client() -> SocketAddr {
            CLIENT.parse().unwrap()
        }

        fn push_raw(&mut self, data: Vec<u8>) {
            self.server
                .borrow_conn()
                .inbox
                .push_back((data, Harness::client()));
        }

        fn push(&mut self, body: impl Into<Body>) {
            self.seq = self.seq.wrapping_add(1);
            let pkt = Packet::new(self.seq, 0xabcd, body);
            self.push_raw(pkt.encode().unwrap());
        }

        fn take_sent(&mut self) -> Vec<(SocketAddr, Packet)> {
            core::mem::take(&mut self.server.borrow_conn().sent)
        }

        /// Send a request, and return the reply (if any).
        fn request(&mut self, body: impl Into<Body>) -> Option<Body> {
            self.push(body);
            assert!(self.server.poll(&self.target).unwrap());

            let mut replies = self
                .take_sent()
                .into_iter()
                .filter(|(addr, _)| *addr == Harness::client())
                .map(|(_, pkt)| {
                    assert_eq!(pkt.seq, self.seq);
                    assert_eq!(pkt.key, 0xabcd);
                    pkt.body
                });
            let reply = replies.next();
            assert!(replies.next().is_none());
            reply
        }

        fn connect(&mut self) {
            self.request(ReattachRequest {
                req_reply_port: 50000,
            })
            .unwrap();
            let reply = self.request(ConnectRequest {
                req_reply_port: 50000,
                exc_note_port: EXC_PORT,
                greeting: b"LLDB".to_vec(),
            });
            assert_eq!(
                reply,
                Some(
                    ConnectReply {
                        error: KdpError::NO_ERROR
                    }
                    .into()
                )
            );
            assert_eq!(self.server.session_state(), SessionState::Connected);
        }
    }

    #[test]
    fn handshake() {
        let mut h = Harness::new(attached_target());
        h.target.lock().set_soft_breakpoint(KERNEL_RIP).unwrap();

        h.connect();
        assert_eq!(h.target.lock().provider().breakpoints().count(), 0);
        assert_eq!(h.server.dropped_packets(), 0);
    }

    #[test]
    fn requests_before_connect_are_dropped() {
        let mut h = Harness::new(attached_target());

        assert_eq!(h.request(HostInfoRequest {}), None);
        assert_eq!(
            h.request(ConnectRequest {
                req_reply_port: 50000,
                exc_note_port: EXC_PORT,
                greeting: Vec::new(),
            }),
            None
        );
        assert_eq!(h.server.session_state(), SessionState::Disconnected);

        h.request(ReattachRequest {
            req_reply_port: 50000,
        })
        .unwrap();
        assert_eq!(h.request(ReadMem64Request { address: 0, nbytes: 4 }), None);
        assert_eq!(h.server.dropped_packets(), 3);
    }

    #[test]
    fn host_info_version_and_kernel_version() {
        let mut h = Harness::new(attached_target());
        h.connect();

        assert_eq!(
            h.request(HostInfoRequest {}),
            Some(
                HostInfoReply {
                    cpus_mask: 1,
                    cpu_type: 0x0100_0007,
                    cpu_subtype: 4,
                }
                .into()
            )
        );
        assert_eq!(
            h.request(VersionRequest {}),
            Some(
                VersionReply {
                    version: 12,
                    feature: Features::BP,
                    pad0: 0,
                    pad1: 0,
                }
                .into()
            )
        );
        assert_eq!(
            h.request(KernelVersionRequest {}),
            Some(
                KernelVersionReply {
                    version: format!("{}; stext=0xffffff8013200000", VERSION).into_bytes(),
                }
                .into()
            )
        );
    }

    #[test]
    fn read_memory() {
        let mut h = Harness::new(attached_target());
        h.connect();

        let reads = h.target.lock().provider().calls().virtual_reads;
        assert_eq!(
            h.request(ReadMem64Request {
                address: KERNEL_RIP,
                nbytes: 1025,
            }),
            Some(
                ReadMem64Reply {
                    error: KdpError::BAD_NBYTES,
                    data: Vec::new(),
                }
                .into()
            )
        );
        assert_eq!(h.target.lock().provider().calls().virtual_reads, reads);

        assert_eq!(
            h.request(ReadMem64Request {
                address: KERNEL_RIP,
                nbytes: 4,
            }),
            Some(
                ReadMem64Reply {
                    error: KdpError::NO_ERROR,
                    data: vec![0x90; 4],
                }
                .into()
            )
        );

        match h.request(ReadMem64Request {
            address: 0x1000,
            nbytes: 4,
        }) {
            Some(Body::ReadMem64Reply(reply)) => assert_eq!(reply.error, KdpError::BAD_ACCESS),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn write_memory() {
        let mut h = Harness::new(attached_target());
        h.connect();

        let oversized = MAX_KDP_DATA_SIZE + 1;
        assert_eq!(
            h.request(WriteMem64Request {
                address: KERNEL_RIP,
                nbytes: oversized as u32,
                data: vec![0xcc; oversized],
            }),
            Some(
                WriteMem64Reply {
                    error: KdpError::BAD_NBYTES
                }
                .into()
            )
        );
        assert_eq!(
            h.target.lock().read_virtual_memory(KERNEL_RIP, 1).unwrap(),
            Some(vec![0x90])
        );

        assert_eq!(
            h.request(WriteMem64Request {
                address: KERNEL_RIP,
                nbytes: 3,
                data: vec![0xcc; 2],
            }),
            Some(
                WriteMem64Reply {
                    error: KdpError::BAD_NBYTES
                }
                .into()
            )
        );
        assert_eq!(
            h.request(WriteMem64Request {
                address: KERNEL_RIP,
                nbytes: 2,
                data: vec![0xcc; 2],
            }),
            Some(
                WriteMem64Reply {
                    error: KdpError::NO_ERROR
                }
                .into()
            )
        );
        assert_eq!(
            h.target
                .lock()
                .read_virtual_memory(KERNEL_RIP, 3)
                .unwrap(),
            Some(vec![0xcc, 0xcc, 0x90])
        );
        assert_eq!(
            h.request(WriteMem64Request {
                address: 0x1000,
                nbytes: 1,
                data: vec![0],
            }),
            Some(
                WriteMem64Reply {
                    error: KdpError::BAD_ACCESS
                }
                .into()
            )
        );
    }

    #[test]
    fn registers() {
        let mut h = Harness::new(attached_target());
        h.connect();

        assert_eq!(
            h.request(ReadRegsRequest {
                cpu: 0,
                flavor: flavor::x86_FLOAT_STATE64,
            }),
            Some(
                ReadRegsReply {
                    error: KdpError::BAD_FLAVOR,
                    state: ThreadState64::default(),
                }
                .into()
            )
        );

        let mut state = match h.request(ReadRegsRequest {
            cpu: 0,
            flavor: flavor::x86_THREAD_STATE64,
        }) {
            Some(Body::ReadRegsReply(reply)) => {
                assert_eq!(reply.error, KdpError::NO_ERROR);
                reply.state
            }
            other => panic!("unexpected reply {:?}", other),
        };
        assert_eq!(state.rip, KERNEL_RIP);

        state.rax = 0x1234;
        assert_eq!(
            h.request(WriteRegsRequest {
                cpu: 0,
                flavor: 0x42,
                state,
            }),
            Some(
                WriteRegsReply {
                    error: KdpError::BAD_FLAVOR
                }
                .into()
            )
        );
        assert_eq!(h.target.lock().provider().register(Register::Rax), 0);

        assert_eq!(
            h.request(WriteRegsRequest {
                cpu: 0,
                flavor: flavor::x86_THREAD_STATE64,
                state,
            }),
            Some(
                WriteRegsReply {
                    error: KdpError::NO_ERROR
                }
                .into()
            )
        );
        assert_eq!(h.target.lock().provider().register(Register::Rax), 0x1234);
    }

    #[test]
    fn breakpoint_error_codes() {
        let mut target = attached_target();
        *target.provider_mut() = kernel_vm().with_breakpoint_capacity(1);
        let mut h = Harness::new(target);
        h.connect();

        let set = |h: &mut Harness, address| match h.request(Breakpoint64SetRequest { address }) {
            Some(Body::Breakpoint64SetReply(reply)) => reply.error,
            other => panic!("unexpected reply {:?}", other),
        };
        let remove = |h: &mut Harness, address| {
            match h.request(Breakpoint64RemoveRequest { address }) {
                Some(Body::Breakpoint64RemoveReply(reply)) => reply.error,
                other => panic!("unexpected reply {:?}", other),
            }
        };

        assert_eq!(set(&mut h, KERNEL_RIP), KdpError::NO_ERROR);
        assert_eq!(set(&mut h, KERNEL_RIP), KdpError::BREAKPOINT_ALREADY_SET);
        assert_eq!(set(&mut h, KERNEL_RIP + 1), KdpError::MAX_BREAKPOINTS);
        assert_eq!(remove(&mut h, KERNEL_RIP), KdpError::NO_ERROR);
        assert_eq!(remove(&mut h, KERNEL_RIP), KdpError::BREAKPOINT_NOT_FOUND);
    }

    #[test]
    fn exceptions_are_relayed() {
        let mut h = Harness::new(attached_target());
        h.connect();

        h.target.lock().provider_mut().push_steps(vec![
            Step::to(KERNEL_RIP + 1),
            Step::to(KERNEL_RIP + 2),
            Step::to(KERNEL_RIP + 3),
        ]);
        assert_eq!(
            h.request(Breakpoint64SetRequest {
                address: KERNEL_RIP + 2
            }),
            Some(
                Breakpoint64SetReply {
                    error: KdpError::NO_ERROR
                }
                .into()
            )
        );

        h.push(ResumeCpusRequest { cpu_mask: 1 });
        h.server.poll(&h.target).unwrap();
        let sent = h.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.body, ResumeCpusReply {}.into());

        let (dst, notification) = &sent[1];
        assert_eq!(*dst, SocketAddr::new(Harness::client().ip(), EXC_PORT));
        assert_eq!(notification.seq, 0);
        assert_eq!(notification.key, DEFAULT_SESSION_KEY);
        assert_eq!(
            notification.body,
            ExceptionRequest {
                n_exc_info: 1,
                cpu: 0,
                exception: Exception::EXC_BREAKPOINT,
                code: Exception::EXC_I386_BPTFLT,
                subcode: 0,
            }
            .into()
        );

        // the client acknowledges, then reads rip past the int3
        h.push(ExceptionReply {});
        h.server.poll(&h.target).unwrap();
        assert!(h.take_sent().is_empty());
        match h.request(ReadRegsRequest {
            cpu: 0,
            flavor: flavor::x86_THREAD_STATE64,
        }) {
            Some(Body::ReadRegsReply(reply)) => assert_eq!(reply.state.rip, KERNEL_RIP + 3),
            other => panic!("unexpected reply {:?}", other),
        }

        // the next notification uses the next sequence number
        h.target.lock().interrupt().unwrap();
        h.server.poll(&h.target).unwrap();
        let sent = h.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.seq, 1);
        assert_eq!(h.server.dropped_packets(), 0);
    }

    #[test]
    fn bad_packets_are_counted() {
        let mut h = Harness::new(attached_target());
        h.connect();

        // forged length
        let mut raw = Packet::new(1, 0, HostInfoRequest {}).encode().unwrap();
        raw[2] = 0xff;
        h.push_raw(raw);
        h.server.poll(&h.target).unwrap();

        // parsed, but not served
        assert_eq!(
            h.request(ReadMsr64Request {
                address: 0xc000_0101,
                lcpu: 0,
            }),
            None
        );
        assert_eq!(h.request(VersionReply {
            version: 12,
            feature: Features::empty(),
            pad0: 0,
            pad1: 0,
        }), None);

        assert!(h.take_sent().is_empty());
        assert_eq!(h.server.dropped_packets(), 3);

        // the session survives
        assert!(h.request(VersionRequest {}).is_some());
    }

    #[test]
    fn run_until_disconnect() {
        let mut target = attached_target();
        target.set_soft_breakpoint(KERNEL_RIP).unwrap();
        let mut h = Harness::new(target);

        h.push(ReattachRequest {
            req_reply_port: 50000,
        });
        h.push(ConnectRequest {
            req_reply_port: 50000,
            exc_note_port: EXC_PORT,
            greeting: Vec::new(),
        });
        h.push(Breakpoint64SetRequest {
            address: KERNEL_RIP + 1,
        });
        h.push(DisconnectRequest {});
        h.push(HostInfoRequest {});

        h.server.run(&h.target).unwrap();
        assert!(h.server.borrow_conn().started);

        let sent = h.take_sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].1.body, DisconnectReply {}.into());
        // the trailing request was never read
        assert_eq!(h.server.borrow_conn().inbox.len(), 1);
        assert_eq!(h.target.lock().provider().breakpoints().count(), 0);
        assert_eq!(h.server.session_state(), SessionState::Disconnected);
    }

    #[test]
    fn disconnect_while_running() {
        let mut h = Harness::new(DebugTarget::new(SimVm::new()));
        h.connect();

        assert_eq!(
            h.request(Breakpoint64SetRequest { address: 0x1000 }),
            Some(
                Breakpoint64SetReply {
                    error: KdpError::NO_ERROR
                }
                .into()
            )
        );
        assert_eq!(h.request(ResumeCpusRequest { cpu_mask: 1 }), Some(ResumeCpusReply {}.into()));
        assert!(!h.target.lock().is_halted().unwrap());

        assert_eq!(h.request(DisconnectRequest {}), Some(DisconnectReply {}.into()));
        let mut target = h.target.lock();
        assert_eq!(target.provider().breakpoints().count(), 0);
        // left running, as it was
        assert!(!target.is_halted().unwrap());
    }
}

//! Helpers to drive a `kdpstub` KDP server the way LLDB does: over real UDP
//! sockets, against a simulated guest.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use log::debug;

use kdpstub::arch::x86_64::{Register, MSR_IA32_GS_BASE, MSR_IA32_KERNEL_GS_BASE};
use kdpstub::protocol::{
    Body, ConnectReply, ConnectRequest, ExceptionReply, KdpError, Packet, ReattachRequest,
    MAX_KDP_PKT_SIZE,
};
use kdpstub::provider::sim::{SimVm, Step};
use kdpstub::xnu::MH_MAGIC_64;

/// Key stamped on every request, echoed back by the server.
pub const CLIENT_KEY: u32 = 0x5eed;

/// Memory and register layout of the simulated guest.
pub mod guest {
    #![allow(missing_docs)]

    pub const KERNEL_LOAD: u64 = 0xffff_ff80_0820_0000;
    pub const KERNEL_RIP: u64 = KERNEL_LOAD + 0x3_0000;
    pub const KERNEL_CR3: u64 = 0x0f00_0000;
    pub const USER_RIP: u64 = 0x0000_7fff_6000_1000;
    pub const USER_CR3: u64 = 0x0e00_0000;
    pub const CPU_DATA: u64 = 0xffff_ff80_0a00_0000;
    pub const ACTIVE_THREAD: u64 = 0xffff_ff80_2abc_d000;
    /// Address of the kernel's `kdp` struct.
    pub const KDP: u64 = 0xffff_ff80_0b00_0040;
    pub const VERSION: &str = "Darwin Kernel Version 19.6.0: Thu Jun 18 20:49:00 PDT 2020; \
                               root:xnu-6153.141.1~1/RELEASE_X86_64";
}

/// A guest stopped in user mode, about to switch to the kernel.
///
/// The low globals are left empty, so attach must scan for the kernel image.
pub fn user_mode_guest() -> SimVm {
    use guest::*;

    let mut vm = SimVm::new();
    vm.map(KERNEL_LOAD, &MH_MAGIC_64.to_le_bytes());
    vm.map(KERNEL_RIP, &[0x90; 64]);

    let mut version = VERSION.as_bytes().to_vec();
    version.push(0);
    vm.map(KERNEL_LOAD + 0x2345, &version);

    let mut cpu_data = CPU_DATA.to_le_bytes().to_vec();
    cpu_data.extend_from_slice(&ACTIVE_THREAD.to_le_bytes());
    vm.map(CPU_DATA, &cpu_data);
    vm.map(KDP, &[0; 0x40]);

    vm.set_msr(MSR_IA32_GS_BASE, 0x0000_7fff_1234_0000);
    vm.set_msr(MSR_IA32_KERNEL_GS_BASE, CPU_DATA);

    vm.set_register(Register::Rip, USER_RIP);
    vm.set_register(Register::Cr3, USER_CR3);
    vm.push_steps(vec![
        Step::to(USER_RIP + 4),
        Step::to(KERNEL_RIP).writing_cr3(KERNEL_CR3),
    ]);
    vm
}

/// A minimal KDP client.
pub struct KdpClient {
    socket: UdpSocket,
    exc_socket: UdpSocket,
    server: SocketAddr,
    seq: u8,
}

impl KdpClient {
    /// Bind the request and exception sockets, without talking to `server`.
    pub fn new(server: SocketAddr) -> anyhow::Result<KdpClient> {
        let bind = |what| -> anyhow::Result<UdpSocket> {
            let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
                .with_context(|| format!("binding {} socket", what))?;
            socket.set_read_timeout(Some(Duration::from_secs(5)))?;
            Ok(socket)
        };

        Ok(KdpClient {
            socket: bind("request")?,
            exc_socket: bind("exception")?,
            server,
            seq: 0,
        })
    }

    /// Open a session: `REATTACH`, then `CONNECT`.
    pub fn connect(server: SocketAddr) -> anyhow::Result<KdpClient> {
        let mut client = KdpClient::new(server)?;

        let req_reply_port = client.socket.local_addr()?.port();
        client.request(ReattachRequest { req_reply_port })?;
        let reply = client.request(ConnectRequest {
            req_reply_port,
            exc_note_port: client.exc_socket.local_addr()?.port(),
            greeting: b"kdpstub_tests".to_vec(),
        })?;
        if reply
            != (ConnectReply {
                error: KdpError::NO_ERROR,
            })
            .into()
        {
            bail!("connect failed: {:?}", reply);
        }
        Ok(client)
    }

    /// Send raw bytes to the server.
    pub fn send_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(data, self.server)?;
        Ok(())
    }

    /// Send a request without waiting for its reply.
    pub fn send(&mut self, body: impl Into<Body>) -> anyhow::Result<u8> {
        self.seq = self.seq.wrapping_add(1);
        let pkt = Packet::new(self.seq, CLIENT_KEY, body);
        debug!("client --> {}", pkt);
        self.send_raw(&pkt.encode()?)?;
        Ok(self.seq)
    }

    /// Send a request, and wait for the matching reply.
    pub fn request(&mut self, body: impl Into<Body>) -> anyhow::Result<Body> {
        let seq = self.send(body)?;
        let pkt = recv(&self.socket).context("waiting for reply")?;
        if pkt.seq != seq || pkt.key != CLIENT_KEY {
            bail!("reply does not match request {:#x}: {}", seq, pkt);
        }
        Ok(pkt.body)
    }

    /// Wait for an `EXCEPTION` notification, and acknowledge it.
    pub fn wait_for_exception(&mut self) -> anyhow::Result<Packet> {
        let pkt = recv(&self.exc_socket).context("waiting for exception")?;
        let ack = Packet::new(pkt.seq, pkt.key, ExceptionReply {});
        self.send_raw(&ack.encode()?)?;
        Ok(pkt)
    }
}

fn recv(socket: &UdpSocket) -> anyhow::Result<Packet> {
    let mut buf = vec![0; MAX_KDP_PKT_SIZE];
    let (len, _) = socket.recv_from(&mut buf)?;
    let pkt = Packet::decode(&buf[..len]).map_err(|e| anyhow!("bad packet from server: {}", e))?;
    debug!("client <-- {}", pkt);
    Ok(pkt)
}

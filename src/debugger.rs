//! User-facing commands.
//!
//! A [`Debugger`] owns at most one attached VM, along with the KDP server
//! thread serving it. LLDB is then pointed at the server with
//! `kdp-remote 127.0.0.1:<port>`.

use core::fmt::{self, Debug, Display};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::thread::{self, JoinHandle};

use log::{error, info, trace};

use crate::arch::x86_64::Register;
use crate::attach::{attach, AttachError};
use crate::provider::Provider;
use crate::server::{BuilderError, KdpServer, ServerError};
use crate::target::{HwTrigger, KernelInfo, SharedTarget, Snapshot, TargetError};

/// Debug registers carried over a snapshot.
const PRESERVED_DEBUG_REGISTERS: [Register; 6] = [
    Register::Dr0,
    Register::Dr1,
    Register::Dr2,
    Register::Dr3,
    Register::Dr6,
    Register::Dr7,
];

type ServerResult = Result<(), ServerError<io::Error>>;

/// An error returned by a [`Debugger`] command.
#[derive(Debug)]
#[non_exhaustive]
pub enum CommandError<E> {
    /// No VM is attached.
    NotAttached,
    /// Attaching failed.
    Attach(AttachError<E>),
    /// The target failed to carry out the command.
    Target(TargetError<E>),
    /// The KDP server could not be configured.
    Builder(BuilderError),
    /// The KDP server socket or thread could not be set up.
    Io(io::Error),
    /// The KDP server stopped with an error.
    Server(ServerError<io::Error>),
    /// The KDP server thread panicked.
    ServerPanicked,
    /// The previous VM's KDP server is still serving a client.
    ServerRunning,
}

impl<E> From<TargetError<E>> for CommandError<E> {
    fn from(e: TargetError<E>) -> Self {
        CommandError::Target(e)
    }
}

impl<E> From<AttachError<E>> for CommandError<E> {
    fn from(e: AttachError<E>) -> Self {
        CommandError::Attach(e)
    }
}

impl<E: Debug> Display for CommandError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::CommandError::*;
        match self {
            NotAttached => write!(f, "not attached to a VM"),
            Attach(e) => write!(f, "could not attach: {}", e),
            Target(e) => Display::fmt(e, f),
            Builder(e) => write!(f, "could not configure the KDP server: {}", e),
            Io(e) => write!(f, "could not start the KDP server: {}", e),
            Server(e) => write!(f, "KDP server error: {}", e),
            ServerPanicked => write!(f, "KDP server thread panicked"),
            ServerRunning => write!(f, "the KDP server of the attached VM is still running"),
        }
    }
}

impl<E: Debug> std::error::Error for CommandError<E> {}

struct Attached<P: Provider> {
    target: SharedTarget<P>,
    kernel: KernelInfo,
    server_addr: SocketAddr,
    server: Option<JoinHandle<ServerResult>>,
}

/// Attaches to VMs, and runs commands against the attached one.
pub struct Debugger<P: Provider> {
    bind_addr: SocketAddr,
    attached: Option<Attached<P>>,
}

impl<P: Provider> Default for Debugger<P> {
    fn default() -> Self {
        Debugger::new()
    }
}

impl<P: Provider> Debugger<P> {
    /// Create a debugger whose KDP servers listen on an ephemeral localhost
    /// port.
    pub fn new() -> Debugger<P> {
        Debugger {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            attached: None,
        }
    }

    /// Listen on `addr` instead.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    fn attached(&self) -> Result<&Attached<P>, CommandError<P::Error>> {
        self.attached.as_ref().ok_or(CommandError::NotAttached)
    }

    /// Returns `true` if a VM is attached.
    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// The attached target.
    pub fn target(&self) -> Option<&SharedTarget<P>> {
        self.attached.as_ref().map(|a| &a.target)
    }

    /// What attach learned about the attached kernel.
    pub fn kernel(&self) -> Option<&KernelInfo> {
        self.attached.as_ref().map(|a| &a.kernel)
    }

    /// Address the KDP server listens on.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.attached.as_ref().map(|a| a.server_addr)
    }

    /// Pause the attached VM.
    pub fn interrupt(&mut self) -> Result<(), CommandError<P::Error>> {
        trace!("interrupt");
        self.attached()?.target.lock().interrupt()?;
        Ok(())
    }

    /// Save the state of the attached VM.
    ///
    /// Snapshots drop hardware breakpoints, so the debug registers are
    /// written back once the snapshot is taken.
    pub fn save(&mut self) -> Result<(), CommandError<P::Error>> {
        trace!("save");
        let mut target = self.attached()?.target.lock();

        let mut saved = [0; PRESERVED_DEBUG_REGISTERS.len()];
        for (val, reg) in saved.iter_mut().zip(PRESERVED_DEBUG_REGISTERS.iter()) {
            *val = target.read_register(*reg)?;
        }

        target.interrupt_and_take_snapshot()?;
        info!("state saved");

        for (val, reg) in saved.iter().zip(PRESERVED_DEBUG_REGISTERS.iter()) {
            target.write_register(*reg, *val)?;
        }
        Ok(())
    }

    /// Restore the attached VM to its last saved state.
    ///
    /// The kernel is rediscovered afterwards, as its load address may differ.
    pub fn restore(&mut self) -> Result<Snapshot, CommandError<P::Error>> {
        trace!("restore");
        let attached = self.attached.as_mut().ok_or(CommandError::NotAttached)?;
        let mut target = attached.target.lock();

        let res = target.interrupt_and_restore_last_snapshot()?;
        if res == Snapshot::NotFound {
            info!("no saved state found");
            return Ok(res);
        }

        target.continue_until_kernel_code()?;
        attached.kernel = target.discover_kernel()?.clone();
        info!("state restored");
        Ok(res)
    }

    /// Program hardware breakpoint `slot` (0-3).
    pub fn set_hw_breakpoint(
        &mut self,
        trigger: HwTrigger,
        slot: u8,
        addr: u64,
    ) -> Result<(), CommandError<P::Error>> {
        self.attached()?
            .target
            .lock()
            .set_hard_breakpoint(trigger, slot, addr)?;
        info!("hardware breakpoint set: address = {:#018x}", addr);
        Ok(())
    }

    /// Free hardware breakpoint `slot` (0-3).
    pub fn unset_hw_breakpoint(&mut self, slot: u8) -> Result<(), CommandError<P::Error>> {
        self.attached()?.target.lock().unset_hard_breakpoint(slot)?;
        info!("hardware breakpoint unset");
        Ok(())
    }

    /// Record the address of the next memory write as the kernel's `kdp`
    /// struct. See
    /// [`DebugTarget::capture_introspection_struct`](crate::target::DebugTarget::capture_introspection_struct).
    pub fn capture_introspection_struct(&mut self) -> Result<(), CommandError<P::Error>> {
        self.attached()?.target.lock().capture_introspection_struct();
        Ok(())
    }

    /// Cancel a pending [`capture_introspection_struct`](Self::capture_introspection_struct).
    pub fn abort_introspection_capture(&mut self) -> Result<(), CommandError<P::Error>> {
        self.attached()?
            .target
            .lock()
            .abort_introspection_capture()?;
        Ok(())
    }
}

impl<P> Debugger<P>
where
    P: Provider + Send + 'static,
{
    /// Attach to the VM opened by `open`, and start serving it over KDP.
    ///
    /// Replaces any previously attached VM, once its KDP client has
    /// disconnected. Returns the address the KDP server listens on.
    pub fn attach<F>(&mut self, open: F) -> Result<SocketAddr, CommandError<P::Error>>
    where
        F: FnOnce() -> Result<P, P::Error>,
    {
        if let Some(attached) = &mut self.attached {
            if let Some(server) = attached.server.take() {
                if !server.is_finished() {
                    attached.server = Some(server);
                    return Err(CommandError::ServerRunning);
                }
                if let Ok(Err(e)) = server.join() {
                    error!("previous KDP server stopped with an error: {}", e);
                }
            }
        }

        let (target, kernel) = attach(open)?;
        info!("kernel load address: {:#018x}", kernel.load_address);
        info!("kernel slide:        {:#x}", kernel.slide);
        info!("kernel cr3:          {:#x}", kernel.cr3);

        let socket = UdpSocket::bind(self.bind_addr).map_err(CommandError::Io)?;
        let server_addr = socket.local_addr().map_err(CommandError::Io)?;
        let mut server = KdpServer::builder(socket)
            .build()
            .map_err(CommandError::Builder)?;

        let server_target = target.clone();
        let server = thread::Builder::new()
            .name("kdp-server".into())
            .spawn(move || {
                let res = server.run(&server_target);
                if let Err(e) = &res {
                    error!("{}", e);
                }
                res
            })
            .map_err(CommandError::Io)?;
        info!("KDP server listening on {}", server_addr);

        self.attached = Some(Attached {
            target,
            kernel,
            server_addr,
            server: Some(server),
        });
        Ok(server_addr)
    }

    /// Block until the KDP client disconnects.
    pub fn wait_for_disconnect(&mut self) -> Result<(), CommandError<P::Error>> {
        let attached = self.attached.as_mut().ok_or(CommandError::NotAttached)?;
        let server = match attached.server.take() {
            Some(server) => server,
            None => return Ok(()),
        };
        match server.join() {
            Ok(res) => res.map_err(CommandError::Server),
            Err(_) => Err(CommandError::ServerPanicked),
        }
    }
}

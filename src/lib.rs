//! An emulated Kernel Debugging Protocol (KDP) stub, for debugging XNU kernels
//! running inside hypervisor-controlled VMs.
//!
//! Rather than relying on the guest kernel's own KDP implementation, `kdpstub`
//! answers LLDB's KDP requests itself, using a hypervisor's introspection
//! capabilities (pause / resume, registers, memory, breakpoints, snapshots)
//! to carry them out. The guest doesn't need to be booted with any debug
//! boot-args, and is never aware of being debugged.
//!
//! ## Overview
//!
//! - [`provider::Provider`]: the VM-control capabilities a hypervisor must
//!   expose. [`provider::sim::SimVm`] is an in-memory implementation.
//! - [`target::DebugTarget`]: turns KDP-level operations into provider calls,
//!   and owns all debugger-side state about the guest.
//! - [`attach::attach`]: pauses a freshly opened VM in kernel code, and
//!   locates the kernel.
//! - [`server::KdpServer`]: serves a KDP client over a [`conn::Connection`]
//!   (usually a [`UdpSocket`](std::net::UdpSocket)).
//! - [`debugger::Debugger`]: ties it all together, and exposes the commands
//!   LLDB users run alongside KDP (snapshots, hardware breakpoints...).
//!
//! ## Feature flags
//!
//! - `trace-pkt` (default): logs a summary of every KDP packet sent and
//!   received via `trace!`.

#![warn(missing_docs)]

pub mod arch;
pub mod attach;
pub mod conn;
pub mod debugger;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod target;
pub mod xnu;

mod internal;

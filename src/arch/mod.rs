//! Architecture definitions for the guests `kdpstub` can debug.
//!
//! Only 64-bit x86 is supported: general registers, the control registers
//! used for address-space switches and the DR0-DR7 debug registers.

pub mod x86_64;

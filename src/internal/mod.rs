//! Byte-order helpers shared by the wire codec and the register layouts.

mod be_bytes;
mod le_bytes;

pub use be_bytes::*;
pub use le_bytes::*;

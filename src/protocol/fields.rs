//! Field encodings used by the body tables.
//!
//! Each encoding `enc` provides `Writer::put_enc`, `Reader::get_enc` and
//! `size_enc`, which the `bodies!` macro stitches together by name:
//!
//! - `le` / `be`: fixed-width integers (or fixed-size structs) in little /
//!   big endian byte order.
//! - `bytes`: a blob consuming every remaining byte of the packet. Must be the
//!   last field of a body.
//! - `cstr`: a NUL-terminated byte string. The NUL is not part of the value.

use crate::internal::{BeBytes, LeBytes};

use super::PacketError;

pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Writer {
        Writer {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_le<T: LeBytes>(&mut self, val: &T) -> Result<(), PacketError> {
        val.write_le(&mut self.buf);
        Ok(())
    }

    pub fn put_be<T: BeBytes>(&mut self, val: &T) -> Result<(), PacketError> {
        val.write_be(&mut self.buf);
        Ok(())
    }

    pub fn put_bytes(&mut self, val: &[u8]) -> Result<(), PacketError> {
        self.buf.extend_from_slice(val);
        Ok(())
    }

    pub fn put_cstr(&mut self, val: &[u8]) -> Result<(), PacketError> {
        if val.contains(&0) {
            return Err(PacketError::InteriorNul);
        }
        self.buf.extend_from_slice(val);
        self.buf.push(0);
        Ok(())
    }
}

pub fn size_le<T: LeBytes>(_: &T) -> usize {
    T::SIZE
}

pub fn size_be<T: BeBytes>(_: &T) -> usize {
    T::SIZE
}

pub fn size_bytes(val: &[u8]) -> usize {
    val.len()
}

pub fn size_cstr(val: &[u8]) -> usize {
    val.len() + 1
}

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn get_le<T: LeBytes>(&mut self) -> Result<T, PacketError> {
        let val = T::read_le(self.rest()).ok_or(PacketError::Truncated)?;
        self.pos += T::SIZE;
        Ok(val)
    }

    pub fn get_be<T: BeBytes>(&mut self) -> Result<T, PacketError> {
        let val = T::read_be(self.rest()).ok_or(PacketError::Truncated)?;
        self.pos += T::SIZE;
        Ok(val)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, PacketError> {
        let val = self.rest().to_vec();
        self.pos = self.buf.len();
        Ok(val)
    }

    pub fn get_cstr(&mut self) -> Result<Vec<u8>, PacketError> {
        let rest = self.rest();
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(PacketError::UnterminatedString)?;
        self.pos += nul + 1;
        Ok(rest[..nul].to_vec())
    }
}

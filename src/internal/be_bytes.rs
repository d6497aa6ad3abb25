/// A trait for types with a fixed-size big-endian (network order) wire
/// representation. KDP only uses it for ports and the session key.
pub trait BeBytes: Sized {
    /// Number of bytes occupied on the wire.
    const SIZE: usize;

    /// Append the big-endian representation of `self` to `out`.
    fn write_be(&self, out: &mut Vec<u8>);

    /// Parse `Self` from the first `SIZE` bytes of `buf`.
    /// Returns None if `buf` is too short.
    fn read_be(buf: &[u8]) -> Option<Self>;
}

macro_rules! impl_be_bytes {
    ($($num:ty)*) => {
        $(
            impl BeBytes for $num {
                const SIZE: usize = core::mem::size_of::<$num>();

                fn write_be(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&<$num>::to_be_bytes(*self));
                }

                fn read_be(buf: &[u8]) -> Option<Self> {
                    let buf = buf.get(..Self::SIZE)?;

                    let mut res: Self = 0;
                    for b in buf.iter().copied() {
                        let b: Self = b as Self;
                        // `res <<= 8` causes the compiler to complain in the `u8` case
                        res <<= 4;
                        res <<= 4;
                        res |= b;
                    }

                    Some(res)
                }
            }
        )*
    };
}

impl_be_bytes!(u8 u16 u32 u64);

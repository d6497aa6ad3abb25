/// A trait for types with a fixed-size little-endian wire representation.
/// Automatically implemented for the unsigned integers used by KDP.
pub trait LeBytes: Sized {
    /// Number of bytes occupied on the wire.
    const SIZE: usize;

    /// Append the little-endian representation of `self` to `out`.
    fn write_le(&self, out: &mut Vec<u8>);

    /// Parse `Self` from the first `SIZE` bytes of `buf`.
    /// Returns None if `buf` is too short.
    fn read_le(buf: &[u8]) -> Option<Self>;
}

macro_rules! impl_le_bytes {
    ($($num:ty)*) => {
        $(
            impl LeBytes for $num {
                const SIZE: usize = core::mem::size_of::<$num>();

                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&<$num>::to_le_bytes(*self));
                }

                fn read_le(buf: &[u8]) -> Option<Self> {
                    use core::convert::TryInto;
                    let bytes = buf.get(..Self::SIZE)?;
                    Some(<$num>::from_le_bytes(bytes.try_into().ok()?))
                }
            }
        )*
    };
}

impl_le_bytes!(u8 u16 u32 u64);

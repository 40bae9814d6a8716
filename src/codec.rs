//! Fixed-size key/value serializers for the B+ tree (spec §3, §4.4).
//! Reflection-based field extraction is explicitly out of scope for the
//! core (§9); callers provide a compile-time serializer per key/value
//! type instead.

use byteorder::{ByteOrder, LittleEndian};

use crate::pointer::{Pointer, POINTER_WIRE_SIZE};

/// A value with a fixed, known-in-advance wire width, ordered the same
/// way its decoded form orders. `Send + Sync + 'static` so keys and
/// values can cross the `async_trait`-generated futures in
/// [`crate::btree::session::NodeSession`].
pub trait FixedSize: Clone + Ord + Send + Sync + 'static {
    const WIDTH: usize;

    fn encode_fixed(&self, out: &mut [u8]);
    fn decode_fixed(bytes: &[u8]) -> Self;

    fn to_fixed_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::WIDTH];
        self.encode_fixed(&mut buf);
        buf
    }
}

macro_rules! impl_fixed_size_int {
    ($t:ty, $width:expr, $write:ident, $read:ident) => {
        impl FixedSize for $t {
            const WIDTH: usize = $width;

            fn encode_fixed(&self, out: &mut [u8]) {
                LittleEndian::$write(out, *self);
            }

            fn decode_fixed(bytes: &[u8]) -> Self {
                LittleEndian::$read(bytes)
            }
        }
    };
}

impl_fixed_size_int!(u64, 8, write_u64, read_u64);
impl_fixed_size_int!(i64, 8, write_i64, read_i64);
impl_fixed_size_int!(u32, 4, write_u32, read_u32);
impl_fixed_size_int!(i32, 4, write_i32, read_i32);

impl FixedSize for Pointer {
    const WIDTH: usize = POINTER_WIRE_SIZE;

    fn encode_fixed(&self, out: &mut [u8]) {
        out[..POINTER_WIRE_SIZE].copy_from_slice(&self.to_bytes());
    }

    fn decode_fixed(bytes: &[u8]) -> Self {
        Pointer::from_bytes(bytes).expect("corrupt pointer in node storage")
    }
}

/// A fixed-width byte string key, right-padded with zeros. Useful for
/// short textual primary keys (e.g. names) that must still compare
/// byte-lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedBytes<const N: usize>(pub [u8; N]);

impl<const N: usize> FixedBytes<N> {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; N];
        let len = bytes.len().min(N);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(buf)
    }
}

impl<const N: usize> FixedSize for FixedBytes<N> {
    const WIDTH: usize = N;

    fn encode_fixed(&self, out: &mut [u8]) {
        out[..N].copy_from_slice(&self.0);
    }

    fn decode_fixed(bytes: &[u8]) -> Self {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&bytes[..N]);
        Self(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_round_trips() {
        let v: u64 = 0xdead_beef_0bad_f00d;
        let bytes = v.to_fixed_bytes();
        assert_eq!(u64::decode_fixed(&bytes), v);
    }

    #[test]
    fn pointer_round_trips_through_fixed_size() {
        let p = Pointer::data(42, 3);
        let bytes = p.to_fixed_bytes();
        assert_eq!(Pointer::decode_fixed(&bytes), p);
    }
}

//! Codec adapters for the key and value types the engine ships with.
//!
//! A key type needs a byte codec plus a total order; a value type only
//! needs the codec and equality (for compare-and-set). Anything satisfying
//! the bounds works, these are the stock adapters the CLI knows about.

use std::cmp::Ordering;
use std::fmt;

use crate::{
    error::KvError,
    io::{Decodeable, Encodeable},
    types::KvResult,
};

/// Bound for key types. The `Ord` impl is the total key ordering and must
/// be consistent with `Eq`, otherwise lookups may miss keys that compare
/// equal but sort apart.
pub trait KeyType: Encodeable + Decodeable + Ord + Clone + fmt::Debug {}

impl<T> KeyType for T where T: Encodeable + Decodeable + Ord + Clone + fmt::Debug {}

pub trait ValueType: Encodeable + Decodeable + Eq + Clone + fmt::Debug {}

impl<T> ValueType for T where T: Encodeable + Decodeable + Eq + Clone + fmt::Debug {}

macro_rules! impl_int_codec {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }

                fn encoded_size(&self) -> usize {
                    std::mem::size_of::<$t>()
                }
            }

            impl Decodeable for $t {
                fn decode(bytes: &[u8]) -> KvResult<Self> {
                    if bytes.len() != std::mem::size_of::<$t>() {
                        return Err(KvError::Serialization(format!(
                            "expected {} bytes for {}, got {}",
                            std::mem::size_of::<$t>(),
                            stringify!($t),
                            bytes.len()
                        )));
                    }
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    Ok(<$t>::from_be_bytes(buf))
                }
            }
        )*
    }
}

impl_int_codec!(for i32, i64, u32, u64);

impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn encoded_size(&self) -> usize {
        self.len()
    }
}

impl Decodeable for String {
    fn decode(bytes: &[u8]) -> KvResult<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| KvError::Serialization(format!("invalid utf-8 string: {}", e)))
    }
}

impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn encoded_size(&self) -> usize {
        self.len()
    }
}

impl Decodeable for Vec<u8> {
    fn decode(bytes: &[u8]) -> KvResult<Self> {
        Ok(bytes.to_vec())
    }
}

/// An `f64` with a total order (`f64::total_cmp`), usable as a key or a
/// value. Plain `f64` qualifies as neither since NaN breaks `Ord`/`Eq`.
#[derive(Clone, Copy, Debug)]
pub struct F64Cell(pub f64);

impl PartialEq for F64Cell {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for F64Cell {}

impl PartialOrd for F64Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for F64Cell {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for F64Cell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Encodeable for F64Cell {
    fn encode(&self) -> Vec<u8> {
        self.0.to_bits().to_be_bytes().to_vec()
    }

    fn encoded_size(&self) -> usize {
        8
    }
}

impl Decodeable for F64Cell {
    fn decode(bytes: &[u8]) -> KvResult<Self> {
        let bits = u64::decode(bytes)?;
        Ok(F64Cell(f64::from_bits(bits)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f64_cell_total_order() {
        let mut cells = vec![
            F64Cell(f64::NAN),
            F64Cell(1.5),
            F64Cell(f64::NEG_INFINITY),
            F64Cell(-0.0),
            F64Cell(0.0),
        ];
        cells.sort();
        assert_eq!(cells[0], F64Cell(f64::NEG_INFINITY));
        assert_eq!(cells[1], F64Cell(-0.0));
        assert_eq!(cells[2], F64Cell(0.0));
        assert_eq!(cells[3], F64Cell(1.5));
        // NaN sorts last under total_cmp
        assert!(cells[4].0.is_nan());
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        match String::decode(&[0xff, 0xfe]) {
            Err(KvError::Serialization(_)) => {}
            other => panic!("expected serialization error, got {:?}", other),
        }
    }
}

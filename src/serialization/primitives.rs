//! Built-in codecs: little-endian numbers, `bool` as one byte, and `String`
//! as raw UTF-8 (variable length).

use crate::error::{ProtocolError, Result};
use crate::serialization::entry::{invalid_utf8, TypeEntry};
use crate::serialization::registry::custom_entry;
use crate::serialization::WireType;

macro_rules! le_number {
    ($($ty:ty),*) => {
        $(impl WireType for $ty {})*

        fn number_entries() -> Vec<TypeEntry> {
            vec![$(
                custom_entry::<$ty, _, _>(
                    Some(std::mem::size_of::<$ty>()),
                    |value: &$ty, out: &mut Vec<u8>| {
                        out.extend_from_slice(&value.to_le_bytes());
                        Ok(())
                    },
                    |bytes: &[u8]| -> Result<$ty> {
                        let array = bytes.try_into().map_err(|_| ProtocolError::SizeMismatch {
                            type_name: stringify!($ty).to_string(),
                            expected: std::mem::size_of::<$ty>(),
                            actual: bytes.len(),
                        })?;
                        Ok(<$ty>::from_le_bytes(array))
                    },
                )
            ),*]
        }
    };
}

le_number!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl WireType for bool {}
impl WireType for String {}

/// Codecs every [`Registry::new`](crate::serialization::Registry::new) starts with
pub(crate) fn default_entries() -> Vec<TypeEntry> {
    let mut entries = number_entries();

    // Any non-zero byte reads as true
    entries.push(custom_entry::<bool, _, _>(
        Some(1),
        |value: &bool, out: &mut Vec<u8>| {
            out.push(u8::from(*value));
            Ok(())
        },
        |bytes: &[u8]| -> Result<bool> { Ok(bytes.first().is_some_and(|b| *b != 0)) },
    ));

    entries.push(custom_entry::<String, _, _>(
        None,
        |value: &String, out: &mut Vec<u8>| {
            out.extend_from_slice(value.as_bytes());
            Ok(())
        },
        |bytes: &[u8]| -> Result<String> { String::from_utf8(bytes.to_vec()).map_err(invalid_utf8) },
    ));

    entries
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use crate::error::ProtocolError;
    use crate::serialization::Registry;

    #[test]
    fn test_numbers_are_little_endian() {
        let registry = Registry::new();
        assert_eq!(registry.serialize(&0x0102_0304u32).unwrap(), [4, 3, 2, 1]);
        assert_eq!(registry.serialize(&-2i16).unwrap(), [0xFE, 0xFF]);
        assert_eq!(registry.serialize(&1.0f32).unwrap(), 1.0f32.to_le_bytes());
    }

    #[test]
    fn test_fixed_sizes() {
        let registry = Registry::new();
        assert_eq!(registry.entry::<u8>().unwrap().fixed_size(), Some(1));
        assert_eq!(registry.entry::<i64>().unwrap().fixed_size(), Some(8));
        assert_eq!(registry.entry::<bool>().unwrap().fixed_size(), Some(1));
        assert_eq!(registry.entry::<String>().unwrap().fixed_size(), None);
    }

    #[test]
    fn test_bool_decoding() {
        let registry = Registry::new();
        assert!(!registry.deserialize::<bool>(&[0]).unwrap());
        assert!(registry.deserialize::<bool>(&[1]).unwrap());
        assert!(registry.deserialize::<bool>(&[7]).unwrap());
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let registry = Registry::new();
        match registry.deserialize::<u32>(&[1, 2, 3]) {
            Err(ProtocolError::SizeMismatch {
                expected: 4,
                actual: 3,
                ..
            }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_string_is_raw_utf8() {
        let registry = Registry::new();
        assert_eq!(registry.serialize(&"hé".to_string()).unwrap(), "hé".as_bytes());
        assert!(matches!(
            registry.deserialize::<String>(&[0xFF, 0xFE]),
            Err(ProtocolError::InvalidData(_))
        ));
    }
}

//! `Vec<T>` codecs, derived for any known element type.
//!
//! Layout: `<u32 LE count>` followed by the elements. Elements of a
//! variable-length type carry their own 4-byte length prefix.

use crate::error::{ProtocolError, Result};
use crate::serialization::entry::{downcast, read_u32_le, EntryKind, TypeEntry};
use crate::serialization::fingerprint::TypeInfo;
use crate::serialization::registry::Registry;
use crate::serialization::WireType;
use std::any::Any;
use std::sync::Arc;

/// Largest array of zero-width elements accepted in either direction.
/// Such elements occupy no wire bytes, so nothing else bounds the count.
pub const MAX_ZERO_WIDTH_ELEMENTS: usize = 65_536;

impl<T: WireType> WireType for Vec<T> {
    fn derive_entry(registry: &Registry) -> Result<Option<TypeEntry>> {
        let element = registry.entry::<T>()?;
        Ok(Some(array_entry::<T>(element)))
    }

    fn type_info() -> TypeInfo {
        let element = T::type_info();
        TypeInfo {
            name: format!("{}[]", element.name),
            namespace: element.namespace,
            member_count: 0,
        }
    }
}

fn array_entry<T: WireType>(element: Arc<TypeEntry>) -> TypeEntry {
    let type_name = std::any::type_name::<Vec<T>>();
    let encode_element = element.clone();

    let encode = Arc::new(move |value: &dyn Any, out: &mut Vec<u8>| -> Result<()> {
        let items = downcast::<Vec<T>>(value, type_name)?;
        let count = u32::try_from(items.len()).map_err(|_| {
            ProtocolError::InvalidData(format!("{type_name}: too many elements"))
        })?;
        check_zero_width(&encode_element, items.len(), type_name)?;
        out.extend_from_slice(&count.to_le_bytes());
        for item in items {
            encode_element.encode_embedded(item, out)?;
        }
        Ok(())
    });

    let decode = Arc::new(move |bytes: &[u8]| -> Result<Box<dyn Any + Send>> {
        let count = read_u32_le(bytes, type_name)? as usize;
        let mut rest = &bytes[4..];
        check_count(&element, count, rest.len(), type_name)?;
        // A hostile count must not drive the allocation
        let mut items = Vec::with_capacity(count.min(rest.len()));
        for _ in 0..count {
            let (chunk, tail) = element.split_embedded(rest)?;
            items.push(element.decode_value::<T>(chunk)?);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(ProtocolError::SizeMismatch {
                type_name: type_name.to_string(),
                expected: bytes.len() - rest.len(),
                actual: bytes.len(),
            });
        }
        Ok(Box::new(items))
    });

    TypeEntry::new::<Vec<T>>(Vec::<T>::type_info(), EntryKind::Array, None, encode, decode)
}

/// Reject a count the remaining bytes cannot possibly hold.
///
/// Every element occupies at least its fixed size, or its 4-byte length
/// prefix when variable-length.
fn check_count(element: &TypeEntry, count: usize, available: usize, type_name: &str) -> Result<()> {
    let min_width = element.fixed_size().unwrap_or(4);
    if min_width == 0 {
        return check_zero_width(element, count, type_name);
    }
    let needed = count.saturating_mul(min_width);
    if needed > available {
        return Err(ProtocolError::SizeMismatch {
            type_name: type_name.to_string(),
            expected: needed,
            actual: available,
        });
    }
    Ok(())
}

fn check_zero_width(element: &TypeEntry, count: usize, type_name: &str) -> Result<()> {
    if element.fixed_size() == Some(0) && count > MAX_ZERO_WIDTH_ELEMENTS {
        return Err(ProtocolError::InvalidData(format!(
            "{type_name}: {count} zero-width elements (maximum {MAX_ZERO_WIDTH_ELEMENTS})"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::MAX_ZERO_WIDTH_ELEMENTS;
    use crate::error::ProtocolError;
    use crate::serialization::{EntryKind, Registry};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Empty;
    crate::wire_composite!(Empty {});

    fn with_empty() -> Registry {
        let registry = Registry::new();
        registry.register_composite::<Empty>().unwrap();
        registry
    }

    #[test]
    fn test_fixed_elements_are_not_prefixed() {
        let registry = Registry::new();
        let bytes = registry.serialize(&vec![1u8, 2]).unwrap();
        assert_eq!(bytes, [2, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_variable_elements_are_prefixed() {
        let registry = Registry::new();
        let bytes = registry
            .serialize(&vec!["ab".to_string(), String::new()])
            .unwrap();
        assert_eq!(bytes, [2, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0, 0, 0, 0]);
    }

    #[test]
    fn test_nested_arrays() {
        let registry = Registry::new();
        let value = vec![vec![1i32, -1], vec![], vec![i32::MAX]];
        let bytes = registry.serialize(&value).unwrap();
        assert_eq!(registry.deserialize::<Vec<Vec<i32>>>(&bytes).unwrap(), value);
    }

    #[test]
    fn test_array_entry_is_cached() {
        let registry = Registry::new();
        let first = registry.entry::<Vec<u64>>().unwrap();
        let second = registry.entry::<Vec<u64>>().unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), EntryKind::Array);
        assert!(!first.is_fixed_size());
    }

    #[test]
    fn test_unknown_element_type() {
        struct Opaque;
        impl crate::serialization::WireType for Opaque {}

        let registry = Registry::new();
        match registry.entry::<Vec<Opaque>>() {
            Err(ProtocolError::EntryNotFound(name)) => assert!(name.ends_with("Opaque")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_array_is_rejected() {
        let registry = Registry::new();
        let result = registry.deserialize::<Vec<u32>>(&[2, 0, 0, 0, 1, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::SizeMismatch { .. })));
        let result = registry.deserialize::<Vec<u32>>(&[1, 0]);
        assert!(matches!(result, Err(ProtocolError::SizeMismatch { .. })));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let registry = Registry::new();
        let result = registry.deserialize::<Vec<u8>>(&[1, 0, 0, 0, 9, 9]);
        assert!(matches!(result, Err(ProtocolError::SizeMismatch { .. })));
    }

    #[test]
    fn test_zero_width_elements_roundtrip() {
        let registry = with_empty();
        let value = vec![Empty; 3];
        let bytes = registry.serialize(&value).unwrap();
        assert_eq!(bytes, [3, 0, 0, 0]);
        assert_eq!(registry.deserialize::<Vec<Empty>>(&bytes).unwrap(), value);
    }

    #[test]
    fn test_huge_zero_width_count_is_rejected_quickly() {
        let registry = with_empty();
        let started = std::time::Instant::now();
        for count in [50_000_000u32, u32::MAX] {
            let result = registry.deserialize::<Vec<Empty>>(&count.to_le_bytes());
            assert!(matches!(result, Err(ProtocolError::InvalidData(_))));
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        let limit = (MAX_ZERO_WIDTH_ELEMENTS as u32).to_le_bytes();
        assert_eq!(registry.deserialize::<Vec<Empty>>(&limit).unwrap().len(), MAX_ZERO_WIDTH_ELEMENTS);

        let oversized = vec![Empty; MAX_ZERO_WIDTH_ELEMENTS + 1];
        assert!(matches!(registry.serialize(&oversized), Err(ProtocolError::InvalidData(_))));
    }

    #[test]
    fn test_count_beyond_available_bytes_is_rejected() {
        let registry = Registry::new();
        let result = registry.deserialize::<Vec<u64>>(&[0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3, 4]);
        assert!(matches!(result, Err(ProtocolError::SizeMismatch { .. })));
        let result = registry.deserialize::<Vec<String>>(&[3, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::SizeMismatch { .. })));
    }
}

use crate::error::{constants, ProtocolError, Result};
use crate::serialization::fingerprint::{TypeFingerprint, TypeInfo};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Type-erased encoder: appends the value's bytes to the output buffer
pub type EncodeFn = Arc<dyn Fn(&dyn Any, &mut Vec<u8>) -> Result<()> + Send + Sync>;

/// Type-erased decoder: consumes exactly the given slice
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>> + Send + Sync>;

/// How an entry came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Explicitly registered encode/decode pair
    Custom,
    /// `Vec<T>` of a known element type
    Array,
    /// Enum encoded through its underlying integer
    Enum,
    /// Structure serialized field by field
    Composite,
}

/// One field of a composite entry
#[derive(Clone)]
pub struct FieldEntry {
    pub name: &'static str,
    pub entry: Arc<TypeEntry>,
}

impl fmt::Debug for FieldEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldEntry")
            .field("name", &self.name)
            .field("type", &self.entry.type_name)
            .finish()
    }
}

/// Codec for one type, as cached by a [`Registry`](crate::serialization::Registry).
pub struct TypeEntry {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) info: TypeInfo,
    pub(crate) fixed_size: Option<usize>,
    pub(crate) kind: EntryKind,
    pub(crate) fields: Vec<FieldEntry>,
    pub(crate) encode: EncodeFn,
    pub(crate) decode: DecodeFn,
}

impl TypeEntry {
    pub(crate) fn new<T: 'static>(
        info: TypeInfo,
        kind: EntryKind,
        fixed_size: Option<usize>,
        encode: EncodeFn,
        decode: DecodeFn,
    ) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            info,
            fixed_size,
            kind,
            fields: Vec::new(),
            encode,
            decode,
        }
    }

    pub(crate) fn with_fields(mut self, fields: Vec<FieldEntry>) -> Self {
        self.fields = fields;
        self
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn info(&self) -> &TypeInfo {
        &self.info
    }

    pub fn fingerprint(&self) -> TypeFingerprint {
        self.info.fingerprint()
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Serialized length, if every value of the type has the same length
    pub fn fixed_size(&self) -> Option<usize> {
        self.fixed_size
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size.is_some()
    }

    /// Field entries in declared order (empty for non-composites)
    pub fn fields(&self) -> &[FieldEntry] {
        &self.fields
    }

    /// Append the encoding of `value`.
    ///
    /// Fixed-size entries are checked against their declared length.
    pub fn encode_any(&self, value: &dyn Any, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        (self.encode)(value, out)?;
        if let Some(expected) = self.fixed_size {
            let actual = out.len() - start;
            if actual != expected {
                out.truncate(start);
                return Err(self.size_mismatch(expected, actual));
            }
        }
        Ok(())
    }

    /// Decode a value that occupies exactly `bytes`
    pub fn decode_any(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
        if let Some(expected) = self.fixed_size {
            if bytes.len() != expected {
                return Err(self.size_mismatch(expected, bytes.len()));
            }
        }
        (self.decode)(bytes)
    }

    pub fn encode_value<T: 'static>(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        self.check_type::<T>()?;
        self.encode_any(value, out)
    }

    pub fn decode_value<T: 'static>(&self, bytes: &[u8]) -> Result<T> {
        self.check_type::<T>()?;
        self.decode_any(bytes)?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| ProtocolError::TypeMismatch(self.type_name.to_string()))
    }

    /// Encode as a member of a composite or array: variable-size values get
    /// a 4-byte little-endian length prefix.
    pub(crate) fn encode_embedded(&self, value: &dyn Any, out: &mut Vec<u8>) -> Result<()> {
        if self.is_fixed_size() {
            return self.encode_any(value, out);
        }

        let prefix_at = out.len();
        out.extend_from_slice(&[0u8; 4]);
        self.encode_any(value, out)?;
        let len = u32::try_from(out.len() - prefix_at - 4)
            .map_err(|_| ProtocolError::InvalidData(constants::ERR_LENGTH_PREFIX.to_string()))?;
        out[prefix_at..prefix_at + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    /// Split one embedded value off the front of `input`.
    ///
    /// Returns the value's bytes and the remainder.
    pub(crate) fn split_embedded<'a>(&self, input: &'a [u8]) -> Result<(&'a [u8], &'a [u8])> {
        let (len, body) = match self.fixed_size {
            Some(size) => (size, input),
            None => {
                let len = read_u32_le(input, self.type_name)? as usize;
                (len, &input[4..])
            }
        };
        if body.len() < len {
            return Err(self.size_mismatch(len, body.len()));
        }
        Ok(body.split_at(len))
    }

    fn check_type<T: 'static>(&self) -> Result<()> {
        if TypeId::of::<T>() == self.type_id {
            Ok(())
        } else {
            Err(ProtocolError::TypeMismatch(self.type_name.to_string()))
        }
    }

    fn size_mismatch(&self, expected: usize, actual: usize) -> ProtocolError {
        ProtocolError::SizeMismatch {
            type_name: self.type_name.to_string(),
            expected,
            actual,
        }
    }
}

impl fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeEntry")
            .field("type_name", &self.type_name)
            .field("kind", &self.kind)
            .field("fixed_size", &self.fixed_size)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Read a 4-byte little-endian length or count prefix
pub(crate) fn read_u32_le(input: &[u8], type_name: &str) -> Result<u32> {
    match input.get(..4) {
        Some(prefix) => Ok(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]])),
        None => Err(ProtocolError::SizeMismatch {
            type_name: type_name.to_string(),
            expected: 4,
            actual: input.len(),
        }),
    }
}

/// Downcast helper for encoders
pub(crate) fn downcast<'a, T: 'static>(value: &'a dyn Any, type_name: &str) -> Result<&'a T> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| ProtocolError::TypeMismatch(type_name.to_string()))
}

/// Wrap `value` in a UTF-8 decode error
pub(crate) fn invalid_utf8(error: std::string::FromUtf8Error) -> ProtocolError {
    ProtocolError::InvalidData(format!("{}: {error}", constants::ERR_INVALID_UTF8))
}

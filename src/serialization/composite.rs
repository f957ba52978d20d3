use crate::error::{ProtocolError, Result};
use crate::serialization::entry::{downcast, EntryKind, FieldEntry, TypeEntry};
use crate::serialization::registry::Registry;
use crate::serialization::WireType;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A structure serialized field by field, in declared order.
///
/// Variable-length fields are length-prefixed, fixed-length fields are not.
/// The type fingerprint covers the type's name, module path and field count.
/// The composite is fixed-size when every field is. Decoding starts from
/// `Default::default()` and assigns each field in turn.
///
/// Usually implemented with [`wire_composite!`](crate::wire_composite).
pub trait Composite: WireType + Default {
    fn fields() -> Vec<Field<Self>>;
}

type FieldEncode<T> = Box<dyn Fn(&T, &TypeEntry, &mut Vec<u8>) -> Result<()> + Send + Sync>;
type FieldDecode<T> = Box<dyn Fn(&mut T, &TypeEntry, &[u8]) -> Result<()> + Send + Sync>;

/// Accessor pair for one field of a composite
pub struct Field<T> {
    name: &'static str,
    type_name: &'static str,
    resolve: fn(&Registry) -> Result<Arc<TypeEntry>>,
    encode: FieldEncode<T>,
    decode: FieldDecode<T>,
}

impl<T: 'static> Field<T> {
    pub fn new<F: WireType>(name: &'static str, get: fn(&T) -> &F, set: fn(&mut T, F)) -> Self {
        Self {
            name,
            type_name: std::any::type_name::<F>(),
            resolve: Registry::entry::<F>,
            encode: Box::new(move |value: &T, entry: &TypeEntry, out: &mut Vec<u8>| {
                entry.encode_embedded(get(value), out)
            }),
            decode: Box::new(move |target: &mut T, entry: &TypeEntry, bytes: &[u8]| {
                set(target, entry.decode_value::<F>(bytes)?);
                Ok(())
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .finish()
    }
}

/// A composite waiting to be registered.
///
/// Building resolves every field entry against the registry; the first
/// unresolved field type is reported as `EntryNotFound`.
pub struct CompositeBlueprint {
    type_id: TypeId,
    type_name: &'static str,
    build: fn(&Registry) -> Result<TypeEntry>,
}

impl CompositeBlueprint {
    pub fn of<T: Composite>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            build: build_composite::<T>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn build(&self, registry: &Registry) -> Result<TypeEntry> {
        (self.build)(registry)
    }
}

impl fmt::Debug for CompositeBlueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompositeBlueprint")
            .field(&self.type_name)
            .finish()
    }
}

fn build_composite<T: Composite>(registry: &Registry) -> Result<TypeEntry> {
    let type_name = std::any::type_name::<T>();
    let mut plan = Vec::new();
    for field in T::fields() {
        let entry = (field.resolve)(registry)?;
        plan.push((field, entry));
    }

    let fixed_size = plan
        .iter()
        .map(|(_, entry)| entry.fixed_size())
        .sum::<Option<usize>>();
    let field_entries = plan
        .iter()
        .map(|(field, entry)| FieldEntry {
            name: field.name,
            entry: entry.clone(),
        })
        .collect();
    let info = T::type_info().with_member_count(plan.len());

    let plan = Arc::new(plan);
    let encode_plan = plan.clone();
    let encode = Arc::new(move |value: &dyn Any, out: &mut Vec<u8>| -> Result<()> {
        let value = downcast::<T>(value, type_name)?;
        for (field, entry) in encode_plan.iter() {
            (field.encode)(value, entry, out)?;
        }
        Ok(())
    });

    let decode = Arc::new(move |bytes: &[u8]| -> Result<Box<dyn Any + Send>> {
        let mut value = T::default();
        let mut rest = bytes;
        for (field, entry) in plan.iter() {
            let (chunk, tail) = entry.split_embedded(rest)?;
            (field.decode)(&mut value, entry, chunk)?;
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(ProtocolError::SizeMismatch {
                type_name: type_name.to_string(),
                expected: bytes.len() - rest.len(),
                actual: bytes.len(),
            });
        }
        Ok(Box::new(value) as Box<dyn Any + Send>)
    });

    Ok(
        TypeEntry::new::<T>(info, EntryKind::Composite, fixed_size, encode, decode)
            .with_fields(field_entries),
    )
}

/// Implement [`WireType`] and [`Composite`] for a struct with named fields.
///
/// The struct must implement `Default`. Fields are serialized in the order
/// listed, which need not match declaration order.
///
/// ```rust
/// use peerlink::serialization::Registry;
/// use peerlink::wire_composite;
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// wire_composite!(Point { x: i32, y: i32 });
///
/// let registry = Registry::new();
/// let entry = registry.register_composite::<Point>().unwrap();
/// assert_eq!(entry.fixed_size(), Some(8));
///
/// let bytes = registry.serialize(&Point { x: 1, y: -1 }).unwrap();
/// assert_eq!(registry.deserialize::<Point>(&bytes).unwrap(), Point { x: 1, y: -1 });
/// ```
#[macro_export]
macro_rules! wire_composite {
    ($name:ty { $($field:ident : $ty:ty),* $(,)? }) => {
        impl $crate::serialization::WireType for $name {}

        impl $crate::serialization::Composite for $name {
            fn fields() -> ::std::vec::Vec<$crate::serialization::Field<Self>> {
                ::std::vec![
                    $(
                        $crate::serialization::Field::new::<$ty>(
                            stringify!($field),
                            |value| &value.$field,
                            |value, field| value.$field = field,
                        )
                    ),*
                ]
            }
        }
    };
}

use crate::error::{ProtocolError, Result};
use crate::serialization::entry::{downcast, EntryKind, TypeEntry};
use crate::serialization::registry::Registry;
use crate::serialization::WireType;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A fieldless enum carried on the wire as its underlying integer.
///
/// Usually implemented with [`wire_enum!`](crate::wire_enum).
pub trait WireEnum: WireType + Copy {
    type Repr: WireType + Copy + Debug;

    fn to_repr(self) -> Self::Repr;

    /// `None` for values that name no variant
    fn from_repr(repr: Self::Repr) -> Option<Self>;
}

/// Build the entry for an enum from the entry of its underlying type
pub fn enum_entry<E: WireEnum>(registry: &Registry) -> Result<TypeEntry> {
    let repr = registry.entry::<E::Repr>()?;
    let type_name = std::any::type_name::<E>();
    let fixed_size = repr.fixed_size();
    let encode_repr = repr.clone();

    let encode = Arc::new(move |value: &dyn Any, out: &mut Vec<u8>| -> Result<()> {
        let value = downcast::<E>(value, type_name)?;
        encode_repr.encode_any(&value.to_repr(), out)
    });

    let decode = Arc::new(move |bytes: &[u8]| -> Result<Box<dyn Any + Send>> {
        let raw = repr.decode_value::<E::Repr>(bytes)?;
        let value = E::from_repr(raw).ok_or_else(|| ProtocolError::InvalidEnumValue {
            type_name: type_name.to_string(),
            value: format!("{raw:?}"),
        })?;
        Ok(Box::new(value))
    });

    Ok(TypeEntry::new::<E>(
        E::type_info(),
        EntryKind::Enum,
        fixed_size,
        encode,
        decode,
    ))
}

/// Declare a fieldless enum with an explicit integer representation and
/// make it serializable.
///
/// The enum derives `Debug, Clone, Copy, PartialEq, Eq, Hash`.
///
/// ```rust
/// use peerlink::serialization::Registry;
/// use peerlink::wire_enum;
///
/// wire_enum! {
///     pub enum Color: u8 {
///         Red = 1,
///         Green = 2,
///     }
/// }
///
/// let registry = Registry::new();
/// assert_eq!(registry.serialize(&Color::Green).unwrap(), [2]);
/// assert_eq!(registry.deserialize::<Color>(&[1]).unwrap(), Color::Red);
/// assert!(registry.deserialize::<Color>(&[9]).is_err());
/// ```
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $crate::serialization::WireEnum for $name {
            type Repr = $repr;

            fn to_repr(self) -> $repr {
                self as $repr
            }

            fn from_repr(repr: $repr) -> ::std::option::Option<Self> {
                $(
                    if repr == $name::$variant as $repr {
                        return ::std::option::Option::Some($name::$variant);
                    }
                )+
                ::std::option::Option::None
            }
        }

        impl $crate::serialization::WireType for $name {
            fn derive_entry(
                registry: &$crate::serialization::Registry,
            ) -> $crate::error::Result<::std::option::Option<$crate::serialization::TypeEntry>> {
                $crate::serialization::enum_entry::<Self>(registry).map(::std::option::Option::Some)
            }

            fn type_info() -> $crate::serialization::TypeInfo {
                let variants: &[&str] = &[$(stringify!($variant)),+];
                $crate::serialization::TypeInfo::of::<Self>().with_member_count(variants.len())
            }
        }
    };
}

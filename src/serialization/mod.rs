//! # Serialization Registry
//!
//! Per-type binary codecs without hand-written marshalling.
//!
//! A type becomes serializable by one of:
//! - **Explicit registration**: an encode/decode pair plus an optional fixed
//!   size ([`Registry::register`]); the primitives come preregistered
//! - **Arrays**: `Vec<T>` of any known `T`, derived on first use
//! - **Enums**: declared with [`wire_enum!`](crate::wire_enum), derived via
//!   the underlying integer type
//! - **Composites**: structs declared with
//!   [`wire_composite!`](crate::wire_composite) and registered through
//!   [`Registry::register_composites`], which resolves dependencies between
//!   composites and rejects cycles
//!
//! ## Wire Layout
//! ```text
//! composite: field1 field2 ...        each field: [len(4, LE)] bytes
//! array:     count(4, LE) elem1 ...   each elem:  [len(4, LE)] bytes
//! ```
//! The length prefix is present only for variable-length types.

pub mod array;
pub mod composite;
pub mod entry;
pub mod enums;
pub mod fingerprint;
pub mod primitives;
pub mod registry;

pub use composite::{Composite, CompositeBlueprint, Field};
pub use entry::{EntryKind, FieldEntry, TypeEntry};
pub use enums::{enum_entry, WireEnum};
pub use fingerprint::{one_at_a_time, TypeFingerprint, TypeInfo};
pub use registry::Registry;

use crate::error::Result;
use std::any::Any;

/// A type that can have an entry in a [`Registry`].
///
/// The default implementation is not derivable: the type must be registered
/// explicitly before use.
pub trait WireType: Any + Send + Sync + Sized {
    /// Build an entry without explicit registration, or `None` if the type
    /// needs one.
    fn derive_entry(registry: &Registry) -> Result<Option<TypeEntry>> {
        let _ = registry;
        Ok(None)
    }

    /// Identity used for the type's fingerprint
    fn type_info() -> TypeInfo {
        TypeInfo::of::<Self>()
    }
}

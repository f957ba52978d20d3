use crate::error::{constants, ProtocolError, Result};
use crate::serialization::composite::{Composite, CompositeBlueprint};
use crate::serialization::entry::{downcast, EntryKind, TypeEntry};
use crate::serialization::primitives;
use crate::serialization::WireType;
use crate::utils::metrics::Timer;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, instrument};

/// Maps types to their codecs.
///
/// Entries come from explicit registration ([`register`](Registry::register),
/// [`register_composites`](Registry::register_composites)) or are derived on
/// first use for arrays and enums of known types. Each type has at most one
/// entry per registry; derived entries are cached.
///
/// ```rust
/// use peerlink::serialization::Registry;
///
/// let registry = Registry::new();
/// let bytes = registry.serialize(&vec![1u16, 2, 3]).unwrap();
/// assert_eq!(bytes, [3, 0, 0, 0, 1, 0, 2, 0, 3, 0]);
/// assert_eq!(registry.deserialize::<Vec<u16>>(&bytes).unwrap(), vec![1, 2, 3]);
/// ```
pub struct Registry {
    entries: RwLock<HashMap<TypeId, Arc<TypeEntry>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry preloaded with the primitive codecs
    /// (`bool`, integers, `f32`, `f64`, `String`)
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let entries = registry
            .entries
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in primitives::default_entries() {
            entries.insert(entry.type_id, Arc::new(entry));
        }
        registry
    }

    /// Registry without any entries
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register an explicit codec for `T`.
    ///
    /// `fixed_size` is the exact encoded length if every value has the same
    /// length; `None` marks the type variable-length, so it is length-prefixed
    /// when embedded in composites and arrays.
    pub fn register<T, E, D>(
        &self,
        fixed_size: Option<usize>,
        encode: E,
        decode: D,
    ) -> Result<Arc<TypeEntry>>
    where
        T: WireType,
        E: Fn(&T, &mut Vec<u8>) -> Result<()> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        self.insert(custom_entry::<T, E, D>(fixed_size, encode, decode))
    }

    /// Entry for `T`, deriving and caching it when possible.
    ///
    /// Fails with `EntryNotFound` naming the first type that is neither
    /// registered nor derivable.
    pub fn entry<T: WireType>(&self) -> Result<Arc<TypeEntry>> {
        if let Some(entry) = self.get_by_id(TypeId::of::<T>())? {
            return Ok(entry);
        }

        let derived = T::derive_entry(self)?
            .ok_or_else(|| ProtocolError::EntryNotFound(std::any::type_name::<T>().to_string()))?;

        // Another thread may have derived the same type meanwhile; keep the first.
        let mut entries = self.write()?;
        let entry = entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(derived))
            .clone();
        Ok(entry)
    }

    /// Cached entry by `TypeId`, without deriving
    pub fn get_by_id(&self, type_id: TypeId) -> Result<Option<Arc<TypeEntry>>> {
        Ok(self.read()?.get(&type_id).cloned())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        matches!(self.get_by_id(TypeId::of::<T>()), Ok(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn serialize<T: WireType>(&self, value: &T) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize_into(value, &mut out)?;
        Ok(out)
    }

    /// Append the encoding of `value` to `out`
    pub fn serialize_into<T: WireType>(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        self.entry::<T>()?.encode_any(value, out)
    }

    /// Decode a value occupying exactly `bytes`
    pub fn deserialize<T: WireType>(&self, bytes: &[u8]) -> Result<T> {
        self.entry::<T>()?.decode_value::<T>(bytes)
    }

    /// Register one composite type; its field types must already be known
    pub fn register_composite<T: Composite>(&self) -> Result<Arc<TypeEntry>> {
        self.register_composites([CompositeBlueprint::of::<T>()])?;
        self.entry::<T>()
    }

    /// Register a set of composites that may depend on each other.
    ///
    /// Composites whose fields reference another composite of the same batch
    /// are deferred and retried until a pass makes no progress. A field type
    /// outside the batch that cannot be resolved fails with
    /// `MissingDependency`; composites that can only wait on each other fail
    /// with `CyclicDependency`. Registering a type twice fails with
    /// `DuplicateEntry`.
    #[instrument(skip_all)]
    pub fn register_composites<I>(&self, blueprints: I) -> Result<()>
    where
        I: IntoIterator<Item = CompositeBlueprint>,
    {
        let _timer = Timer::start("register_composites");
        let mut pending: Vec<CompositeBlueprint> = Vec::new();
        for blueprint in blueprints {
            if self.get_by_id(blueprint.type_id())?.is_some() {
                return Err(ProtocolError::DuplicateEntry(blueprint.type_name().to_string()));
            }
            if !pending.iter().any(|p| p.type_id() == blueprint.type_id()) {
                pending.push(blueprint);
            }
        }

        while !pending.is_empty() {
            let pending_names: HashSet<&'static str> =
                pending.iter().map(|p| p.type_name()).collect();
            let mut deferred = Vec::new();
            let mut waiting: Vec<(&'static str, String)> = Vec::new();
            let before = pending.len();

            for blueprint in pending {
                match blueprint.build(self) {
                    Ok(entry) => {
                        debug!(composite = blueprint.type_name(), "Registered composite");
                        self.insert(entry)?;
                    }
                    Err(ProtocolError::EntryNotFound(dependency))
                        if pending_names.contains(dependency.as_str()) =>
                    {
                        waiting.push((blueprint.type_name(), dependency));
                        deferred.push(blueprint);
                    }
                    Err(ProtocolError::EntryNotFound(dependency)) => {
                        return Err(ProtocolError::MissingDependency {
                            composite: blueprint.type_name().to_string(),
                            dependency,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            if deferred.len() == before {
                return Err(find_cycle(&waiting));
            }
            pending = deferred;
        }
        Ok(())
    }

    /// Like [`register_composites`](Registry::register_composites), but types
    /// that already have an entry are skipped instead of rejected.
    pub fn try_register_composites<I>(&self, blueprints: I) -> Result<()>
    where
        I: IntoIterator<Item = CompositeBlueprint>,
    {
        let mut missing = Vec::new();
        for blueprint in blueprints {
            if self.get_by_id(blueprint.type_id())?.is_none() {
                missing.push(blueprint);
            }
        }
        self.register_composites(missing)
    }

    pub(crate) fn insert(&self, entry: TypeEntry) -> Result<Arc<TypeEntry>> {
        let mut entries = self.write()?;
        if entries.contains_key(&entry.type_id) {
            return Err(ProtocolError::DuplicateEntry(entry.type_name.to_string()));
        }
        let entry = Arc::new(entry);
        entries.insert(entry.type_id, entry.clone());
        Ok(entry)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TypeId, Arc<TypeEntry>>>> {
        self.entries
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_READ_LOCK.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TypeId, Arc<TypeEntry>>>> {
        self.entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))
    }
}

/// Every deferred composite waits on another deferred composite, so
/// following the edges must end in a loop. Report the first edge on it.
fn find_cycle(waiting: &[(&'static str, String)]) -> ProtocolError {
    let edges: HashMap<&str, &str> = waiting
        .iter()
        .map(|(composite, dependency)| (*composite, dependency.as_str()))
        .collect();

    let Some((start, _)) = waiting.first() else {
        return ProtocolError::Custom("no composites left to register".to_string());
    };

    let mut seen = HashSet::new();
    let mut current: &str = start;
    while seen.insert(current) {
        match edges.get(current) {
            Some(next) => current = *next,
            None => break,
        }
    }
    let dependency = edges.get(current).copied().unwrap_or(current);
    ProtocolError::CyclicDependency(current.to_string(), dependency.to_string())
}

pub(crate) fn custom_entry<T, E, D>(fixed_size: Option<usize>, encode: E, decode: D) -> TypeEntry
where
    T: WireType,
    E: Fn(&T, &mut Vec<u8>) -> Result<()> + Send + Sync + 'static,
    D: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
{
    let type_name = std::any::type_name::<T>();
    TypeEntry::new::<T>(
        T::type_info(),
        EntryKind::Custom,
        fixed_size,
        Arc::new(move |value: &dyn Any, out: &mut Vec<u8>| -> Result<()> {
            encode(downcast::<T>(value, type_name)?, out)
        }),
        Arc::new(move |bytes: &[u8]| -> Result<Box<dyn Any + Send>> {
            Ok(Box::new(decode(bytes)?))
        }),
    )
}

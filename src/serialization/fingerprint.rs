use std::fmt;

/// Jenkins one-at-a-time hash.
///
/// Small, stable across platforms and good enough to tell type layouts
/// apart. Not cryptographic.
pub fn one_at_a_time(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in bytes {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Name, namespace and member count of a serializable type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeInfo {
    pub name: String,
    pub namespace: String,
    pub member_count: usize,
}

impl TypeInfo {
    /// Derive name and namespace from the Rust type path.
    ///
    /// `my_app::proto::Ping` becomes name `Ping` in namespace `my_app::proto`.
    /// Generic arguments stay part of the name.
    pub fn of<T: ?Sized>() -> Self {
        Self::from_path(std::any::type_name::<T>())
    }

    pub(crate) fn from_path(path: &str) -> Self {
        let generics_at = path.find('<').unwrap_or(path.len());
        let (head, generics) = path.split_at(generics_at);
        let (namespace, name) = match head.rsplit_once("::") {
            Some((namespace, name)) => (namespace, name),
            None => ("", head),
        };
        Self {
            name: format!("{name}{generics}"),
            namespace: namespace.to_string(),
            member_count: 0,
        }
    }

    pub fn with_member_count(mut self, member_count: usize) -> Self {
        self.member_count = member_count;
        self
    }

    /// Identity fingerprint over name, namespace and member count.
    ///
    /// Types without namespace or members (primitives) hash their name only.
    pub fn fingerprint(&self) -> TypeFingerprint {
        let mut input = String::with_capacity(self.name.len() + self.namespace.len() + 4);
        input.push_str(&self.name);
        input.push_str(&self.namespace);
        if self.member_count > 0 {
            input.push_str(&self.member_count.to_string());
        }
        TypeFingerprint(one_at_a_time(input.as_bytes()))
    }
}

/// 4-byte type identity hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeFingerprint(pub u32);

impl TypeFingerprint {
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for TypeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_at_a_time_known_values() {
        assert_eq!(one_at_a_time(b""), 0);
        assert_eq!(one_at_a_time(b"a"), 0xca2e_9442);
        assert_eq!(
            one_at_a_time(b"The quick brown fox jumps over the lazy dog"),
            0x519e_91f5
        );
    }

    #[test]
    fn test_type_info_splits_path() {
        let info = TypeInfo::from_path("my_app::proto::Ping");
        assert_eq!(info.name, "Ping");
        assert_eq!(info.namespace, "my_app::proto");
    }

    #[test]
    fn test_type_info_keeps_generics_in_name() {
        let info = TypeInfo::from_path("alloc::vec::Vec<my_app::Point>");
        assert_eq!(info.name, "Vec<my_app::Point>");
        assert_eq!(info.namespace, "alloc::vec");
    }

    #[test]
    fn test_primitive_has_no_namespace() {
        let info = TypeInfo::of::<u32>();
        assert_eq!(info.name, "u32");
        assert_eq!(info.namespace, "");
        assert_eq!(info.fingerprint().0, one_at_a_time(b"u32"));
    }

    #[test]
    fn test_member_count_changes_fingerprint() {
        let base = TypeInfo::from_path("app::Point");
        let two = base.clone().with_member_count(2);
        let three = base.with_member_count(3);
        assert_ne!(two.fingerprint(), three.fingerprint());
    }
}

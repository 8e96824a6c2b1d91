//! Loaded classes for one session generation.
//!
//! Built while a session is initializing and frozen once it becomes ready.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

#[derive(Debug, Clone)]
struct ClassEntry {
    bytes: Arc<[u8]>,
    digest: [u8; 16],
}

/// Collects class bytes during initialization.
#[derive(Debug, Default)]
pub struct ClassRegistryBuilder {
    expected: usize,
    classes: BTreeMap<String, ClassEntry>,
}

impl ClassRegistryBuilder {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            classes: BTreeMap::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Adds a class. A repeated name replaces the earlier bytes.
    pub fn add(&mut self, name: String, bytes: Vec<u8>) {
        let digest = md5::compute(&bytes).0;
        let entry = ClassEntry {
            bytes: bytes.into(),
            digest,
        };
        if self.classes.insert(name.clone(), entry).is_some() {
            debug!(class = %name, "Class bytes replaced during initialization");
        }
    }

    pub fn build(self) -> ClassRegistry {
        ClassRegistry {
            classes: self.classes,
        }
    }
}

/// Immutable name → bytes map for a ready session.
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: BTreeMap<String, ClassEntry>,
}

impl ClassRegistry {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.classes.get(name).map(|entry| &*entry.bytes)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    /// Classes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.classes
            .iter()
            .map(|(name, entry)| (name.as_str(), &*entry.bytes))
    }

    pub fn digest(&self) -> ClassSetDigest {
        ClassSetDigest(
            self.classes
                .iter()
                .map(|(name, entry)| (name.clone(), entry.digest))
                .collect(),
        )
    }
}

/// Names plus byte hashes of a class set; two generations match only when
/// both agree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassSetDigest(BTreeMap<String, [u8; 16]>);

impl ClassSetDigest {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names added, removed or rebuilt relative to `previous`.
    pub fn changed_since(&self, previous: &ClassSetDigest) -> Vec<String> {
        let mut changed: Vec<String> = self
            .0
            .iter()
            .filter(|(name, digest)| previous.0.get(*name) != Some(*digest))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(
            previous
                .0
                .keys()
                .filter(|name| !self.0.contains_key(*name))
                .cloned(),
        );
        changed.sort();
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(classes: &[(&str, &str)]) -> ClassRegistry {
        let mut builder = ClassRegistryBuilder::new(classes.len());
        for (name, bytes) in classes {
            builder.add(name.to_string(), bytes.as_bytes().to_vec());
        }
        builder.build()
    }

    #[test]
    fn keeps_every_added_class() {
        let registry = registry(&[("com/acme/B", "b"), ("com/acme/A", "a")]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["com/acme/A", "com/acme/B"]);
        assert_eq!(registry.get("com/acme/A"), Some(&b"a"[..]));
        assert!(registry.get("com/acme/C").is_none());
    }

    #[test]
    fn duplicate_names_keep_latest_bytes() {
        let registry = registry(&[("A", "old"), ("A", "new")]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("A"), Some(&b"new"[..]));
    }

    #[test]
    fn digest_detects_byte_and_name_changes() {
        let before = registry(&[("A", "a"), ("B", "b")]).digest();
        let same = registry(&[("B", "b"), ("A", "a")]).digest();
        assert_eq!(before, same);

        let rebuilt = registry(&[("A", "a2"), ("B", "b")]).digest();
        assert_ne!(before, rebuilt);
        assert_eq!(rebuilt.changed_since(&before), vec!["A".to_string()]);

        let renamed = registry(&[("A", "a"), ("C", "b")]).digest();
        assert_eq!(
            renamed.changed_since(&before),
            vec!["B".to_string(), "C".to_string()]
        );
    }
}

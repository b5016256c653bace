use std::fmt;
use std::sync::Arc;

use super::EntryFlags;

/// Identifies an in-flight fill.
///
/// Two operations share a fill when they use the same cache key and the same
/// [visibility flags](EntryFlags::VISIBILITY). Flags which only affect what is *written*
/// are stripped, so that e.g. a caller which disables local cache writes still joins a
/// concurrent fill for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StampedeKey {
    key: Arc<str>,
    flags: EntryFlags,
}

impl StampedeKey {
    pub fn new(key: &str, flags: EntryFlags) -> Self {
        Self {
            key: key.into(),
            flags: flags & EntryFlags::VISIBILITY,
        }
    }

    /// The cache key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The visibility flags that take part in deduplication.
    pub fn flags(&self) -> EntryFlags {
        self.flags
    }
}

impl fmt::Display for StampedeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_flags_do_not_split_stampedes() {
        let plain = StampedeKey::new("k", EntryFlags::empty());
        let no_writes = StampedeKey::new(
            "k",
            EntryFlags::DISABLE_LOCAL_CACHE_WRITE | EntryFlags::DISABLE_DISTRIBUTED_CACHE_WRITE,
        );
        assert_eq!(plain, no_writes);
    }

    #[test]
    fn test_read_flags_split_stampedes() {
        let plain = StampedeKey::new("k", EntryFlags::empty());
        let no_local = StampedeKey::new("k", EntryFlags::DISABLE_LOCAL_CACHE);
        let no_remote = StampedeKey::new("k", EntryFlags::DISABLE_DISTRIBUTED_CACHE_READ);

        assert_ne!(plain, no_local);
        assert_ne!(plain, no_remote);
        assert_ne!(no_local, no_remote);
        assert_eq!(no_local.flags(), EntryFlags::DISABLE_LOCAL_CACHE_READ);
    }

    #[test]
    fn test_keys_differ() {
        assert_ne!(
            StampedeKey::new("a", EntryFlags::empty()),
            StampedeKey::new("b", EntryFlags::empty())
        );
    }
}

//! Bidirectional tag registry.
//!
//! Tracks which stored entries are filed under which tags, so a flush of
//! any one tag can find every entry it must evict.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::keys::HashedKey;
use super::lock::{rw_read, rw_write};
use super::tags::TagSet;

const SOURCE: &str = "cache::registry";

/// Physical identity of a stored entry: the hashed key scoped to the exact
/// tag set it was stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub scope: String,
    pub hashed_key: HashedKey,
}

impl EntryKey {
    pub fn new(tags: &TagSet, hashed_key: &HashedKey) -> Self {
        Self {
            scope: tags.canonical(),
            hashed_key: hashed_key.clone(),
        }
    }
}

/// Tracks tag → entries and entry → tags mappings.
///
/// Locks are always taken `tag_to_entries` first.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tag_to_entries: RwLock<HashMap<String, HashSet<EntryKey>>>,
    entry_to_tags: RwLock<HashMap<EntryKey, TagSet>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File an entry under every one of its tags.
    pub fn register(&self, entry: EntryKey, tags: &TagSet) {
        let mut t2e = rw_write(&self.tag_to_entries, SOURCE, "register.t2e");
        let mut e2t = rw_write(&self.entry_to_tags, SOURCE, "register.e2t");

        for tag in tags.iter() {
            t2e.entry(tag.to_string())
                .or_default()
                .insert(entry.clone());
        }
        e2t.insert(entry, tags.clone());
    }

    pub fn entries_for_tag(&self, tag: &str) -> HashSet<EntryKey> {
        rw_read(&self.tag_to_entries, SOURCE, "entries_for_tag")
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tags_for_entry(&self, entry: &EntryKey) -> Option<TagSet> {
        rw_read(&self.entry_to_tags, SOURCE, "tags_for_entry")
            .get(entry)
            .cloned()
    }

    /// Remove an entry from every tag it was filed under.
    pub fn unregister(&self, entry: &EntryKey) {
        let mut t2e = rw_write(&self.tag_to_entries, SOURCE, "unregister.t2e");
        let mut e2t = rw_write(&self.entry_to_tags, SOURCE, "unregister.e2t");
        detach(&mut t2e, &mut e2t, entry);
    }

    /// Remove every entry filed under `tag`, along with their other tag
    /// memberships. Returns the removed entries.
    pub fn drain_tag(&self, tag: &str) -> HashSet<EntryKey> {
        let mut t2e = rw_write(&self.tag_to_entries, SOURCE, "drain_tag.t2e");
        let mut e2t = rw_write(&self.entry_to_tags, SOURCE, "drain_tag.e2t");

        let entries = t2e.remove(tag).unwrap_or_default();
        for entry in &entries {
            detach(&mut t2e, &mut e2t, entry);
        }
        entries
    }

    pub fn clear(&self) {
        rw_write(&self.tag_to_entries, SOURCE, "clear.t2e").clear();
        rw_write(&self.entry_to_tags, SOURCE, "clear.e2t").clear();
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.tag_to_entries, SOURCE, "tag_count").len()
    }

    pub fn entry_count(&self) -> usize {
        rw_read(&self.entry_to_tags, SOURCE, "entry_count").len()
    }
}

fn detach(
    t2e: &mut HashMap<String, HashSet<EntryKey>>,
    e2t: &mut HashMap<EntryKey, TagSet>,
    entry: &EntryKey,
) {
    let Some(tags) = e2t.remove(entry) else {
        return;
    };
    for tag in tags.iter() {
        if let Some(entries) = t2e.get_mut(tag) {
            entries.remove(entry);
            if entries.is_empty() {
                t2e.remove(tag);
            }
        }
    }
}

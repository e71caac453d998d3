//! In-memory graph index mapping keys to their location inside a group
//! compress block.
//!
//! This plays the role of `_GCGraphIndex`/`_GCBuildDetails`: given a key, it
//! answers "which block is it in, where in that block, and what are its
//! parents" without touching the block itself. The on-disk B-tree index
//! format the original backs this with is a separate, general-purpose
//! Breezy subsystem and is out of scope here; this index is an in-memory
//! stand-in with the same query surface.

use crate::groupcompress::container::ReadMemo;
use crate::versionedfile::{Error, Key};
use std::collections::{HashMap, HashSet};

/// Where a key's content lives: the block's read-memo into the access layer,
/// plus the byte span of the key's own content within that (decompressed)
/// block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMemo {
    pub read_memo: ReadMemo,
    pub group_start: usize,
    pub group_end: usize,
}

/// Everything needed to locate and reconstruct one key's content, short of
/// the block bytes themselves.
#[derive(Debug, Clone)]
pub struct BuildDetails {
    pub index_memo: IndexMemo,
    pub parents: Option<Vec<Key>>,
}

/// A key → location mapping for a group compress store.
///
/// Not thread-safe and not persisted; callers needing durability serialize
/// their own `(key, parents, index_memo)` records alongside the blocks.
#[derive(Default)]
pub struct GraphIndex {
    entries: HashMap<Key, BuildDetails>,
    /// Insertion order, so `keys()` is stable and matches what most callers
    /// (e.g. repack candidates) expect from an append-only index.
    order: Vec<Key>,
    track_external_parent_refs: bool,
    external_refs: HashMap<Key, usize>,
}

impl GraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external_parent_tracking() -> Self {
        Self {
            track_external_parent_refs: true,
            ..Self::default()
        }
    }

    /// Record one key's location and parentage. Returns an error if `key`
    /// is already present with different parents or a different location,
    /// matching the "inconsistency is fatal" default of the original.
    pub fn add_record(
        &mut self,
        key: Key,
        parents: Option<Vec<Key>>,
        index_memo: IndexMemo,
    ) -> Result<(), Error> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.parents != parents {
                return Err(Error::InconsistentParents {
                    key,
                    expected: existing.parents.clone(),
                    actual: parents,
                });
            }
            return Ok(());
        }
        if self.track_external_parent_refs {
            if let Some(ref parents) = parents {
                for parent in parents {
                    *self.external_refs.entry(parent.clone()).or_insert(0) += 1;
                }
            }
        }
        self.order.push(key.clone());
        self.entries.insert(
            key,
            BuildDetails {
                index_memo,
                parents,
            },
        );
        Ok(())
    }

    pub fn get_build_details(&self, keys: &[Key]) -> HashMap<Key, BuildDetails> {
        keys.iter()
            .filter_map(|k| self.entries.get(k).map(|d| (k.clone(), d.clone())))
            .collect()
    }

    pub fn get_parent_map(&self, keys: &[Key]) -> HashMap<Key, Option<Vec<Key>>> {
        keys.iter()
            .filter_map(|k| self.entries.get(k).map(|d| (k.clone(), d.parents.clone())))
            .collect()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<Key> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Parent keys referenced by some entry but never themselves added,
    /// i.e. ghosts. Only tracked when built via
    /// [`Self::with_external_parent_tracking`].
    pub fn missing_parents(&self) -> Vec<Key> {
        self.external_refs
            .keys()
            .filter(|k| !self.entries.contains_key(k))
            .cloned()
            .collect()
    }

    /// `keys` plus every ancestor reachable by following recorded parents,
    /// stopping at ghosts. Used by repack to decide which blocks a
    /// candidate set of keys actually touches.
    pub fn find_ancestry(&self, keys: &[Key]) -> HashSet<Key> {
        let mut seen = HashSet::new();
        let mut pending: Vec<Key> = keys.to_vec();
        while let Some(key) = pending.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(parents) = self.entries.get(&key).and_then(|d| d.parents.clone()) {
                for parent in parents {
                    if !seen.contains(&parent) {
                        pending.push(parent);
                    }
                }
            }
        }
        seen
    }

    /// Stream build details for `keys` in this index's insertion order,
    /// skipping any key not present. An empty `keys` means every entry.
    pub fn iter_entries(&self, keys: &[Key]) -> Vec<(Key, BuildDetails)> {
        let wanted: Option<HashSet<&Key>> = if keys.is_empty() {
            None
        } else {
            Some(keys.iter().collect())
        };
        self.order
            .iter()
            .filter(|k| wanted.as_ref().is_none_or(|w| w.contains(k)))
            .filter_map(|k| self.entries.get(k).map(|d| (k.clone(), d.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Key {
        Key::Fixed(vec![s.as_bytes().to_vec()])
    }

    #[test]
    fn add_and_lookup() {
        let mut index = GraphIndex::new();
        index
            .add_record(
                key("a"),
                Some(vec![]),
                IndexMemo {
                    read_memo: (0, 0, 0),
                    group_start: 0,
                    group_end: 10,
                },
            )
            .unwrap();
        index
            .add_record(
                key("b"),
                Some(vec![key("a")]),
                IndexMemo {
                    read_memo: (0, 0, 0),
                    group_start: 10,
                    group_end: 20,
                },
            )
            .unwrap();

        let details = index.get_build_details(&[key("a"), key("b"), key("missing")]);
        assert_eq!(details.len(), 2);
        assert_eq!(details[&key("b")].parents, Some(vec![key("a")]));

        let parent_map = index.get_parent_map(&[key("a"), key("b")]);
        assert_eq!(parent_map[&key("a")], Some(vec![]));
        assert_eq!(parent_map[&key("b")], Some(vec![key("a")]));

        assert_eq!(index.keys(), vec![key("a"), key("b")]);
    }

    #[test]
    fn rejects_inconsistent_reinsertion() {
        let mut index = GraphIndex::new();
        let memo = IndexMemo {
            read_memo: (0, 0, 0),
            group_start: 0,
            group_end: 5,
        };
        index.add_record(key("a"), Some(vec![]), memo).unwrap();
        let err = index.add_record(key("a"), Some(vec![key("b")]), memo);
        assert!(err.is_err());
    }

    #[test]
    fn tracks_missing_parents() {
        let mut index = GraphIndex::with_external_parent_tracking();
        index
            .add_record(
                key("b"),
                Some(vec![key("a")]),
                IndexMemo {
                    read_memo: (0, 0, 0),
                    group_start: 0,
                    group_end: 5,
                },
            )
            .unwrap();
        assert_eq!(index.missing_parents(), vec![key("a")]);
    }

    fn memo(start: usize, end: usize) -> IndexMemo {
        IndexMemo {
            read_memo: (0, 0, 0),
            group_start: start,
            group_end: end,
        }
    }

    #[test]
    fn find_ancestry_walks_parents_and_stops_at_ghosts() {
        let mut index = GraphIndex::new();
        index.add_record(key("a"), Some(vec![]), memo(0, 5)).unwrap();
        index
            .add_record(key("b"), Some(vec![key("a")]), memo(5, 10))
            .unwrap();
        index
            .add_record(key("c"), Some(vec![key("b"), key("ghost")]), memo(10, 15))
            .unwrap();

        let ancestry = index.find_ancestry(&[key("c")]);
        assert_eq!(
            ancestry,
            HashSet::from([key("a"), key("b"), key("c"), key("ghost")])
        );
    }

    #[test]
    fn iter_entries_preserves_insertion_order_and_filters_to_requested_keys() {
        let mut index = GraphIndex::new();
        index.add_record(key("a"), Some(vec![]), memo(0, 5)).unwrap();
        index.add_record(key("b"), Some(vec![]), memo(5, 10)).unwrap();
        index.add_record(key("c"), Some(vec![]), memo(10, 15)).unwrap();

        let all: Vec<Key> = index.iter_entries(&[]).into_iter().map(|(k, _)| k).collect();
        assert_eq!(all, vec![key("a"), key("b"), key("c")]);

        let filtered: Vec<Key> = index
            .iter_entries(&[key("c"), key("a"), key("missing")])
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(filtered, vec![key("a"), key("c")]);
    }
}

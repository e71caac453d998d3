//! Lazy repacking of group compress blocks.
//!
//! A [`ContentManager`] owns one [`GroupCompressBlock`] and the set of keys
//! extracted from it so far. Decompression of the block is deferred until a
//! factory's bytes are actually asked for, and when only a small fraction of
//! a large block is actually wanted, the block gets trimmed or rebuilt down
//! to just the referenced bytes instead of being kept around in full.

use crate::groupcompress::block::GroupCompressBlock;
use crate::groupcompress::compressor::{
    CompressorSettings, GroupCompressor, TraditionalGroupCompressor,
};
use crate::versionedfile::{ContentFactory, Error, Key, StorageKind};
use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

struct FactoryState {
    key: Key,
    parents: Option<Vec<Key>>,
    sha1: Option<String>,
    start: usize,
    end: usize,
}

struct Inner {
    block: GroupCompressBlock,
    factories: Vec<FactoryState>,
    last_byte: usize,
}

/// Whether a block needs repacking before it can be shipped, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildAction {
    /// Drop everything past the last byte any live factory references.
    Trim,
    /// Recompress only the referenced spans into a fresh block.
    Rebuild,
}

/// Above this block size, and below this fraction of bytes actually used,
/// a block is not considered well utilised.
const MAX_CUT_FRACTION: f64 = 0.75;
const FULL_BLOCK_SIZE: usize = 4 * 1024 * 1024;
const FULL_MIXED_BLOCK_SIZE: usize = 2 * 1024 * 1024;
const FULL_ENOUGH_BLOCK_SIZE: usize = 3 * 1024 * 1024;
const FULL_ENOUGH_MIXED_BLOCK_SIZE: usize = 2 * 768 * 1024; // 1.5MiB

/// Owns one group compress block and lazily hands out its content.
pub struct ContentManager {
    inner: RefCell<Inner>,
}

impl ContentManager {
    pub fn new(block: GroupCompressBlock) -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(Inner {
                block,
                factories: Vec::new(),
                last_byte: 0,
            }),
        })
    }

    /// Register a key's span within the block and return a [`ContentFactory`]
    /// for it. The factory holds only a weak reference back to `self`, so it
    /// never keeps the manager (and its block) alive on its own.
    pub fn add_factory(
        self: &Rc<Self>,
        key: Key,
        parents: Option<Vec<Key>>,
        start: usize,
        end: usize,
    ) -> GroupCompressFactory {
        let mut inner = self.inner.borrow_mut();
        let index = inner.factories.len();
        if end > inner.last_byte {
            inner.last_byte = end;
        }
        inner.factories.push(FactoryState {
            key: key.clone(),
            parents: parents.clone(),
            sha1: None,
            start,
            end,
        });
        drop(inner);
        GroupCompressFactory {
            key,
            parents,
            index,
            manager: Rc::downgrade(self),
        }
    }

    /// A factory for every key added so far, in insertion order.
    pub fn get_record_stream(self: &Rc<Self>) -> Vec<GroupCompressFactory> {
        let inner = self.inner.borrow();
        (0..inner.factories.len())
            .map(|index| {
                let f = &inner.factories[index];
                GroupCompressFactory {
                    key: f.key.clone(),
                    parents: f.parents.clone(),
                    index,
                    manager: Rc::downgrade(self),
                }
            })
            .collect()
    }

    /// Every key this manager holds, with its parents and byte span, in
    /// insertion order. Used to rebuild index entries for a block that was
    /// copied verbatim from another store rather than recompressed.
    pub fn factory_spans(&self) -> Vec<(Key, Option<Vec<Key>>, usize, usize)> {
        self.inner
            .borrow()
            .factories
            .iter()
            .map(|f| (f.key.clone(), f.parents.clone(), f.start, f.end))
            .collect()
    }

    /// A factory for a single key, if this manager's block holds it.
    pub fn factory_for_key(self: &Rc<Self>, key: &Key) -> Option<GroupCompressFactory> {
        let inner = self.inner.borrow();
        let index = inner.factories.iter().position(|f| &f.key == key)?;
        let f = &inner.factories[index];
        Some(GroupCompressFactory {
            key: f.key.clone(),
            parents: f.parents.clone(),
            index,
            manager: Rc::downgrade(self),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extract(&self, index: usize) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.borrow_mut();
        let last_byte = inner.last_byte;
        inner.block.ensure_content(Some(last_byte));
        let (start, end) = {
            let f = &inner.factories[index];
            (f.start, f.end)
        };
        let chunks = inner
            .block
            .extract(start, end)
            .map_err(|e| Error::Decompress(e.to_string()))?;
        Ok(chunks.concat())
    }

    /// A block containing a single key is never well utilised: there is
    /// nothing to amortise the block's own overhead against.
    pub fn check_is_well_utilized(&self) -> bool {
        if self.inner.borrow().factories.len() < 2 {
            return false;
        }
        let (_, _, total_bytes_used) = self.check_rebuild_action();
        let inner = self.inner.borrow();
        let block_size = inner.block.content_length().unwrap_or(0);
        if (total_bytes_used as f64) < block_size as f64 * MAX_CUT_FRACTION {
            // This block wants to trim itself small enough to count as
            // under-utilized.
            return false;
        }
        if block_size >= FULL_ENOUGH_BLOCK_SIZE {
            return true;
        }
        // Below the single-content threshold, a block can still count as
        // full if it holds mixed-prefix content above the lower threshold.
        let mut common_prefix: Option<&[Vec<u8>]> = None;
        for f in &inner.factories {
            let parts = f.key.parts();
            let prefix = &parts[..parts.len().saturating_sub(1)];
            match common_prefix {
                None => common_prefix = Some(prefix),
                Some(cp) if cp != prefix => {
                    return block_size >= FULL_ENOUGH_MIXED_BLOCK_SIZE;
                }
                _ => {}
            }
        }
        false
    }

    /// Decide whether this block should be trimmed, rebuilt, or left alone
    /// before being handed off (shipped over the wire, or written to an
    /// index), and how many bytes are actually used if it is.
    pub fn check_rebuild_action(&self) -> (Option<RebuildAction>, usize, usize) {
        let inner = self.inner.borrow();
        let mut total_bytes_used = 0usize;
        let mut last_byte_used = 0usize;
        for f in &inner.factories {
            total_bytes_used += f.end.saturating_sub(f.start);
            if f.end > last_byte_used {
                last_byte_used = f.end;
            }
        }
        let block_len = inner.block.content_length().unwrap_or(0);
        if total_bytes_used * 2 >= block_len {
            // Using more than half of the block's bytes; nothing to check.
            return (None, last_byte_used, total_bytes_used);
        }
        let action = if total_bytes_used * 2 > last_byte_used {
            // Used content is clustered at the front: just trim the tail.
            RebuildAction::Trim
        } else {
            RebuildAction::Rebuild
        };
        log::debug!(
            "repack decision: {action:?} (total_bytes_used={total_bytes_used}, \
             last_byte_used={last_byte_used}, block_len={block_len})"
        );
        (Some(action), last_byte_used, total_bytes_used)
    }

    pub fn trim_block(&self, last_byte_used: usize) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.block.ensure_content(Some(last_byte_used));
        let content = inner.block.content().unwrap()[..last_byte_used].to_vec();
        let mut new_block = GroupCompressBlock::new();
        new_block.set_content(&content);
        inner.block = new_block;
        inner.last_byte = last_byte_used;
        Ok(())
    }

    pub fn rebuild_block(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let mut compressor = TraditionalGroupCompressor::new();
        let mut end_point = 0usize;
        for i in 0..inner.factories.len() {
            let (start, end, key, sha1) = {
                let f = &inner.factories[i];
                (f.start, f.end, f.key.clone(), f.sha1.clone())
            };
            let chunks = inner
                .block
                .extract(start, end)
                .map_err(|e| Error::Decompress(e.to_string()))?;
            let chunks_len: usize = chunks.iter().map(|c| c.len()).sum();
            let chunk_refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
            let (new_sha1, new_start, new_end, _kind) =
                compressor.compress(&key, &chunk_refs, chunks_len, sha1, None, None)?;
            let f = &mut inner.factories[i];
            f.sha1 = Some(new_sha1);
            f.start = new_start;
            f.end = new_end;
            end_point = new_end;
        }
        inner.last_byte = end_point;
        let (chunks, endpoint) = compressor.flush();
        let mut new_block = GroupCompressBlock::new();
        new_block.set_chunked_content(&chunks, endpoint);
        inner.block = new_block;
        Ok(())
    }

    /// Trim or rebuild as [`Self::check_rebuild_action`] recommends.
    pub fn check_rebuild_block(&self) -> Result<(), Error> {
        let (action, last_byte_used, _total) = self.check_rebuild_action();
        match action {
            None => Ok(()),
            Some(RebuildAction::Trim) => self.trim_block(last_byte_used),
            Some(RebuildAction::Rebuild) => self.rebuild_block(),
        }
    }

    fn join_key(parts: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push(0);
            }
            out.extend_from_slice(part);
        }
        out
    }

    /// Serialize this manager's block, repacking it first if warranted, as
    /// a self-contained wire envelope.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, Error> {
        self.check_rebuild_block()?;
        let mut inner = self.inner.borrow_mut();
        let mut header = Vec::new();
        for f in &inner.factories {
            header.extend_from_slice(&Self::join_key(f.key.parts()));
            header.push(b'\n');
            match &f.parents {
                None => header.extend_from_slice(b"None:"),
                Some(parents) => {
                    for (i, p) in parents.iter().enumerate() {
                        if i > 0 {
                            header.push(b'\t');
                        }
                        header.extend_from_slice(&Self::join_key(p.parts()));
                    }
                }
            }
            header.push(b'\n');
            header.extend_from_slice(f.start.to_string().as_bytes());
            header.push(b'\n');
            header.extend_from_slice(f.end.to_string().as_bytes());
            header.push(b'\n');
        }
        let block_bytes = inner.block.to_bytes();
        crate::groupcompress::wire::encode(&header, &block_bytes)
            .map_err(|e| Error::Corrupt(e.to_string()))
    }

    /// Rebuild a manager from the bytes [`Self::to_wire_bytes`] produced.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Rc<Self>, Error> {
        let (header, block_bytes) =
            crate::groupcompress::wire::decode(bytes).map_err(|e| Error::Corrupt(e.to_string()))?;
        let block = GroupCompressBlock::from_bytes(block_bytes.as_slice())
            .map_err(|e| Error::Corrupt(e.to_string()))?;
        let manager = Self::new(block);

        let mut lines: Vec<&[u8]> = header.split(|&b| b == b'\n').collect();
        if lines.last() == Some(&&b""[..]) {
            lines.pop();
        }
        if !lines.len().is_multiple_of(4) {
            return Err(Error::Corrupt("group compress header not a multiple of 4 lines".into()));
        }
        for chunk in lines.chunks(4) {
            let key = Key::Fixed(chunk[0].split(|&b| b == 0).map(|s| s.to_vec()).collect());
            let parents = if chunk[1] == b"None:" {
                None
            } else {
                Some(
                    chunk[1]
                        .split(|&b| b == b'\t')
                        .map(|seg| Key::Fixed(seg.split(|&b| b == 0).map(|s| s.to_vec()).collect()))
                        .collect(),
                )
            };
            let start: usize = std::str::from_utf8(chunk[2])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupt("bad start offset in header".into()))?;
            let end: usize = std::str::from_utf8(chunk[3])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupt("bad end offset in header".into()))?;
            manager.add_factory(key, parents, start, end);
        }
        Ok(manager)
    }
}

/// Tunables consulted by [`crate::groupcompress::facade`] when deciding how
/// large a block to build before flushing it. Exposed here since they
/// travel together with the manager/compressor pairing they parametrize.
pub fn default_compressor_settings() -> CompressorSettings {
    CompressorSettings::default()
}

pub const FULL_BLOCK_SIZE_BYTES: usize = FULL_BLOCK_SIZE;
pub const FULL_MIXED_BLOCK_SIZE_BYTES: usize = FULL_MIXED_BLOCK_SIZE;

/// A lazily-materialized record backed by a [`ContentManager`]'s block.
///
/// Cheap to clone the key/parents out of; actually extracting the fulltext
/// decompresses (and possibly trims/rebuilds) the owning block on demand.
pub struct GroupCompressFactory {
    key: Key,
    parents: Option<Vec<Key>>,
    index: usize,
    manager: Weak<ContentManager>,
}

impl ContentFactory for GroupCompressFactory {
    fn sha1(&self) -> Option<Vec<u8>> {
        self.manager.upgrade().and_then(|m| {
            m.inner
                .borrow()
                .factories
                .get(self.index)
                .and_then(|f| f.sha1.clone())
                .map(|s| s.into_bytes())
        })
    }

    fn size(&self) -> Option<usize> {
        None
    }

    fn key(&self) -> Key {
        self.key.clone()
    }

    fn parents(&self) -> Option<Vec<Key>> {
        self.parents.clone()
    }

    fn to_fulltext(&self) -> Result<Cow<'_, [u8]>, Error> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::Corrupt("group content manager no longer available".into()))?;
        Ok(Cow::Owned(manager.extract(self.index)?))
    }

    fn to_chunks(&self) -> Result<Box<dyn Iterator<Item = Cow<'_, [u8]>> + '_>, Error> {
        let data = self.to_fulltext()?.into_owned();
        Ok(Box::new(std::iter::once(Cow::Owned(data))))
    }

    fn into_fulltext(self: Box<Self>) -> Result<Vec<u8>, Error> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::Corrupt("group content manager no longer available".into()))?;
        manager.extract(self.index)
    }

    fn into_chunks(self: Box<Self>) -> Result<Box<dyn Iterator<Item = Vec<u8>>>, Error> {
        Ok(Box::new(std::iter::once(self.into_fulltext()?)))
    }

    fn storage_kind(&self) -> StorageKind {
        if self.index == 0 {
            StorageKind::GroupCompressBlock
        } else {
            StorageKind::GroupCompressBlockRef
        }
    }

    fn map_key(&mut self, f: &dyn Fn(Key) -> Key) {
        self.key = f(self.key.clone());
        self.parents = self.parents.take().map(|v| v.into_iter().map(f).collect());
    }
}

impl GroupCompressFactory {
    /// The owning block's wire bytes, for a [`StorageKind::GroupCompressBlock`]
    /// factory that a caller wants to copy verbatim rather than recompress.
    pub fn block_wire_bytes(&self) -> Result<Vec<u8>, Error> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::Corrupt("group content manager no longer available".into()))?;
        manager.to_wire_bytes()
    }

    /// Whether the owning block is well utilised, i.e. worth copying
    /// verbatim instead of extracting and recompressing from scratch.
    pub fn block_is_well_utilized(&self) -> bool {
        self.manager
            .upgrade()
            .map(|m| m.check_is_well_utilized())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groupcompress::compressor::GroupCompressor;

    fn build_manager(keys: &[(&str, &[u8])]) -> Rc<ContentManager> {
        let mut compressor = TraditionalGroupCompressor::new();
        let mut spans = Vec::new();
        for (name, content) in keys {
            let (_, start, end, _kind) = compressor
                .compress(
                    &Key::Fixed(vec![name.as_bytes().to_vec()]),
                    &[content],
                    content.len(),
                    None,
                    None,
                    None,
                )
                .unwrap();
            spans.push((name.to_string(), start, end));
        }
        let (chunks, endpoint) = compressor.flush();
        let mut block = GroupCompressBlock::new();
        block.set_chunked_content(&chunks, endpoint);
        let manager = ContentManager::new(block);
        for (name, start, end) in spans {
            manager.add_factory(Key::Fixed(vec![name.into_bytes()]), None, start, end);
        }
        manager
    }

    #[test]
    fn only_the_first_factory_carries_the_whole_block() {
        let manager = build_manager(&[("a", b"hello world"), ("b", b"goodbye world")]);
        let factories = manager.get_record_stream();
        assert_eq!(factories[0].storage_kind(), StorageKind::GroupCompressBlock);
        assert_eq!(factories[1].storage_kind(), StorageKind::GroupCompressBlockRef);
    }

    #[test]
    fn extract_returns_distinct_records() {
        let manager = build_manager(&[("a", b"hello world"), ("b", b"goodbye world")]);
        let factories = manager.get_record_stream();
        assert_eq!(factories.len(), 2);
        assert_eq!(&*factories[0].to_fulltext().unwrap(), b"hello world");
        assert_eq!(&*factories[1].to_fulltext().unwrap(), b"goodbye world");
    }

    #[test]
    fn wire_roundtrip_preserves_content() {
        let manager = build_manager(&[("a", b"hello world"), ("b", b"goodbye world")]);
        let bytes = manager.to_wire_bytes().unwrap();
        let restored = ContentManager::from_wire_bytes(&bytes).unwrap();
        let factories = restored.get_record_stream();
        assert_eq!(factories.len(), 2);
        assert_eq!(&*factories[0].to_fulltext().unwrap(), b"hello world");
        assert_eq!(&*factories[1].to_fulltext().unwrap(), b"goodbye world");
    }

    #[test]
    fn single_key_block_is_never_well_utilized() {
        let manager = build_manager(&[("a", b"hello world")]);
        assert!(!manager.check_is_well_utilized());
    }

    /// Builds a manager whose block has an exact `content_length` and whose
    /// factories reference exactly the given `(start, end)` spans, bypassing
    /// the compressor so the rebuild-action arithmetic can be checked against
    /// known numbers.
    fn build_manager_with_spans(block_len: usize, spans: &[(usize, usize)]) -> Rc<ContentManager> {
        let mut block = GroupCompressBlock::new();
        block.set_content(&vec![0u8; block_len]);
        let manager = ContentManager::new(block);
        for (i, (start, end)) in spans.iter().enumerate() {
            manager.add_factory(Key::Fixed(vec![format!("k{i}").into_bytes()]), None, *start, *end);
        }
        manager
    }

    #[test]
    fn rebuild_action_picks_rebuild_when_used_bytes_are_sparse_and_scattered() {
        // block_len=100, last_byte_used=60, total_bytes_used=21: 42 <= 60, so
        // this must rebuild rather than trim (it would wrongly "trim" if the
        // decision compared last_byte_used/block_len against a fixed fraction
        // instead of total_bytes_used*2 against last_byte_used).
        let manager = build_manager_with_spans(100, &[(0, 10), (49, 60)]);
        let (action, last_byte_used, total_bytes_used) = manager.check_rebuild_action();
        assert_eq!(total_bytes_used, 21);
        assert_eq!(last_byte_used, 60);
        assert_eq!(action, Some(RebuildAction::Rebuild));
    }

    #[test]
    fn rebuild_action_picks_trim_when_used_bytes_are_clustered_at_front() {
        // total_bytes_used*2 (80) > last_byte_used (60): used bytes are
        // clustered near the front, so trimming the tail suffices.
        let manager = build_manager_with_spans(1000, &[(0, 40), (20, 60)]);
        let (action, last_byte_used, total_bytes_used) = manager.check_rebuild_action();
        assert_eq!(total_bytes_used, 40 + 40);
        assert_eq!(last_byte_used, 60);
        assert_eq!(action, Some(RebuildAction::Trim));
    }

    #[test]
    fn well_utilized_requires_meeting_cut_fraction_before_size_thresholds() {
        // total_bytes_used (21) is far below block_len * 0.75 (75), so this
        // must report under-utilized even though the block is itself large
        // enough to clear FULL_ENOUGH_BLOCK_SIZE.
        let manager = build_manager_with_spans(FULL_ENOUGH_BLOCK_SIZE + 1, &[(0, 10), (49, 60)]);
        assert!(!manager.check_is_well_utilized());
    }
}

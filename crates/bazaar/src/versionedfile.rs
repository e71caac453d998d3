//! The versioned-files facade: keys, content factories, orderings and the
//! error taxonomy shared by every store built on top of group compress.

use std::borrow::Cow;
use std::collections::HashMap;

#[derive(Debug)]
pub enum Error {
    /// `add_lines`/`add_content` was asked to store content whose sha1
    /// matched a caller-supplied `nostore_sha`.
    ExistingContent(Key),
    /// A legacy single-file version id was requested but isn't present.
    VersionNotPresent(VersionId),
    /// A key was requested but is not present in this store (or any fallback).
    Absent(Key),
    /// The content exists, but not in the representation the caller asked for.
    UnavailableRepresentation(Key),
    /// The backing bytes failed an integrity check (bad sha1, bad length, a
    /// rebuild that would have inflated a non-well-utilised block, ...).
    Corrupt(String),
    /// A compressed block failed to decompress.
    Decompress(String),
    /// The caller should retry the operation (used when a fallback store's
    /// content changed concurrently).
    Retry,
    /// The store doesn't accept writes.
    ReadOnly,
    /// A record stream claimed different parents than the ones already on file.
    InconsistentParents {
        key: Key,
        expected: Option<Vec<Key>>,
        actual: Option<Vec<Key>>,
    },
    Io(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<crate::groupcompress::container::Error> for Error {
    fn from(e: crate::groupcompress::container::Error) -> Error {
        Error::Corrupt(e.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ExistingContent(key) => write!(f, "Existing content: {}", key),
            Error::VersionNotPresent(version) => write!(f, "Version not present: {}", version),
            Error::Absent(key) => write!(f, "Key not present: {}", key),
            Error::UnavailableRepresentation(key) => {
                write!(f, "Representation not available for: {}", key)
            }
            Error::Corrupt(msg) => write!(f, "Corrupt data: {}", msg),
            Error::Decompress(msg) => write!(f, "Decompression failed: {}", msg),
            Error::Retry => write!(f, "Operation should be retried"),
            Error::ReadOnly => write!(f, "Store is read-only"),
            Error::InconsistentParents {
                key,
                expected,
                actual,
            } => write!(
                f,
                "Inconsistent parents for {}: expected {:?}, got {:?}",
                key, expected, actual
            ),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// The order in which a `get_record_stream` caller wants its keys delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ordering {
    /// No ordering guarantee; the store may deliver whatever is cheapest.
    Unordered,
    /// Parents are guaranteed to come before children.
    Topological,
    /// Like `Topological`, but further biased towards the on-disk grouping so
    /// that records sharing a group block are read together.
    Groupcompress,
    /// Delivered in exactly the order the keys were requested.
    AsRequested,
}

impl std::fmt::Display for Ordering {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Ordering::Unordered => "unordered",
            Ordering::Topological => "topological",
            Ordering::Groupcompress => "groupcompress",
            Ordering::AsRequested => "as-requested",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionId(Vec<u8>);

impl VersionId {
    pub fn new(bytes: Vec<u8>) -> Self {
        VersionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "VersionId({:?})", self.0)
    }
}

/// A key into the shared keyspace of a `VersionedFiles` store.
///
/// `Fixed` keys carry an explicit, caller-chosen identifier as their last
/// element. `ContentAddressed` keys have that last element filled in by the
/// store itself once the content's sha1 is known (see
/// [`crate::groupcompress::compressor::GroupCompressor::compress`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Fixed(Vec<Vec<u8>>),
    ContentAddressed(Vec<Vec<u8>>),
}

impl Key {
    pub fn add_prefix(&mut self, prefix: &[&[u8]]) {
        let v = match self {
            Key::Fixed(ref mut v) => v,
            Key::ContentAddressed(ref mut v) => v,
        };
        for p in prefix.iter().rev() {
            v.insert(0, p.to_vec());
        }
    }

    pub fn parts(&self) -> &[Vec<u8>] {
        match self {
            Key::Fixed(v) => v,
            Key::ContentAddressed(v) => v,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Key::Fixed(v) => {
                write!(f, "(")?;
                for (i, v) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", v)?;
                }
                write!(f, ")")
            }
            Key::ContentAddressed(v) => {
                write!(f, "(")?;
                for v in v.iter() {
                    write!(f, "{:?}, ", v)?;
                }
                write!(f, "<ContentAddressed>)")
            }
        }
    }
}

/// A key isn't accepted for insertion if its final component looks like a
/// reserved/internal id (currently: nothing is reserved by this store, but
/// the hook exists for stacked formats to veto specific ids).
pub fn check_not_reserved_id(_key: &Key) -> bool {
    true
}

/// Lazily-materialized content for one key, plus its metadata.
///
/// Implementations may fail to produce content (see [`AbsentContentFactory`]):
/// every accessor is therefore fallible rather than panicking.
pub trait ContentFactory {
    fn sha1(&self) -> Option<Vec<u8>>;

    fn size(&self) -> Option<usize>;

    fn key(&self) -> Key;

    /// Parent keys for `self.key()`. `None` means "parentage unknown", which
    /// is distinct from `Some(vec![])` (known to have no parents).
    fn parents(&self) -> Option<Vec<Key>>;

    fn to_fulltext(&self) -> Result<Cow<'_, [u8]>, Error>;

    fn to_chunks(&self) -> Result<Box<dyn Iterator<Item = Cow<'_, [u8]>> + '_>, Error>;

    fn to_lines(&self) -> Result<Box<dyn Iterator<Item = Cow<'_, [u8]>> + '_>, Error> {
        let fulltext = self.to_fulltext()?;
        Ok(Box::new(
            breezy_osutils::chunks_to_lines(std::iter::once(Ok::<_, std::io::Error>(fulltext)))
                .map(|v| v.unwrap()),
        ))
    }

    fn into_fulltext(self: Box<Self>) -> Result<Vec<u8>, Error>;

    fn into_chunks(self: Box<Self>) -> Result<Box<dyn Iterator<Item = Vec<u8>>>, Error>;

    fn into_lines(self: Box<Self>) -> Result<Box<dyn Iterator<Item = Vec<u8>>>, Error> {
        let fulltext = self.into_fulltext()?;
        Ok(Box::new(
            breezy_osutils::chunks_to_lines(std::iter::once(Ok::<_, std::io::Error>(fulltext)))
                .map(|v| v.unwrap().into_owned()),
        ))
    }

    /// A short tag describing how this factory will deliver its bytes
    /// (e.g. `"fulltext"`, `"groupcompress-block"`, `"absent"`). Used by the
    /// batching fetcher to decide whether bytes can be copied verbatim.
    fn storage_kind(&self) -> StorageKind;

    fn map_key(&mut self, f: &dyn Fn(Key) -> Key);
}

/// How a [`ContentFactory`] will deliver its bytes. Replaces the stringly
/// typed `storage_kind()` the Python implementation used, while keeping the
/// same cases: a plain fulltext or chunk sequence, a whole compressed group
/// block plus an intra-block span, or "not present".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Fulltext,
    Chunked,
    /// The full bytes of a group block, to be stored or relayed verbatim.
    GroupCompressBlock,
    /// A reference into a group block the recipient already has, or will
    /// receive earlier in the same stream.
    GroupCompressBlockRef,
    Absent,
}

pub struct FulltextContentFactory {
    sha1: Option<Vec<u8>>,
    size: usize,
    key: Key,
    parents: Option<Vec<Key>>,
    fulltext: Vec<u8>,
}

impl FulltextContentFactory {
    pub fn new(
        sha1: Option<Vec<u8>>,
        key: Key,
        parents: Option<Vec<Key>>,
        fulltext: Vec<u8>,
    ) -> Self {
        Self {
            sha1,
            size: fulltext.len(),
            key,
            parents,
            fulltext,
        }
    }
}

impl ContentFactory for FulltextContentFactory {
    fn sha1(&self) -> Option<Vec<u8>> {
        self.sha1.clone()
    }

    fn size(&self) -> Option<usize> {
        Some(self.size)
    }

    fn key(&self) -> Key {
        self.key.clone()
    }

    fn parents(&self) -> Option<Vec<Key>> {
        self.parents.clone()
    }

    fn to_fulltext(&self) -> Result<Cow<'_, [u8]>, Error> {
        Ok(Cow::Borrowed(&self.fulltext))
    }

    fn to_chunks(&self) -> Result<Box<dyn Iterator<Item = Cow<'_, [u8]>> + '_>, Error> {
        Ok(Box::new(
            self.fulltext
                .as_slice()
                .chunks(crate::DEFAULT_CHUNK_SIZE)
                .map(|v| v.into()),
        ))
    }

    fn into_fulltext(self: Box<Self>) -> Result<Vec<u8>, Error> {
        Ok(self.fulltext)
    }

    fn into_chunks(self: Box<Self>) -> Result<Box<dyn Iterator<Item = Vec<u8>>>, Error> {
        let mut fulltext = self.fulltext;
        Ok(Box::new(std::iter::from_fn(move || {
            if fulltext.is_empty() {
                None
            } else {
                let chunk = fulltext
                    .drain(..std::cmp::min(crate::DEFAULT_CHUNK_SIZE, fulltext.len()))
                    .collect::<Vec<_>>();
                Some(chunk)
            }
        })))
    }

    fn storage_kind(&self) -> StorageKind {
        StorageKind::Fulltext
    }

    fn map_key(&mut self, f: &dyn Fn(Key) -> Key) {
        self.key = f(self.key.clone());
        self.parents = self.parents.take().map(|v| v.into_iter().map(f).collect());
    }
}

pub struct ChunkedContentFactory {
    sha1: Option<Vec<u8>>,
    size: usize,
    key: Key,
    parents: Option<Vec<Key>>,
    chunks: Vec<Vec<u8>>,
}

impl ChunkedContentFactory {
    pub fn new(
        sha1: Option<Vec<u8>>,
        key: Key,
        parents: Option<Vec<Key>>,
        chunks: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            sha1,
            size: chunks.iter().map(|v| v.len()).sum(),
            key,
            parents,
            chunks,
        }
    }
}

impl ContentFactory for ChunkedContentFactory {
    fn sha1(&self) -> Option<Vec<u8>> {
        self.sha1.clone()
    }

    fn size(&self) -> Option<usize> {
        Some(self.size)
    }

    fn key(&self) -> Key {
        self.key.clone()
    }

    fn parents(&self) -> Option<Vec<Key>> {
        self.parents.clone()
    }

    fn to_fulltext(&self) -> Result<Cow<'_, [u8]>, Error> {
        Ok(self.chunks.concat().into())
    }

    fn to_chunks(&self) -> Result<Box<dyn Iterator<Item = Cow<'_, [u8]>> + '_>, Error> {
        Ok(Box::new(self.chunks.iter().map(|v| v.into())))
    }

    fn into_fulltext(self: Box<Self>) -> Result<Vec<u8>, Error> {
        Ok(self.chunks.into_iter().flatten().collect())
    }

    fn into_chunks(self: Box<Self>) -> Result<Box<dyn Iterator<Item = Vec<u8>>>, Error> {
        Ok(Box::new(self.chunks.into_iter()))
    }

    fn storage_kind(&self) -> StorageKind {
        StorageKind::Chunked
    }

    fn map_key(&mut self, f: &dyn Fn(Key) -> Key) {
        self.key = f(self.key.clone());
        self.parents = self.parents.take().map(|v| v.into_iter().map(f).collect());
    }
}

/// A content factory for a key this store could not find, in itself or any
/// fallback. Every accessor returns `Err(Error::Absent(..))` instead of
/// panicking, so a caller iterating a mixed stream can skip or report
/// missing keys without the whole stream aborting.
pub struct AbsentContentFactory {
    key: Key,
}

impl AbsentContentFactory {
    pub fn new(key: Key) -> Self {
        Self { key }
    }
}

impl ContentFactory for AbsentContentFactory {
    fn sha1(&self) -> Option<Vec<u8>> {
        None
    }

    fn size(&self) -> Option<usize> {
        None
    }

    fn key(&self) -> Key {
        self.key.clone()
    }

    fn parents(&self) -> Option<Vec<Key>> {
        None
    }

    fn to_fulltext(&self) -> Result<Cow<'_, [u8]>, Error> {
        Err(Error::Absent(self.key.clone()))
    }

    fn to_chunks(&self) -> Result<Box<dyn Iterator<Item = Cow<'_, [u8]>> + '_>, Error> {
        Err(Error::Absent(self.key.clone()))
    }

    fn into_fulltext(self: Box<Self>) -> Result<Vec<u8>, Error> {
        Err(Error::Absent(self.key))
    }

    fn into_chunks(self: Box<Self>) -> Result<Box<dyn Iterator<Item = Vec<u8>>>, Error> {
        Err(Error::Absent(self.key))
    }

    fn storage_kind(&self) -> StorageKind {
        StorageKind::Absent
    }

    fn map_key(&mut self, f: &dyn Fn(Key) -> Key) {
        self.key = f(self.key.clone());
    }
}

/// Storage for many versioned files, addressed by [`Key`].
///
/// This is the facade every concrete store (currently just the group
/// compress store, [`crate::groupcompress::facade::GroupCompressVersionedFiles`])
/// implements. A store may delegate to `fallback` stores for keys it doesn't
/// hold itself, via [`Self::add_fallback_versioned_files`].
pub trait VersionedFiles<CF: ContentFactory> {
    /// `check_content`, when set, verifies every line but the last ends
    /// with `\n` and that no line carries an embedded newline, matching
    /// what a caller handing this store already-split lines should uphold.
    /// `random_id`, when set, tells the store the caller asserts `key` is
    /// novel, so the usual duplicate-insertion consistency check is skipped.
    #[allow(clippy::too_many_arguments)]
    fn add_lines(
        &mut self,
        key: Key,
        parents: Option<Vec<Key>>,
        lines: Vec<Vec<u8>>,
        nostore_sha: Option<String>,
        random_id: bool,
        check_content: bool,
    ) -> Result<(String, usize, Key), Error>;

    fn add_content(
        &mut self,
        factory: &dyn ContentFactory,
        nostore_sha: Option<String>,
        random_id: bool,
    ) -> Result<(String, usize, Key), Error>;

    fn get_record_stream(
        &self,
        keys: &[Key],
        ordering: Ordering,
        include_delta_closure: bool,
    ) -> Box<dyn Iterator<Item = CF> + '_>;

    fn get_sha1s(&self, keys: &[Key]) -> HashMap<Key, String>;

    fn get_parent_map(&self, keys: &[Key]) -> HashMap<Key, Option<Vec<Key>>>;

    /// For every key in `keys` that is present, returns the set of line
    /// texts introduced (or still referenced) by it, paired with the key
    /// that introduced them. Used by annotate-style callers that need to
    /// know which lines are new at each revision.
    fn iter_lines_added_or_present_in_keys(
        &self,
        keys: &[Key],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Key)> + '_>;

    fn keys(&self) -> Vec<Key>;

    fn insert_record_stream(
        &mut self,
        stream: Box<dyn Iterator<Item = CF>>,
    ) -> Result<(), Error>;

    fn add_fallback_versioned_files(&mut self, fallback: Box<dyn VersionedFiles<CF>>);
}

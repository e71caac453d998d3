//! A content-addressed, delta-compressed versioned-file store
//! ("group compress"): batches of related fulltexts are packed into
//! compressed blocks, addressed by key through a graph index, and exposed
//! through the [`versionedfile`] facade.

pub mod groupcompress;
pub mod versionedfile;

/// Default chunk size used when a [`versionedfile::ContentFactory`] splits a
/// fulltext into chunks instead of returning it whole.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

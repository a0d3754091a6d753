//! # sharedcache — multi-process mmap-backed read-through file cache
//!
//! Cooperating processes and threads on one host share a cache directory
//! and fetch each fixed-size block of a `shared:` resource at most once.
//! There is no daemon: all coordination lives in two on-disk files per
//! resource, a content file holding the bytes and a "space map" holding a
//! 128-byte identity header plus one atomic state byte per block.
//!
//! Protocol guarantees (frozen in space-map v1):
//! - Header fields are set-once: written by exactly one winner via CAS from
//!   zero, verified by everyone else — magic, version, shift, size, hash
//! - Block states form a fixed DAG (NONE/PENDING/CACHED/FAILED); a reader
//!   observing CACHED also observes the block's bytes (release/acquire)
//! - The space map only ever grows; growth is the single locked operation
//! - A participant may die between any two operations without corrupting
//!   the cache; stale PENDING claims are re-driven after a wait budget
//! - Resources are identified by SHA-512/256 of their URI, stored in full
//!   in the header, with zero bytes eliminated so set-once stays valid

pub mod options;
pub mod hash;
pub mod set_once;
pub mod lock;
pub mod spacemap;
pub mod content;
pub mod transport;
pub mod reader;
pub mod inspect;

// Flat re-exports for the most common types.
pub use options::{CacheOptions, OptionsError};
pub use hash::{cache_paths, hash_uri, HASH_SIZE};
pub use set_once::SetOnce;
pub use spacemap::{BlockState, SpaceMap, SpacemapError, HEADER_MAGIC, HEADER_SIZE, HEADER_VERSION};
pub use transport::{FileTransport, Transport};
pub use reader::{CacheStats, OpenError, SharedReader, URI_PREFIX};
pub use inspect::{inspect_file, InspectError, SpacemapHealth, SpacemapReport};

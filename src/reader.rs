//! Read-through session over one `shared:` resource.
//!
//! [`SharedReader`] is the embedding surface: it looks like any seekable
//! reader (`std::io::Read` + `Seek`), but every block it touches goes
//! through the shared block state machine:
//!
//! ```text
//!                  ┌──────────────┐
//!      (CAS 0→2)   │              │  fetch ok (store 1, release)
//!  NONE ─────────► │   PENDING    │ ────────────────► CACHED
//!      (CAS 3→2)   │              │
//!  FAILED ───────► │              │  fetch err: CAS 2→3 ► FAILED
//!                  └──────┬───────┘
//!                         │ seek err / write-back err:
//!                         └── CAS 2→0 (revert)
//! ```
//!
//! A `CACHED` block is served straight from the content file.  A missing
//! block is claimed (`NONE → PENDING`) and fetched from the inner
//! transport; a block someone else is fetching is waited on, bounded by
//! the configured timeout, after which the fetch is raced — a stuck or
//! dead fetcher must never block progress forever.  All of this works
//! identically across threads and across processes, with no daemon and no
//! lock on the read path.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::content::ContentFile;
use crate::hash::{cache_paths, hash_uri};
use crate::options::{CacheOptions, OptionsError};
use crate::spacemap::{BlockState, SpaceMap, SpacemapError};
use crate::transport::{self, Transport};

/// URI prefix selecting this protocol.
pub const URI_PREFIX: &str = "shared:";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("URI '{0}' is missing the '{URI_PREFIX}' prefix")]
    MissingPrefix(String),
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Spacemap(#[from] SpacemapError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn io_err(e: SpacemapError) -> io::Error {
    match e {
        SpacemapError::Io(e) => e,
        other => io::Error::other(other),
    }
}

// ── Statistics ───────────────────────────────────────────────────────────────

/// Hit/miss counters for one session.  A read served from a `CACHED` block
/// is a hit; anything that reaches the inner transport is a miss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits:   u64,
    pub misses: u64,
}

// ── Fetch destination ────────────────────────────────────────────────────────

/// Where a fetched block's bytes land before (or instead of) write-back.
#[derive(Clone, Copy)]
enum Dest {
    /// The mapped content file itself; no write-back needed.
    Map(*mut u8),
    /// The caller's buffer is block-aligned and large enough.
    Caller,
    /// The session's scratch block.
    Scratch,
}

// ── SharedReader ─────────────────────────────────────────────────────────────

/// One session over a shared-cached resource.
///
/// Sessions are cheap and independent; every cooperating thread or process
/// opens its own.  Coordination happens entirely through the on-disk pair.
pub struct SharedReader {
    inner:     Box<dyn Transport>,
    inner_pos: u64,

    read_only:    bool,
    timeout_us:   u64,
    retry_errors: bool,

    pos:        u64,
    shift:      u16,
    block_size: usize,
    write_err:  bool,

    content:  ContentFile,
    spacemap: SpaceMap,
    scratch:  Vec<u8>,
    stats:    CacheStats,
}

impl std::fmt::Debug for SharedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedReader")
            .field("inner_pos", &self.inner_pos)
            .field("read_only", &self.read_only)
            .field("timeout_us", &self.timeout_us)
            .field("retry_errors", &self.retry_errors)
            .field("pos", &self.pos)
            .field("shift", &self.shift)
            .field("block_size", &self.block_size)
            .field("write_err", &self.write_err)
            .finish()
    }
}

impl SharedReader {
    /// Open a `shared:` URI, resolving the inner transport from the
    /// remainder of the URI (see [`transport::resolve`]).
    pub fn open(uri: &str, opts: CacheOptions) -> Result<Self, OpenError> {
        let inner_uri = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| OpenError::MissingPrefix(uri.to_owned()))?;
        let inner = transport::resolve(inner_uri)?;
        Self::open_with(inner, inner_uri, opts)
    }

    /// Open with a ready inner transport.  `uri` (without the `shared:`
    /// prefix) is the resource's cache identity: two sessions share cached
    /// blocks iff they pass the same URI.
    pub fn open_with(
        inner: Box<dyn Transport>,
        uri:   &str,
        opts:  CacheOptions,
    ) -> Result<Self, OpenError> {
        opts.validate()?;

        let hash = hash_uri(uri);
        let (cache_path, map_path) = cache_paths(&opts.cache_dir, &hash);
        debug!(cache = %cache_path.display(), uri, "opening shared cache file");

        let cache_file = open_rw(&cache_path)?;
        let map_file = open_rw(&map_path)?;

        let mut spacemap = SpaceMap::open(map_file)?;
        spacemap.init(&hash, opts.block_shift)?;

        let mut this = Self {
            inner,
            inner_pos:    0,
            read_only:    opts.read_only,
            timeout_us:   opts.cache_timeout_us,
            retry_errors: opts.retry_errors,
            pos:          0,
            shift:        spacemap.shift(),
            block_size:   spacemap.block_size(),
            write_err:    false,
            content:      ContentFile::new(cache_file),
            spacemap,
            scratch:      Vec::new(),
            stats:        CacheStats::default(),
        };

        // Resource size: trust the header, otherwise ask the inner
        // transport (which may not know either — streaming).
        let mut file_size = this.spacemap.file_size();
        if file_size == 0 {
            if let Some(size) = this.inner.size()? {
                if size > 0 {
                    this.record_file_size(size)?;
                    file_size = size;
                }
            }
        } else if !this.read_only {
            this.content.map_to(file_size)?;
        }

        if file_size > 0 {
            this.spacemap.grow((file_size - 1) >> this.shift)?;
        }
        if !this.content.is_mapped() {
            this.scratch = vec![0u8; this.block_size];
        }
        Ok(this)
    }

    /// Established block size of the underlying space map.  Reads of this
    /// many bytes at aligned positions avoid all intermediate copies.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Resource size, from the header or the inner transport.  `None` while
    /// nobody knows (the resource has not been read to EOF yet).
    pub fn size(&mut self) -> io::Result<Option<u64>> {
        let file_size = self.spacemap.file_size();
        if file_size > 0 {
            return Ok(Some(file_size));
        }
        match self.inner.size()? {
            Some(size) if size > 0 => {
                if let Err(e) = self.record_file_size(size) {
                    warn!("failed to record discovered resource size: {e}");
                }
                Ok(Some(size))
            }
            other => Ok(other),
        }
    }

    /// Seek distance below which skipping ahead by reading-and-discarding
    /// beats a real seek: at least one full block, since that is the unit
    /// the cache fetches anyway.
    pub fn short_seek_threshold(&self) -> usize {
        self.inner.short_seek_threshold().max(self.block_size)
    }

    /// Session hit/miss counters.
    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    // ── Size discovery ───────────────────────────────────────────────────────

    /// Publish a discovered resource size and, if this session established
    /// it, bring the content file up to shape (resize + map).
    fn record_file_size(&mut self, size: u64) -> Result<(), SpacemapError> {
        let newly_set = self.spacemap.set_file_size(size)?;
        if self.read_only {
            return Ok(());
        }
        if newly_set {
            // Sizing metadata only; ignored on failure.
            let _ = self.content.set_len(size);
        }
        self.content.map_to(size)?;
        Ok(())
    }

    // ── Read path ────────────────────────────────────────────────────────────

    fn read_blocks(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut size = buf.len();

        let file_size = self.spacemap.file_size();
        if file_size > 0 {
            // Clip the request to the known EOF.
            if self.pos >= file_size {
                return Ok(0);
            }
            size = size.min(usize::try_from(file_size - self.pos).unwrap_or(usize::MAX));
        }

        let block = self.pos >> self.shift;
        let offset = (self.pos & (self.block_size as u64 - 1)) as usize;
        let block_pos = block << self.shift;
        self.spacemap.grow(block).map_err(io_err)?;

        let timeout = Duration::from_micros(self.timeout_us);
        let mut pending_since: Option<Instant> = None;
        let mut state = self.spacemap.state(block);

        loop {
            match BlockState::from_raw(state) {
                Some(BlockState::Cached) => {
                    let want = size.min(self.block_size - offset);
                    let n = self.content.read_at(&mut buf[..want], self.pos).map_err(|e| {
                        error!("failed to read from cache file: {e}");
                        e
                    })?;
                    self.stats.hits += 1;
                    self.pos += n as u64;
                    return Ok(n);
                }

                // A read-only session (or one whose cache writes started
                // failing) serves hits above but never drives the state
                // machine: everything else bypasses the cache entirely.
                _ if self.read_only || self.write_err => {
                    return self.read_through(buf, size);
                }

                Some(BlockState::Failed) if !self.retry_errors => {
                    return Err(io::Error::other("cached block previously failed to fetch"));
                }

                Some(BlockState::Pending) => {
                    if self.timeout_us == 0 {
                        // No wait budget: race the fetch immediately.
                        break;
                    }
                    match pending_since {
                        Some(since) if since.elapsed() >= timeout => break,
                        Some(_) => {}
                        None => pending_since = Some(Instant::now()),
                    }
                    // Subdivide the budget so we re-check the state several
                    // times before giving up on the current fetcher.
                    std::thread::sleep(timeout / 16);
                    state = self.spacemap.state(block);
                }

                // NONE, FAILED with retry enabled, or an unrecognized byte:
                // claim the fetch.  A lost claim reports who beat us.
                _ => match self.spacemap.claim(block, state) {
                    Ok(()) => break,
                    Err(actual) => state = actual,
                },
            }
        }

        self.fetch_block(buf, size, block, block_pos, offset, file_size)
    }

    /// Byte-accurate forward to the inner transport, no caching.
    fn read_through(&mut self, buf: &mut [u8], size: usize) -> io::Result<usize> {
        self.stats.misses += 1;
        if self.inner_pos != self.pos {
            self.inner_pos = self.inner.seek(SeekFrom::Start(self.pos))?;
        }
        let n = self.inner.read(&mut buf[..size])?;
        self.inner_pos += n as u64;
        self.pos = self.inner_pos;
        Ok(n)
    }

    /// Fetch one block from the inner transport and publish it.
    ///
    /// The claim may be ours (we won the CAS) or raced (a pending fetcher
    /// exceeded the wait budget).  Either way the same bytes get written,
    /// so overlapping fetches of one block are idempotent.
    fn fetch_block(
        &mut self,
        buf:       &mut [u8],
        size:      usize,
        block:     u64,
        block_pos: u64,
        offset:    usize,
        file_size: u64,
    ) -> io::Result<usize> {
        self.stats.misses += 1;

        if self.inner_pos != block_pos {
            match self.inner.seek(SeekFrom::Start(block_pos)) {
                Ok(p) => self.inner_pos = p,
                Err(e) => {
                    // A seek failure says nothing about this block; release
                    // the claim instead of poisoning it.
                    self.spacemap.demote(block, BlockState::None);
                    error!("failed to seek inner transport: {e}");
                    return Err(e);
                }
            }
        }

        let block_len = if file_size > 0 {
            self.block_size.min((file_size - block_pos) as usize)
        } else {
            self.block_size
        };

        let dest = if let Some(ptr) = self.content.mapped_range(block_pos, block_len) {
            Dest::Map(ptr)
        } else if offset == 0 && size >= block_len {
            Dest::Caller
        } else {
            Dest::Scratch
        };

        let mut bytes_read = 0usize;
        while bytes_read < block_len {
            let res = match dest {
                // SAFETY: mapped_range verified [block_pos, block_pos +
                // block_len) is inside the mapping, which lives until the
                // session drops and is never replaced once created.  Racing
                // fetchers of this block write identical bytes.
                Dest::Map(ptr) => self.inner.read(unsafe {
                    std::slice::from_raw_parts_mut(ptr.add(bytes_read), block_len - bytes_read)
                }),
                Dest::Caller => self.inner.read(&mut buf[bytes_read..block_len]),
                Dest::Scratch => self.inner.read(&mut self.scratch[bytes_read..block_len]),
            };
            match res {
                Ok(0) => break,
                Ok(n) => {
                    bytes_read += n;
                    self.inner_pos += n as u64;
                }
                Err(e) => {
                    // Block-specific failure.  If another participant
                    // resolved the block meanwhile, their outcome stands.
                    self.spacemap.demote(block, BlockState::Failed);
                    return Err(e);
                }
            }
        }

        if bytes_read < block_len {
            // Found the true EOF; publish it (also maps the content file
            // now that its final size is known).
            self.record_file_size(block_pos + bytes_read as u64)
                .map_err(io_err)?;
        }

        if bytes_read == 0 {
            return Ok(0);
        }

        match dest {
            Dest::Map(_) => self.spacemap.publish(block),
            Dest::Caller | Dest::Scratch => {
                let data: &[u8] = match dest {
                    Dest::Caller => &buf[..bytes_read],
                    _ => &self.scratch[..bytes_read],
                };
                match self.content.write_all_at(data, block_pos) {
                    Ok(()) => self.spacemap.publish(block),
                    Err(e) => {
                        // The fetched bytes are intact, only the cache copy
                        // is not: release the claim and stop writing to the
                        // cache for the rest of this session.
                        error!("failed to write to cache file: {e}");
                        self.write_err = true;
                        self.spacemap.demote(block, BlockState::None);
                    }
                }
            }
        }

        if bytes_read <= offset {
            // EOF landed before the first requested byte.
            return Ok(0);
        }
        let wanted = (bytes_read - offset).min(size);
        match dest {
            Dest::Map(ptr) => {
                // SAFETY: offset + wanted <= bytes_read <= block_len, all
                // inside the range verified by mapped_range; `buf` is a
                // distinct allocation.
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr.add(offset), buf.as_mut_ptr(), wanted);
                }
            }
            Dest::Scratch => buf[..wanted].copy_from_slice(&self.scratch[offset..offset + wanted]),
            Dest::Caller => {} // offset == 0: already in place
        }
        self.pos += wanted as u64;
        Ok(wanted)
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o660)
        .open(path)
}

// ── std trait surfaces ───────────────────────────────────────────────────────

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_blocks(buf)
    }
}

impl Seek for SharedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let invalid =
            || io::Error::new(io::ErrorKind::InvalidInput, "seek outside the resource");

        match pos {
            SeekFrom::Start(p) => {
                self.pos = p;
                Ok(p)
            }
            SeekFrom::Current(delta) => {
                self.pos = self.pos.checked_add_signed(delta).ok_or_else(invalid)?;
                Ok(self.pos)
            }
            SeekFrom::End(delta) => {
                let file_size = self.spacemap.file_size();
                if file_size > 0 {
                    self.pos = file_size.checked_add_signed(delta).ok_or_else(invalid)?;
                    return Ok(self.pos);
                }
                // Size unknown: let the inner transport place us, and keep
                // the size it just revealed.
                let res = self.inner.seek(SeekFrom::End(delta))?;
                let size = i64::try_from(res)
                    .ok()
                    .and_then(|r| r.checked_sub(delta))
                    .filter(|s| *s >= 0)
                    .ok_or_else(invalid)? as u64;
                if let Err(e) = self.record_file_size(size) {
                    warn!("failed to record discovered resource size: {e}");
                }
                self.inner_pos = res;
                self.pos = res;
                Ok(res)
            }
        }
    }
}

impl Drop for SharedReader {
    fn drop(&mut self) {
        debug!(hits = self.stats.hits, misses = self.stats.misses, "cache statistics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let err = SharedReader::open("file:///nope", CacheOptions::new(dir.path())).unwrap_err();
        assert!(matches!(err, OpenError::MissingPrefix(_)));
    }

    #[test]
    fn open_requires_a_cache_dir() {
        let err = SharedReader::open("shared:/dev/null", CacheOptions::default()).unwrap_err();
        assert!(matches!(err, OpenError::Options(OptionsError::MissingCacheDir)));
    }
}

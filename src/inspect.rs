//! Offline space-map inspection.
//!
//! Decodes a `.spacemap` file from a plain byte stream — without mapping it
//! and without joining the cache — and reports what the coordination state
//! looks like: header identity, discovered resource size, and per-state
//! block counts.
//!
//! The interesting number for operators is usually `pending`: a process
//! that died mid-fetch leaves its blocks `PENDING` on disk, and while later
//! readers recover by racing after their wait budget, a wedged pair shows
//! up here long before anyone complains.
//!
//! Works on live caches: block states are single bytes, so a concurrent
//! snapshot is merely slightly stale, never torn.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt};
use serde::Serialize;
use thiserror::Error;

use crate::hash::HASH_SIZE;
use crate::options::{MAX_BLOCK_SHIFT, MIN_BLOCK_SHIFT};
use crate::spacemap::{HEADER_MAGIC, HEADER_SIZE, HEADER_VERSION};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Not a space map: magic {0:#010X} (expected {HEADER_MAGIC:#010X})")]
    BadMagic(u32),
    #[error("Unsupported space map version {0} (this build handles v{HEADER_VERSION})")]
    UnsupportedVersion(u16),
    #[error("File too short for a space map header")]
    Truncated,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Report ───────────────────────────────────────────────────────────────────

/// Overall verdict for one space map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpacemapHealth {
    /// Every block of the (known-size) resource is cached.
    Complete,
    /// Some blocks cached, some not.
    Partial,
    /// Nothing cached yet.
    Empty,
    /// Out-of-range shift or unrecognized state bytes — the file was
    /// corrupted or written by something else.
    Inconsistent,
}

/// What [`inspect`] found in one space map.
#[derive(Debug, Clone, Serialize)]
pub struct SpacemapReport {
    pub version:      u16,
    pub block_shift:  u16,
    /// Resource size from the header; 0 while still unknown.
    pub file_size:    u64,
    /// Stored URI hash, uppercase hex.
    pub uri_hash:     String,
    /// Blocks the resource needs, if its size is known.
    pub declared_blocks: Option<u64>,
    /// State bytes present in the file (growth rounds this up).
    pub state_bytes:  u64,
    pub none:         u64,
    pub cached:       u64,
    pub pending:      u64,
    pub failed:       u64,
    /// State bytes outside the known encoding.
    pub invalid:      u64,
    /// Bytes of the resource that are cached (last-block remainder
    /// accounted for when the size is known).
    pub cached_bytes: u64,
    pub health:       SpacemapHealth,
}

impl SpacemapReport {
    /// Fraction of the resource that is cached, when its size is known.
    pub fn cached_ratio(&self) -> Option<f64> {
        match self.file_size {
            0 => None,
            size => Some(self.cached_bytes as f64 / size as f64),
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let coverage = match (self.declared_blocks, self.cached_ratio()) {
            (Some(total), Some(ratio)) => {
                format!("{}/{} blocks cached ({:.1}%)", self.cached, total, ratio * 100.0)
            }
            _ => format!("{} blocks cached, resource size unknown", self.cached),
        };
        format!(
            "{:?}: {}, {} pending, {} failed, {:.2} MiB cached",
            self.health,
            coverage,
            self.pending,
            self.failed,
            self.cached_bytes as f64 / 1024.0 / 1024.0,
        )
    }
}

// ── Inspection ───────────────────────────────────────────────────────────────

/// Inspect a space-map file on disk.
pub fn inspect_file(path: &Path) -> Result<SpacemapReport, InspectError> {
    inspect(BufReader::new(File::open(path)?))
}

/// Inspect a space map from a byte stream.
///
/// Header fields are native-endian, matching the natural-width atomics that
/// wrote them; this tool is host-local like the cache itself.
pub fn inspect<R: Read>(mut r: R) -> Result<SpacemapReport, InspectError> {
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => InspectError::Truncated,
        _ => InspectError::Io(e),
    })?;

    let mut fields = &header[..];
    let magic = fields.read_u32::<NativeEndian>()?;
    if magic != HEADER_MAGIC {
        return Err(InspectError::BadMagic(magic));
    }
    let version = fields.read_u16::<NativeEndian>()?;
    if version != HEADER_VERSION {
        return Err(InspectError::UnsupportedVersion(version));
    }
    let block_shift = fields.read_u16::<NativeEndian>()?;
    let file_size = fields.read_u64::<NativeEndian>()?;
    let uri_hash = hex::encode_upper(&header[16..16 + HASH_SIZE]);

    let shift_ok = (MIN_BLOCK_SHIFT..=MAX_BLOCK_SHIFT).contains(&block_shift);
    let declared_blocks = if shift_ok && file_size > 0 {
        Some((file_size + (1u64 << block_shift) - 1) >> block_shift)
    } else {
        None
    };
    let last_block = declared_blocks.map(|n| n - 1);

    // Tally the state bytes; remember whether the final (possibly partial)
    // block is among the cached ones so cached_bytes comes out exact.
    let mut counts = [0u64; 4];
    let mut invalid = 0u64;
    let mut state_bytes = 0u64;
    let mut last_block_cached = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = match r.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        for &state in &chunk[..n] {
            if let Some(slot) = counts.get_mut(state as usize) {
                *slot += 1;
                if state == 1 && Some(state_bytes) == last_block {
                    last_block_cached = true;
                }
            } else {
                invalid += 1;
            }
            state_bytes += 1;
        }
    }

    let [none, cached, pending, failed] = counts;
    let mut cached_bytes = if shift_ok { cached << block_shift } else { 0 };
    if last_block_cached {
        let tail = file_size & ((1u64 << block_shift) - 1);
        if tail != 0 {
            cached_bytes -= (1u64 << block_shift) - tail;
        }
    }

    let health = if !shift_ok || invalid > 0 {
        SpacemapHealth::Inconsistent
    } else if cached == 0 {
        SpacemapHealth::Empty
    } else if declared_blocks == Some(cached) {
        SpacemapHealth::Complete
    } else {
        SpacemapHealth::Partial
    };

    Ok(SpacemapReport {
        version,
        block_shift,
        file_size,
        uri_hash,
        declared_blocks,
        state_bytes,
        none,
        cached,
        pending,
        failed,
        invalid,
        cached_bytes,
        health,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_uri;
    use crate::spacemap::{BlockState, SpaceMap};
    use std::fs::OpenOptions;

    fn fixture(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("a.spacemap");
        let file = OpenOptions::new()
            .read(true).write(true).create(true).truncate(false)
            .open(&path)
            .unwrap();
        let hash = hash_uri("file:///demo");
        let mut sm = SpaceMap::open(file).unwrap();
        sm.init(&hash, 12).unwrap();
        sm.set_file_size(10_000).unwrap();
        sm.grow(2).unwrap();
        sm.claim(0, BlockState::None as u8).unwrap();
        sm.publish(0);
        sm.claim(1, BlockState::None as u8).unwrap();
        sm.claim(2, BlockState::None as u8).unwrap();
        sm.publish(2);
        path
    }

    #[test]
    fn reports_counts_and_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let report = inspect_file(&fixture(&dir)).unwrap();

        assert_eq!(report.version, 1);
        assert_eq!(report.block_shift, 12);
        assert_eq!(report.file_size, 10_000);
        assert_eq!(report.declared_blocks, Some(3));
        assert_eq!(report.cached, 2);
        assert_eq!(report.pending, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.invalid, 0);
        // Block 0 is full, block 2 is the 1808-byte tail.
        assert_eq!(report.cached_bytes, 4096 + (10_000 - 2 * 4096));
        assert_eq!(report.health, SpacemapHealth::Partial);
        assert_eq!(report.uri_hash, hex::encode_upper(hash_uri("file:///demo")));
        assert!(report.summary().contains("pending"));
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0x11u8; 256]).unwrap();
        assert!(matches!(inspect_file(&path), Err(InspectError::BadMagic(_))));

        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(inspect_file(&path), Err(InspectError::Truncated)));
    }

    #[test]
    fn serializes_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = inspect_file(&fixture(&dir)).unwrap();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"health\":\"Partial\""));
    }
}

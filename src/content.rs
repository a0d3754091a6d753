//! Content file — the cached bytes themselves.
//!
//! Block `i` of the resource occupies `[i*B, (i+1)*B)` of this file, so the
//! file is a sparse 1:1 image of the resource.  It is accessed through
//! positional I/O while the resource size is unknown, and through a shared
//! mapping sized exactly to the resource once the size is established —
//! mapped hits then reduce to one memcpy and mapped fetches to none.
//!
//! Coherence between mapped and positional access on the same host comes
//! from the kernel page cache; ordering against block-state transitions is
//! the space map's job.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

pub struct ContentFile {
    file: File,
    map:  Option<MmapRaw>,
}

impl ContentFile {
    pub fn new(file: File) -> Self {
        Self { file, map: None }
    }

    /// Whether the content is currently memory-mapped.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Map the file once the resource size is known.
    ///
    /// The on-disk length is first forced to `size`: a previous process may
    /// have established the header size and then died before resizing the
    /// content file.  The mapping covers exactly `size` bytes and is never
    /// replaced afterwards (the size is set-once).
    pub fn map_to(&mut self, size: u64) -> io::Result<()> {
        if self.map.is_some() || size == 0 {
            return Ok(());
        }
        if self.file.metadata()?.len() != size {
            self.file.set_len(size)?;
        }
        let map = MmapOptions::new().len(size as usize).map_raw(&self.file)?;
        debug!(bytes = size, "mapped content file");
        self.map = Some(map);
        Ok(())
    }

    /// Opportunistically resize the file to the discovered resource size.
    /// Failure is ignored by callers — sizing metadata is not load-bearing.
    pub fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    /// Read up to `buf.len()` bytes at `pos`.  Returns the count actually
    /// read, which is short only at end of file.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        if let Some(map) = &self.map {
            let len = map.len() as u64;
            if pos >= len {
                return Ok(0);
            }
            let n = buf.len().min((len - pos) as usize);
            // SAFETY: [pos, pos + n) is within the mapping; `buf` is a
            // distinct allocation.  Concurrent writers of the same range
            // store identical bytes (block writes are idempotent), so a
            // torn read cannot surface wrong data.
            unsafe {
                std::ptr::copy_nonoverlapping(map.as_ptr().add(pos as usize), buf.as_mut_ptr(), n);
            }
            return Ok(n);
        }

        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], pos + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Write all of `data` at `pos`.
    pub fn write_all_at(&self, data: &[u8], pos: u64) -> io::Result<()> {
        self.file.write_all_at(data, pos)
    }

    /// Raw pointer to the mapped range `[pos, pos + len)`, if the mapping
    /// exists and covers it.  Used as a fetch destination so the block's
    /// bytes land in the cache without a separate write-back.
    pub fn mapped_range(&self, pos: u64, len: usize) -> Option<*mut u8> {
        let map = self.map.as_ref()?;
        if pos.checked_add(len as u64)? <= map.len() as u64 {
            // SAFETY: offset is within the mapping.
            Some(unsafe { map.as_mut_ptr().add(pos as usize) })
        } else {
            None
        }
    }
}

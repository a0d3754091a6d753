//! The inner transport seam.
//!
//! The cache wraps an arbitrary seekable byte source.  Anything that can
//! read, seek and (maybe) report its size plugs in here — an HTTP client, a
//! device, another cache.  [`FileTransport`] covers local files and is what
//! [`resolve`] hands out for `file://` URIs and bare paths; other schemes
//! are embedder-provided via
//! [`SharedReader::open_with`](crate::reader::SharedReader::open_with).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// A seekable byte source the cache can wrap.
///
/// `Send` because sessions move across threads; the transport itself is
/// never shared between sessions.
pub trait Transport: Send {
    /// Read into `buf`; `Ok(0)` is end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Seek and return the new absolute position.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Total size in bytes, or `None` when the source cannot tell
    /// (streaming).
    fn size(&mut self) -> io::Result<Option<u64>>;

    /// Seek distance below which the source prefers read-and-discard over
    /// a real seek.  `0` means no opinion.
    fn short_seek_threshold(&self) -> usize {
        0
    }
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Transport>")
    }
}

// ── Local files ──────────────────────────────────────────────────────────────

/// Transport over a local file.
pub struct FileTransport {
    file: File,
}

impl FileTransport {
    pub fn open(path: &str) -> io::Result<Self> {
        Ok(Self { file: File::open(path)? })
    }
}

impl Transport for FileTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn size(&mut self) -> io::Result<Option<u64>> {
        Ok(Some(self.file.metadata()?.len()))
    }
}

// ── URI resolution ───────────────────────────────────────────────────────────

/// Open a transport for `uri` (without the `shared:` prefix).
///
/// `file://` URIs and plain paths resolve to [`FileTransport`]; any other
/// scheme is unsupported here and must come in through `open_with`.
pub fn resolve(uri: &str) -> io::Result<Box<dyn Transport>> {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    if scheme_of(path).is_some() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("No built-in transport for URI '{uri}'"),
        ));
    }
    Ok(Box::new(FileTransport::open(path)?))
}

/// The URI scheme, if `uri` has one (`scheme:` with an alphabetic start).
fn scheme_of(uri: &str) -> Option<&str> {
    let colon = uri.find(':')?;
    let scheme = &uri[..colon];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic()
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') =>
        {
            Some(scheme)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_transport_reads_and_reports_size() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();

        let path = tmp.path().to_str().unwrap();
        let mut t = FileTransport::open(path).unwrap();
        assert_eq!(t.size().unwrap(), Some(10));

        t.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(t.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");
        assert_eq!(t.short_seek_threshold(), 0);
    }

    #[test]
    fn resolve_handles_file_uris_and_paths() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();

        assert!(resolve(path).is_ok());
        assert!(resolve(&format!("file://{path}")).is_ok());

        let err = resolve("http://example.com/a").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}

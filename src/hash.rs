//! URI hashing and cache file naming.
//!
//! A resource is identified on disk by SHA-512/256 of its URI.  The hash has
//! to be collision-resistant: an attacker must not be able to craft two URIs
//! that map to the same cache pair.  128 bits would suffice in practice; we
//! compute a 256-bit digest and store all of it in the space-map header for
//! verification.
//!
//! Because header fields are established with "set once from zero" atomics,
//! the stored hash must not contain zero bytes — a zero byte would read as
//! "not yet set".  Each zero byte is therefore replaced by its bitwise NOT
//! (`0xFF`).  The resulting loss of hash strength is negligible.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha512_256};

/// Size of the stored URI hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Number of leading hash bytes used for the on-disk file names.
const NAME_BYTES: usize = 16;

/// Hash a URI to its 32-byte cache identity.  The output never contains
/// zero bytes.
pub fn hash_uri(uri: &str) -> [u8; HASH_SIZE] {
    let mut hasher = Sha512_256::new();
    hasher.update(uri.as_bytes());
    let mut hash: [u8; HASH_SIZE] = hasher.finalize().into();

    for b in &mut hash {
        if *b == 0 {
            *b = !*b; // prevent zero bytes
        }
    }
    hash
}

/// Content-file and space-map paths for a hashed URI.
///
/// The names are the first 16 hash bytes rendered as uppercase hex —
/// 128 bits, enough for collision resistance on their own; the full hash in
/// the space-map header settles any residual doubt.
pub fn cache_paths(cache_dir: &Path, hash: &[u8; HASH_SIZE]) -> (PathBuf, PathBuf) {
    let name = hex::encode_upper(&hash[..NAME_BYTES]);
    (
        cache_dir.join(format!("{name}.cache")),
        cache_dir.join(format!("{name}.spacemap")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_zero_free() {
        let a = hash_uri("file:///tmp/movie.mp4");
        let b = hash_uri("file:///tmp/movie.mp4");
        assert_eq!(a, b);
        assert!(a.iter().all(|&b| b != 0));
        assert_ne!(a, hash_uri("file:///tmp/movie2.mp4"));
    }

    #[test]
    fn known_vector() {
        // SHA-512/256("abc") from FIPS 180-4; the digest happens to contain
        // no zero bytes, so the post-pass leaves it untouched.
        let expected =
            "53048e2681941ef99b2e29b76b4c7dabe4c2d0c634fc6d46e0e2f13107e7af23";
        assert_eq!(hex::encode(hash_uri("abc")), expected);
    }

    #[test]
    fn paths_use_uppercase_hex_prefix() {
        let hash = hash_uri("some://uri");
        let (cache, map) = cache_paths(Path::new("/var/cache/shared"), &hash);
        let stem = cache.file_stem().unwrap().to_str().unwrap();
        assert_eq!(stem.len(), 32);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(cache.extension().unwrap(), "cache");
        assert_eq!(map.extension().unwrap(), "spacemap");
        assert_eq!(cache.file_stem(), map.file_stem());
    }
}

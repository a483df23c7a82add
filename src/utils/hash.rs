//! Content fingerprints and path digests.
//!
//! - [`Fingerprint`]: `rustc_hash::FxHasher` over file bytes. Fast and
//!   non-cryptographic; used for change detection only.
//! - [`path_digest`]: blake3 of a path, used to name content-addressed cache
//!   files so arbitrary paths map to safe filenames.

use std::fmt;
use std::hash::Hasher;
use std::io::{self, Read};
use std::path::Path;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// 64-bit fingerprint of file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Fingerprint a byte slice. The length is mixed in so trailing zero
    /// bytes still change the result.
    #[inline]
    pub fn of<T: AsRef<[u8]> + ?Sized>(data: &T) -> Self {
        let bytes = data.as_ref();
        let mut hasher = FxHasher::default();
        hasher.write(bytes);
        hasher.write_usize(bytes.len());
        Self(hasher.finish())
    }

    /// Read a whole file and fingerprint it. Returns the bytes as well since
    /// callers that miss the cache need them for parsing.
    pub fn of_file(path: &Path) -> io::Result<(Self, Vec<u8>)> {
        let mut file = std::fs::File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok((Self::of(&bytes), bytes))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Stable 16-hex-char digest of a path.
pub fn path_digest(path: &Path) -> String {
    let hash = blake3::hash(path.as_os_str().as_encoded_bytes());
    hex::encode(&hash.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        assert_eq!(Fingerprint::of("component Button()"), Fingerprint::of("component Button()"));
    }

    #[test]
    fn test_fingerprint_any_byte_difference() {
        let base = Fingerprint::of("component Button(label string) {}");
        assert_ne!(base, Fingerprint::of("component Button(label string) { }"));
        assert_ne!(base, Fingerprint::of("component Button(label string) {}\n"));
        assert_ne!(Fingerprint::of(b"ab"), Fingerprint::of(b"ab\0"));
    }

    #[test]
    fn test_of_file_matches_of_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.component");
        std::fs::write(&path, "component A() {}").unwrap();
        let (fp, bytes) = Fingerprint::of_file(&path).unwrap();
        assert_eq!(fp, Fingerprint::of(&bytes));
    }

    #[test]
    fn test_path_digest_is_filename_safe() {
        let digest = path_digest(Path::new("/tmp/some dir/../x.component"));
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

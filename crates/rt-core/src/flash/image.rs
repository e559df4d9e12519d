use super::FlashError;
use crate::partition::hash_file;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A local image file about to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 the image must match, if known.
    pub expected_sha256: Option<String>,
}

impl ImageFile {
    /// Stat the file and validate the expected digest's format. Does not
    /// read the contents; see [`ImageFile::verify`].
    pub fn inspect(path: &Path, expected_sha256: Option<&str>) -> Result<Self, FlashError> {
        let expected_sha256 = expected_sha256
            .map(|s| normalize_sha256(s).ok_or_else(|| {
                FlashError::InvalidImage(format!("{:?} is not a SHA-256 hex digest", s))
            }))
            .transpose()?;
        let meta = std::fs::metadata(path).map_err(|e| {
            FlashError::InvalidImage(format!("{}: {}", path.display(), e))
        })?;
        if !meta.is_file() {
            return Err(FlashError::InvalidImage(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if meta.len() == 0 {
            return Err(FlashError::InvalidImage(format!(
                "{} is empty",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            expected_sha256,
        })
    }

    /// Hash the file and check it against the recorded size and expected
    /// digest. Returns the digest.
    pub fn verify(&self, buffer_bytes: usize) -> Result<String, FlashError> {
        let (size, sha256) = hash_file(&self.path, buffer_bytes)?;
        if size != self.size_bytes {
            return Err(FlashError::ImageChanged {
                path: self.path.clone(),
            });
        }
        if let Some(expected) = &self.expected_sha256 {
            if *expected != sha256 {
                return Err(FlashError::ChecksumMismatch {
                    subject: self.path.display().to_string(),
                    expected: expected.clone(),
                    actual: sha256,
                });
            }
        }
        Ok(sha256)
    }

    /// Pin the image to its current digest.
    pub fn with_digest(mut self, sha256: String) -> Self {
        self.expected_sha256 = Some(sha256);
        self
    }
}

pub(crate) fn normalize_sha256(value: &str) -> Option<String> {
    let value = value.trim();
    (value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| value.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_inspect_rejects_missing_and_empty() {
        let temp = tempfile::tempdir().unwrap();
        assert!(ImageFile::inspect(&temp.path().join("nope.img"), None).is_err());
        let empty = temp.path().join("empty.img");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            ImageFile::inspect(&empty, None),
            Err(FlashError::InvalidImage(_))
        ));
        assert!(ImageFile::inspect(temp.path(), None).is_err());
    }

    #[test]
    fn test_inspect_rejects_malformed_digest() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.img");
        std::fs::write(&path, b"abc").unwrap();
        assert!(ImageFile::inspect(&path, Some("abc123")).is_err());
    }

    #[test]
    fn test_verify_expected_digest() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.img");
        std::fs::write(&path, b"abc").unwrap();

        let upper = ABC.to_ascii_uppercase();
        let image = ImageFile::inspect(&path, Some(&upper)).unwrap();
        assert_eq!(image.expected_sha256.as_deref(), Some(ABC));
        assert_eq!(image.verify(4096).unwrap(), ABC);

        std::fs::write(&path, b"abd").unwrap();
        assert!(matches!(
            image.verify(4096),
            Err(FlashError::ChecksumMismatch { .. })
        ));
    }
}

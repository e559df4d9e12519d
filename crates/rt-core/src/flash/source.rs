//! Byte sources for downloads.

use super::FlashError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Something that can be read from an arbitrary byte offset.
pub trait ImageSource: Send + Sync {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    /// Total length, when the source knows it.
    fn total_len(&self) -> Result<Option<u64>, FlashError>;

    /// Stream the bytes starting at `offset`.
    fn open_at(&self, offset: u64) -> Result<Box<dyn Read + Send>, FlashError>;
}

/// A file on the local filesystem or a mounted share.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ImageSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn total_len(&self) -> Result<Option<u64>, FlashError> {
        let meta = std::fs::metadata(&self.path)
            .map_err(|e| FlashError::Source(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(meta.len()))
    }

    fn open_at(&self, offset: u64) -> Result<Box<dyn Read + Send>, FlashError> {
        let mut file = File::open(&self.path)
            .map_err(|e| FlashError::Source(format!("{}: {}", self.path.display(), e)))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file))
    }
}

#[cfg(feature = "http")]
pub use http::HttpSource;

#[cfg(feature = "http")]
mod http {
    use super::{FlashError, ImageSource};
    use std::io::Read;
    use std::time::Duration;

    /// HTTP(S) source using range requests for resume.
    pub struct HttpSource {
        url: String,
        agent: ureq::Agent,
    }

    impl HttpSource {
        pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
            let agent = ureq::AgentBuilder::new().timeout(timeout).build();
            Self {
                url: url.into(),
                agent,
            }
        }
    }

    fn source_error(err: ureq::Error) -> FlashError {
        FlashError::Source(err.to_string())
    }

    impl ImageSource for HttpSource {
        fn describe(&self) -> String {
            self.url.clone()
        }

        fn total_len(&self) -> Result<Option<u64>, FlashError> {
            let response = self.agent.head(&self.url).call().map_err(source_error)?;
            Ok(response
                .header("Content-Length")
                .and_then(|v| v.trim().parse().ok()))
        }

        fn open_at(&self, offset: u64) -> Result<Box<dyn Read + Send>, FlashError> {
            let mut request = self.agent.get(&self.url);
            if offset > 0 {
                request = request.set("Range", &format!("bytes={}-", offset));
            }
            let response = request.call().map_err(source_error)?;
            if offset > 0 && response.status() != 206 {
                return Err(FlashError::Source(format!(
                    "{} ignored the range request (status {})",
                    self.url,
                    response.status()
                )));
            }
            Ok(Box::new(response.into_reader()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_source_reads_from_offset() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("rom.zip");
        std::fs::write(&path, b"0123456789").unwrap();
        let source = FileSource::new(&path);
        assert_eq!(source.total_len().unwrap(), Some(10));
        let mut rest = String::new();
        source.open_at(4).unwrap().read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "456789");
    }

    #[test]
    fn test_missing_file_is_a_source_error() {
        let source = FileSource::new("/definitely/not/here.img");
        assert!(matches!(source.total_len(), Err(FlashError::Source(_))));
    }
}

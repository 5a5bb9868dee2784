use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::ByteSource;
use crate::error::IoError;

/// Local-file implementation of [`ByteSource`].
///
/// Uses positional reads (`pread`-style) so that concurrent decode workers can
/// share a single file handle without seek-state races. Blocking reads are
/// moved off the async runtime via `spawn_blocking`.
#[derive(Clone)]
pub struct FileSource {
    file: Arc<File>,
    size: u64,
    identifier: String,
}

impl FileSource {
    /// Open a file and capture its size.
    ///
    /// Returns `IoError::Unavailable` if the file cannot be opened or stat'ed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| IoError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .map_err(|e| IoError::Unavailable(format!("{}: {}", path.display(), e)))?
            .len();
        let identifier = format!("file://{}", path.display());

        Ok(Self {
            file: Arc::new(file),
            size,
            identifier,
        })
    }

    fn read_at_sync(file: &File, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let mut buf = vec![0u8; len];

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let mut read = 0usize;
            while read < len {
                let n = file
                    .read_at(&mut buf[read..], offset + read as u64)
                    .map_err(|e| IoError::Unavailable(e.to_string()))?;
                if n == 0 {
                    return Err(IoError::Short {
                        offset,
                        requested: len as u64,
                        actual: read as u64,
                    });
                }
                read += n;
            }
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut read = 0usize;
            while read < len {
                let n = file
                    .seek_read(&mut buf[read..], offset + read as u64)
                    .map_err(|e| IoError::Unavailable(e.to_string()))?;
                if n == 0 {
                    return Err(IoError::Short {
                        offset,
                        requested: len as u64,
                        actual: read as u64,
                    });
                }
                read += n;
            }
        }

        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        if offset + len as u64 > self.size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.size,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        let file = self.file.clone();
        tokio::task::spawn_blocking(move || Self::read_at_sync(&file, offset, len))
            .await
            .map_err(|e| IoError::Unavailable(format!("read task failed: {e}")))?
    }

    async fn read_batch(&self, requests: &[(u64, usize)]) -> Result<Bytes, IoError> {
        // One blocking hop for the whole batch; the reads themselves stay
        // positional so the order of the output matches the request order.
        let size = self.size;
        for &(offset, len) in requests {
            if offset + len as u64 > size {
                return Err(IoError::RangeOutOfBounds {
                    offset,
                    requested: len as u64,
                    size,
                });
            }
        }

        let file = self.file.clone();
        let requests = requests.to_vec();
        tokio::task::spawn_blocking(move || {
            let total: usize = requests.iter().map(|r| r.1).sum();
            let mut out = bytes::BytesMut::with_capacity(total);
            for (offset, len) in requests {
                out.extend_from_slice(&Self::read_at_sync(&file, offset, len)?);
            }
            Ok(out.freeze())
        })
        .await
        .map_err(|e| IoError::Unavailable(format!("read task failed: {e}")))?
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn test_read_exact_at() {
        let data: Vec<u8> = (0..=255).collect();
        let f = write_temp(&data);
        let source = FileSource::open(f.path()).unwrap();

        assert_eq!(source.size(), 256);

        let bytes = source.read_exact_at(10, 5).await.unwrap();
        assert_eq!(&bytes[..], &data[10..15]);
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        let f = write_temp(b"hello");
        let source = FileSource::open(f.path()).unwrap();

        let result = source.read_exact_at(3, 10).await;
        assert!(matches!(result, Err(IoError::RangeOutOfBounds { .. })));
    }

    #[tokio::test]
    async fn test_read_batch_order() {
        let data: Vec<u8> = (0..=255).collect();
        let f = write_temp(&data);
        let source = FileSource::open(f.path()).unwrap();

        let out = source
            .read_batch(&[(100, 4), (0, 2), (200, 1)])
            .await
            .unwrap();
        assert_eq!(&out[..], &[100, 101, 102, 103, 0, 1, 200]);
    }

    #[tokio::test]
    async fn test_zero_length_read() {
        let f = write_temp(b"abc");
        let source = FileSource::open(f.path()).unwrap();

        let bytes = source.read_exact_at(1, 0).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_open_missing_file() {
        let result = FileSource::open("/nonexistent/path/to/slide.tiff");
        assert!(matches!(result, Err(IoError::Unavailable(_))));
    }
}

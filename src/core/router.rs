//! Size Router: Determines how a file travels through a channel.
//!
//! Small files are read whole and sent as one buffer, which keeps per-item
//! overhead low for the common case. Large files are sent as a lazy chunk
//! stream so that they never have to be materialized.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use super::chunked::open_chunked;
use crate::channel::{ByteStream, Item};
use crate::error::{FlowError, Result};

/// Default size threshold (5 MiB)
pub const DEFAULT_SIZE_THRESHOLD: u64 = 5 * 1024 * 1024;

/// A discovered file and its size at discovery time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Stat `path` and build a descriptor from its current length
    pub fn stat(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| FlowError::from_path_io(path, e))?;
        Ok(Self::new(path, metadata.len()))
    }
}

/// Transport selection for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Read whole file, emit one buffer (or text)
    Buffer,

    /// Emit a lazy chunk stream
    Stream,
}

/// Router that picks a transport based on file size
#[derive(Debug, Clone)]
pub struct SizeRouter {
    /// Files strictly larger than this are streamed
    threshold: u64,
}

impl SizeRouter {
    /// Creates a new router with the given threshold in bytes
    ///
    /// # Example
    ///
    /// ```
    /// use fileflow::core::router::{SizeRouter, Transport};
    ///
    /// let router = SizeRouter::new(1024);
    /// assert_eq!(router.route(1024), Transport::Buffer);
    /// assert_eq!(router.route(1025), Transport::Stream);
    /// ```
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    /// Determines the transport for a file of `size` bytes
    ///
    /// A file of exactly `threshold` bytes is still buffered.
    pub fn route(&self, size: u64) -> Transport {
        if size > self.threshold {
            Transport::Stream
        } else {
            Transport::Buffer
        }
    }

    /// Returns the configured threshold
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Read a file into an item using the routed transport
    ///
    /// With `as_text`, buffered files are decoded as UTF-8 and emitted as text;
    /// streamed files stay streams either way.
    pub fn load(&self, file: &FileDescriptor, chunk_size: usize, as_text: bool) -> Result<Item> {
        match self.route(file.size) {
            Transport::Buffer => {
                let data = std::fs::read(&file.path)
                    .map_err(|e| FlowError::from_path_io(&file.path, e))?;
                debug!("Buffered {:?} ({} bytes)", file.path, data.len());

                if as_text {
                    let text = String::from_utf8(data).map_err(|_| FlowError::InvalidText {
                        context: file.path.display().to_string(),
                    })?;
                    Ok(Item::Text(text))
                } else {
                    Ok(Item::Buffer(Bytes::from(data)))
                }
            }
            Transport::Stream => {
                let reader = open_chunked(&file.path, chunk_size)?;
                debug!(
                    "Streaming {:?} ({} bytes in {} byte chunks)",
                    file.path, file.size, chunk_size
                );
                Ok(Item::Stream(ByteStream::new(reader)))
            }
        }
    }
}

impl Default for SizeRouter {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_routing_boundary_is_inclusive_for_buffers() {
        let router = SizeRouter::default();
        assert_eq!(router.route(0), Transport::Buffer);
        assert_eq!(router.route(DEFAULT_SIZE_THRESHOLD - 1), Transport::Buffer);
        assert_eq!(router.route(DEFAULT_SIZE_THRESHOLD), Transport::Buffer);
        assert_eq!(router.route(DEFAULT_SIZE_THRESHOLD + 1), Transport::Stream);
    }

    #[test]
    fn test_default_threshold_is_five_mib() {
        assert_eq!(SizeRouter::default().threshold(), 5 * 1024 * 1024);
    }

    #[test]
    fn test_load_small_file_as_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.bin");
        std::fs::write(&path, b"tiny").unwrap();

        let file = FileDescriptor::stat(&path).unwrap();
        match SizeRouter::new(16).load(&file, 4, false).unwrap() {
            Item::Buffer(bytes) => assert_eq!(&bytes[..], b"tiny"),
            other => panic!("expected buffer, got {}", other.shape()),
        }
    }

    #[test]
    fn test_load_small_file_as_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, "héllo").unwrap();

        let file = FileDescriptor::stat(&path).unwrap();
        match SizeRouter::new(16).load(&file, 4, true).unwrap() {
            Item::Text(text) => assert_eq!(text, "héllo"),
            other => panic!("expected text, got {}", other.shape()),
        }
    }

    #[test]
    fn test_load_invalid_utf8_as_text_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();

        let file = FileDescriptor::stat(&path).unwrap();
        let result = SizeRouter::new(16).load(&file, 4, true);
        assert!(matches!(result, Err(FlowError::InvalidText { .. })));
    }

    #[test]
    fn test_load_large_file_as_bounded_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let data: Vec<u8> = (0..100u8).collect();
        std::fs::write(&path, &data).unwrap();

        let file = FileDescriptor::stat(&path).unwrap();
        match SizeRouter::new(50).load(&file, 8, true).unwrap() {
            Item::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect();
                assert!(chunks.iter().all(|c| c.len() <= 8));
                let joined: Vec<u8> = chunks.concat();
                assert_eq!(joined, data);
            }
            other => panic!("expected stream, got {}", other.shape()),
        }
    }

    #[test]
    fn test_stat_missing_file() {
        let dir = tempdir().unwrap();
        let result = FileDescriptor::stat(&dir.path().join("missing"));
        assert!(matches!(result, Err(FlowError::SourceNotFound(_))));
    }
}

/*!
 * Chunked file reading
 *
 * Files are read in fixed-size chunks so that a file of any size can be forwarded
 * while holding at most one chunk in memory.
 */

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use bytes::Bytes;
use tracing::debug;

use crate::error::{FlowError, Result};

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Open `path` for chunked reading
pub fn open_chunked(path: &Path, chunk_size: usize) -> Result<ChunkedReader> {
    if chunk_size == 0 {
        return Err(FlowError::Config("chunk_size must be greater than 0".into()));
    }

    let file = File::open(path).map_err(|e| FlowError::from_path_io(path, e))?;
    debug!("Opened {:?} for chunked reading ({} byte chunks)", path, chunk_size);

    Ok(ChunkedReader::new(file, path.display().to_string(), chunk_size))
}

/// Iterator over fixed-size chunks of a reader
///
/// Every chunk except the last is exactly `chunk_size` bytes long. After an I/O
/// error the error is yielded once and iteration ends.
pub struct ChunkedReader<R = File> {
    reader: R,
    source: String,
    chunk_size: usize,
    bytes_read: u64,
    done: bool,
}

impl<R: Read> ChunkedReader<R> {
    /// `source` names the origin of the bytes in log lines
    pub fn new(reader: R, source: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            reader,
            source: source.into(),
            chunk_size,
            bytes_read: 0,
            done: false,
        }
    }

    /// Fill `buf` completely unless EOF comes first
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for ChunkedReader<R> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buffer = vec![0u8; self.chunk_size];
        match self.fill(&mut buffer) {
            Ok(0) => {
                self.done = true;
                debug!("Finished {} after {} bytes", self.source, self.bytes_read);
                None
            }
            Ok(n) => {
                buffer.truncate(n);
                self.bytes_read += n as u64;
                if n < self.chunk_size {
                    self.done = true;
                }
                Some(Ok(Bytes::from(buffer)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunks_reassemble_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data = sample(10_000);
        std::fs::write(&path, &data).unwrap();

        for chunk_size in [1, 7, 1024, 4096, 10_000, 20_000] {
            let chunks: Vec<Bytes> = open_chunked(&path, chunk_size)
                .unwrap()
                .map(|c| c.unwrap())
                .collect();

            assert!(chunks.iter().all(|c| c.len() <= chunk_size));
            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            assert_eq!(joined, data, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_last_chunk_may_be_short() {
        let reader = ChunkedReader::new(Cursor::new(sample(2500)), "mem", 1024);
        let sizes: Vec<usize> = reader.map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let reader = ChunkedReader::new(Cursor::new(sample(2048)), "mem", 1024);
        let sizes: Vec<usize> = reader.map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![1024, 1024]);
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(open_chunked(&path, 16).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_file_is_source_not_found() {
        let dir = tempdir().unwrap();
        let result = open_chunked(&dir.path().join("nope.txt"), 1024);
        assert!(matches!(result, Err(FlowError::SourceNotFound(_))));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(open_chunked(&path, 0), Err(FlowError::Config(_))));
    }
}

/*!
 * Decompression support for fileflow
 *
 * Two families are handled here:
 * - stream codecs (gzip, zstd, lz4), decoded lazily chunk by chunk
 * - zip containers, whose entries are read one at a time
 */

use std::fmt;
use std::io::{self, Cursor, Read};

use bytes::{Buf, Bytes};
use flate2::read::MultiGzDecoder;
use lz4::Decoder as Lz4Decoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zip::ZipArchive;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::channel::ByteStream;
use crate::core::chunked::ChunkedReader;
use crate::error::{FlowError, Result};

/// Stream codec used by single-stream decompression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// gzip (RFC 1952), including concatenated members
    #[default]
    Gzip,

    /// Zstandard frames
    Zstd,

    /// LZ4 frame format
    Lz4,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Gzip => write!(f, "gzip"),
            Codec::Zstd => write!(f, "zstd"),
            Codec::Lz4 => write!(f, "lz4"),
        }
    }
}

/// `Read` adapter over a chunk stream
///
/// Pulls the next chunk only when the current one is exhausted.
pub struct StreamReader {
    stream: ByteStream,
    current: Bytes,
}

impl StreamReader {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            current: Bytes::new(),
        }
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.stream.next() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Wrap `input` in a decoder for `codec`
pub fn decoder(codec: Codec, input: ByteStream) -> io::Result<Box<dyn Read + Send>> {
    let reader = StreamReader::new(input);

    Ok(match codec {
        Codec::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Codec::Zstd => Box::new(ZstdDecoder::new(reader)?),
        Codec::Lz4 => Box::new(Lz4Decoder::new(reader)?),
    })
}

/// Decode `input` lazily into a stream of chunks of at most `chunk_size` bytes
///
/// The first chunk is decoded eagerly so that inputs with a broken header are
/// rejected here instead of halfway through a consumer. Errors further into the
/// stream are yielded to the consumer as `Err` chunks. Zero bytes of input are
/// never a valid stream, whatever the codec.
pub fn decode_stream(
    codec: Codec,
    mut input: ByteStream,
    chunk_size: usize,
    label: &str,
) -> Result<ByteStream> {
    if chunk_size == 0 {
        return Err(FlowError::Config("chunk_size must be greater than 0".into()));
    }

    let head = loop {
        match input.next() {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => break chunk,
            Some(Err(e)) => return Err(FlowError::Decompression(format!("{}: {}", label, e))),
            None => {
                return Err(FlowError::Decompression(format!(
                    "{} is empty, not valid {}",
                    label, codec
                )))
            }
        }
    };
    let input = ByteStream::new(std::iter::once(Ok(head)).chain(input));

    let decoder = decoder(codec, input)
        .map_err(|e| FlowError::Decompression(format!("{}: {}", label, e)))?;
    let mut chunks = ChunkedReader::new(decoder, label, chunk_size);

    match chunks.next() {
        None => {
            debug!("{} decoded to an empty {} stream", label, codec);
            Ok(ByteStream::new(std::iter::empty()))
        }
        Some(Err(e)) => Err(FlowError::Decompression(format!(
            "{} is not valid {}: {}",
            label, codec, e
        ))),
        Some(Ok(first)) => Ok(ByteStream::new(std::iter::once(Ok(first)).chain(chunks))),
    }
}

/// One file extracted from a container archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub payload: Bytes,
}

/// Initial allocation cap for entry payloads; the header size is not trusted
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// Iterator over the file entries of a zip archive, in archive order
///
/// Directory entries are skipped. Entries larger than the optional size limit are
/// skipped with a warning. A corrupt entry yields `Err(Archive)` and iteration
/// continues with the next entry.
pub struct ZipEntries {
    archive: ZipArchive<Cursor<Bytes>>,
    next_index: usize,
    max_entry_size: Option<u64>,
}

impl ZipEntries {
    /// Parse the central directory of `data`
    pub fn open(data: Bytes, max_entry_size: Option<u64>) -> Result<Self> {
        let archive = ZipArchive::new(Cursor::new(data))?;
        debug!("Opened zip archive with {} entries", archive.len());

        Ok(Self {
            archive,
            next_index: 0,
            max_entry_size,
        })
    }

    fn read_entry(&mut self, index: usize) -> Result<Option<ArchiveEntry>> {
        let file = self.archive.by_index(index)?;
        let name = file.name().to_string();

        if file.is_dir() {
            debug!("Skipping directory entry '{}'", name);
            return Ok(None);
        }

        let declared = file.size();
        if let Some(limit) = self.max_entry_size {
            if declared > limit {
                warn!(
                    "Skipping zip entry '{}': {} bytes exceeds limit of {} bytes",
                    name, declared, limit
                );
                return Ok(None);
            }
        }

        let mut payload = Vec::with_capacity(declared.min(MAX_PREALLOC) as usize);
        let read = match self.max_entry_size {
            Some(limit) => file.take(limit + 1).read_to_end(&mut payload),
            None => {
                let mut file = file;
                file.read_to_end(&mut payload)
            }
        };
        read.map_err(|e| FlowError::Archive(format!("entry '{}': {}", name, e)))?;

        if let Some(limit) = self.max_entry_size {
            if payload.len() as u64 > limit {
                warn!(
                    "Skipping zip entry '{}': inflated past limit of {} bytes",
                    name, limit
                );
                return Ok(None);
            }
        }

        Ok(Some(ArchiveEntry {
            name,
            payload: Bytes::from(payload),
        }))
    }
}

impl Iterator for ZipEntries {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_index < self.archive.len() {
            let index = self.next_index;
            self.next_index += 1;

            match self.read_entry(index) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{compress, zip_archive};
    use super::*;

    fn drain(stream: ByteStream) -> Vec<u8> {
        stream.read_to_end().unwrap().to_vec()
    }

    #[test]
    fn test_stream_reader_spans_chunks() {
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"defgh")),
        ];
        let mut reader = StreamReader::new(ByteStream::new(chunks.into_iter()));

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcdefgh");
    }

    #[test]
    fn test_gzip_hello_world() {
        let compressed = compress(Codec::Gzip, b"hello world");
        let stream = decode_stream(
            Codec::Gzip,
            ByteStream::once(Bytes::from(compressed)),
            1024,
            "hello.gz",
        )
        .unwrap();
        assert_eq!(drain(stream), b"hello world");
    }

    #[test]
    fn test_each_codec_roundtrip_in_small_chunks() {
        let plain: Vec<u8> = b"streaming decompression keeps memory flat "
            .iter()
            .cycle()
            .take(50_000)
            .copied()
            .collect();

        for codec in [Codec::Gzip, Codec::Zstd, Codec::Lz4] {
            let compressed = Bytes::from(compress(codec, &plain));
            // Feed the compressed bytes in 100 byte chunks
            let input: Vec<std::io::Result<Bytes>> = compressed
                .chunks(100)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();

            let stream =
                decode_stream(codec, ByteStream::new(input.into_iter()), 512, "input").unwrap();
            let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect();

            assert!(chunks.iter().all(|c| c.len() <= 512), "{}", codec);
            assert_eq!(chunks.concat(), plain, "{}", codec);
        }
    }

    #[test]
    fn test_garbage_is_rejected_up_front() {
        for codec in [Codec::Gzip, Codec::Zstd, Codec::Lz4] {
            let result = decode_stream(
                codec,
                ByteStream::once(Bytes::from_static(b"definitely not compressed data")),
                1024,
                "garbage",
            );
            assert!(
                matches!(result, Err(FlowError::Decompression(_))),
                "{} accepted garbage",
                codec
            );
        }
    }

    #[test]
    fn test_empty_input_is_rejected_for_every_codec() {
        for codec in [Codec::Gzip, Codec::Zstd, Codec::Lz4] {
            let empty = ByteStream::new(vec![Ok(Bytes::new()), Ok(Bytes::new())].into_iter());
            let result = decode_stream(codec, empty, 1024, "empty");
            assert!(
                matches!(result, Err(FlowError::Decompression(_))),
                "{} accepted zero bytes",
                codec
            );
        }
    }

    #[test]
    fn test_compressed_empty_payload_decodes_to_nothing() {
        for codec in [Codec::Gzip, Codec::Zstd, Codec::Lz4] {
            let compressed = Bytes::from(compress(codec, b""));
            let stream = decode_stream(codec, ByteStream::once(compressed), 1024, "blank").unwrap();
            assert!(drain(stream).is_empty(), "{}", codec);
        }
    }

    #[test]
    fn test_zip_entries_in_order() {
        let data = zip_archive(&[("a.txt", b"alpha"), ("dir/", b""), ("b.txt", b"beta")]);
        let entries: Vec<ArchiveEntry> = ZipEntries::open(Bytes::from(data), None)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].payload, Bytes::from_static(b"alpha"));
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].payload, Bytes::from_static(b"beta"));
    }

    #[test]
    fn test_zip_entry_size_limit() {
        let data = zip_archive(&[("big.txt", &[b'x'; 100]), ("small.txt", b"ok")]);
        let entries: Vec<ArchiveEntry> = ZipEntries::open(Bytes::from(data), Some(10))
            .unwrap()
            .map(|e| e.unwrap())
            .collect();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "small.txt");
    }

    #[test]
    fn test_corrupt_zip_fails_to_open() {
        let result = ZipEntries::open(Bytes::from_static(b"PK but not really a zip"), None);
        assert!(matches!(result, Err(FlowError::Archive(_))));
    }
}

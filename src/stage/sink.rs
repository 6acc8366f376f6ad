/*!
 * WriteFile sink
 *
 * Appends every incoming item to one destination file. Streams are written chunk
 * by chunk as they are pulled, so streamed input is never materialized.
 *
 * In text mode every byte written must be valid UTF-8. Buffers are checked before
 * writing and an invalid buffer stops the stage. Streams are checked chunk by chunk
 * (multi-byte sequences may straddle chunks, and only complete sequences are
 * written). An invalid or failing stream is logged and abandoned, and the sink
 * carries on with the next item; what was appended before the failure stays.
 */

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, error, info};

use super::{Downstream, Stage, StageCounters};
use crate::channel::{ByteStream, ChannelReader, Item};
use crate::error::{FlowError, Result};

/// Incremental UTF-8 checker for chunked input
#[derive(Debug, Default)]
pub struct Utf8Validator {
    /// Trailing bytes of an incomplete sequence from the previous chunk
    carry: Vec<u8>,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the next chunk and return the bytes that are safe to write
    ///
    /// An incomplete trailing sequence is held back until the next chunk.
    /// Returns `None` once an invalid sequence is seen.
    pub fn feed(&mut self, chunk: Bytes) -> Option<Bytes> {
        let data = if self.carry.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(&chunk);
            Bytes::from(joined)
        };

        match std::str::from_utf8(&data) {
            Ok(_) => Some(data),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.carry = data[valid..].to_vec();
                Some(data.slice(..valid))
            }
            Err(_) => None,
        }
    }

    /// True when no incomplete sequence is left over
    pub fn finish(&self) -> bool {
        self.carry.is_empty()
    }
}

/// Why a streamed item was abandoned
enum StreamFailure {
    /// The upstream stream yielded an error
    Source(std::io::Error),
    /// Text mode saw invalid UTF-8
    InvalidText,
}

/// Appends incoming items to a file
pub struct WriteFile {
    path: PathBuf,
    binary: bool,
    writer: Option<BufWriter<File>>,
    counters: StageCounters,
}

impl WriteFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            binary: false,
            writer: None,
            counters: StageCounters::default(),
        }
    }

    /// Write bytes unchecked instead of requiring UTF-8
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| FlowError::Config("write_file: consume before init".into()))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let path = self.path.clone();
        self.writer()?
            .write_all(data)
            .map_err(|e| FlowError::from_path_io(path, e))
    }

    fn flush(&mut self) -> Result<()> {
        let path = self.path.clone();
        self.writer()?
            .flush()
            .map_err(|e| FlowError::from_path_io(path, e))
    }

    /// Append a stream chunk by chunk
    ///
    /// The outer result is fatal (destination write failed); the inner one is
    /// item-scoped.
    fn write_stream(
        &mut self,
        stream: ByteStream,
    ) -> Result<std::result::Result<u64, StreamFailure>> {
        let mut validator = (!self.binary).then(Utf8Validator::new);
        let mut written = 0u64;

        for chunk in stream {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Ok(Err(StreamFailure::Source(e))),
            };
            let chunk = match validator.as_mut() {
                Some(v) => match v.feed(chunk) {
                    Some(valid) => valid,
                    None => return Ok(Err(StreamFailure::InvalidText)),
                },
                None => chunk,
            };
            self.write_all(&chunk)?;
            written += chunk.len() as u64;
        }

        if validator.is_some_and(|v| !v.finish()) {
            return Ok(Err(StreamFailure::InvalidText));
        }
        Ok(Ok(written))
    }
}

impl Stage for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn has_upstream(&self) -> bool {
        true
    }

    fn has_downstream(&self) -> bool {
        false
    }

    fn init(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| FlowError::from_path_io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FlowError::from_path_io(&self.path, e))?;
        info!("Appending to {:?} ({} mode)", self.path, if self.binary { "binary" } else { "text" });

        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn consume(&mut self, input: ChannelReader, _output: &mut Downstream) -> Result<()> {
        for (index, item) in input.enumerate() {
            match item? {
                Item::Text(text) => {
                    self.write_all(text.as_bytes())?;
                    debug!("Wrote text input {} ({} bytes)", index, text.len());
                }
                Item::Buffer(bytes) => {
                    if !self.binary && std::str::from_utf8(&bytes).is_err() {
                        return Err(FlowError::InvalidText {
                            context: format!("buffer input {} for {:?}", index, self.path),
                        });
                    }
                    self.write_all(&bytes)?;
                    debug!("Wrote buffer input {} ({} bytes)", index, bytes.len());
                }
                Item::Stream(stream) => match self.write_stream(stream)? {
                    Ok(written) => debug!("Wrote stream input {} ({} bytes)", index, written),
                    Err(StreamFailure::Source(e)) => {
                        error!("Abandoning stream input {}: {}", index, e);
                        self.counters.items_dropped += 1;
                    }
                    Err(StreamFailure::InvalidText) => {
                        error!("Abandoning stream input {}: not valid UTF-8", index);
                        self.counters.items_dropped += 1;
                    }
                },
            }
            self.flush()?;
        }
        Ok(())
    }

    fn produce(&mut self, _output: &mut Downstream) -> Result<()> {
        if self.writer.is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }
}

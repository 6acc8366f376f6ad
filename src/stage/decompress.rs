/*!
 * Decompression stages
 *
 * `Unzip` extracts every file entry of a zip archive as its own buffer.
 * `Decompress` turns each compressed input into one lazily decoded stream.
 *
 * Broken inputs never take the pipeline down: a bad archive, entry or compressed
 * stream is logged with its input index and dropped, and the stage moves on.
 */

use tracing::{debug, error, info};

use super::{Downstream, Stage, StageCounters};
use crate::channel::{ChannelReader, Item, Shape};
use crate::compression::{decode_stream, Codec, ZipEntries};
use crate::core::DEFAULT_CHUNK_SIZE;
use crate::error::{FlowError, Result};

/// Extracts zip archives entry by entry
#[derive(Debug, Default)]
pub struct Unzip {
    max_entry_size: Option<u64>,
    counters: StageCounters,
}

impl Unzip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip entries whose uncompressed size exceeds `limit` bytes
    pub fn max_entry_size(mut self, limit: Option<u64>) -> Self {
        self.max_entry_size = limit;
        self
    }
}

impl Stage for Unzip {
    fn name(&self) -> &str {
        "unzip"
    }

    fn has_upstream(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<()> {
        if self.max_entry_size == Some(0) {
            return Err(FlowError::Config(
                "unzip: max_entry_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    fn consume(&mut self, input: ChannelReader, output: &mut Downstream) -> Result<()> {
        for (index, item) in input.enumerate() {
            let data = match item? {
                Item::Buffer(bytes) => bytes,
                Item::Stream(stream) => match stream.read_to_end() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Ignoring unreadable archive stream at input {}: {}", index, e);
                        self.counters.items_dropped += 1;
                        continue;
                    }
                },
                Item::Text(_) => {
                    return Err(FlowError::shape_mismatch("unzip", "buffer or stream", Shape::Text))
                }
            };

            let entries = match ZipEntries::open(data, self.max_entry_size) {
                Ok(entries) => entries,
                Err(e) => {
                    error!("Ignoring invalid zip file received at input {}", index);
                    debug!("{}", e);
                    self.counters.items_dropped += 1;
                    continue;
                }
            };

            for entry in entries {
                match entry {
                    Ok(entry) => {
                        info!("Unzipping received file '{}'", entry.name);
                        output.buffer(entry.payload)?;
                    }
                    Err(e) => {
                        error!("Skipping corrupt zip entry at input {}: {}", index, e);
                        self.counters.items_dropped += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn produce(&mut self, _output: &mut Downstream) -> Result<()> {
        Ok(())
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }
}

/// Decodes each input with a stream codec
#[derive(Debug)]
pub struct Decompress {
    codec: Codec,
    chunk_size: usize,
    counters: StageCounters,
}

impl Decompress {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            chunk_size: DEFAULT_CHUNK_SIZE,
            counters: StageCounters::default(),
        }
    }

    /// Maximum size of a decoded chunk
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl Default for Decompress {
    fn default() -> Self {
        Self::new(Codec::default())
    }
}

impl Stage for Decompress {
    fn name(&self) -> &str {
        "decompress"
    }

    fn has_upstream(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(FlowError::Config(
                "decompress: chunk_size must be greater than 0".into(),
            ));
        }
        debug!("Decompressing {} input", self.codec);
        Ok(())
    }

    fn consume(&mut self, mut input: ChannelReader, output: &mut Downstream) -> Result<()> {
        for (index, stream) in input.streams("decompress").enumerate() {
            let stream = stream?;
            let label = format!("input {}", index);
            match decode_stream(self.codec, stream, self.chunk_size, &label) {
                Ok(decoded) => {
                    info!("Decompressing received {} file ({})", self.codec, label);
                    output.stream(decoded)?;
                }
                Err(e) if e.is_item_scoped() => {
                    error!("Ignoring invalid {} file received at {}: {}", self.codec, label, e);
                    self.counters.items_dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn produce(&mut self, _output: &mut Downstream) -> Result<()> {
        Ok(())
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }
}

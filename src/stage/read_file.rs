/*!
 * ReadFile: turns file names into file contents
 *
 * Every text item names a file relative to a base folder. Small files are emitted
 * as text (or as a buffer in binary mode), large files as a chunk stream.
 */

use std::path::{Component, Path, PathBuf};

use tracing::info;

use super::source::emit_file;
use super::{Downstream, Stage};
use crate::channel::ChannelReader;
use crate::core::{normalize_path, FileDescriptor, SizeRouter, DEFAULT_CHUNK_SIZE};
use crate::error::{FlowError, Result};

pub struct ReadFile {
    folder_path: PathBuf,
    binary: bool,
    chunk_size: usize,
    router: SizeRouter,
}

impl ReadFile {
    pub fn new(folder_path: impl Into<PathBuf>) -> Self {
        Self {
            folder_path: folder_path.into(),
            binary: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            router: SizeRouter::default(),
        }
    }

    /// Emit small files as buffers instead of text
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn size_threshold(mut self, threshold: u64) -> Self {
        self.router = SizeRouter::new(threshold);
        self
    }

    /// Resolve `name` under the base folder
    ///
    /// Roots and drive prefixes in `name` are ignored, so absolute names are read
    /// relative to the folder too. A name that climbs out of the folder is rejected.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative: PathBuf = Path::new(name)
            .components()
            .filter(|c| !matches!(c, Component::Prefix(_) | Component::RootDir))
            .collect();
        let path = normalize_path(&self.folder_path.join(relative));

        if !path.starts_with(&self.folder_path) {
            return Err(FlowError::Config(format!(
                "read_file: '{}' resolves outside {:?}",
                name, self.folder_path
            )));
        }
        Ok(path)
    }
}

impl Stage for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn has_upstream(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(FlowError::Config(
                "read_file: chunk_size must be greater than 0".into(),
            ));
        }
        let absolute = std::path::absolute(&self.folder_path)?;
        self.folder_path = normalize_path(&absolute);
        Ok(())
    }

    fn consume(&mut self, mut input: ChannelReader, output: &mut Downstream) -> Result<()> {
        for name in input.texts("read_file") {
            let path = self.resolve(&name?)?;
            info!("Reading file at {:?}", path);

            let file = FileDescriptor::stat(&path)?;
            emit_file(&file, &self.router, self.chunk_size, !self.binary, output)?;
        }
        Ok(())
    }

    fn produce(&mut self, _output: &mut Downstream) -> Result<()> {
        Ok(())
    }
}

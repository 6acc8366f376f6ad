/*!
 * Configuration types for fileflow
 *
 * A pipeline is described in TOML: global settings, a `[logging]` table and an
 * ordered `[[stages]]` array, one table per stage, tagged by `type`.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::Codec;
use crate::error::{FlowError, Result};
use crate::stage::{
    Decompress, Envsub, GlobRead, ReadFile, ReadFolder, Stage, Substitute, Unzip, WriteFile,
};

/// Top-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items that may be in flight on each channel before the producer blocks
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Diagnostic output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Stages, source first
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            logging: LoggingConfig::default(),
            stages: Vec::new(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// One stage of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageConfig {
    /// Emit every file matching a glob pattern
    GlobRead {
        glob: String,

        /// Delay between two files, in milliseconds
        #[serde(default)]
        wait_ms: u64,

        #[serde(default = "default_true")]
        close_on_end: bool,

        /// Emit small files as text instead of buffers
        #[serde(default)]
        text: bool,

        #[serde(default = "default_chunk_size")]
        chunk_size: usize,

        #[serde(default = "default_size_threshold")]
        size_threshold: u64,

        #[serde(default = "default_memory_ceiling")]
        memory_ceiling: u64,

        #[serde(default = "default_pause_ms")]
        pause_ms: u64,
    },

    /// Emit every file below a folder, recursively
    ReadFolder {
        folder: PathBuf,

        #[serde(default)]
        text: bool,

        #[serde(default = "default_chunk_size")]
        chunk_size: usize,

        #[serde(default = "default_size_threshold")]
        size_threshold: u64,

        #[serde(default = "default_memory_ceiling")]
        memory_ceiling: u64,

        #[serde(default = "default_pause_ms")]
        pause_ms: u64,
    },

    /// Turn incoming file names into file contents
    ReadFile {
        folder_path: PathBuf,

        #[serde(default)]
        binary: bool,

        #[serde(default = "default_chunk_size")]
        chunk_size: usize,

        #[serde(default = "default_size_threshold")]
        size_threshold: u64,
    },

    /// Extract zip archives
    Unzip {
        /// Skip entries larger than this many bytes
        #[serde(default)]
        max_entry_size: Option<u64>,
    },

    /// Decode single compressed streams
    Decompress {
        #[serde(default)]
        codec: Codec,

        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
    },

    /// Replace a literal string or regex in text
    Substitute {
        source: String,
        replace: String,

        #[serde(default)]
        regex: bool,
    },

    /// Expand `${VAR}` placeholders from the environment
    Envsub,

    /// Append everything to a file
    WriteFile {
        path: PathBuf,

        #[serde(default)]
        binary: bool,
    },
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    1
}

fn default_chunk_size() -> usize {
    crate::core::DEFAULT_CHUNK_SIZE
}

fn default_size_threshold() -> u64 {
    crate::core::DEFAULT_SIZE_THRESHOLD
}

fn default_memory_ceiling() -> u64 {
    crate::core::DEFAULT_MEMORY_CEILING
}

fn default_pause_ms() -> u64 {
    crate::core::DEFAULT_PAUSE.as_millis() as u64
}

impl StageConfig {
    /// Stage type name as written in the `type` key
    pub fn kind(&self) -> &'static str {
        match self {
            StageConfig::GlobRead { .. } => "glob_read",
            StageConfig::ReadFolder { .. } => "read_folder",
            StageConfig::ReadFile { .. } => "read_file",
            StageConfig::Unzip { .. } => "unzip",
            StageConfig::Decompress { .. } => "decompress",
            StageConfig::Substitute { .. } => "substitute",
            StageConfig::Envsub => "envsub",
            StageConfig::WriteFile { .. } => "write_file",
        }
    }

    /// Whether the stage produces items without an upstream
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            StageConfig::GlobRead { .. } | StageConfig::ReadFolder { .. }
        )
    }

    /// Whether the stage terminates the pipeline
    pub fn is_sink(&self) -> bool {
        matches!(self, StageConfig::WriteFile { .. })
    }

    /// Check values that can be checked without touching the filesystem
    pub fn validate(&self) -> Result<()> {
        let chunk_size = match self {
            StageConfig::GlobRead {
                glob: pattern,
                chunk_size,
                ..
            } => {
                if pattern.trim().is_empty() {
                    return Err(self.invalid("glob must not be empty"));
                }
                glob::Pattern::new(pattern)?;
                Some(*chunk_size)
            }
            StageConfig::ReadFolder { chunk_size, .. }
            | StageConfig::ReadFile { chunk_size, .. }
            | StageConfig::Decompress { chunk_size, .. } => Some(*chunk_size),
            StageConfig::Unzip { max_entry_size } => {
                if *max_entry_size == Some(0) {
                    return Err(self.invalid("max_entry_size must be greater than 0"));
                }
                None
            }
            StageConfig::Substitute { source, regex, .. } => {
                if *regex {
                    regex::Regex::new(source)?;
                } else if source.is_empty() {
                    return Err(self.invalid("source must not be empty"));
                }
                None
            }
            StageConfig::Envsub | StageConfig::WriteFile { .. } => None,
        };

        if chunk_size == Some(0) {
            return Err(self.invalid("chunk_size must be greater than 0"));
        }
        Ok(())
    }

    fn invalid(&self, message: &str) -> FlowError {
        FlowError::Config(format!("{}: {}", self.kind(), message))
    }

    /// Instantiate the stage
    pub fn build(&self) -> Result<Box<dyn Stage>> {
        self.validate()?;

        Ok(match self {
            StageConfig::GlobRead {
                glob,
                wait_ms,
                close_on_end,
                text,
                chunk_size,
                size_threshold,
                memory_ceiling,
                pause_ms,
            } => Box::new(
                GlobRead::new(glob.clone())
                    .wait(Duration::from_millis(*wait_ms))
                    .close_on_end(*close_on_end)
                    .text(*text)
                    .chunk_size(*chunk_size)
                    .size_threshold(*size_threshold)
                    .memory_ceiling(*memory_ceiling, Duration::from_millis(*pause_ms)),
            ),
            StageConfig::ReadFolder {
                folder,
                text,
                chunk_size,
                size_threshold,
                memory_ceiling,
                pause_ms,
            } => Box::new(
                ReadFolder::new(folder.clone())
                    .text(*text)
                    .chunk_size(*chunk_size)
                    .size_threshold(*size_threshold)
                    .memory_ceiling(*memory_ceiling, Duration::from_millis(*pause_ms)),
            ),
            StageConfig::ReadFile {
                folder_path,
                binary,
                chunk_size,
                size_threshold,
            } => Box::new(
                ReadFile::new(folder_path.clone())
                    .binary(*binary)
                    .chunk_size(*chunk_size)
                    .size_threshold(*size_threshold),
            ),
            StageConfig::Unzip { max_entry_size } => {
                Box::new(Unzip::new().max_entry_size(*max_entry_size))
            }
            StageConfig::Decompress { codec, chunk_size } => {
                Box::new(Decompress::new(*codec).chunk_size(*chunk_size))
            }
            StageConfig::Substitute {
                source,
                replace,
                regex,
            } => {
                if *regex {
                    Box::new(Substitute::regex(source.clone(), replace.clone()))
                } else {
                    Box::new(Substitute::literal(source.clone(), replace.clone()))
                }
            }
            StageConfig::Envsub => Box::new(Envsub::new()),
            StageConfig::WriteFile { path, binary } => {
                Box::new(WriteFile::new(path.clone()).binary(*binary))
            }
        })
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| FlowError::from_path_io(path, e))?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| FlowError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| FlowError::from_path_io(path, e))?;
        Ok(())
    }

    /// Check the configuration as a whole
    ///
    /// The chain must start with a source, sources may only appear first and a
    /// sink may only appear last.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(FlowError::Config(
                "channel_capacity must be greater than 0".into(),
            ));
        }

        let Some(first) = self.stages.first() else {
            return Err(FlowError::Config("pipeline has no stages".into()));
        };
        if !first.is_source() {
            return Err(FlowError::Config(format!(
                "first stage must be glob_read or read_folder, found {}",
                first.kind()
            )));
        }

        let last = self.stages.len() - 1;
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 && stage.is_source() {
                return Err(FlowError::Config(format!(
                    "stage {} ({}) is a source and can only be first",
                    index,
                    stage.kind()
                )));
            }
            if index < last && stage.is_sink() {
                return Err(FlowError::Config(format!(
                    "stage {} ({}) is a sink and can only be last",
                    index,
                    stage.kind()
                )));
            }
            stage.validate()?;
        }
        Ok(())
    }
}

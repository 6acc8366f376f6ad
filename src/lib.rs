/*!
 * fileflow - streaming file ingestion and transformation
 *
 * Files are read from disk, optionally decompressed and rewritten, and written
 * out through a chain of stages connected by bounded channels:
 * - size-routed transport: small files as buffers, large files as chunk streams
 * - memory watchdog pacing for source stages
 * - zip, gzip, zstd and lz4 decoding that skips corrupt input
 * - literal, regex and `${VAR}` text rewriting
 */

pub mod channel;
pub mod compression;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod stage;

// Re-export commonly used types
pub use channel::{channel, ByteStream, ChannelReader, ChannelWriter, Item, Shape};
pub use config::{LogLevel, LoggingConfig, PipelineConfig, StageConfig};
pub use error::{FlowError, Result};
pub use pipeline::{Pipeline, PipelineReport, RunningPipeline};
pub use stage::{Stage, StageReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

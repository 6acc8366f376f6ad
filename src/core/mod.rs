/*!
 * Core streaming primitives: chunked reads, size routing, memory pacing and
 * file enumeration
 */

pub mod chunked;
pub mod enumerate;
pub mod router;
pub mod watchdog;

pub use chunked::{open_chunked, ChunkedReader, DEFAULT_CHUNK_SIZE};
pub use enumerate::{glob_files, normalize_path, walk_files};
pub use router::{FileDescriptor, SizeRouter, Transport, DEFAULT_SIZE_THRESHOLD};
pub use watchdog::{
    FixedMemoryMonitor, MemoryMonitor, Pace, SystemMemoryMonitor, Watchdog, WatchdogStats,
    DEFAULT_MEMORY_CEILING, DEFAULT_PAUSE,
};

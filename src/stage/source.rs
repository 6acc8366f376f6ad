/*!
 * Source stages: enumerate files at init, emit them during produce
 *
 * Each file goes out as a buffer or a stream depending on its size. The produce
 * loop is paced by the memory watchdog, so a slow consumer cannot make the source
 * pile up unbounded data.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{Downstream, Stage, StageCounters};
use crate::channel::ChannelReader;
use crate::core::{
    glob_files, normalize_path, walk_files, FileDescriptor, MemoryMonitor, SizeRouter,
    SystemMemoryMonitor, Watchdog, DEFAULT_CHUNK_SIZE, DEFAULT_MEMORY_CEILING, DEFAULT_PAUSE,
};
use crate::error::{FlowError, Result};

/// Read one file and emit it with the transport picked by `router`
pub fn emit_file(
    file: &FileDescriptor,
    router: &SizeRouter,
    chunk_size: usize,
    as_text: bool,
    out: &mut Downstream,
) -> Result<()> {
    let item = router.load(file, chunk_size, as_text)?;
    out.emit(item)
}

/// Settings and state shared by the file-emitting sources
struct FileEmitter {
    label: String,
    router: SizeRouter,
    chunk_size: usize,
    as_text: bool,
    memory_ceiling: u64,
    pause: Duration,
    monitor: Option<Arc<dyn MemoryMonitor>>,
    watchdog: Option<Watchdog>,
    files: Vec<FileDescriptor>,
}

impl FileEmitter {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            router: SizeRouter::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            as_text: false,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            pause: DEFAULT_PAUSE,
            monitor: None,
            watchdog: None,
            files: Vec::new(),
        }
    }

    fn init(&mut self, files: Vec<FileDescriptor>) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(FlowError::Config(format!(
                "{}: chunk_size must be greater than 0",
                self.label
            )));
        }

        let monitor = match self.monitor.take() {
            Some(monitor) => monitor,
            None => SystemMemoryMonitor::shared()?,
        };
        self.watchdog = Some(Watchdog::new(
            monitor,
            self.memory_ceiling,
            self.pause,
            self.label.clone(),
        ));
        self.files = files;
        Ok(())
    }

    /// Emit every enumerated file, pacing before each and sleeping `wait` after
    fn produce(&mut self, out: &mut Downstream, wait: Duration) -> Result<()> {
        let files = std::mem::take(&mut self.files);
        let watchdog = self
            .watchdog
            .as_mut()
            .ok_or_else(|| FlowError::Config(format!("{}: produce before init", self.label)))?;

        let label = &self.label;
        let router = &self.router;
        let chunk_size = self.chunk_size;
        let as_text = self.as_text;

        watchdog.run(files, |file| {
            info!("[{}] processing {:?}", label, file.path);
            emit_file(&file, router, chunk_size, as_text, out)?;
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            Ok(())
        })
    }

    fn counters(&self) -> StageCounters {
        let mut counters = StageCounters::default();
        if let Some(watchdog) = &self.watchdog {
            counters.record_watchdog(watchdog.stats());
        }
        counters
    }
}

/// Emits every file matching a glob pattern
pub struct GlobRead {
    pattern: String,
    wait: Duration,
    close_on_end: bool,
    emitter: FileEmitter,
}

impl GlobRead {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            wait: Duration::ZERO,
            close_on_end: true,
            emitter: FileEmitter::new("globRead"),
        }
    }

    /// Delay between two emitted files
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn close_on_end(mut self, close: bool) -> Self {
        self.close_on_end = close;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.emitter.chunk_size = chunk_size;
        self
    }

    /// Emit small files as UTF-8 text instead of buffers
    pub fn text(mut self, as_text: bool) -> Self {
        self.emitter.as_text = as_text;
        self
    }

    pub fn size_threshold(mut self, threshold: u64) -> Self {
        self.emitter.router = SizeRouter::new(threshold);
        self
    }

    pub fn memory_ceiling(mut self, ceiling: u64, pause: Duration) -> Self {
        self.emitter.memory_ceiling = ceiling;
        self.emitter.pause = pause;
        self
    }

    /// Replace the process memory monitor
    pub fn monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.emitter.monitor = Some(monitor);
        self
    }

}

impl Stage for GlobRead {
    fn name(&self) -> &str {
        "glob_read"
    }

    fn has_upstream(&self) -> bool {
        false
    }

    fn close_on_end(&self) -> bool {
        self.close_on_end
    }

    fn init(&mut self) -> Result<()> {
        let files = glob_files(&self.pattern)?;
        for file in &files {
            info!(
                "Reading file {:?} (from glob pattern '{}')",
                file.path, self.pattern
            );
        }
        self.emitter.init(files)
    }

    fn consume(&mut self, _input: ChannelReader, _output: &mut Downstream) -> Result<()> {
        Ok(())
    }

    fn produce(&mut self, output: &mut Downstream) -> Result<()> {
        self.emitter.produce(output, self.wait)
    }

    fn counters(&self) -> StageCounters {
        self.emitter.counters()
    }
}

/// Emits every file below a folder, recursively, sorted by name
pub struct ReadFolder {
    folder: PathBuf,
    emitter: FileEmitter,
}

impl ReadFolder {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            emitter: FileEmitter::new("readFolder"),
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.emitter.chunk_size = chunk_size;
        self
    }

    /// Emit small files as UTF-8 text instead of buffers
    pub fn text(mut self, as_text: bool) -> Self {
        self.emitter.as_text = as_text;
        self
    }

    pub fn size_threshold(mut self, threshold: u64) -> Self {
        self.emitter.router = SizeRouter::new(threshold);
        self
    }

    pub fn memory_ceiling(mut self, ceiling: u64, pause: Duration) -> Self {
        self.emitter.memory_ceiling = ceiling;
        self.emitter.pause = pause;
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.emitter.monitor = Some(monitor);
        self
    }
}

impl Stage for ReadFolder {
    fn name(&self) -> &str {
        "read_folder"
    }

    fn has_upstream(&self) -> bool {
        false
    }

    fn init(&mut self) -> Result<()> {
        let root = normalize_path(&self.folder);
        let files = walk_files(&root)?;
        info!("Reading {} files from {:?}", files.len(), root);
        for file in &files {
            debug!("  {:?} ({} bytes)", file.path, file.size);
        }
        self.folder = root;
        self.emitter.init(files)
    }

    fn consume(&mut self, _input: ChannelReader, _output: &mut Downstream) -> Result<()> {
        Ok(())
    }

    fn produce(&mut self, output: &mut Downstream) -> Result<()> {
        self.emitter.produce(output, Duration::ZERO)
    }

    fn counters(&self) -> StageCounters {
        self.emitter.counters()
    }
}

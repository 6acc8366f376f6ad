/*!
 * Stage lifecycle
 *
 * Every stage goes through `Init -> Running -> Closed`. `init` runs once and must
 * succeed before anything is consumed or produced. Running is the consume loop
 * (only for stages with an upstream channel) followed by the produce loop. The
 * runner, not the stage, closes the downstream channel, so each channel is closed
 * exactly once and only after the last emission.
 *
 * When a stage fails, its downstream writer is dropped without a close frame and
 * the next stage observes an aborted upstream.
 */

pub mod decompress;
pub mod read_file;
pub mod rewrite;
pub mod sink;
pub mod source;

use std::fmt;
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, info_span};

use crate::channel::{ByteStream, ChannelReader, ChannelWriter, Item};
use crate::core::WatchdogStats;
use crate::error::{FlowError, Result};

pub use decompress::{Decompress, Unzip};
pub use read_file::ReadFile;
pub use rewrite::{Envsub, Substitute};
pub use sink::WriteFile;
pub use source::{GlobRead, ReadFolder};

/// Lifecycle state of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Init,
    Running,
    Closed,
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Init => write!(f, "init"),
            StageState::Running => write!(f, "running"),
            StageState::Closed => write!(f, "closed"),
            StageState::Failed => write!(f, "failed"),
        }
    }
}

/// Counters a stage accumulates while running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounters {
    /// Items dropped because of item-scoped errors
    pub items_dropped: u64,

    /// Watchdog checks and pauses (paced sources only)
    pub memory_checks: u64,
    pub memory_pauses: u64,
}

impl StageCounters {
    pub fn record_watchdog(&mut self, stats: WatchdogStats) {
        self.memory_checks = stats.checks;
        self.memory_pauses = stats.pauses;
    }
}

/// A pipeline stage
///
/// `init`, `consume` and `produce` are the three lifecycle operations; stages
/// without an upstream leave `consume` empty, stages that only transform leave
/// `produce` empty.
pub trait Stage: Send {
    /// Stage name used in logs, channel names and errors
    fn name(&self) -> &str;

    /// Whether this stage reads from an upstream channel
    fn has_upstream(&self) -> bool;

    /// Whether this stage writes to a downstream channel
    fn has_downstream(&self) -> bool {
        true
    }

    /// Whether the runner closes the downstream channel at the end
    fn close_on_end(&self) -> bool {
        true
    }

    /// One-shot setup: resolve paths, validate settings, enumerate inputs
    fn init(&mut self) -> Result<()>;

    /// Consume loop: pull every upstream item, transform, emit
    fn consume(&mut self, input: ChannelReader, output: &mut Downstream) -> Result<()>;

    /// Produce loop: emit self-originated items
    fn produce(&mut self, output: &mut Downstream) -> Result<()>;

    /// Counters for the final report
    fn counters(&self) -> StageCounters {
        StageCounters::default()
    }
}

/// Downstream side handed to a running stage
///
/// Sinks run with a detached downstream; emitting into it is an error.
#[derive(Debug)]
pub struct Downstream {
    stage: String,
    writer: Option<ChannelWriter>,
}

impl Downstream {
    pub fn attached(stage: impl Into<String>, writer: ChannelWriter) -> Self {
        Self {
            stage: stage.into(),
            writer: Some(writer),
        }
    }

    pub fn detached(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            writer: None,
        }
    }

    pub fn emit(&mut self, item: Item) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.emit(item),
            None => Err(FlowError::Config(format!(
                "stage '{}' has no downstream channel",
                self.stage
            ))),
        }
    }

    pub fn buffer(&mut self, bytes: impl Into<bytes::Bytes>) -> Result<()> {
        self.emit(Item::Buffer(bytes.into()))
    }

    pub fn text(&mut self, text: impl Into<String>) -> Result<()> {
        self.emit(Item::Text(text.into()))
    }

    pub fn stream(&mut self, stream: ByteStream) -> Result<()> {
        self.emit(Item::Stream(stream))
    }

    /// Items emitted so far
    pub fn emitted(&self) -> u64 {
        self.writer.as_ref().map(ChannelWriter::emitted).unwrap_or(0)
    }

    fn into_writer(self) -> Option<ChannelWriter> {
        self.writer
    }
}

/// Outcome of a successfully completed stage
#[derive(Debug, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub state: StageState,
    pub items_emitted: u64,
    #[serde(flatten)]
    pub counters: StageCounters,
    pub duration_ms: u64,

    /// Writer left open because the stage does not close on end
    #[serde(skip)]
    pub open_writer: Option<ChannelWriter>,
}

fn check_wiring(
    stage: &dyn Stage,
    input: &Option<ChannelReader>,
    output: &Option<ChannelWriter>,
) -> Result<()> {
    if stage.has_upstream() != input.is_some() {
        return Err(FlowError::Config(if stage.has_upstream() {
            format!("stage '{}' needs an upstream channel", stage.name())
        } else {
            format!("stage '{}' does not accept an upstream channel", stage.name())
        }));
    }
    if stage.has_downstream() != output.is_some() {
        return Err(FlowError::Config(if stage.has_downstream() {
            format!("stage '{}' needs a downstream channel", stage.name())
        } else {
            format!("stage '{}' does not emit to a downstream channel", stage.name())
        }));
    }
    Ok(())
}

/// Consume loop (if there is an upstream), then produce loop
fn run_loops(
    stage: &mut dyn Stage,
    input: Option<ChannelReader>,
    downstream: &mut Downstream,
) -> Result<()> {
    if let Some(input) = input {
        stage.consume(input, downstream)?;
    }
    stage.produce(downstream)
}

/// Drive one stage through its whole lifecycle on the current thread
pub fn run_stage(
    mut stage: Box<dyn Stage>,
    input: Option<ChannelReader>,
    output: Option<ChannelWriter>,
) -> Result<StageReport> {
    let name = stage.name().to_string();
    let span = info_span!("stage", name = %name);
    let _guard = span.enter();
    let start = Instant::now();

    debug!(state = %StageState::Init, "initializing");
    check_wiring(stage.as_ref(), &input, &output)?;
    if let Err(e) = stage.init() {
        error!(state = %StageState::Failed, "init failed: {}", e);
        return Err(e);
    }

    debug!(state = %StageState::Running, "running");
    let mut downstream = match output {
        Some(writer) => Downstream::attached(&name, writer),
        None => Downstream::detached(&name),
    };

    if let Err(e) = run_loops(stage.as_mut(), input, &mut downstream) {
        error!(state = %StageState::Failed, category = %e.category(), "stage failed: {}", e);
        return Err(e);
    }

    let items_emitted = downstream.emitted();
    let mut open_writer = None;
    if let Some(writer) = downstream.into_writer() {
        if stage.close_on_end() {
            writer.close()?;
        } else {
            debug!("leaving downstream channel open");
            open_writer = Some(writer);
        }
    }

    let counters = stage.counters();
    info!(
        state = %StageState::Closed,
        items = items_emitted,
        dropped = counters.items_dropped,
        "stage finished in {:?}",
        start.elapsed()
    );

    Ok(StageReport {
        stage: name,
        state: StageState::Closed,
        items_emitted,
        counters,
        duration_ms: start.elapsed().as_millis() as u64,
        open_writer,
    })
}

/// Handle to a stage running on its own thread
pub struct StageHandle {
    name: String,
    handle: thread::JoinHandle<Result<StageReport>>,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the stage to finish
    pub fn join(self) -> Result<StageReport> {
        let name = self.name;
        self.handle.join().map_err(|panic| FlowError::StageCrashed {
            stage: name,
            reason: panic_message(panic.as_ref()),
        })?
    }
}

/// Run a stage on a dedicated, named thread
pub fn spawn_stage(
    stage: Box<dyn Stage>,
    input: Option<ChannelReader>,
    output: Option<ChannelWriter>,
) -> Result<StageHandle> {
    let name = stage.name().to_string();
    let handle = thread::Builder::new()
        .name(format!("stage-{}", name))
        .spawn(move || run_stage(stage, input, output))
        .map_err(|e| FlowError::StageCrashed {
            stage: name.clone(),
            reason: e.to_string(),
        })?;

    Ok(StageHandle { name, handle })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

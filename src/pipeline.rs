/*!
 * Linear pipeline runner
 *
 * Stages are chained source first: each stage's downstream channel is the next
 * stage's upstream. Every stage runs on its own thread, so a slow consumer throttles
 * its producer through the bounded channel between them.
 */

use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::channel::{channel, ChannelReader, Item};
use crate::config::PipelineConfig;
use crate::error::{ErrorCategory, FlowError, Result, EXIT_PARTIAL, EXIT_SUCCESS};
use crate::stage::{spawn_stage, Stage, StageHandle, StageReport};

/// Pipeline under construction
pub struct Pipeline {
    capacity: usize,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// New empty pipeline whose channels hold `capacity` items each
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stages: Vec::new(),
        }
    }

    /// Build every configured stage
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let mut pipeline = Self::new(config.channel_capacity);
        for stage in &config.stages {
            pipeline = pipeline.boxed_stage(stage.build()?);
        }
        Ok(pipeline)
    }

    /// Append a stage
    pub fn stage<S: Stage + 'static>(self, stage: S) -> Self {
        self.boxed_stage(Box::new(stage))
    }

    pub fn boxed_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Every stage must have an upstream exactly when its predecessor emits
    fn check_wiring(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(FlowError::Config("pipeline has no stages".into()));
        }

        let mut upstream_open = false;
        for stage in &self.stages {
            match (upstream_open, stage.has_upstream()) {
                (false, true) => {
                    return Err(FlowError::Config(format!(
                        "stage '{}' needs an upstream but nothing feeds it",
                        stage.name()
                    )))
                }
                (true, false) => {
                    return Err(FlowError::Config(format!(
                        "stage '{}' takes no upstream but follows an emitting stage",
                        stage.name()
                    )))
                }
                _ => {}
            }
            upstream_open = stage.has_downstream();
        }
        Ok(())
    }

    /// Wire the channels and start every stage
    pub fn spawn(self) -> Result<RunningPipeline> {
        self.check_wiring()?;

        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        info!("Starting pipeline: {}", names.join(" -> "));

        let capacity = self.capacity;
        let mut handles = Vec::with_capacity(self.stages.len());
        let mut upstream: Option<ChannelReader> = None;

        for (index, stage) in self.stages.into_iter().enumerate() {
            let (output, next) = if stage.has_downstream() {
                let (tx, rx) = channel(format!("{}#{}", stage.name(), index), capacity);
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            handles.push(spawn_stage(stage, upstream.take(), output)?);
            upstream = next;
        }

        Ok(RunningPipeline {
            handles,
            output: upstream,
            started: Instant::now(),
        })
    }

    /// Run to completion, draining items emitted by the last stage
    pub fn run(self) -> Result<PipelineReport> {
        let mut running = self.spawn()?;

        let mut trailing = 0;
        if let Some(output) = running.take_output() {
            for item in output {
                // Upstream failures are reported by the stage that failed
                let Ok(item) = item else { break };
                if let Item::Stream(stream) = item {
                    for chunk in stream {
                        if let Err(e) = chunk {
                            warn!("Trailing stream failed: {}", e);
                            break;
                        }
                    }
                }
                trailing += 1;
            }
        }

        let mut report = running.join()?;
        report.trailing_items = trailing;
        Ok(report)
    }
}

/// Pipeline whose stages are running
pub struct RunningPipeline {
    handles: Vec<StageHandle>,
    output: Option<ChannelReader>,
    started: Instant,
}

impl RunningPipeline {
    /// Reader of the last stage's output, if the last stage emits
    ///
    /// Must be drained before `join`, otherwise the last stage stops with
    /// `DownstreamClosed`.
    pub fn take_output(&mut self) -> Option<ChannelReader> {
        self.output.take()
    }

    /// Wait for every stage and collect their reports
    ///
    /// When several stages fail, the root cause is returned rather than the
    /// channel errors it caused in its neighbours.
    pub fn join(mut self) -> Result<PipelineReport> {
        drop(self.output.take());

        let mut reports = Vec::with_capacity(self.handles.len());
        let mut failures = Vec::new();

        for handle in self.handles {
            let name = handle.name().to_string();
            match handle.join() {
                Ok(mut report) => {
                    // Nothing else can write into a linear chain
                    if let Some(writer) = report.open_writer.take() {
                        info!("Closing channel '{}' left open by {}", writer.name(), name);
                        if let Err(e) = writer.close() {
                            warn!("Could not close channel left open by {}: {}", name, e);
                        }
                    }
                    reports.push(report);
                }
                Err(e) => {
                    error!("Stage {} failed: {}", name, e);
                    failures.push(e);
                }
            }
        }

        if let Some(root) = root_cause(failures) {
            return Err(root);
        }

        let report = PipelineReport {
            stages: reports,
            trailing_items: 0,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        info!(
            "Pipeline finished in {} ms ({} items dropped)",
            report.duration_ms,
            report.items_dropped()
        );
        Ok(report)
    }
}

fn root_cause(failures: Vec<FlowError>) -> Option<FlowError> {
    let position = failures
        .iter()
        .position(|e| e.category() != ErrorCategory::Channel)
        .unwrap_or(0);
    failures.into_iter().nth(position)
}

/// Summary of a completed run
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,

    /// Items emitted by the last stage and drained by the runner
    pub trailing_items: u64,

    pub duration_ms: u64,
}

impl PipelineReport {
    /// Items dropped by item-scoped errors across all stages
    pub fn items_dropped(&self) -> u64 {
        self.stages.iter().map(|s| s.counters.items_dropped).sum()
    }

    /// Process exit code: partial success when anything was dropped
    pub fn exit_code(&self) -> i32 {
        if self.items_dropped() > 0 {
            EXIT_PARTIAL
        } else {
            EXIT_SUCCESS
        }
    }
}

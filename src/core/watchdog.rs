/*!
 * Memory watchdog for producer loops
 *
 * Before every item a paced loop samples process memory. When the sample is above
 * the configured ceiling the loop sleeps for the pause duration before emitting the
 * item. Nothing is dropped or reordered; the watchdog only slows the producer down
 * so consumers can drain what is already in flight.
 */

use std::io;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// Default memory ceiling (3 GiB)
pub const DEFAULT_MEMORY_CEILING: u64 = 3 * 1024 * 1024 * 1024;

/// Default pause when above the ceiling (5 seconds)
pub const DEFAULT_PAUSE: Duration = Duration::from_millis(5000);

/// Source of memory usage samples
pub trait MemoryMonitor: Send + Sync {
    /// Current memory in use by this process, in bytes
    fn used_bytes(&self) -> u64;
}

/// Samples the resident memory of the current process via sysinfo
pub struct SystemMemoryMonitor {
    pid: Pid,
    system: Mutex<System>,
}

impl SystemMemoryMonitor {
    pub fn new() -> Result<Self> {
        let pid = get_current_pid()
            .map_err(|e| FlowError::Io(io::Error::other(format!("Cannot resolve own pid: {}", e))))?;

        Ok(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }

    /// Process-wide monitor shared by every paced stage
    pub fn shared() -> Result<Arc<dyn MemoryMonitor>> {
        static SHARED: OnceLock<Arc<SystemMemoryMonitor>> = OnceLock::new();

        if let Some(monitor) = SHARED.get() {
            return Ok(monitor.clone());
        }
        let monitor = Arc::new(Self::new()?);
        Ok(SHARED.get_or_init(|| monitor).clone())
    }
}

impl MemoryMonitor for SystemMemoryMonitor {
    fn used_bytes(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Outcome of one watchdog check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Memory below the ceiling, proceed immediately
    Clear,

    /// Memory above the ceiling, the loop slept before proceeding
    Paused { used: u64 },
}

/// Counters for reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogStats {
    pub checks: u64,
    pub pauses: u64,
}

/// Check-and-pause policy keyed to process memory
pub struct Watchdog {
    monitor: Arc<dyn MemoryMonitor>,
    ceiling: u64,
    pause: Duration,
    label: String,
    stats: WatchdogStats,
}

impl Watchdog {
    pub fn new(
        monitor: Arc<dyn MemoryMonitor>,
        ceiling: u64,
        pause: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            monitor,
            ceiling,
            pause,
            label: label.into(),
            stats: WatchdogStats::default(),
        }
    }

    /// Sample memory once and sleep if it is above the ceiling
    pub fn pace(&mut self) -> Pace {
        self.stats.checks += 1;
        let used = self.monitor.used_bytes();

        if used > self.ceiling {
            self.stats.pauses += 1;
            warn!(
                "[{}] too much data in memory (used {:.2} MB, ceiling {:.2} MB), waiting {:?}",
                self.label,
                used as f64 / 1024.0 / 1024.0,
                self.ceiling as f64 / 1024.0 / 1024.0,
                self.pause
            );
            std::thread::sleep(self.pause);
            Pace::Paused { used }
        } else {
            debug!("[{}] memory check ok ({} bytes used)", self.label, used);
            Pace::Clear
        }
    }

    /// Run `step` for every item, pacing before each one
    pub fn run<T, I, F>(&mut self, items: I, mut step: F) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Result<()>,
    {
        for item in items {
            self.pace();
            step(item)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> WatchdogStats {
        self.stats
    }
}

/// Monitor returning a fixed value
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryMonitor(pub u64);

impl MemoryMonitor for FixedMemoryMonitor {
    fn used_bytes(&self) -> u64 {
        self.0
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedMonitor;
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_clear_below_ceiling() {
        let mut dog = Watchdog::new(
            Arc::new(FixedMemoryMonitor(100)),
            1000,
            Duration::from_secs(60),
            "test",
        );
        assert_eq!(dog.pace(), Pace::Clear);
        assert_eq!(dog.stats(), WatchdogStats { checks: 1, pauses: 0 });
    }

    #[test]
    fn test_ceiling_is_exclusive() {
        let mut dog = Watchdog::new(
            Arc::new(FixedMemoryMonitor(1000)),
            1000,
            Duration::from_secs(60),
            "test",
        );
        assert_eq!(dog.pace(), Pace::Clear);
    }

    #[test]
    fn test_pauses_above_ceiling() {
        let mut dog = Watchdog::new(
            Arc::new(FixedMemoryMonitor(2000)),
            1000,
            Duration::from_millis(20),
            "test",
        );

        let start = Instant::now();
        assert_eq!(dog.pace(), Pace::Paused { used: 2000 });
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(dog.stats().pauses, 1);
    }

    #[test]
    fn test_run_pauses_before_item_and_keeps_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let monitor = ScriptedMonitor::new(&[10, 5000, 10], log.clone());
        let mut dog = Watchdog::new(Arc::new(monitor), 1000, Duration::from_millis(1), "test");

        let step_log = log.clone();
        dog.run(["a", "b", "c"], |item| {
            step_log.lock().unwrap().push(format!("emit {}", item));
            Ok(())
        })
        .unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "sample 10",
                "emit a",
                "sample 5000",
                "emit b",
                "sample 10",
                "emit c"
            ]
        );
        assert_eq!(dog.stats(), WatchdogStats { checks: 3, pauses: 1 });
    }

    #[test]
    fn test_run_stops_on_step_error() {
        let mut dog = Watchdog::new(
            Arc::new(FixedMemoryMonitor(0)),
            1000,
            Duration::from_millis(1),
            "test",
        );
        let mut seen = Vec::new();
        let result = dog.run(1..=5, |i| {
            seen.push(i);
            if i == 3 {
                Err(FlowError::Config("stop".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_system_monitor_reports_usage() {
        let monitor = SystemMemoryMonitor::new().unwrap();
        assert!(monitor.used_bytes() > 0);
    }
}

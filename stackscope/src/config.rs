//! Process-wide sampling configuration.

use std::path::PathBuf;

use crate::vm::VmReadMode;

/// Everything the control surface can tune. Changes only take effect at
/// the next `start`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tick period in microseconds.
    pub interval_us: u64,
    /// Sample CPU time instead of wall time.
    pub cpu: bool,
    /// Track allocations; suppresses time sampling.
    pub memory: bool,
    /// Unwind native stacks and interleave them with managed ones.
    pub native: bool,
    /// Render one snapshot to the pipe and exit.
    pub where_mode: bool,
    /// Upper bound on a single stack's depth.
    pub max_frames: usize,
    /// Snapshot pipe path; defaults to a pid-derived temp path.
    pub pipe_name: Option<PathBuf>,
    /// In CPU mode, skip threads the kernel reports as not running.
    pub ignore_non_running_threads: bool,
    /// Memory-read strategy.
    pub vm_read_mode: VmReadMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_us: 1000,
            cpu: false,
            memory: false,
            native: false,
            where_mode: false,
            max_frames: 2048,
            pipe_name: None,
            ignore_non_running_threads: true,
            vm_read_mode: VmReadMode::Kernel,
        }
    }
}

impl Config {
    /// The mode label recorded in the output stream's metadata.
    #[must_use]
    pub fn mode_name(&self) -> &'static str {
        if self.where_mode {
            "where"
        } else if self.memory {
            "memory"
        } else if self.cpu {
            "cpu"
        } else {
            "wall"
        }
    }
}

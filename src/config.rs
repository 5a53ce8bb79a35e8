// src/config.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::assign::{AssignmentPolicy, OverflowPolicy};
use crate::budget::ErrorBudgetConfig;
use crate::rlimit::RlimitConfig;
use crate::scheduler::SchedulerConfig;
use crate::tokenizer::TraceLimits;

/// Replay run configuration, loaded from YAML. Every field is optional;
/// CLI flags override whatever the file sets.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Number of worker threads. Defaults to the number of CPUs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded queue capacity per worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How records are assigned to workers: round_robin, target_hash or affinity.
    #[serde(default)]
    pub assignment: AssignmentPolicy,

    /// What happens when a worker queue is full: block or reject.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// With `overflow: block`, give up on a task after waiting this long
    /// (e.g. "250ms"). Default: wait forever.
    #[serde(default, with = "humantime_serde")]
    pub enqueue_timeout: Option<Duration>,

    /// Timing multiplier (2.0 = twice as fast as captured).
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Wait for each record's scheduled start. Off replays as fast as possible.
    #[serde(default = "default_true")]
    pub honor_timing: bool,

    /// Thresholds that cancel the run. Default: unlimited.
    #[serde(default)]
    pub error_budget: ErrorBudgetConfig,

    /// Line length and token count ceilings.
    #[serde(default)]
    pub limits: TraceLimits,

    /// Process resource limits raised before the pool starts.
    #[serde(default)]
    pub rlimits: RlimitConfig,

    /// Directory the filesystem executor replays under.
    #[serde(default)]
    pub target_root: Option<PathBuf>,

    /// Create missing parent directories under the target root on CREATE,
    /// WRITE and MKDIR.
    #[serde(default = "default_true")]
    pub create_parents: bool,

    /// Execute nothing; only exercise parsing and scheduling.
    #[serde(default)]
    pub dry_run: bool,

    /// Record what is replayed into this capture file.
    #[serde(default)]
    pub capture_out: Option<PathBuf>,

    /// Base path for TSV results (`<base>-results.tsv`).
    #[serde(default)]
    pub results_tsv: Option<PathBuf>,
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_queue_capacity() -> usize {
    crate::constants::TASK_BUFFER_PER_THREAD
}

fn default_speed() -> f64 {
    crate::constants::DEFAULT_SPEED
}

fn default_true() -> bool {
    true
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            assignment: AssignmentPolicy::default(),
            overflow: OverflowPolicy::default(),
            enqueue_timeout: None,
            speed: default_speed(),
            honor_timing: true,
            error_budget: ErrorBudgetConfig::default(),
            limits: TraceLimits::default(),
            rlimits: RlimitConfig::default(),
            target_root: None,
            create_parents: true,
            dry_run: false,
            capture_out: None,
            results_tsv: None,
        }
    }
}

impl ReplayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Trace limits from an optional config file, for commands that only
    /// parse traces. Without a file the defaults apply.
    pub fn load_trace_limits(path: Option<&Path>) -> Result<TraceLimits> {
        let cfg = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        cfg.validate_limits()?;
        Ok(cfg.limits)
    }

    pub fn validate_limits(&self) -> Result<()> {
        if self.limits.max_line_len == 0 {
            bail!("limits.max_line_len must be at least 1");
        }
        if self.limits.max_tokens < 2 {
            bail!("limits.max_tokens must be at least 2 (kind and target)");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler_config().validate()?;
        self.validate_limits()?;
        if !self.dry_run && self.target_root.is_none() {
            bail!("a target root is required unless dry_run is set");
        }
        if let Some(root) = &self.target_root {
            if !root.is_dir() {
                bail!("target root {} is not a directory", root.display());
            }
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            assignment: self.assignment,
            overflow: self.overflow,
            enqueue_timeout: self.enqueue_timeout,
            speed: self.speed,
            honor_timing: self.honor_timing,
            error_budget: self.error_budget.clone(),
        }
    }
}

//! Per-cycle trace records for `.pilot/traces/`.
//!
//! The engine hands one [`TraceRecord`] to its [`TraceSink`] after every
//! cycle. Sink failures are logged and never fail the task.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::topology::Stage;
use crate::core::types::{TaskPhase, ToolOutcome};

/// One stage decision as it appears in a trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionSummary {
    pub stage: Stage,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub run_id: String,
    pub cycle: u32,
    /// Step count after the cycle.
    pub step: u32,
    pub phase: TaskPhase,
    /// Stages visited during the cycle, in order.
    pub stages: Vec<Stage>,
    pub decisions: Vec<DecisionSummary>,
    pub tool_results: Vec<ToolOutcome>,
    pub convergence: String,
    pub duration_ms: u64,
}

/// Append-only destination for trace records.
pub trait TraceSink: Send + Sync {
    fn record(&self, record: &TraceRecord) -> Result<()>;
}

impl<T: TraceSink + ?Sized> TraceSink for Arc<T> {
    fn record(&self, record: &TraceRecord) -> Result<()> {
        (**self).record(record)
    }
}

/// Discards every record.
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn record(&self, _record: &TraceRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TracePaths {
    pub dir: PathBuf,
}

impl TracePaths {
    pub fn new(root: &Path, run_id: &str) -> Self {
        Self {
            dir: root.join(".pilot").join("traces").join(run_id),
        }
    }

    pub fn cycle_path(&self, cycle: u32) -> PathBuf {
        self.dir.join(format!("{cycle}.json"))
    }
}

/// Writes `.pilot/traces/<run_id>/<cycle>.json` under `root`.
pub struct FileTraceSink {
    root: PathBuf,
}

impl FileTraceSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TraceSink for FileTraceSink {
    fn record(&self, record: &TraceRecord) -> Result<()> {
        let paths = TracePaths::new(&self.root, &record.run_id);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create trace dir {}", paths.dir.display()))?;
        let path = paths.cycle_path(record.cycle);
        let mut buf = serde_json::to_string_pretty(record)?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "trace record written");
        Ok(())
    }
}

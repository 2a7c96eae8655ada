//! Pilot configuration, usually stored as `pilot.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::topology::Topology;
use crate::core::types::ExecutionMode;

/// Pilot configuration (TOML).
///
/// Read once when an engine is built; the topology and step budget are then
/// captured into each task run and never re-read mid-run. Missing fields
/// default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PilotConfig {
    /// Stage graph to drive (`baseline` or `multi_role`).
    pub topology: Topology,

    /// How each tool-call batch is dispatched.
    pub execution_mode: ExecutionMode,

    /// Re-read UI state after calls that declare an expected effect.
    pub post_validation: bool,

    /// Tool-call batches allowed before the run is aborted.
    pub max_steps: u32,

    /// Verification retries for a single text entry.
    pub text_entry_retries: u32,

    pub decision_timeout_secs: u64,

    pub tool_timeout_secs: u64,

    /// Upper bound on device calls in flight in parallel mode.
    pub max_concurrent_calls: usize,

    /// Thoughts kept in the run's log.
    pub thought_retention: usize,

    /// Most recent thoughts handed to each decision.
    pub context_thoughts: usize,

    /// Consecutive cycles without subgoal progress before a forced replan.
    pub stall_cycle_limit: u32,

    pub max_replans: u32,

    /// Capture a fresh screen observation for every decision.
    pub use_vision: bool,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            topology: Topology::MultiRole,
            execution_mode: ExecutionMode::SequentialAbort,
            post_validation: true,
            max_steps: 400,
            text_entry_retries: 2,
            decision_timeout_secs: 120,
            tool_timeout_secs: 30,
            max_concurrent_calls: 4,
            thought_retention: 200,
            context_thoughts: 20,
            stall_cycle_limit: 10,
            max_replans: 5,
            use_vision: false,
        }
    }
}

impl PilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.decision_timeout_secs == 0 {
            return Err(anyhow!("decision_timeout_secs must be > 0"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.max_concurrent_calls == 0 {
            return Err(anyhow!("max_concurrent_calls must be > 0"));
        }
        if self.thought_retention == 0 {
            return Err(anyhow!("thought_retention must be > 0"));
        }
        if self.context_thoughts > self.thought_retention {
            return Err(anyhow!(
                "context_thoughts ({}) must not exceed thought_retention ({})",
                self.context_thoughts,
                self.thought_retention
            ));
        }
        if self.stall_cycle_limit == 0 {
            return Err(anyhow!("stall_cycle_limit must be > 0"));
        }
        Ok(())
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// Named feature combinations used for ablation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// Three-stage graph, parallel dispatch, no post-validation.
    Baseline,
    /// Eight-stage graph, parallel dispatch, no post-validation.
    MultiRole,
    /// Eight-stage graph, sequential-abort dispatch with post-validation.
    SequentialValidation,
    /// Everything on, including per-decision screen capture.
    Full,
}

impl Preset {
    pub fn config(self) -> PilotConfig {
        let base = PilotConfig::default();
        match self {
            Preset::Baseline => PilotConfig {
                topology: Topology::Baseline,
                execution_mode: ExecutionMode::Parallel,
                post_validation: false,
                ..base
            },
            Preset::MultiRole => PilotConfig {
                topology: Topology::MultiRole,
                execution_mode: ExecutionMode::Parallel,
                post_validation: false,
                ..base
            },
            Preset::SequentialValidation => PilotConfig {
                topology: Topology::MultiRole,
                execution_mode: ExecutionMode::SequentialAbort,
                post_validation: true,
                ..base
            },
            Preset::Full => PilotConfig {
                use_vision: true,
                ..Preset::SequentialValidation.config()
            },
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<PilotConfig> {
    if !path.exists() {
        let cfg = PilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn config_to_toml(cfg: &PilotConfig) -> Result<String> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    Ok(buf)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PilotConfig) -> Result<()> {
    cfg.validate()?;
    let buf = config_to_toml(cfg)?;
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PilotConfig::default());
        assert_eq!(cfg.max_steps, 400);
        assert_eq!(cfg.text_entry_retries, 2);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("pilot.toml");
        let cfg = Preset::Full.config();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pilot.toml");
        fs::write(
            &path,
            "topology = \"baseline\"\nexecution_mode = \"parallel\"\nmax_steps = 12\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.topology, Topology::Baseline);
        assert_eq!(cfg.execution_mode, ExecutionMode::Parallel);
        assert_eq!(cfg.max_steps, 12);
        assert!(cfg.post_validation);
    }

    #[test]
    fn rejects_zero_budget_and_unknown_topology() {
        let cfg = PilotConfig {
            max_steps: 0,
            ..PilotConfig::default()
        };
        assert!(cfg.validate().is_err());

        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pilot.toml");
        fs::write(&path, "topology = \"star\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn presets_differ_only_in_feature_toggles() {
        let baseline = Preset::Baseline.config();
        let full = Preset::Full.config();
        assert_eq!(baseline.topology, Topology::Baseline);
        assert!(!baseline.post_validation);
        assert_eq!(full.topology, Topology::MultiRole);
        assert!(full.use_vision && full.post_validation);
        assert_eq!(baseline.max_steps, full.max_steps);
        for preset in Preset::value_variants() {
            preset.config().validate().expect("preset validates");
        }
    }
}

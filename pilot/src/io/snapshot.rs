//! Task run snapshots (`.pilot/snapshot.json` by default).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::invariants::validate_plan_invariants;
use crate::run::TaskRun;

/// Load a snapshot and check the plan invariants.
pub fn load_snapshot(path: &Path) -> Result<TaskRun> {
    debug!(path = %path.display(), "loading snapshot");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    let run: TaskRun = serde_json::from_str(&contents)
        .with_context(|| format!("parse snapshot {}", path.display()))?;
    let errors = validate_plan_invariants(run.plan());
    if !errors.is_empty() {
        return Err(anyhow!(
            "snapshot {} violates plan invariants: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    debug!(run_id = run.run_id(), step = run.step_count(), "snapshot loaded");
    Ok(run)
}

/// Atomically write a snapshot (temp file + rename).
pub fn write_snapshot(path: &Path, run: &TaskRun) -> Result<()> {
    debug!(
        path = %path.display(),
        run_id = run.run_id(),
        step = run.step_count(),
        "writing snapshot"
    );
    let mut buf = serde_json::to_string_pretty(run)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("snapshot path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp snapshot {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace snapshot {}", path.display()))?;
    Ok(())
}

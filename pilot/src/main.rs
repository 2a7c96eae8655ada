//! Operator CLI for pilot configuration and task-run snapshots.
//!
//! Task runs themselves are driven by embedding [`pilot::engine::Engine`];
//! this binary checks configuration files, prints presets, and inspects the
//! snapshots an engine checkpoints to disk.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use pilot::core::types::TaskStatus;
use pilot::exit_codes;
use pilot::io::config::{Preset, config_to_toml, load_config};
use pilot::io::snapshot::load_snapshot;
use pilot::logging;
use pilot::run::TaskOutcome;

#[derive(Parser)]
#[command(
    name = "pilot",
    version,
    about = "Goal-driven mobile automation orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Configuration files and presets.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Summarize a task-run snapshot; the exit code reflects its status.
    Inspect {
        /// Snapshot written by an engine checkpoint.
        #[arg(default_value = ".pilot/snapshot.json")]
        snapshot: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Load and validate a config file, then print the effective settings.
    Check { path: PathBuf },
    /// Print a preset as TOML.
    Preset {
        #[arg(value_enum)]
        name: Preset,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Config {
            command: ConfigCommand::Check { path },
        } => cmd_config_check(&path),
        Command::Config {
            command: ConfigCommand::Preset { name },
        } => cmd_config_preset(name),
        Command::Inspect { snapshot } => cmd_inspect(&snapshot),
    }
}

fn cmd_config_check(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    print!("{}", config_to_toml(&config)?);
    Ok(exit_codes::OK)
}

fn cmd_config_preset(preset: Preset) -> Result<i32> {
    print!("{}", config_to_toml(&preset.config())?);
    Ok(exit_codes::OK)
}

fn cmd_inspect(path: &Path) -> Result<i32> {
    let run = load_snapshot(path)?;
    println!("run:      {}", run.run_id());
    println!("goal:     {}", run.goal());
    println!("topology: {}", run.topology().label());
    println!("phase:    {:?}", run.phase());
    println!("steps:    {}/{}", run.step_count(), run.max_steps());
    println!("cycles:   {}", run.cycle());
    for subgoal in run.plan().subgoals() {
        println!(
            "  [{}] {} {}",
            subgoal.status.label(),
            subgoal.id,
            subgoal.description
        );
    }
    if let Some(TaskOutcome::Failure {
        reason, message, ..
    }) = run.outcome()
    {
        println!("failure:  {} ({})", message, reason.code());
    }
    Ok(status_code(run.status()))
}

fn status_code(status: TaskStatus) -> i32 {
    match status {
        TaskStatus::Success => exit_codes::OK,
        TaskStatus::Failure => exit_codes::FAILED,
        TaskStatus::Aborted => exit_codes::ABORTED,
        TaskStatus::Running => exit_codes::RUNNING,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_check() {
        let cli = Cli::parse_from(["pilot", "config", "check", "pilot.toml"]);
        assert!(matches!(
            cli.command,
            Command::Config {
                command: ConfigCommand::Check { ref path }
            } if path == &PathBuf::from("pilot.toml")
        ));
    }

    #[test]
    fn parse_config_preset() {
        let cli = Cli::parse_from(["pilot", "config", "preset", "sequential-validation"]);
        assert!(matches!(
            cli.command,
            Command::Config {
                command: ConfigCommand::Preset {
                    name: Preset::SequentialValidation
                }
            }
        ));
    }

    #[test]
    fn parse_inspect_defaults_snapshot_path() {
        let cli = Cli::parse_from(["pilot", "inspect"]);
        assert!(matches!(
            cli.command,
            Command::Inspect { ref snapshot }
                if snapshot == &PathBuf::from(".pilot/snapshot.json")
        ));
    }

    #[test]
    fn terminal_statuses_map_to_distinct_exit_codes() {
        assert_eq!(status_code(TaskStatus::Success), exit_codes::OK);
        assert_eq!(status_code(TaskStatus::Failure), exit_codes::FAILED);
        assert_eq!(status_code(TaskStatus::Aborted), exit_codes::ABORTED);
        assert_eq!(status_code(TaskStatus::Running), exit_codes::RUNNING);
    }
}

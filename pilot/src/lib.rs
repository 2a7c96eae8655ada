//! Orchestration core for goal-driven mobile device automation.
//!
//! A task run repeatedly plans subgoals, asks decision stages what to do next,
//! executes the resulting tool calls against a device, and decides whether to
//! continue, replan, or stop. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan lifecycle, thought log,
//!   convergence, topology, decision resolution). No I/O, fully testable in isolation.
//! - **[`io`]**: Boundaries with side effects (decision ports, the device,
//!   trace sinks, snapshots, configuration files).
//!
//! Orchestration modules ([`engine`], [`coordinator`], [`text_entry`], [`run`])
//! coordinate core logic with the boundaries.

pub mod coordinator;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod text_entry;

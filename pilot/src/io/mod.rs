//! Boundaries with side effects: decision stages, the device, traces, files.

pub mod config;
pub mod decision;
pub mod device;
pub mod snapshot;
pub mod trace;

//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod convergence;
pub mod invariants;
pub mod outcome;
pub mod plan;
pub mod text_entry;
pub mod thoughts;
pub mod topology;
pub mod types;

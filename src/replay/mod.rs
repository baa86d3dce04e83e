//! Replay Engine: request matching, target fan-out, and failure recording.

pub mod correlation;
pub mod engine;
pub mod failure_log;
pub mod rule;

pub use engine::ReplayEngine;

//! Test doubles and fixtures.
//!
//! This module provides:
//! - [`RecordingHandler`] for bus and subscription tests
//! - [`ScriptedExecutor`] for worker tests
//! - Envelope and catalog fixtures

mod executor;
pub mod fixtures;
mod recording;

pub use executor::ScriptedExecutor;
pub use recording::RecordingHandler;

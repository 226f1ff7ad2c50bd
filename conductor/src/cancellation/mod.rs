//! Shutdown signalling for the orchestrator's long-lived tasks.

mod token;

pub use token::ShutdownToken;

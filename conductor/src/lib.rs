//! # Conductor
//!
//! Event-driven orchestration core for multi-stage build pipelines executed
//! by autonomous workers.
//!
//! A pipeline is an ordered list of stages. For each stage the core publishes
//! exactly one task envelope to `tasks.<worker_type>`, waits for the worker's
//! result on the shared `results` topic (mirrored into a durable stream), and
//! advances, completes or fails the pipeline:
//!
//! - **Versioned contracts**: task and result envelopes validated on both ends
//! - **Durable results**: consumer groups, acknowledgement after handling,
//!   dead-lettering of poison entries
//! - **Explicit state machine**: a pure transition function plus persisted,
//!   deduplicated, per-pipeline serialized effects
//! - **Resilience**: stage watchdogs, retry with backoff, per-worker-type
//!   circuit breakers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conductor::prelude::*;
//!
//! let catalog = StageCatalog::new().with_pipeline(
//!     "app",
//!     vec![
//!         StageDefinition::new("init", "scaffold"),
//!         StageDefinition::new("build", "compiler"),
//!         StageDefinition::new("test", "tester"),
//!     ],
//! )?;
//!
//! let config = ConductorConfig::from_env()?;
//! let machine = Arc::new(PipelineStateMachine::new(repository, store.clone(), bus.clone(), catalog, config.clone()));
//! let consumer = Arc::new(ResultConsumer::new(store, repository, machine.clone()));
//! let results = StreamSubscription::new(bus, config.subscription_config()).with_handler(consumer);
//!
//! machine.recover(&results).await?;
//! machine.spawn_timeout_listener(shutdown.clone());
//! Arc::new(results).spawn(shutdown);
//!
//! let pipeline = machine.create_pipeline(NewPipeline::new("app", "demo")).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bus;
pub mod cancellation;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod contracts;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod kv;
pub mod machine;
pub mod observability;
pub mod repository;
pub mod resilience;
pub mod testing;
pub mod utils;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::{InMemoryBus, MessageBus, MessageHandler, StreamSubscription};
    pub use crate::cancellation::ShutdownToken;
    pub use crate::catalog::{StageCatalog, StageDefinition};
    pub use crate::config::ConductorConfig;
    pub use crate::consumer::ResultConsumer;
    pub use crate::contracts::{
        Envelope, ResultEnvelope, ResultError, ResultStatus, TaskEnvelope, TraceContext,
        SCHEMA_VERSION,
    };
    pub use crate::core::{NewPipeline, Pipeline, PipelineEvent, PipelineStatus};
    pub use crate::errors::{ConductorError, ContractViolation, PipelineError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::kv::{InMemoryKeyValueStore, KeyValueStore};
    pub use crate::machine::{PipelineControl, PipelineStateMachine, Transition};
    pub use crate::repository::{InMemoryPipelineRepository, PipelineRepository};
    pub use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
    pub use crate::worker::{TaskExecutor, WorkerConfig, WorkerHarness};
}

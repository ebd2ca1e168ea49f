//! # fapilog - structured, asynchronous logging pipeline
//!
//! fapilog is a logging pipeline for service applications: producers hand
//! off structured records on the calling task, a bounded queue absorbs
//! bursts under an explicit backpressure policy, and a background worker
//! pool runs each record through enrichment, redaction, filtering, and
//! serialization before batching it out to one or more sinks.
//!
//! ## Architecture
//!
//! - [`envelope`]: the record type (`Envelope`), severity levels, and the
//!   dynamic JSON-safe payload model.
//! - [`context`]: task-local ambient context propagation.
//! - [`queue`]: the bounded MPSC queue and its backpressure policies.
//! - [`pipeline`]: enrichment, redaction, filtering, and serialization
//!   plugin traits plus the built-in implementations.
//! - [`worker`]: the background worker pool that drains the queue and
//!   writes batches to sinks.
//! - [`sink`]: the sink trait, circuit breaker, and routing; [`sink::file`]
//!   is the rotating file sink.
//! - [`diagnostics`]: the internal self-observation channel.
//! - [`metrics`]: process-wide counters.
//! - [`lifecycle`]: startup, flush, and drain orchestration.
//! - [`config`]: environment-driven settings.
//! - [`facade`]: the producer-facing `Logger` handle and its builder.

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod worker;

pub use envelope::{Envelope, Level, Value};
pub use error::{Error, Result};
pub use facade::{global, install_global, Logger, LoggerBuilder, LoggerGuard};
pub use lifecycle::{DrainResult, LifecycleController};

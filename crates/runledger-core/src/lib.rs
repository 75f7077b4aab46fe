//! runledger-core: Core library for runledger
//!
//! This crate records the lifecycle events emitted by the worker threads of a
//! test run (runs, suites, testcases, load queues, checkpoints, messages and
//! statistics) into a hierarchical report held by a durable write sink.
//!
//! # Architecture
//!
//! ```text
//! producer threads ──► EventPipeline (FIFO) ──► consumer thread
//!        │                                          │
//!        │ request_deletion (out-of-band)           ▼
//!        └──────────────────────────────────► Processor ──► WriteSink
//!                                                   │
//!        ◄──── Completion (one-shot) ───────────────┘
//! ```
//!
//! # Modules
//!
//! - `event`: Lifecycle event taxonomy and the envelope carried by the queue
//! - `lifecycle`: Run → suite → testcase state machine and processor state
//! - `identity`: Suite identity cache and deleted-testcase tracking
//! - `load_queue`: Load queue, thread binding and checkpoint bookkeeping
//! - `routing`: Destination selection for messages and statistics
//! - `sink`: The write-sink contract required from storage
//! - `processor`: Event validation and dispatch onto the sink
//! - `bridge`: One-shot completion signals for synchronizing events
//! - `pipeline`: Event queue, consumer thread and producer API
//! - `memory_sink`: In-memory recording sink with fault injection
//! - `sqlite_sink`: SQLite reference backend
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod lifecycle;
pub mod load_queue;
pub mod logging;
pub mod memory_sink;
pub mod pipeline;
pub mod processor;
pub mod routing;
pub mod sink;
pub mod sqlite_sink;

pub use error::{Error, Result, SinkError};
pub use event::{EntityId, Envelope, LifecycleEvent};
pub use pipeline::EventPipeline;
pub use processor::Processor;
pub use sink::WriteSink;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

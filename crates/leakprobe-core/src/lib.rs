//! leakprobe-core: Core library for leakprobe
//!
//! Reproduces and verifies lifecycle leaks in resources that own a periodic
//! background task: a client-throttling analyzer whose timer is started on
//! construction and only stopped by an explicit release.
//!
//! # Architecture
//!
//! ```text
//! LifecycleMonitor ──open/probe/close──► StorageClient ──spawn──► PeriodicTaskResource
//!        │                                                            │ TaskTag
//!        └──snapshot/collect──► TaskRegistry ◄────────register────────┘
//!                                   ▲
//! ComparativeLeakHarness ──────────┘ (broken batch vs released batch)
//! ```
//!
//! # Modules
//!
//! - `registry`: Named task registry and the injected `TaskRegistry` capability
//! - `snapshot`: Task/memory snapshots and deltas
//! - `resource`: Periodic-task-owning resource (throttling analyzer)
//! - `client`: Storage client collaborator and the simulated ABFS client
//! - `monitor`: Repeated open/probe/close cycles
//! - `harness`: Broken-vs-fixed comparison and verdict
//! - `report`: Cycle table, final summary, JSON summary
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod harness;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod report;
pub mod resource;
pub mod snapshot;

pub use error::{Error, Result};

/// Version of the leakprobe-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

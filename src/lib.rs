#![warn(missing_docs)]

//! # Task Dispatcher
//!
//! A master/worker executor for shell commands. The server holds a fixed list
//! of tasks and hands them out, one at a time, to whichever workers connect
//! over TCP; workers run each command and send back what it produced.
//!
//! ## Features
//! - **Asynchronous I/O**: Built on the [Tokio](https://tokio.rs) runtime, one task per worker connection.
//! - **Simple Protocol**: Length-prefixed binary frames, little-endian, with a one byte task kind tag.
//! - **Failure Tolerant**: A task whose worker disappears goes back to the pool for someone else.
//! - **Safe Persistence**: Results are written to their destination through a temporary file and a rename.
//!
//! ## Architecture
//! 1. [`protocol`]: Framing of sized and typed messages over any byte stream.
//! 2. [`task`]: A shell command, its result kind, and how it is sent, run and saved.
//! 3. [`manager`]: The shared task registry deciding who works on what, and when everything is done.
//! 4. [`network`]: The server's accept loop and per-connection handler.
//! 5. [`workers`]: The worker's receive/execute/reply loop.

use std::sync::atomic::AtomicU64;

/// Settings for the server and the worker.
#[allow(missing_docs)]
pub mod config;
/// Global constants used in the protocol
///
/// This module defines the task kind tags sent on the wire and the limits
/// such as [`MAX_PAYLOAD_SIZE`](constants::MAX_PAYLOAD_SIZE).
#[allow(missing_docs)]
pub mod constants;
/// Error types for every layer of the crate.
#[allow(missing_docs)]
pub mod error;
/// Reading task lists from files, stdin and JSON manifests.
#[allow(missing_docs)]
pub mod loader;
/// Task registry and progress accounting.
#[allow(missing_docs)]
pub mod manager;
/// Server side of the dispatch protocol.
///
/// This module binds the listener, accepts workers and runs one handler per
/// connection against the shared [`manager::TasksManager`].
pub mod network;
/// Progress bar rendering for the server.
#[allow(missing_docs)]
pub mod progress;
/// Module to centralize all of the protocol logic
///
/// This module defines the framing primitives every exchange is built on.
#[allow(missing_docs)]
pub mod protocol;
/// Ctrl-C and SIGTERM handling.
pub mod shutdown;
/// The unit of work and its result.
#[allow(missing_docs)]
pub mod task;
/// Module that runs tasks on the worker side
///
/// This module defines the loop a worker runs on its connection to the
/// server.
#[allow(missing_docs)]
pub mod workers;

pub use manager::{TaskOutcome, TaskStatus, TasksManager};
pub use network::{ShutdownReason, run_server, run_server_on};
pub use task::{Task, TaskKind, TaskResult};
pub use workers::run_worker;

/// Thread-safe metrics for monitoring the server's state.
///
/// This structure uses atomic integers to allow high-concurrency updates
/// without the overhead of locking. It is typically wrapped in an [`std::sync::Arc`]
/// and shared between the listener loop and the connection handlers.
pub struct ServerMetrics {
    /// The total number of tasks completed and persisted since the server started.
    pub processed_tasks: AtomicU64,
    /// Exchanges that ended without a usable result.
    pub failed_exchanges: AtomicU64,
    /// The number of workers currently connected.
    pub active_connections: AtomicU64,
}

impl ServerMetrics {
    /// Creates a new instance of [`ServerMetrics`] with all counters initialized to zero.
    #[inline]
    pub fn new() -> Self {
        Self {
            processed_tasks: AtomicU64::new(0),
            failed_exchanges: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

//! Durable background jobs.
//!
//! ## Components
//!
//! - `JobStore`: enqueue, claim, delete; SQLite-backed or in-memory
//! - `Registry`: maps job names to async handlers
//! - `Runner`: polls the store and runs claimed jobs with bounded concurrency
//! - `send_email`: the job enqueued by signup and login
//!
//! Delivery is at-least-once. A job row is deleted only after its handler
//! succeeds; otherwise it is retried after its lease (`timeout`) expires.

pub mod registry;
pub mod runner;
pub mod send_email;
pub mod sqlite;
pub mod store;

pub use registry::{HandlerError, JobContext, JobHandler, Registry};
pub use runner::{Runner, RunnerConfig, RunnerHandle, RunnerStats, RunnerStatsSnapshot};
pub use send_email::{SEND_EMAIL_TIMEOUT, UserLookup, register_send_email};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};

//! `courier-core`: domain foundation for the job queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the `Job` record and its claimable predicate, payload encoding, user-facing
//! value objects and the clock used to stamp jobs.

pub mod error;
pub mod id;
pub mod job;
pub mod payload;
pub mod time;
pub mod user;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, GroupId, JobId, UserId};
pub use job::{Job, JobState};
pub use payload::{EmailKind, JobPayload, PayloadError, PayloadMap, SendEmail};
pub use time::{Clock, ManualClock, SystemClock, to_time_delta, truncate_millis};
pub use user::{Email, Token, User};

//! Infrastructure layer: SQLite, the job queue and runner, auth and email.

pub mod auth;
pub mod db;
pub mod email;
pub mod jobs;

pub use auth::{AuthError, AuthStore};
pub use db::{Database, DatabaseConfig, DatabaseError};
pub use email::{EmailError, EmailSender, LogEmailSender};

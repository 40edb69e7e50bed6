//! Outbound email.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use courier_core::{Email, Token};

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email provider rejected the message: {0}")]
    Rejected(String),

    #[error("email provider unavailable: {0}")]
    Unavailable(String),
}

/// Sends the signup and login emails.
///
/// Implementations must be cancel-safe: the runner drops the future when the
/// job's timeout elapses.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_signup_email(&self, name: &str, email: &Email, token: &Token)
    -> Result<(), EmailError>;

    async fn send_login_email(&self, name: &str, email: &Email, token: &Token)
    -> Result<(), EmailError>;
}

/// Writes the login link to the log instead of sending mail.
#[derive(Debug, Clone)]
pub struct LogEmailSender {
    base_url: String,
}

impl LogEmailSender {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn login_link(&self, token: &Token) -> String {
        format!("{}/login?token={}", self.base_url, token)
    }
}

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_signup_email(
        &self,
        name: &str,
        email: &Email,
        token: &Token,
    ) -> Result<(), EmailError> {
        info!(to = %email, name, link = %self.login_link(token), "sending signup email");
        Ok(())
    }

    async fn send_login_email(
        &self,
        name: &str,
        email: &Email,
        token: &Token,
    ) -> Result<(), EmailError> {
        info!(to = %email, name, link = %self.login_link(token), "sending login email");
        Ok(())
    }
}

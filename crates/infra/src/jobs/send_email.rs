//! The `send-email` job.
//!
//! Enqueued by signup and login. The handler resolves the token to its user at
//! run time, so a user deleted in the meantime is skipped rather than retried.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, instrument};

use courier_core::{EmailKind, SendEmail, Token, User};

use super::registry::{HandlerError, JobContext, Registry};
use crate::email::EmailSender;

/// Lease and handler timeout for `send-email` jobs.
pub const SEND_EMAIL_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves a login token to its user.
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn user_from_token(&self, token: &Token) -> anyhow::Result<Option<User>>;
}

/// Register the `send-email` handler.
pub fn register_send_email(
    registry: &mut Registry,
    sender: Arc<dyn EmailSender>,
    users: Arc<dyn UserLookup>,
) {
    registry.register_payload(move |ctx: JobContext, job: SendEmail| {
        let sender = sender.clone();
        let users = users.clone();
        async move { send_email(&ctx, sender.as_ref(), users.as_ref(), job).await }
    });
}

#[instrument(skip_all, fields(job_id = %ctx.job_id(), kind = job.kind.as_str()))]
async fn send_email(
    ctx: &JobContext,
    sender: &dyn EmailSender,
    users: &dyn UserLookup,
    job: SendEmail,
) -> Result<(), HandlerError> {
    let user = users
        .user_from_token(&job.token)
        .await
        .context("error getting user from token")?;

    let Some(user) = user else {
        debug!("no user for token; nothing to send");
        return Ok(());
    };

    let sent = match job.kind {
        EmailKind::Signup => {
            sender
                .send_signup_email(&user.name, &user.email, &job.token)
                .await
        }
        EmailKind::Login => {
            sender
                .send_login_email(&user.name, &user.email, &job.token)
                .await
        }
    };
    sent.with_context(|| format!("error sending {} email", job.kind.as_str()))?;
    Ok(())
}

//! Signup and login backed by SQLite.
//!
//! Every operation that needs an email enqueues its `send-email` job in the
//! same transaction as the rows it writes, so a committed signup always has
//! its email job and a rolled-back signup never does.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, instrument};

use courier_core::{
    AccountId, Clock, DomainError, Email, GroupId, JobPayload, SendEmail, SystemClock, Token,
    User, UserId,
};

use crate::db::{Database, begin_write, timestamp_from_millis};
use crate::jobs::send_email::{SEND_EMAIL_TIMEOUT, UserLookup};
use crate::jobs::sqlite::SqliteJobStore;
use crate::jobs::store::JobStoreError;

/// How long a login token stays valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("email address is already registered")]
    EmailConflict,

    #[error("token has expired")]
    TokenExpired,

    #[error("token not found")]
    TokenNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("user is inactive")]
    UserInactive,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("error enqueueing email job: {0}")]
    Jobs(#[from] JobStoreError),
}

#[derive(Debug, Clone)]
pub struct AuthStore<C: Clock = SystemClock> {
    pool: SqlitePool,
    jobs: SqliteJobStore<C>,
    clock: C,
}

impl AuthStore<SystemClock> {
    pub fn new(db: &Database) -> Self {
        Self::with_clock(db, SystemClock)
    }
}

impl<C: Clock + Clone> AuthStore<C> {
    pub fn with_clock(db: &Database, clock: C) -> Self {
        Self {
            pool: db.pool().clone(),
            jobs: SqliteJobStore::with_clock(db, clock.clone()),
            clock,
        }
    }

    /// Create an account, its default group and its first user, and enqueue
    /// the signup email.
    #[instrument(skip(self, name), fields(email = %email), err)]
    pub async fn signup(&self, name: &str, email: &Email) -> Result<User, AuthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("name must not be empty").into());
        }

        let now = self.clock.now();
        let ms = now.timestamp_millis();
        let mut tx = begin_write(&self.pool).await?;

        let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = ?1")
            .bind(email.as_str())
            .fetch_one(&mut *tx)
            .await?;
        if taken > 0 {
            return Err(AuthError::EmailConflict);
        }

        let account_id = AccountId::new();
        sqlx::query("INSERT INTO accounts (id, name, created, updated) VALUES (?1, ?2, ?3, ?3)")
            .bind(account_id.to_string())
            .bind(name)
            .bind(ms)
            .execute(&mut *tx)
            .await?;

        let group_id = GroupId::new();
        sqlx::query(
            r#"
            INSERT INTO account_groups (id, account_id, name, created, updated)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(group_id.to_string())
        .bind(account_id.to_string())
        .bind(name)
        .bind(ms)
        .execute(&mut *tx)
        .await?;

        let user_id = UserId::new();
        sqlx::query(
            r#"
            INSERT INTO users (id, account_id, name, email, created, updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(user_id.to_string())
        .bind(account_id.to_string())
        .bind(name)
        .bind(email.as_str())
        .bind(ms)
        .execute(&mut *tx)
        .await
        .map_err(map_unique_email)?;

        sqlx::query("INSERT INTO group_membership (group_id, user_id, created) VALUES (?1, ?2, ?3)")
            .bind(group_id.to_string())
            .bind(user_id.to_string())
            .bind(ms)
            .execute(&mut *tx)
            .await?;

        let token = self.insert_token(&mut tx, &user_id, now).await?;
        let payload = SendEmail::signup(token).to_map();
        self.jobs
            .enqueue_in(&mut tx, SendEmail::NAME, &payload, SEND_EMAIL_TIMEOUT)
            .await?;

        tx.commit().await?;
        info!(user_id = %user_id, account_id = %account_id, "user signed up");

        Ok(User {
            id: user_id,
            account_id,
            name: name.to_string(),
            email: email.clone(),
            confirmed: false,
            active: true,
            created: now,
            updated: now,
        })
    }

    /// Redeem a login token: mark it used and confirm the user.
    ///
    /// Tokens stay redeemable until they expire.
    #[instrument(skip_all, err)]
    pub async fn login(&self, token: &Token) -> Result<UserId, AuthError> {
        let now = self.clock.now().timestamp_millis();
        let mut tx = begin_write(&self.pool).await?;

        let row = sqlx::query(
            r#"
            SELECT tokens.user_id, tokens.expires, users.active
            FROM tokens
            JOIN users ON users.id = tokens.user_id
            WHERE tokens.value = ?1
            "#,
        )
        .bind(token.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AuthError::TokenNotFound)?;

        let user_id: String = row.try_get("user_id")?;
        let expires: i64 = row.try_get("expires")?;
        let active: i64 = row.try_get("active")?;

        if expires <= now {
            return Err(AuthError::TokenExpired);
        }
        if active == 0 {
            return Err(AuthError::UserInactive);
        }

        sqlx::query("UPDATE tokens SET used = 1 WHERE value = ?1")
            .bind(token.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE users SET confirmed = 1, updated = ?2 WHERE id = ?1 AND confirmed = 0")
            .bind(&user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user_id.parse()?)
    }

    /// Issue a fresh login token for an active user and enqueue the login email.
    #[instrument(skip(self), fields(email = %email), err)]
    pub async fn login_with_email(&self, email: &Email) -> Result<(), AuthError> {
        let now = self.clock.now();
        let mut tx = begin_write(&self.pool).await?;

        let row = sqlx::query("SELECT id, active FROM users WHERE email = ?1")
            .bind(email.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let user_id: UserId = row.try_get::<String, _>("id")?.parse()?;
        let active: i64 = row.try_get("active")?;
        if active == 0 {
            return Err(AuthError::UserInactive);
        }

        let token = self.insert_token(&mut tx, &user_id, now).await?;
        let payload = SendEmail::login(token).to_map();
        self.jobs
            .enqueue_in(&mut tx, SendEmail::NAME, &payload, SEND_EMAIL_TIMEOUT)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// The user a token was issued to, whether or not the token has expired.
    pub async fn user_from_token(&self, token: &Token) -> Result<Option<User>, AuthError> {
        let row = sqlx::query(
            r#"
            SELECT users.id, users.account_id, users.name, users.email,
                   users.confirmed, users.active, users.created, users.updated
            FROM users
            JOIN tokens ON tokens.user_id = users.id
            WHERE tokens.value = ?1
            "#,
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn insert_token(
        &self,
        conn: &mut sqlx::SqliteConnection,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Token, AuthError> {
        let token = Token::generate();
        let ttl = chrono::Duration::from_std(TOKEN_TTL)
            .map_err(|e| DomainError::validation(e.to_string()))?;
        let expires = now + ttl;

        sqlx::query("INSERT INTO tokens (value, user_id, expires, created) VALUES (?1, ?2, ?3, ?4)")
            .bind(token.as_str())
            .bind(user_id.to_string())
            .bind(expires.timestamp_millis())
            .bind(now.timestamp_millis())
            .execute(&mut *conn)
            .await?;
        Ok(token)
    }
}

#[async_trait]
impl<C: Clock + Clone + 'static> UserLookup for AuthStore<C> {
    async fn user_from_token(&self, token: &Token) -> anyhow::Result<Option<User>> {
        Ok(AuthStore::user_from_token(self, token).await?)
    }
}

fn map_unique_email(e: sqlx::Error) -> AuthError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => AuthError::EmailConflict,
        _ => AuthError::Storage(e),
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, AuthError> {
    let corrupt = |reason: String| DomainError::validation(format!("corrupt user row: {reason}"));

    Ok(User {
        id: row.try_get::<String, _>("id")?.parse()?,
        account_id: row.try_get::<String, _>("account_id")?.parse()?,
        name: row.try_get("name")?,
        email: Email::parse(row.try_get::<String, _>("email")?)?,
        confirmed: row.try_get::<i64, _>("confirmed")? != 0,
        active: row.try_get::<i64, _>("active")? != 0,
        created: timestamp_from_millis("created", row.try_get("created")?).map_err(corrupt)?,
        updated: timestamp_from_millis("updated", row.try_get("updated")?).map_err(corrupt)?,
    })
}

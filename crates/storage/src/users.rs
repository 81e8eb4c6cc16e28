use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use shopfront_core::types::{User, Workspace};

use crate::workspaces::insert_owned_workspace;
use crate::{is_unique_violation, new_id, to_rfc3339};

/// Repository for user accounts.
#[derive(Clone)]
pub struct UserRepository {
    pub(crate) pool: SqlitePool,
}

/// Payload required to create a user.
pub struct NewUser<'a> {
    pub email: &'a str,
    pub name: &'a str,
    pub password_hash: &'a str,
    pub created_at: DateTime<Utc>,
}

/// User joined with the stored password hash, used only for login.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

impl UserRepository {
    /// Inserts a new user. The email is expected to be normalized already.
    pub async fn insert(&self, user: &NewUser<'_>) -> Result<User, UserError> {
        let mut tx = self.pool.begin().await?;
        let created = insert_user(&mut tx, user).await?;
        tx.commit().await?;
        Ok(created)
    }

    /// Inserts a user together with a workspace they own, atomically.
    pub async fn register(
        &self,
        user: &NewUser<'_>,
        workspace_name: &str,
    ) -> Result<(User, Workspace), UserError> {
        let mut tx = self.pool.begin().await?;
        let created = insert_user(&mut tx, user).await?;
        let workspace =
            insert_owned_workspace(&mut tx, workspace_name, &created.id, user.created_at).await?;
        tx.commit().await?;
        Ok((created, workspace))
    }

    pub async fn fetch(&self, user_id: &str) -> Result<Option<User>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, name, created_at FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, name, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Loads the user and password hash for a login attempt.
    pub async fn find_credentials(&self, email: &str) -> Result<Option<UserCredentials>, UserError> {
        let row = sqlx::query(
            "SELECT id, email, name, created_at, password_hash FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| UserCredentials {
            user: User {
                id: row.get("id"),
                email: row.get("email"),
                name: row.get("name"),
                created_at: row.get("created_at"),
            },
            password_hash: row.get("password_hash"),
        }))
    }
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("a user with this email already exists")]
    DuplicateEmail,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository managing hashed refresh tokens.
#[derive(Clone)]
pub struct RefreshTokenRepository {
    pub(crate) pool: SqlitePool,
}

/// Refresh token row. Only the SHA-256 digest of the token is ever stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct NewRefreshToken<'a> {
    pub user_id: &'a str,
    pub token_hash: &'a str,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRepository {
    pub async fn insert(&self, token: &NewRefreshToken<'_>) -> Result<String, RefreshTokenError> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(token.user_id)
        .bind(token.token_hash)
        .bind(to_rfc3339(token.expires_at))
        .bind(to_rfc3339(token.created_at))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, RefreshTokenError> {
        let row = sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT id, user_id, token_hash, expires_at, revoked_at, replaced_by, created_at \
               FROM refresh_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Revokes `current_id` and inserts its replacement in one transaction.
    ///
    /// Fails with [`RefreshTokenError::AlreadyRevoked`] when another request
    /// rotated the same token first.
    pub async fn rotate(
        &self,
        current_id: &str,
        replacement: &NewRefreshToken<'_>,
    ) -> Result<String, RefreshTokenError> {
        let mut tx = self.pool.begin().await?;
        let new_id = new_id();
        let revoked_at = to_rfc3339(replacement.created_at);

        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ?, replaced_by = ? \
             WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(&revoked_at)
        .bind(&new_id)
        .bind(current_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RefreshTokenError::AlreadyRevoked);
        }

        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&new_id)
        .bind(replacement.user_id)
        .bind(replacement.token_hash)
        .bind(to_rfc3339(replacement.expires_at))
        .bind(&revoked_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(new_id)
    }

    /// Revokes a single token. Returns `false` when nothing was revoked.
    pub async fn revoke(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RefreshTokenError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE token_hash = ? AND revoked_at IS NULL",
        )
        .bind(to_rfc3339(now))
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revokes every live token of a user, returning how many were revoked.
    pub async fn revoke_all_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RefreshTokenError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL",
        )
        .bind(to_rfc3339(now))
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes tokens that expired before `expired_before` or were revoked
    /// before `revoked_before`, at most `limit` rows.
    pub async fn delete_expired_batch(
        &self,
        expired_before: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM refresh_tokens WHERE id IN (\
                SELECT id FROM refresh_tokens \
                 WHERE expires_at < ? OR (revoked_at IS NOT NULL AND revoked_at < ?) \
                 LIMIT ?)",
        )
        .bind(to_rfc3339(expired_before))
        .bind(to_rfc3339(revoked_before))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_user(
    tx: &mut Transaction<'_, Sqlite>,
    user: &NewUser<'_>,
) -> Result<User, UserError> {
    let id = new_id();
    let created_at = to_rfc3339(user.created_at);
    sqlx::query(
        "INSERT INTO users (id, email, name, password_hash, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user.email)
    .bind(user.name)
    .bind(user.password_hash)
    .bind(&created_at)
    .bind(&created_at)
    .execute(&mut **tx)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            UserError::DuplicateEmail
        } else {
            UserError::Database(err)
        }
    })?;

    Ok(User {
        id,
        email: user.email.to_string(),
        name: user.name.to_string(),
        created_at: user.created_at,
    })
}

#[derive(Debug, Error)]
pub enum RefreshTokenError {
    #[error("refresh token was already revoked")]
    AlreadyRevoked,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

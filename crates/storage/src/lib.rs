mod carts;
mod domains;
mod legal;
mod orders;
mod products;
mod sellpages;
mod stores;
mod users;
mod workspaces;

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;

pub use carts::{CartError, CartRepository, CartSummary};
pub use domains::{DomainError, DomainRepository, DomainVerificationUpdate, NewDomain};
pub use legal::{LegalSetError, LegalSetRepository, NewLegalSet};
pub use orders::{CheckoutError, CheckoutRequest, OrderError, OrderRepository};
pub use products::{
    NewProduct, NewVariant, ProductDeletion, ProductError, ProductRepository, ProductUpdate,
    VariantUpdate,
};
pub use sellpages::{NewSellpage, SellpageError, SellpageRepository, SellpageUpdate};
pub use stores::{NewStore, StoreError, StoreRepository, StoreUpdate};
pub use users::{
    NewRefreshToken, NewUser, RefreshTokenError, RefreshTokenRecord, RefreshTokenRepository,
    UserCredentials, UserError, UserRepository,
};
pub use workspaces::{WorkspaceError, WorkspaceRepository};

const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for user accounts.
    pub fn users(&self) -> UserRepository {
        UserRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for refresh token rotation.
    pub fn refresh_tokens(&self) -> RefreshTokenRepository {
        RefreshTokenRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for workspaces and their memberships.
    pub fn workspaces(&self) -> WorkspaceRepository {
        WorkspaceRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn stores(&self) -> StoreRepository {
        StoreRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn products(&self) -> ProductRepository {
        ProductRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn sellpages(&self) -> SellpageRepository {
        SellpageRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn carts(&self) -> CartRepository {
        CartRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for orders, including the checkout transaction.
    pub fn orders(&self) -> OrderRepository {
        OrderRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn legal_sets(&self) -> LegalSetRepository {
        LegalSetRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn domains(&self) -> DomainRepository {
        DomainRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and returns its frame counts.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let (busy_frames, log_frames, checkpointed_frames): (i64, i64, i64) =
            sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE);")
                .fetch_one(&self.pool)
                .await?;
        Ok(CheckpointStats {
            busy_frames,
            log_frames,
            checkpointed_frames,
        })
    }
}

/// Result row of a WAL checkpoint. In-memory databases report `-1` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised when a persisted column cannot be mapped back into a domain value.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Enum(#[from] shopfront_core::types::UnknownVariant),
    #[error("invalid json column: {0}")]
    Json(#[from] serde_json::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn constraint_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        constraint_code(err).as_deref(),
        Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    constraint_code(err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY)
}


#[cfg(test)]
mod tests {
    use super::test_support::setup_db;

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 14, "expected core tables to be created");
    }

    #[tokio::test]
    async fn in_memory_databases_are_isolated() {
        let first = setup_db().await;
        let second = setup_db().await;

        sqlx::query(
            "INSERT INTO workspaces (id, name, created_at, updated_at) \
             VALUES ('ws-1', 'One', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .execute(first.pool())
        .await
        .expect("insert");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workspaces")
            .fetch_one(second.pool())
            .await
            .expect("count");
        assert_eq!(count.0, 0);
    }
}

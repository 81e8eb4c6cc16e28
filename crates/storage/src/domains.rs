use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use shopfront_core::types::{Domain, DomainStatus};

use crate::{is_unique_violation, new_id, to_rfc3339, DecodeError};

/// Repository for custom store domains.
#[derive(Clone)]
pub struct DomainRepository {
    pub(crate) pool: SqlitePool,
}

pub struct NewDomain<'a> {
    pub store_id: &'a str,
    pub hostname: &'a str,
    pub verification_token: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one DNS check.
pub struct DomainVerificationUpdate<'a> {
    pub status: DomainStatus,
    pub failure_reason: Option<&'a str>,
    pub checked_at: DateTime<Utc>,
}

const DOMAIN_COLUMNS: &str = "id, store_id, hostname, verification_token, status, failure_reason, \
    last_checked_at, verified_at, created_at";

#[derive(Debug, sqlx::FromRow)]
struct DomainRow {
    id: String,
    store_id: String,
    hostname: String,
    verification_token: String,
    status: String,
    failure_reason: Option<String>,
    last_checked_at: Option<DateTime<Utc>>,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl DomainRow {
    fn into_domain(self) -> Result<Domain, DecodeError> {
        Ok(Domain {
            status: self.status.parse()?,
            id: self.id,
            store_id: self.store_id,
            hostname: self.hostname,
            verification_token: self.verification_token,
            failure_reason: self.failure_reason,
            last_checked_at: self.last_checked_at,
            verified_at: self.verified_at,
            created_at: self.created_at,
        })
    }
}

impl DomainRepository {
    pub async fn create(&self, domain: &NewDomain<'_>) -> Result<Domain, DomainError> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO domains (id, store_id, hostname, verification_token, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(domain.store_id)
        .bind(domain.hostname)
        .bind(domain.verification_token)
        .bind(DomainStatus::Pending.as_str())
        .bind(to_rfc3339(domain.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                DomainError::DuplicateHostname
            } else {
                DomainError::Database(err)
            }
        })?;

        Ok(Domain {
            id,
            store_id: domain.store_id.to_string(),
            hostname: domain.hostname.to_string(),
            verification_token: domain.verification_token.to_string(),
            status: DomainStatus::Pending,
            failure_reason: None,
            last_checked_at: None,
            verified_at: None,
            created_at: domain.created_at,
        })
    }

    pub async fn list(&self, store_id: &str) -> Result<Vec<Domain>, DomainError> {
        let rows = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE store_id = ? ORDER BY created_at, hostname"
        ))
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(DomainError::from))
            .collect()
    }

    pub async fn fetch(&self, store_id: &str, domain_id: &str) -> Result<Domain, DomainError> {
        let row = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE store_id = ? AND id = ?"
        ))
        .bind(store_id)
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DomainError::NotFound)?;
        Ok(row.into_domain()?)
    }

    /// Deletes a domain and clears it as the store's primary domain.
    pub async fn delete(&self, store_id: &str, domain_id: &str) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM domains WHERE store_id = ? AND id = ?")
            .bind(store_id)
            .bind(domain_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound);
        }

        sqlx::query(
            "UPDATE stores SET primary_domain_id = NULL WHERE id = ? AND primary_domain_id = ?",
        )
        .bind(store_id)
        .bind(domain_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Stores the result of a DNS check. `verified_at` is stamped on the
    /// first successful check and kept afterwards.
    pub async fn record_verification(
        &self,
        domain_id: &str,
        update: &DomainVerificationUpdate<'_>,
    ) -> Result<(), DomainError> {
        let checked_at = to_rfc3339(update.checked_at);
        let result = sqlx::query(
            "UPDATE domains \
                SET status = ?, failure_reason = ?, last_checked_at = ?, \
                    verified_at = CASE WHEN ? = 'VERIFIED' THEN COALESCE(verified_at, ?) ELSE verified_at END \
              WHERE id = ?",
        )
        .bind(update.status.as_str())
        .bind(update.failure_reason)
        .bind(&checked_at)
        .bind(update.status.as_str())
        .bind(&checked_at)
        .bind(domain_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }

    /// Pending domains, least recently checked first.
    pub async fn list_pending_batch(&self, limit: i64) -> Result<Vec<Domain>, DomainError> {
        let rows = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE status = 'PENDING' \
              ORDER BY last_checked_at IS NOT NULL, last_checked_at, created_at \
              LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(DomainError::from))
            .collect()
    }

    /// Resolves a verified hostname to the slug of its store.
    pub async fn resolve_store_slug(&self, hostname: &str) -> Result<Option<String>, DomainError> {
        let slug: Option<(String,)> = sqlx::query_as(
            "SELECT s.slug FROM domains AS d JOIN stores AS s ON s.id = d.store_id \
              WHERE d.hostname = ? AND d.status = 'VERIFIED'",
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;
        Ok(slug.map(|(slug,)| slug))
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain not found")]
    NotFound,
    #[error("hostname is already registered")]
    DuplicateHostname,
    #[error("failed to decode domain row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::tests::seed_store;
    use crate::test_support::{seed_workspace, setup_db};

    fn new_domain<'a>(store_id: &'a str, hostname: &'a str) -> NewDomain<'a> {
        NewDomain {
            store_id,
            hostname,
            verification_token: "token-123",
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn hostnames_are_globally_unique() {
        let db = setup_db().await;
        let (_, workspace_id) = seed_workspace(&db).await;
        let first = seed_store(&db, &workspace_id, "first").await;
        let second = seed_store(&db, &workspace_id, "second").await;

        db.domains()
            .create(&new_domain(&first.id, "shop.example.com"))
            .await
            .expect("create");
        let err = db
            .domains()
            .create(&new_domain(&second.id, "shop.example.com"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, DomainError::DuplicateHostname));
    }

    #[tokio::test]
    async fn verification_resolves_hostname_and_delete_clears_primary() {
        let db = setup_db().await;
        let (_, workspace_id) = seed_workspace(&db).await;
        let store = seed_store(&db, &workspace_id, "acme").await;
        let repo = db.domains();
        let domain = repo
            .create(&new_domain(&store.id, "shop.example.com"))
            .await
            .expect("create");

        assert_eq!(
            repo.resolve_store_slug("shop.example.com")
                .await
                .expect("resolve"),
            None
        );

        let checked_at = Utc::now();
        repo.record_verification(
            &domain.id,
            &DomainVerificationUpdate {
                status: DomainStatus::Verified,
                failure_reason: None,
                checked_at,
            },
        )
        .await
        .expect("verify");
        let verified = repo.fetch(&store.id, &domain.id).await.expect("fetch");
        assert_eq!(verified.status, DomainStatus::Verified);
        assert!(verified.verified_at.is_some());
        assert_eq!(
            repo.resolve_store_slug("shop.example.com")
                .await
                .expect("resolve")
                .as_deref(),
            Some("acme")
        );

        db.stores()
            .set_primary_domain(&store.id, Some(&domain.id), Utc::now())
            .await
            .expect("primary");
        repo.delete(&store.id, &domain.id).await.expect("delete");
        let store = db
            .stores()
            .fetch(&workspace_id, &store.id)
            .await
            .expect("store");
        assert_eq!(store.primary_domain_id, None);
    }

    #[tokio::test]
    async fn pending_batch_prefers_unchecked_domains() {
        let db = setup_db().await;
        let (_, workspace_id) = seed_workspace(&db).await;
        let store = seed_store(&db, &workspace_id, "acme").await;
        let repo = db.domains();
        let checked = repo
            .create(&new_domain(&store.id, "a.example.com"))
            .await
            .expect("create");
        let unchecked = repo
            .create(&new_domain(&store.id, "b.example.com"))
            .await
            .expect("create");
        repo.record_verification(
            &checked.id,
            &DomainVerificationUpdate {
                status: DomainStatus::Pending,
                failure_reason: Some("TXT record not found"),
                checked_at: Utc::now(),
            },
        )
        .await
        .expect("record");

        let batch = repo.list_pending_batch(1).await.expect("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, unchecked.id);
    }
}

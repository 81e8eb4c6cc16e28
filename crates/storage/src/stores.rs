use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;

use shopfront_core::types::Store;

use crate::{is_foreign_key_violation, is_unique_violation, new_id, to_rfc3339, DecodeError};

/// Repository for stores.
#[derive(Clone)]
pub struct StoreRepository {
    pub(crate) pool: SqlitePool,
}

pub struct NewStore<'a> {
    pub workspace_id: &'a str,
    pub name: &'a str,
    pub slug: &'a str,
    pub currency: &'a str,
    pub theme: &'a Value,
    pub support_email: Option<&'a str>,
    pub shipping_flat_cents: i64,
    pub free_shipping_threshold_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Full set of editable store columns, already merged with the current values.
pub struct StoreUpdate<'a> {
    pub name: &'a str,
    pub slug: &'a str,
    pub currency: &'a str,
    pub theme: &'a Value,
    pub support_email: Option<&'a str>,
    pub shipping_flat_cents: i64,
    pub free_shipping_threshold_cents: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

const STORE_COLUMNS: &str = "id, workspace_id, name, slug, currency, theme_json, support_email, \
    shipping_flat_cents, free_shipping_threshold_cents, legal_set_id, primary_domain_id, \
    created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct StoreRow {
    id: String,
    workspace_id: String,
    name: String,
    slug: String,
    currency: String,
    theme_json: String,
    support_email: Option<String>,
    shipping_flat_cents: i64,
    free_shipping_threshold_cents: Option<i64>,
    legal_set_id: Option<String>,
    primary_domain_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StoreRow {
    fn into_domain(self) -> Result<Store, DecodeError> {
        Ok(Store {
            theme: serde_json::from_str(&self.theme_json)?,
            id: self.id,
            workspace_id: self.workspace_id,
            name: self.name,
            slug: self.slug,
            currency: self.currency,
            support_email: self.support_email,
            shipping_flat_cents: self.shipping_flat_cents,
            free_shipping_threshold_cents: self.free_shipping_threshold_cents,
            legal_set_id: self.legal_set_id,
            primary_domain_id: self.primary_domain_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl StoreRepository {
    pub async fn create(&self, store: &NewStore<'_>) -> Result<Store, StoreError> {
        let id = new_id();
        let timestamp = to_rfc3339(store.created_at);
        sqlx::query(
            "INSERT INTO stores \
             (id, workspace_id, name, slug, currency, theme_json, support_email, \
              shipping_flat_cents, free_shipping_threshold_cents, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(store.workspace_id)
        .bind(store.name)
        .bind(store.slug)
        .bind(store.currency)
        .bind(store.theme.to_string())
        .bind(store.support_email)
        .bind(store.shipping_flat_cents)
        .bind(store.free_shipping_threshold_cents)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        Ok(Store {
            id,
            workspace_id: store.workspace_id.to_string(),
            name: store.name.to_string(),
            slug: store.slug.to_string(),
            currency: store.currency.to_string(),
            theme: store.theme.clone(),
            support_email: store.support_email.map(str::to_string),
            shipping_flat_cents: store.shipping_flat_cents,
            free_shipping_threshold_cents: store.free_shipping_threshold_cents,
            legal_set_id: None,
            primary_domain_id: None,
            created_at: store.created_at,
            updated_at: store.created_at,
        })
    }

    pub async fn list(&self, workspace_id: &str) -> Result<Vec<Store>, StoreError> {
        let rows = sqlx::query_as::<_, StoreRow>(&format!(
            "SELECT {STORE_COLUMNS} FROM stores WHERE workspace_id = ? ORDER BY created_at, id"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(StoreError::from))
            .collect()
    }

    /// Fetches a store scoped to its workspace.
    pub async fn fetch(&self, workspace_id: &str, store_id: &str) -> Result<Store, StoreError> {
        let row = sqlx::query_as::<_, StoreRow>(&format!(
            "SELECT {STORE_COLUMNS} FROM stores WHERE workspace_id = ? AND id = ?"
        ))
        .bind(workspace_id)
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.into_domain()?)
    }

    /// Fetches a store by its public slug.
    pub async fn fetch_by_slug(&self, slug: &str) -> Result<Store, StoreError> {
        let row = sqlx::query_as::<_, StoreRow>(&format!(
            "SELECT {STORE_COLUMNS} FROM stores WHERE slug = ?"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.into_domain()?)
    }

    pub async fn update(
        &self,
        workspace_id: &str,
        store_id: &str,
        update: &StoreUpdate<'_>,
    ) -> Result<Store, StoreError> {
        let result = sqlx::query(
            "UPDATE stores SET name = ?, slug = ?, currency = ?, theme_json = ?, support_email = ?, \
                    shipping_flat_cents = ?, free_shipping_threshold_cents = ?, updated_at = ? \
              WHERE workspace_id = ? AND id = ?",
        )
        .bind(update.name)
        .bind(update.slug)
        .bind(update.currency)
        .bind(update.theme.to_string())
        .bind(update.support_email)
        .bind(update.shipping_flat_cents)
        .bind(update.free_shipping_threshold_cents)
        .bind(to_rfc3339(update.updated_at))
        .bind(workspace_id)
        .bind(store_id)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.fetch(workspace_id, store_id).await
    }

    /// Deletes a store together with its carts, sellpages and domains.
    ///
    /// Stores that already received orders cannot be deleted.
    pub async fn delete(&self, workspace_id: &str, store_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM stores WHERE workspace_id = ? AND id = ?")
            .bind(workspace_id)
            .bind(store_id)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    StoreError::HasOrders
                } else {
                    StoreError::Database(err)
                }
            })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn set_legal_set(
        &self,
        workspace_id: &str,
        store_id: &str,
        legal_set_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Store, StoreError> {
        let result = sqlx::query(
            "UPDATE stores SET legal_set_id = ?, updated_at = ? WHERE workspace_id = ? AND id = ?",
        )
        .bind(legal_set_id)
        .bind(to_rfc3339(now))
        .bind(workspace_id)
        .bind(store_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        self.fetch(workspace_id, store_id).await
    }

    pub async fn set_primary_domain(
        &self,
        store_id: &str,
        domain_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE stores SET primary_domain_id = ?, updated_at = ? WHERE id = ?")
                .bind(domain_id)
                .bind(to_rfc3339(now))
                .bind(store_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn map_write_error(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::DuplicateSlug
    } else {
        StoreError::Database(err)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store not found")]
    NotFound,
    #[error("store slug is already taken")]
    DuplicateSlug,
    #[error("store has orders and cannot be deleted")]
    HasOrders,
    #[error("failed to decode store row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::{seed_workspace, setup_db};
    use crate::Database;
    use serde_json::json;

    pub async fn seed_store(db: &Database, workspace_id: &str, slug: &str) -> Store {
        let theme = json!({ "primary": "#111111" });
        db.stores()
            .create(&NewStore {
                workspace_id,
                name: "Acme Store",
                slug,
                currency: "USD",
                theme: &theme,
                support_email: Some("help@acme.test"),
                shipping_flat_cents: 500,
                free_shipping_threshold_cents: Some(5_000),
                created_at: Utc::now(),
            })
            .await
            .expect("create store")
    }

    #[tokio::test]
    async fn create_fetch_and_update() {
        let db = setup_db().await;
        let (_, workspace_id) = seed_workspace(&db).await;
        let store = seed_store(&db, &workspace_id, "acme").await;

        let fetched = db.stores().fetch_by_slug("acme").await.expect("fetch");
        assert_eq!(fetched.id, store.id);
        assert_eq!(fetched.free_shipping_threshold_cents, Some(5_000));
        assert_eq!(fetched.theme["primary"], "#111111");

        let theme = json!({});
        let updated = db
            .stores()
            .update(
                &workspace_id,
                &store.id,
                &StoreUpdate {
                    name: "Renamed",
                    slug: "acme-2",
                    currency: "EUR",
                    theme: &theme,
                    support_email: None,
                    shipping_flat_cents: 0,
                    free_shipping_threshold_cents: None,
                    updated_at: Utc::now(),
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.slug, "acme-2");
        assert_eq!(updated.support_email, None);
    }

    #[tokio::test]
    async fn duplicate_slug_is_rejected() {
        let db = setup_db().await;
        let (_, workspace_id) = seed_workspace(&db).await;
        seed_store(&db, &workspace_id, "acme").await;

        let theme = json!({});
        let err = db
            .stores()
            .create(&NewStore {
                workspace_id: &workspace_id,
                name: "Other",
                slug: "acme",
                currency: "USD",
                theme: &theme,
                support_email: None,
                shipping_flat_cents: 0,
                free_shipping_threshold_cents: None,
                created_at: Utc::now(),
            })
            .await
            .expect_err("duplicate slug");
        assert!(matches!(err, StoreError::DuplicateSlug));
    }

    #[tokio::test]
    async fn fetch_is_scoped_to_workspace() {
        let db = setup_db().await;
        let (_, workspace_id) = seed_workspace(&db).await;
        let store = seed_store(&db, &workspace_id, "acme").await;

        let err = db
            .stores()
            .fetch("other-workspace", &store.id)
            .await
            .expect_err("scoped");
        assert!(matches!(err, StoreError::NotFound));

        db.stores()
            .delete(&workspace_id, &store.id)
            .await
            .expect("delete");
        assert!(matches!(
            db.stores().fetch_by_slug("acme").await,
            Err(StoreError::NotFound)
        ));
    }
}

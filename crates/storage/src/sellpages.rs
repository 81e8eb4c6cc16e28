use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use shopfront_core::types::{Section, Sellpage, SellpageStatus};

use crate::{is_unique_violation, new_id, to_rfc3339, DecodeError};

/// Repository for sellpages.
#[derive(Clone)]
pub struct SellpageRepository {
    pub(crate) pool: SqlitePool,
}

pub struct NewSellpage<'a> {
    pub store_id: &'a str,
    pub product_id: &'a str,
    pub slug: &'a str,
    pub title: &'a str,
    pub sections: &'a [Section],
    pub created_at: DateTime<Utc>,
}

pub struct SellpageUpdate<'a> {
    pub product_id: &'a str,
    pub slug: &'a str,
    pub title: &'a str,
    pub status: SellpageStatus,
    pub sections: &'a [Section],
    pub updated_at: DateTime<Utc>,
}

const SELLPAGE_COLUMNS: &str =
    "id, store_id, product_id, slug, title, status, sections_json, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SellpageRow {
    id: String,
    store_id: String,
    product_id: String,
    slug: String,
    title: String,
    status: String,
    sections_json: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SellpageRow {
    fn into_domain(self) -> Result<Sellpage, DecodeError> {
        Ok(Sellpage {
            status: self.status.parse()?,
            sections: serde_json::from_str(&self.sections_json)?,
            id: self.id,
            store_id: self.store_id,
            product_id: self.product_id,
            slug: self.slug,
            title: self.title,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl SellpageRepository {
    /// Creates a draft sellpage.
    pub async fn create(&self, page: &NewSellpage<'_>) -> Result<Sellpage, SellpageError> {
        let id = new_id();
        let timestamp = to_rfc3339(page.created_at);
        let sections_json = serde_json::to_string(page.sections).map_err(DecodeError::from)?;

        sqlx::query(
            "INSERT INTO sellpages \
             (id, store_id, product_id, slug, title, status, sections_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(page.store_id)
        .bind(page.product_id)
        .bind(page.slug)
        .bind(page.title)
        .bind(SellpageStatus::Draft.as_str())
        .bind(&sections_json)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        Ok(Sellpage {
            id,
            store_id: page.store_id.to_string(),
            product_id: page.product_id.to_string(),
            slug: page.slug.to_string(),
            title: page.title.to_string(),
            status: SellpageStatus::Draft,
            sections: page.sections.to_vec(),
            created_at: page.created_at,
            updated_at: page.created_at,
        })
    }

    pub async fn list(
        &self,
        store_id: &str,
        status: Option<SellpageStatus>,
    ) -> Result<Vec<Sellpage>, SellpageError> {
        let rows = sqlx::query_as::<_, SellpageRow>(&format!(
            "SELECT {SELLPAGE_COLUMNS} FROM sellpages \
              WHERE store_id = ? AND (? IS NULL OR status = ?) \
              ORDER BY created_at, id"
        ))
        .bind(store_id)
        .bind(status.map(SellpageStatus::as_str))
        .bind(status.map(SellpageStatus::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(SellpageError::from))
            .collect()
    }

    pub async fn fetch(&self, store_id: &str, sellpage_id: &str) -> Result<Sellpage, SellpageError> {
        let row = sqlx::query_as::<_, SellpageRow>(&format!(
            "SELECT {SELLPAGE_COLUMNS} FROM sellpages WHERE store_id = ? AND id = ?"
        ))
        .bind(store_id)
        .bind(sellpage_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SellpageError::NotFound)?;
        Ok(row.into_domain()?)
    }

    /// Fetches a published sellpage by slug for the public storefront.
    pub async fn fetch_published(
        &self,
        store_id: &str,
        slug: &str,
    ) -> Result<Sellpage, SellpageError> {
        let row = sqlx::query_as::<_, SellpageRow>(&format!(
            "SELECT {SELLPAGE_COLUMNS} FROM sellpages \
              WHERE store_id = ? AND slug = ? AND status = 'PUBLISHED'"
        ))
        .bind(store_id)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SellpageError::NotFound)?;
        Ok(row.into_domain()?)
    }

    pub async fn update(
        &self,
        store_id: &str,
        sellpage_id: &str,
        update: &SellpageUpdate<'_>,
    ) -> Result<Sellpage, SellpageError> {
        let sections_json = serde_json::to_string(update.sections).map_err(DecodeError::from)?;
        let result = sqlx::query(
            "UPDATE sellpages \
                SET product_id = ?, slug = ?, title = ?, status = ?, sections_json = ?, updated_at = ? \
              WHERE store_id = ? AND id = ?",
        )
        .bind(update.product_id)
        .bind(update.slug)
        .bind(update.title)
        .bind(update.status.as_str())
        .bind(&sections_json)
        .bind(to_rfc3339(update.updated_at))
        .bind(store_id)
        .bind(sellpage_id)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 0 {
            return Err(SellpageError::NotFound);
        }
        self.fetch(store_id, sellpage_id).await
    }

    pub async fn delete(&self, store_id: &str, sellpage_id: &str) -> Result<(), SellpageError> {
        let result = sqlx::query("DELETE FROM sellpages WHERE store_id = ? AND id = ?")
            .bind(store_id)
            .bind(sellpage_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SellpageError::NotFound);
        }
        Ok(())
    }
}

fn map_write_error(err: sqlx::Error) -> SellpageError {
    if is_unique_violation(&err) {
        SellpageError::DuplicateSlug
    } else {
        SellpageError::Database(err)
    }
}

#[derive(Debug, Error)]
pub enum SellpageError {
    #[error("sellpage not found")]
    NotFound,
    #[error("sellpage slug is already used in this store")]
    DuplicateSlug,
    #[error("failed to decode sellpage row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

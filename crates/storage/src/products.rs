use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use shopfront_core::types::{Product, ProductStatus, Variant};

use crate::{is_foreign_key_violation, is_unique_violation, new_id, to_rfc3339, DecodeError};

/// Repository for products and their variants.
#[derive(Clone)]
pub struct ProductRepository {
    pub(crate) pool: SqlitePool,
}

pub struct NewProduct<'a> {
    pub workspace_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub status: ProductStatus,
    pub variants: Vec<NewVariant<'a>>,
    pub created_at: DateTime<Utc>,
}

pub struct NewVariant<'a> {
    pub sku: &'a str,
    pub title: &'a str,
    pub price_cents: i64,
    pub compare_at_cents: Option<i64>,
    pub stock: i64,
    pub position: i64,
}

pub struct ProductUpdate<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub status: ProductStatus,
    pub updated_at: DateTime<Utc>,
}

pub struct VariantUpdate<'a> {
    pub sku: &'a str,
    pub title: &'a str,
    pub price_cents: i64,
    pub compare_at_cents: Option<i64>,
    pub stock: i64,
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

/// What happened to a product on deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductDeletion {
    Deleted,
    /// The product is referenced by past orders and was archived instead.
    Archived,
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    workspace_id: String,
    title: String,
    description: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProductRow {
    fn into_domain(self, variants: Vec<Variant>) -> Result<Product, DecodeError> {
        Ok(Product {
            status: self.status.parse()?,
            id: self.id,
            workspace_id: self.workspace_id,
            title: self.title,
            description: self.description,
            variants,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct VariantRow {
    pub id: String,
    pub product_id: String,
    pub sku: String,
    pub title: String,
    pub price_cents: i64,
    pub compare_at_cents: Option<i64>,
    pub stock: i64,
    pub position: i64,
}

impl From<VariantRow> for Variant {
    fn from(row: VariantRow) -> Self {
        Self {
            id: row.id,
            product_id: row.product_id,
            sku: row.sku,
            title: row.title,
            price_cents: row.price_cents,
            compare_at_cents: row.compare_at_cents,
            stock: row.stock,
            position: row.position,
        }
    }
}

const PRODUCT_COLUMNS: &str = "id, workspace_id, title, description, status, created_at, updated_at";
pub(crate) const VARIANT_COLUMNS: &str =
    "id, product_id, sku, title, price_cents, compare_at_cents, stock, position";

impl ProductRepository {
    /// Creates a product and all of its initial variants atomically.
    pub async fn create(&self, product: &NewProduct<'_>) -> Result<Product, ProductError> {
        let id = new_id();
        let timestamp = to_rfc3339(product.created_at);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO products (id, workspace_id, title, description, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(product.workspace_id)
        .bind(product.title)
        .bind(product.description)
        .bind(product.status.as_str())
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await?;

        let mut variants = Vec::with_capacity(product.variants.len());
        for variant in &product.variants {
            let created = insert_variant(
                &mut tx,
                product.workspace_id,
                &id,
                variant,
                product.created_at,
            )
            .await?;
            variants.push(created);
        }

        tx.commit().await?;

        Ok(Product {
            id,
            workspace_id: product.workspace_id.to_string(),
            title: product.title.to_string(),
            description: product.description.to_string(),
            status: product.status,
            variants,
            created_at: product.created_at,
            updated_at: product.created_at,
        })
    }

    /// Lists products of a workspace, newest first, optionally filtered by status.
    pub async fn list(
        &self,
        workspace_id: &str,
        status: Option<ProductStatus>,
    ) -> Result<Vec<Product>, ProductError> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
              WHERE workspace_id = ? AND (? IS NULL OR status = ?) \
              ORDER BY created_at DESC, id"
        ))
        .bind(workspace_id)
        .bind(status.map(ProductStatus::as_str))
        .bind(status.map(ProductStatus::as_str))
        .fetch_all(&self.pool)
        .await?;

        let variant_rows = sqlx::query_as::<_, VariantRow>(&format!(
            "SELECT {VARIANT_COLUMNS} FROM product_variants \
              WHERE workspace_id = ? ORDER BY position, sku"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<Variant>> = HashMap::new();
        for row in variant_rows {
            grouped
                .entry(row.product_id.clone())
                .or_default()
                .push(row.into());
        }

        rows.into_iter()
            .map(|row| {
                let variants = grouped.remove(&row.id).unwrap_or_default();
                row.into_domain(variants).map_err(ProductError::from)
            })
            .collect()
    }

    pub async fn fetch(&self, workspace_id: &str, product_id: &str) -> Result<Product, ProductError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE workspace_id = ? AND id = ?"
        ))
        .bind(workspace_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ProductError::NotFound)?;

        let variants = self.variants_of(product_id).await?;
        Ok(row.into_domain(variants)?)
    }

    async fn variants_of(&self, product_id: &str) -> Result<Vec<Variant>, ProductError> {
        let rows = sqlx::query_as::<_, VariantRow>(&format!(
            "SELECT {VARIANT_COLUMNS} FROM product_variants \
              WHERE product_id = ? ORDER BY position, sku"
        ))
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Variant::from).collect())
    }

    pub async fn update(
        &self,
        workspace_id: &str,
        product_id: &str,
        update: &ProductUpdate<'_>,
    ) -> Result<Product, ProductError> {
        let result = sqlx::query(
            "UPDATE products SET title = ?, description = ?, status = ?, updated_at = ? \
              WHERE workspace_id = ? AND id = ?",
        )
        .bind(update.title)
        .bind(update.description)
        .bind(update.status.as_str())
        .bind(to_rfc3339(update.updated_at))
        .bind(workspace_id)
        .bind(product_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProductError::NotFound);
        }
        self.fetch(workspace_id, product_id).await
    }

    /// Deletes a product, or archives it when past orders reference it.
    pub async fn delete(
        &self,
        workspace_id: &str,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProductDeletion, ProductError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM products WHERE workspace_id = ? AND id = ?")
                .bind(workspace_id)
                .bind(product_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(ProductError::NotFound);
        }

        let (ordered,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM order_items WHERE product_id = ?")
                .bind(product_id)
                .fetch_one(&mut *tx)
                .await?;

        let outcome = if ordered > 0 {
            sqlx::query("UPDATE products SET status = 'ARCHIVED', updated_at = ? WHERE id = ?")
                .bind(to_rfc3339(now))
                .bind(product_id)
                .execute(&mut *tx)
                .await?;
            ProductDeletion::Archived
        } else {
            sqlx::query("DELETE FROM products WHERE id = ?")
                .bind(product_id)
                .execute(&mut *tx)
                .await
                .map_err(|err| {
                    if is_foreign_key_violation(&err) {
                        ProductError::InUse
                    } else {
                        ProductError::Database(err)
                    }
                })?;
            ProductDeletion::Deleted
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn add_variant(
        &self,
        workspace_id: &str,
        product_id: &str,
        variant: &NewVariant<'_>,
        now: DateTime<Utc>,
    ) -> Result<Variant, ProductError> {
        let mut tx = self.pool.begin().await?;
        ensure_product(&mut tx, workspace_id, product_id).await?;
        let created = insert_variant(&mut tx, workspace_id, product_id, variant, now).await?;
        touch_product(&mut tx, product_id, now).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn update_variant(
        &self,
        workspace_id: &str,
        product_id: &str,
        variant_id: &str,
        update: &VariantUpdate<'_>,
    ) -> Result<Variant, ProductError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE product_variants \
                SET sku = ?, title = ?, price_cents = ?, compare_at_cents = ?, stock = ?, \
                    position = ?, updated_at = ? \
              WHERE workspace_id = ? AND product_id = ? AND id = ?",
        )
        .bind(update.sku)
        .bind(update.title)
        .bind(update.price_cents)
        .bind(update.compare_at_cents)
        .bind(update.stock)
        .bind(update.position)
        .bind(to_rfc3339(update.updated_at))
        .bind(workspace_id)
        .bind(product_id)
        .bind(variant_id)
        .execute(&mut *tx)
        .await
        .map_err(map_variant_error)?;

        if result.rows_affected() == 0 {
            return Err(ProductError::VariantNotFound);
        }
        touch_product(&mut tx, product_id, update.updated_at).await?;
        tx.commit().await?;

        Ok(Variant {
            id: variant_id.to_string(),
            product_id: product_id.to_string(),
            sku: update.sku.to_string(),
            title: update.title.to_string(),
            price_cents: update.price_cents,
            compare_at_cents: update.compare_at_cents,
            stock: update.stock,
            position: update.position,
        })
    }

    /// Deletes a variant; the last remaining variant of a product is kept.
    pub async fn delete_variant(
        &self,
        workspace_id: &str,
        product_id: &str,
        variant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ProductError> {
        let mut tx = self.pool.begin().await?;
        ensure_product(&mut tx, workspace_id, product_id).await?;

        let (remaining,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM product_variants WHERE product_id = ?")
                .bind(product_id)
                .fetch_one(&mut *tx)
                .await?;

        let result = sqlx::query("DELETE FROM product_variants WHERE product_id = ? AND id = ?")
            .bind(product_id)
            .bind(variant_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProductError::VariantNotFound);
        }
        if remaining <= 1 {
            return Err(ProductError::LastVariant);
        }

        touch_product(&mut tx, product_id, now).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn ensure_product(
    tx: &mut Transaction<'_, Sqlite>,
    workspace_id: &str,
    product_id: &str,
) -> Result<(), ProductError> {
    let exists: Option<(String,)> =
        sqlx::query_as("SELECT id FROM products WHERE workspace_id = ? AND id = ?")
            .bind(workspace_id)
            .bind(product_id)
            .fetch_optional(&mut **tx)
            .await?;
    exists.map(|_| ()).ok_or(ProductError::NotFound)
}

async fn touch_product(
    tx: &mut Transaction<'_, Sqlite>,
    product_id: &str,
    now: DateTime<Utc>,
) -> Result<(), ProductError> {
    sqlx::query("UPDATE products SET updated_at = ? WHERE id = ?")
        .bind(to_rfc3339(now))
        .bind(product_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_variant(
    tx: &mut Transaction<'_, Sqlite>,
    workspace_id: &str,
    product_id: &str,
    variant: &NewVariant<'_>,
    now: DateTime<Utc>,
) -> Result<Variant, ProductError> {
    let id = new_id();
    let timestamp = to_rfc3339(now);
    sqlx::query(
        "INSERT INTO product_variants \
         (id, product_id, workspace_id, sku, title, price_cents, compare_at_cents, stock, position, \
          created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(product_id)
    .bind(workspace_id)
    .bind(variant.sku)
    .bind(variant.title)
    .bind(variant.price_cents)
    .bind(variant.compare_at_cents)
    .bind(variant.stock)
    .bind(variant.position)
    .bind(&timestamp)
    .bind(&timestamp)
    .execute(&mut **tx)
    .await
    .map_err(map_variant_error)?;

    Ok(Variant {
        id,
        product_id: product_id.to_string(),
        sku: variant.sku.to_string(),
        title: variant.title.to_string(),
        price_cents: variant.price_cents,
        compare_at_cents: variant.compare_at_cents,
        stock: variant.stock,
        position: variant.position,
    })
}

fn map_variant_error(err: sqlx::Error) -> ProductError {
    if is_unique_violation(&err) {
        ProductError::DuplicateSku
    } else {
        ProductError::Database(err)
    }
}

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("product not found")]
    NotFound,
    #[error("variant not found")]
    VariantNotFound,
    #[error("sku is already used in this workspace")]
    DuplicateSku,
    #[error("a product must keep at least one variant")]
    LastVariant,
    #[error("product is referenced by a sellpage")]
    InUse,
    #[error("failed to decode product row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

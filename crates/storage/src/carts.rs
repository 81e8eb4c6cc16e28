use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use shopfront_core::types::{CartLine, CartStatus, ProductStatus, Variant};

use crate::products::{VariantRow, VARIANT_COLUMNS};
use crate::{new_id, to_rfc3339, DecodeError};

/// Repository for session carts.
#[derive(Clone)]
pub struct CartRepository {
    pub(crate) pool: SqlitePool,
}

/// Cart header without lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartSummary {
    pub id: String,
    pub store_id: String,
    pub status: CartStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct CartRow {
    id: String,
    store_id: String,
    status: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CartLineRow {
    pub variant_id: String,
    pub product_id: String,
    pub product_title: String,
    pub variant_title: String,
    pub sku: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub available_stock: i64,
    pub product_status: String,
}

impl CartLineRow {
    pub(crate) fn is_sellable(&self) -> bool {
        self.product_status == ProductStatus::Active.as_str()
    }
}

impl From<CartLineRow> for CartLine {
    fn from(row: CartLineRow) -> Self {
        Self {
            line_total_cents: row.unit_price_cents.saturating_mul(row.quantity),
            variant_id: row.variant_id,
            product_id: row.product_id,
            product_title: row.product_title,
            variant_title: row.variant_title,
            sku: row.sku,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
            available_stock: row.available_stock,
        }
    }
}

pub(crate) const CART_LINES_QUERY: &str = "SELECT ci.variant_id, v.product_id, p.title AS product_title, \
        v.title AS variant_title, v.sku, ci.quantity, v.price_cents AS unit_price_cents, \
        v.stock AS available_stock, p.status AS product_status \
   FROM cart_items AS ci \
   JOIN product_variants AS v ON v.id = ci.variant_id \
   JOIN products AS p ON p.id = v.product_id \
  WHERE ci.cart_id = ? \
  ORDER BY ci.added_at, v.sku";

impl CartRepository {
    pub async fn create(&self, store_id: &str, now: DateTime<Utc>) -> Result<CartSummary, CartError> {
        let id = new_id();
        let timestamp = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO carts (id, store_id, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(store_id)
        .bind(CartStatus::Open.as_str())
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?;

        Ok(CartSummary {
            id,
            store_id: store_id.to_string(),
            status: CartStatus::Open,
            updated_at: now,
        })
    }

    pub async fn fetch(&self, cart_id: &str) -> Result<Option<CartSummary>, CartError> {
        let row = sqlx::query_as::<_, CartRow>(
            "SELECT id, store_id, status, updated_at FROM carts WHERE id = ?",
        )
        .bind(cart_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(CartSummary {
                status: row.status.parse().map_err(DecodeError::from)?,
                id: row.id,
                store_id: row.store_id,
                updated_at: row.updated_at,
            })
        })
        .transpose()
    }

    /// Lines of a cart priced with the current variant values.
    pub async fn lines(&self, cart_id: &str) -> Result<Vec<CartLine>, CartError> {
        let rows = sqlx::query_as::<_, CartLineRow>(CART_LINES_QUERY)
            .bind(cart_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(CartLine::from).collect())
    }

    /// Looks up a variant of the workspace together with its product status.
    pub async fn sellable_variant(
        &self,
        workspace_id: &str,
        variant_id: &str,
    ) -> Result<Option<(Variant, ProductStatus)>, CartError> {
        let row = sqlx::query_as::<_, VariantRow>(&format!(
            "SELECT {VARIANT_COLUMNS} FROM product_variants WHERE workspace_id = ? AND id = ?"
        ))
        .bind(workspace_id)
        .bind(variant_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let (status,): (String,) = sqlx::query_as("SELECT status FROM products WHERE id = ?")
            .bind(&row.product_id)
            .fetch_one(&self.pool)
            .await?;
        let status: ProductStatus = status.parse().map_err(DecodeError::from)?;
        Ok(Some((row.into(), status)))
    }

    /// Adds `quantity` units of a variant, merging with an existing line.
    ///
    /// The resulting line quantity must stay within `max_quantity` and the
    /// variant's current stock. Returns the new line quantity.
    pub async fn add_item(
        &self,
        cart_id: &str,
        variant_id: &str,
        quantity: i64,
        max_quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, CartError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(i64,)> =
            sqlx::query_as("SELECT quantity FROM cart_items WHERE cart_id = ? AND variant_id = ?")
                .bind(cart_id)
                .bind(variant_id)
                .fetch_optional(&mut *tx)
                .await?;
        let next = current.map(|(q,)| q).unwrap_or(0) + quantity;
        if next > max_quantity {
            return Err(CartError::QuantityLimit { max: max_quantity });
        }
        ensure_stock(&mut tx, variant_id, next).await?;

        sqlx::query(
            "INSERT INTO cart_items (cart_id, variant_id, quantity, added_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(cart_id, variant_id) DO UPDATE SET quantity = excluded.quantity",
        )
        .bind(cart_id)
        .bind(variant_id)
        .bind(next)
        .bind(to_rfc3339(now))
        .execute(&mut *tx)
        .await?;

        touch(&mut tx, cart_id, now).await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Sets the quantity of an existing line; zero removes the line.
    pub async fn set_quantity(
        &self,
        cart_id: &str,
        variant_id: &str,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<(), CartError> {
        let mut tx = self.pool.begin().await?;
        let result = if quantity == 0 {
            sqlx::query("DELETE FROM cart_items WHERE cart_id = ? AND variant_id = ?")
                .bind(cart_id)
                .bind(variant_id)
                .execute(&mut *tx)
                .await?
        } else {
            ensure_stock(&mut tx, variant_id, quantity).await?;
            sqlx::query("UPDATE cart_items SET quantity = ? WHERE cart_id = ? AND variant_id = ?")
                .bind(quantity)
                .bind(cart_id)
                .bind(variant_id)
                .execute(&mut *tx)
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(CartError::LineNotFound);
        }
        touch(&mut tx, cart_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes open carts untouched since `threshold`, at most `limit` rows.
    pub async fn delete_abandoned_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM carts WHERE id IN (\
                SELECT id FROM carts WHERE status = 'OPEN' AND updated_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn ensure_stock(
    tx: &mut Transaction<'_, Sqlite>,
    variant_id: &str,
    quantity: i64,
) -> Result<(), CartError> {
    let (stock, status): (i64, String) = sqlx::query_as(
        "SELECT v.stock, p.status FROM product_variants AS v \
           JOIN products AS p ON p.id = v.product_id \
          WHERE v.id = ?",
    )
    .bind(variant_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(CartError::VariantNotFound)?;
    if status != ProductStatus::Active.as_str() {
        return Err(CartError::ProductUnavailable);
    }
    if stock < quantity {
        return Err(CartError::InsufficientStock { available: stock });
    }
    Ok(())
}

async fn touch(
    tx: &mut Transaction<'_, Sqlite>,
    cart_id: &str,
    now: DateTime<Utc>,
) -> Result<(), CartError> {
    sqlx::query("UPDATE carts SET updated_at = ? WHERE id = ?")
        .bind(to_rfc3339(now))
        .bind(cart_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum CartError {
    #[error("variant not found")]
    VariantNotFound,
    #[error("variant is not in the cart")]
    LineNotFound,
    #[error("product is not for sale")]
    ProductUnavailable,
    #[error("only {available} units are in stock")]
    InsufficientStock { available: i64 },
    #[error("at most {max} units per line are allowed")]
    QuantityLimit { max: i64 },
    #[error("failed to decode cart row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

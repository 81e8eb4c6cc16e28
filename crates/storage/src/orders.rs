use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use shopfront_core::pricing::{compute_totals, PricedLine, PricingError, ShippingRule};
use shopfront_core::types::{CartLine, CartStatus, Order, OrderItem, OrderStatus, ShippingAddress};

use crate::carts::{CartLineRow, CART_LINES_QUERY};
use crate::{new_id, to_rfc3339, DecodeError};

/// Repository for orders and the checkout transaction.
#[derive(Clone)]
pub struct OrderRepository {
    pub(crate) pool: SqlitePool,
}

/// Everything needed to turn an open cart into an order.
pub struct CheckoutRequest<'a> {
    pub store_id: &'a str,
    pub cart_id: &'a str,
    pub order_number: &'a str,
    pub email: &'a str,
    pub currency: &'a str,
    pub shipping_address: &'a ShippingAddress,
    pub note: Option<&'a str>,
    pub shipping: ShippingRule,
    pub now: DateTime<Utc>,
}

const ORDER_COLUMNS: &str = "id, order_number, store_id, email, status, currency, \
    shipping_address_json, note, subtotal_cents, shipping_cents, total_cents, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: String,
    order_number: String,
    store_id: String,
    email: String,
    status: String,
    currency: String,
    shipping_address_json: String,
    note: Option<String>,
    subtotal_cents: i64,
    shipping_cents: i64,
    total_cents: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_domain(self, items: Vec<OrderItem>) -> Result<Order, DecodeError> {
        Ok(Order {
            status: self.status.parse()?,
            shipping_address: serde_json::from_str(&self.shipping_address_json)?,
            id: self.id,
            order_number: self.order_number,
            store_id: self.store_id,
            email: self.email,
            currency: self.currency,
            note: self.note,
            items,
            subtotal_cents: self.subtotal_cents,
            shipping_cents: self.shipping_cents,
            total_cents: self.total_cents,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    order_id: String,
    variant_id: String,
    product_id: String,
    sku: String,
    title: String,
    quantity: i64,
    unit_price_cents: i64,
    line_total_cents: i64,
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        Self {
            variant_id: row.variant_id,
            product_id: row.product_id,
            sku: row.sku,
            title: row.title,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
            line_total_cents: row.line_total_cents,
        }
    }
}

const ORDER_ITEM_COLUMNS: &str = "order_id, variant_id, product_id, sku, title, quantity, \
    unit_price_cents, line_total_cents";

impl OrderRepository {
    /// Converts an open cart into a pending order.
    ///
    /// Stock is decremented with a guarded update per line; when any line
    /// cannot be covered the whole transaction is rolled back.
    pub async fn checkout(&self, request: &CheckoutRequest<'_>) -> Result<Order, CheckoutError> {
        let mut tx = self.pool.begin().await?;

        let cart: Option<(String,)> =
            sqlx::query_as("SELECT status FROM carts WHERE id = ? AND store_id = ?")
                .bind(request.cart_id)
                .bind(request.store_id)
                .fetch_optional(&mut *tx)
                .await?;
        match cart {
            Some((status,)) if status == CartStatus::Open.as_str() => {}
            _ => return Err(CheckoutError::CartEmpty),
        }

        let rows = sqlx::query_as::<_, CartLineRow>(CART_LINES_QUERY)
            .bind(request.cart_id)
            .fetch_all(&mut *tx)
            .await?;
        if rows.is_empty() {
            return Err(CheckoutError::CartEmpty);
        }
        if let Some(row) = rows.iter().find(|row| !row.is_sellable()) {
            return Err(CheckoutError::ProductUnavailable {
                sku: row.sku.clone(),
            });
        }
        let lines: Vec<CartLine> = rows.into_iter().map(CartLine::from).collect();

        let priced: Vec<PricedLine> = lines
            .iter()
            .map(|line| PricedLine {
                unit_price_cents: line.unit_price_cents,
                quantity: line.quantity,
            })
            .collect();
        let totals = compute_totals(&priced, request.shipping)?;

        for line in &lines {
            decrement_stock(&mut tx, line, request.now).await?;
        }

        let order_id = new_id();
        let timestamp = to_rfc3339(request.now);
        let address_json =
            serde_json::to_string(request.shipping_address).map_err(DecodeError::from)?;
        sqlx::query(
            "INSERT INTO orders \
             (id, order_number, store_id, cart_id, email, status, currency, shipping_address_json, \
              note, subtotal_cents, shipping_cents, total_cents, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&order_id)
        .bind(request.order_number)
        .bind(request.store_id)
        .bind(request.cart_id)
        .bind(request.email)
        .bind(OrderStatus::Pending.as_str())
        .bind(request.currency)
        .bind(&address_json)
        .bind(request.note)
        .bind(totals.subtotal_cents)
        .bind(totals.shipping_cents)
        .bind(totals.total_cents)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await?;

        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let item = OrderItem {
                title: format!("{} - {}", line.product_title, line.variant_title),
                line_total_cents: line.line_total_cents,
                variant_id: line.variant_id,
                product_id: line.product_id,
                sku: line.sku,
                quantity: line.quantity,
                unit_price_cents: line.unit_price_cents,
            };
            sqlx::query(
                "INSERT INTO order_items \
                 (order_id, variant_id, product_id, sku, title, quantity, unit_price_cents, line_total_cents) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&order_id)
            .bind(&item.variant_id)
            .bind(&item.product_id)
            .bind(&item.sku)
            .bind(&item.title)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.line_total_cents)
            .execute(&mut *tx)
            .await?;
            items.push(item);
        }

        sqlx::query("UPDATE carts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(CartStatus::Converted.as_str())
            .bind(&timestamp)
            .bind(request.cart_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Order {
            id: order_id,
            order_number: request.order_number.to_string(),
            store_id: request.store_id.to_string(),
            email: request.email.to_string(),
            status: OrderStatus::Pending,
            currency: request.currency.to_string(),
            shipping_address: request.shipping_address.clone(),
            note: request.note.map(str::to_string),
            items,
            subtotal_cents: totals.subtotal_cents,
            shipping_cents: totals.shipping_cents,
            total_cents: totals.total_cents,
            created_at: request.now,
            updated_at: request.now,
        })
    }

    /// Lists store orders newest first, optionally filtered by status.
    pub async fn list(
        &self,
        store_id: &str,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, OrderError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
              WHERE store_id = ? AND (? IS NULL OR status = ?) \
              ORDER BY created_at DESC, id"
        ))
        .bind(store_id)
        .bind(status.map(OrderStatus::as_str))
        .bind(status.map(OrderStatus::as_str))
        .fetch_all(&self.pool)
        .await?;

        let item_rows = sqlx::query_as::<_, OrderItemRow>(&format!(
            "SELECT {ORDER_ITEM_COLUMNS} FROM order_items \
              WHERE order_id IN (SELECT id FROM orders WHERE store_id = ?) \
              ORDER BY id"
        ))
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<OrderItem>> = HashMap::new();
        for row in item_rows {
            grouped
                .entry(row.order_id.clone())
                .or_default()
                .push(row.into());
        }

        rows.into_iter()
            .map(|row| {
                let items = grouped.remove(&row.id).unwrap_or_default();
                row.into_domain(items).map_err(OrderError::from)
            })
            .collect()
    }

    pub async fn fetch(&self, store_id: &str, order_id: &str) -> Result<Order, OrderError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE store_id = ? AND id = ?"
        ))
        .bind(store_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OrderError::NotFound)?;
        self.with_items(row).await
    }

    /// Public lookup by order number.
    pub async fn fetch_by_number(
        &self,
        store_id: &str,
        order_number: &str,
    ) -> Result<Order, OrderError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE store_id = ? AND order_number = ?"
        ))
        .bind(store_id)
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OrderError::NotFound)?;
        self.with_items(row).await
    }

    async fn with_items(&self, row: OrderRow) -> Result<Order, OrderError> {
        let items = sqlx::query_as::<_, OrderItemRow>(&format!(
            "SELECT {ORDER_ITEM_COLUMNS} FROM order_items WHERE order_id = ? ORDER BY id"
        ))
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(OrderItem::from)
        .collect();
        Ok(row.into_domain(items)?)
    }

    /// Moves an order to `next` when the lifecycle allows it.
    pub async fn update_status(
        &self,
        store_id: &str,
        order_id: &str,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderError> {
        let mut tx = self.pool.begin().await?;
        let (current,): (String,) =
            sqlx::query_as("SELECT status FROM orders WHERE store_id = ? AND id = ?")
                .bind(store_id)
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(OrderError::NotFound)?;
        let current: OrderStatus = current.parse().map_err(DecodeError::from)?;
        if !current.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let result = sqlx::query(
            "UPDATE orders SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(to_rfc3339(now))
        .bind(order_id)
        .bind(current.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrderError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        tx.commit().await?;

        self.fetch(store_id, order_id).await
    }
}

async fn decrement_stock(
    tx: &mut Transaction<'_, Sqlite>,
    line: &CartLine,
    now: DateTime<Utc>,
) -> Result<(), CheckoutError> {
    let result = sqlx::query(
        "UPDATE product_variants SET stock = stock - ?, updated_at = ? \
          WHERE id = ? AND stock >= ?",
    )
    .bind(line.quantity)
    .bind(to_rfc3339(now))
    .bind(&line.variant_id)
    .bind(line.quantity)
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(CheckoutError::InsufficientStock {
            sku: line.sku.clone(),
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("cart is empty")]
    CartEmpty,
    #[error("not enough stock for {sku}")]
    InsufficientStock { sku: String },
    #[error("{sku} is no longer for sale")]
    ProductUnavailable { sku: String },
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error("failed to encode order: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order not found")]
    NotFound,
    #[error("cannot move order from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("failed to decode order row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

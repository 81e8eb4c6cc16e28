use std::time::{Instant, SystemTime};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use tracing::{info, warn};
use ulid::Ulid;

use shopfront_core::types::{Order, ShippingAddress};
use shopfront_core::validation::{normalize_address, normalize_email, ValidationError};
use shopfront_storage::{CheckoutError, CheckoutRequest, OrderError};

use crate::problem::{ApiJson, ProblemResponse};
use crate::router::AppState;
use crate::storefront::{load_store, shipping_rule};

const ORDER_NUMBER_PREFIX: &str = "SF-";
const MAX_NOTE_LEN: usize = 1_000;

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    email: String,
    shipping_address: ShippingAddress,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmationQuery {
    #[serde(default)]
    email: Option<String>,
}

fn order_number(now: chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "{ORDER_NUMBER_PREFIX}{}",
        Ulid::from_datetime(SystemTime::from(now))
    )
}

fn checkout_result(err: &CheckoutError) -> &'static str {
    match err {
        CheckoutError::CartEmpty => "cart_empty",
        CheckoutError::InsufficientStock { .. } => "insufficient_stock",
        CheckoutError::ProductUnavailable { .. } => "product_unavailable",
        CheckoutError::Pricing(_) => "amount_out_of_range",
        CheckoutError::Decode(_) | CheckoutError::Database(_) => "error",
    }
}

/// Turns the cookie's cart into a PENDING order.
pub async fn checkout(
    State(state): State<AppState>,
    Path(store_slug): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<CheckoutBody>,
) -> Result<(StatusCode, Json<Order>), ProblemResponse> {
    let store = load_store(&state, &store_slug).await?;
    let email = normalize_email(&body.email)?;
    let address = normalize_address(&body.shipping_address)?;
    let note = body
        .note
        .as_deref()
        .map(str::trim)
        .filter(|note| !note.is_empty());
    if note.is_some_and(|note| note.chars().count() > MAX_NOTE_LEN) {
        return Err(ValidationError::new("note", "is too long").into());
    }

    let Some(cart_id) = state.cart_cookies().cart_id(&headers) else {
        counter!("checkout_total", "result" => "cart_empty").increment(1);
        return Err(ProblemResponse::conflict("cart_empty", "cart is empty"));
    };

    let now = state.now();
    let number = order_number(now);
    let started = Instant::now();
    let result = state
        .storage()
        .orders()
        .checkout(&CheckoutRequest {
            store_id: &store.id,
            cart_id: &cart_id,
            order_number: &number,
            email: &email,
            currency: &store.currency,
            shipping_address: &address,
            note,
            shipping: shipping_rule(&store),
            now,
        })
        .await;
    histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());

    match result {
        Ok(order) => {
            counter!("checkout_total", "result" => "ok").increment(1);
            info!(
                stage = "checkout",
                order_number = %order.order_number,
                store_id = %store.id,
                total_cents = order.total_cents,
                "order placed"
            );
            Ok((StatusCode::CREATED, Json(order)))
        }
        Err(err) => {
            counter!("checkout_total", "result" => checkout_result(&err)).increment(1);
            warn!(stage = "checkout", %cart_id, error = %err, "checkout rejected");
            Err(err.into())
        }
    }
}

/// Public order lookup. The email must match the one given at checkout.
pub async fn confirmation(
    State(state): State<AppState>,
    Path((store_slug, order_number)): Path<(String, String)>,
    Query(query): Query<ConfirmationQuery>,
) -> Result<Json<Order>, ProblemResponse> {
    let not_found = || ProblemResponse::not_found("order not found");
    let store = load_store(&state, &store_slug).await?;
    let email = query
        .email
        .as_deref()
        .and_then(|email| normalize_email(email).ok())
        .ok_or_else(not_found)?;

    let order = match state
        .storage()
        .orders()
        .fetch_by_number(&store.id, &order_number)
        .await
    {
        Ok(order) => order,
        Err(OrderError::NotFound) => return Err(not_found()),
        Err(err) => return Err(err.into()),
    };
    if order.email != email {
        return Err(not_found());
    }
    Ok(Json(order))
}

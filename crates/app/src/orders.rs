use axum::{
    extract::{Path, Query, State},
    Json,
};
use metrics::counter;
use serde::Deserialize;
use tracing::info;

use shopfront_core::types::{MemberRole, Order, OrderStatus};

use crate::auth::AuthUser;
use crate::problem::{ApiJson, ProblemResponse};
use crate::router::AppState;
use crate::stores::authorize_store;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    status: OrderStatus,
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Order>>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Member).await?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<OrderStatus>)
        .transpose()?;
    Ok(Json(state.storage().orders().list(&store_id, status).await?))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, order_id)): Path<(String, String, String)>,
) -> Result<Json<Order>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Member).await?;
    Ok(Json(
        state.storage().orders().fetch(&store_id, &order_id).await?,
    ))
}

/// Moves an order along PENDING -> PAID -> FULFILLED, or to CANCELLED.
///
/// Cancelling does not restock.
pub async fn update_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, order_id)): Path<(String, String, String)>,
    ApiJson(body): ApiJson<UpdateStatusRequest>,
) -> Result<Json<Order>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;
    let order = state
        .storage()
        .orders()
        .update_status(&store_id, &order_id, body.status, state.now())
        .await?;

    counter!("order_transitions_total", "status" => body.status.as_str()).increment(1);
    info!(
        stage = "orders",
        %order_id,
        order_number = %order.order_number,
        status = body.status.as_str(),
        "order status changed"
    );
    Ok(Json(order))
}

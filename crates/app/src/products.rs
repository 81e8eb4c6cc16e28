use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use shopfront_core::types::{MemberRole, Product, ProductStatus, Variant};
use shopfront_core::validation::{require_text, validate_price, ValidationError};
use shopfront_storage::{NewProduct, NewVariant, ProductDeletion, ProductUpdate, VariantUpdate};

use crate::auth::AuthUser;
use crate::problem::{ApiJson, ProblemResponse};
use crate::router::AppState;
use crate::stores::nullable;
use crate::workspaces::require_role;

const MAX_VARIANTS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VariantInput {
    sku: String,
    title: String,
    price_cents: i64,
    #[serde(default)]
    compare_at_cents: Option<i64>,
    #[serde(default)]
    stock: i64,
    #[serde(default)]
    position: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: Option<ProductStatus>,
    variants: Vec<VariantInput>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProductRequest {
    title: Option<String>,
    description: Option<String>,
    status: Option<ProductStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVariantRequest {
    sku: Option<String>,
    title: Option<String>,
    price_cents: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    compare_at_cents: Option<Option<i64>>,
    stock: Option<i64>,
    position: Option<i64>,
}

/// Validated variant fields shared by create and update.
struct CheckedVariant {
    sku: String,
    title: String,
    price_cents: i64,
    compare_at_cents: Option<i64>,
    stock: i64,
}

fn check_variant(
    sku: &str,
    title: &str,
    price_cents: i64,
    compare_at_cents: Option<i64>,
    stock: i64,
) -> Result<CheckedVariant, ValidationError> {
    let sku = require_text("sku", sku, 64)?;
    if sku.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("sku", "must not contain whitespace"));
    }
    let title = require_text("variant.title", title, 200)?;
    validate_price("price_cents", price_cents)?;
    if let Some(compare_at) = compare_at_cents {
        validate_price("compare_at_cents", compare_at)?;
    }
    if stock < 0 {
        return Err(ValidationError::new("stock", "must not be negative"));
    }
    Ok(CheckedVariant {
        sku,
        title,
        price_cents,
        compare_at_cents,
        stock,
    })
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
    ApiJson(body): ApiJson<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;

    let title = require_text("title", &body.title, 200)?;
    if body.variants.is_empty() {
        return Err(ValidationError::new("variants", "at least one variant is required").into());
    }
    if body.variants.len() > MAX_VARIANTS {
        return Err(ValidationError::new(
            "variants",
            format!("at most {MAX_VARIANTS} variants are allowed"),
        )
        .into());
    }

    let mut checked = Vec::with_capacity(body.variants.len());
    for (index, input) in body.variants.iter().enumerate() {
        let variant = check_variant(
            &input.sku,
            &input.title,
            input.price_cents,
            input.compare_at_cents,
            input.stock,
        )?;
        checked.push((variant, input.position.unwrap_or(index as i64)));
    }

    let product = state
        .storage()
        .products()
        .create(&NewProduct {
            workspace_id: &workspace_id,
            title: &title,
            description: body.description.trim(),
            status: body.status.unwrap_or(ProductStatus::Draft),
            variants: checked
                .iter()
                .map(|(variant, position)| NewVariant {
                    sku: &variant.sku,
                    title: &variant.title,
                    price_cents: variant.price_cents,
                    compare_at_cents: variant.compare_at_cents,
                    stock: variant.stock,
                    position: *position,
                })
                .collect(),
            created_at: state.now(),
        })
        .await?;
    info!(stage = "products", product_id = %product.id, variants = product.variants.len(), "product created");

    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Product>>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ProductStatus>)
        .transpose()?;
    Ok(Json(
        state.storage().products().list(&workspace_id, status).await?,
    ))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, product_id)): Path<(String, String)>,
) -> Result<Json<Product>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    Ok(Json(
        state
            .storage()
            .products()
            .fetch(&workspace_id, &product_id)
            .await?,
    ))
}

pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, product_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<UpdateProductRequest>,
) -> Result<Json<Product>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let repo = state.storage().products();
    let current = repo.fetch(&workspace_id, &product_id).await?;

    let title = match body.title {
        Some(title) => require_text("title", &title, 200)?,
        None => current.title,
    };
    let description = body
        .description
        .map(|description| description.trim().to_string())
        .unwrap_or(current.description);

    let product = repo
        .update(
            &workspace_id,
            &product_id,
            &ProductUpdate {
                title: &title,
                description: &description,
                status: body.status.unwrap_or(current.status),
                updated_at: state.now(),
            },
        )
        .await?;
    Ok(Json(product))
}

pub async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, product_id)): Path<(String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let outcome = state
        .storage()
        .products()
        .delete(&workspace_id, &product_id, state.now())
        .await?;

    match outcome {
        ProductDeletion::Deleted => {
            info!(stage = "products", %product_id, "product deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        ProductDeletion::Archived => {
            info!(stage = "products", %product_id, "product has orders; archived instead of deleted");
            Ok(StatusCode::ACCEPTED)
        }
    }
}

pub async fn add_variant(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, product_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<VariantInput>,
) -> Result<(StatusCode, Json<Variant>), ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let repo = state.storage().products();
    let current = repo.fetch(&workspace_id, &product_id).await?;
    if current.variants.len() >= MAX_VARIANTS {
        return Err(ValidationError::new(
            "variants",
            format!("at most {MAX_VARIANTS} variants are allowed"),
        )
        .into());
    }

    let variant = check_variant(
        &body.sku,
        &body.title,
        body.price_cents,
        body.compare_at_cents,
        body.stock,
    )?;
    let position = body.position.unwrap_or_else(|| {
        current
            .variants
            .iter()
            .map(|variant| variant.position + 1)
            .max()
            .unwrap_or(0)
    });

    let created = repo
        .add_variant(
            &workspace_id,
            &product_id,
            &NewVariant {
                sku: &variant.sku,
                title: &variant.title,
                price_cents: variant.price_cents,
                compare_at_cents: variant.compare_at_cents,
                stock: variant.stock,
                position,
            },
            state.now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_variant(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, product_id, variant_id)): Path<(String, String, String)>,
    ApiJson(body): ApiJson<UpdateVariantRequest>,
) -> Result<Json<Variant>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let repo = state.storage().products();
    let product = repo.fetch(&workspace_id, &product_id).await?;
    let current = product
        .variants
        .into_iter()
        .find(|variant| variant.id == variant_id)
        .ok_or_else(|| ProblemResponse::not_found("variant not found"))?;

    let variant = check_variant(
        body.sku.as_deref().unwrap_or(&current.sku),
        body.title.as_deref().unwrap_or(&current.title),
        body.price_cents.unwrap_or(current.price_cents),
        body.compare_at_cents.unwrap_or(current.compare_at_cents),
        body.stock.unwrap_or(current.stock),
    )?;

    let updated = repo
        .update_variant(
            &workspace_id,
            &product_id,
            &variant_id,
            &VariantUpdate {
                sku: &variant.sku,
                title: &variant.title,
                price_cents: variant.price_cents,
                compare_at_cents: variant.compare_at_cents,
                stock: variant.stock,
                position: body.position.unwrap_or(current.position),
                updated_at: state.now(),
            },
        )
        .await?;
    Ok(Json(updated))
}

pub async fn remove_variant(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, product_id, variant_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    state
        .storage()
        .products()
        .delete_variant(&workspace_id, &product_id, &variant_id, state.now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

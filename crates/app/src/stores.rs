use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::info;

use shopfront_core::types::{MemberRole, Store};
use shopfront_core::validation::{
    normalize_currency, normalize_email, require_text, validate_price, validate_slug,
    ValidationError,
};
use shopfront_storage::{NewStore, StoreUpdate};

use crate::auth::AuthUser;
use crate::problem::{ApiJson, ProblemResponse};
use crate::router::AppState;
use crate::workspaces::require_role;

const DEFAULT_CURRENCY: &str = "USD";
/// Path segments under `/storefront` that cannot be used as store slugs.
const RESERVED_SLUGS: &[&str] = &["by-host"];

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct CreateStoreRequest {
    name: String,
    slug: String,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    theme: Option<Value>,
    #[serde(default)]
    support_email: Option<String>,
    #[serde(default)]
    shipping_flat_cents: i64,
    #[serde(default)]
    free_shipping_threshold_cents: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateStoreRequest {
    name: Option<String>,
    slug: Option<String>,
    currency: Option<String>,
    theme: Option<Value>,
    #[serde(default, deserialize_with = "nullable")]
    support_email: Option<Option<String>>,
    shipping_flat_cents: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    free_shipping_threshold_cents: Option<Option<i64>>,
}

#[derive(Debug, Deserialize)]
pub struct AssignLegalSetRequest {
    legal_set_id: Option<String>,
}

/// Checks the caller's role and loads a store of the workspace.
pub(crate) async fn authorize_store(
    state: &AppState,
    user: &AuthUser,
    workspace_id: &str,
    store_id: &str,
    required: MemberRole,
) -> Result<Store, ProblemResponse> {
    require_role(state, user, workspace_id, required).await?;
    Ok(state.storage().stores().fetch(workspace_id, store_id).await?)
}

fn check_slug(slug: &str) -> Result<(), ValidationError> {
    validate_slug("slug", slug)?;
    if RESERVED_SLUGS.contains(&slug) {
        return Err(ValidationError::new("slug", "is reserved"));
    }
    Ok(())
}

fn check_theme(theme: Option<Value>) -> Result<Value, ValidationError> {
    match theme {
        None => Ok(Value::Object(Default::default())),
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(ValidationError::new("theme", "must be a JSON object")),
    }
}

fn check_support_email(email: Option<&str>) -> Result<Option<String>, ValidationError> {
    email
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .map(|email| {
            normalize_email(email).map_err(|err| ValidationError::new("support_email", err.message))
        })
        .transpose()
}

fn check_shipping(flat: i64, threshold: Option<i64>) -> Result<(), ValidationError> {
    validate_price("shipping_flat_cents", flat)?;
    if let Some(threshold) = threshold {
        validate_price("free_shipping_threshold_cents", threshold)?;
    }
    Ok(())
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
    ApiJson(body): ApiJson<CreateStoreRequest>,
) -> Result<(StatusCode, Json<Store>), ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;

    let name = require_text("name", &body.name, 100)?;
    let slug = body.slug.trim().to_string();
    check_slug(&slug)?;
    let currency = normalize_currency(body.currency.as_deref().unwrap_or(DEFAULT_CURRENCY))?;
    let theme = check_theme(body.theme)?;
    let support_email = check_support_email(body.support_email.as_deref())?;
    check_shipping(body.shipping_flat_cents, body.free_shipping_threshold_cents)?;

    let store = state
        .storage()
        .stores()
        .create(&NewStore {
            workspace_id: &workspace_id,
            name: &name,
            slug: &slug,
            currency: &currency,
            theme: &theme,
            support_email: support_email.as_deref(),
            shipping_flat_cents: body.shipping_flat_cents,
            free_shipping_threshold_cents: body.free_shipping_threshold_cents,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "stores", store_id = %store.id, slug = %store.slug, "store created");

    Ok((StatusCode::CREATED, Json(store)))
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<Store>>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    Ok(Json(state.storage().stores().list(&workspace_id).await?))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
) -> Result<Json<Store>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    Ok(Json(
        state.storage().stores().fetch(&workspace_id, &store_id).await?,
    ))
}

pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<UpdateStoreRequest>,
) -> Result<Json<Store>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let repo = state.storage().stores();
    let current = repo.fetch(&workspace_id, &store_id).await?;

    let name = match body.name {
        Some(name) => require_text("name", &name, 100)?,
        None => current.name,
    };
    let slug = match body.slug {
        Some(slug) => {
            let slug = slug.trim().to_string();
            check_slug(&slug)?;
            slug
        }
        None => current.slug,
    };
    let currency = match body.currency {
        Some(currency) => normalize_currency(&currency)?,
        None => current.currency,
    };
    let theme = match body.theme {
        Some(theme) => check_theme(Some(theme))?,
        None => current.theme,
    };
    let support_email = match body.support_email {
        Some(email) => check_support_email(email.as_deref())?,
        None => current.support_email,
    };
    let shipping_flat_cents = body
        .shipping_flat_cents
        .unwrap_or(current.shipping_flat_cents);
    let free_shipping_threshold_cents = body
        .free_shipping_threshold_cents
        .unwrap_or(current.free_shipping_threshold_cents);
    check_shipping(shipping_flat_cents, free_shipping_threshold_cents)?;

    let store = repo
        .update(
            &workspace_id,
            &store_id,
            &StoreUpdate {
                name: &name,
                slug: &slug,
                currency: &currency,
                theme: &theme,
                support_email: support_email.as_deref(),
                shipping_flat_cents,
                free_shipping_threshold_cents,
                updated_at: state.now(),
            },
        )
        .await?;
    Ok(Json(store))
}

pub async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    state
        .storage()
        .stores()
        .delete(&workspace_id, &store_id)
        .await?;
    info!(stage = "stores", %store_id, "store deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn assign_legal_set(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<AssignLegalSetRequest>,
) -> Result<Json<Store>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;

    if let Some(legal_set_id) = body.legal_set_id.as_deref() {
        // Only sets of the same workspace may be assigned.
        state
            .storage()
            .legal_sets()
            .fetch(&workspace_id, legal_set_id)
            .await?;
    }

    let store = state
        .storage()
        .stores()
        .set_legal_set(
            &workspace_id,
            &store_id,
            body.legal_set_id.as_deref(),
            state.now(),
        )
        .await?;
    Ok(Json(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use serde_json::json;

    use crate::router::app_router;
    use crate::test_support::{
        create_product, create_store, owner_with_workspace, place_order, register_user, send,
        test_state,
    };

    #[tokio::test]
    async fn create_normalizes_and_rejects_duplicate_slugs() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;

        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        assert_eq!(store["currency"], "USD");
        assert_eq!(store["theme"], json!({}));
        assert_eq!(store["free_shipping_threshold_cents"], 5000);

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/api/workspaces/{workspace_id}/stores"),
            Some(&owner.access_token),
            Some(json!({ "name": "Other", "slug": "acme" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "slug_taken");
    }

    #[tokio::test]
    async fn invalid_slugs_and_themes_are_rejected() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let uri = format!("/api/workspaces/{workspace_id}/stores");

        for body in [
            json!({ "name": "A", "slug": "-bad" }),
            json!({ "name": "A", "slug": "Bad_Slug" }),
            json!({ "name": "A", "slug": "by-host" }),
            json!({ "name": "A", "slug": "fine", "theme": [1, 2] }),
            json!({ "name": "A", "slug": "fine", "currency": "dollars" }),
            json!({ "name": "A", "slug": "fine", "shipping_flat_cents": -1 }),
        ] {
            let (status, response) =
                send(&app, Method::POST, &uri, Some(&owner.access_token), Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{response}");
            assert_eq!(response["type"], "validation_error");
        }
    }

    #[tokio::test]
    async fn patch_keeps_unset_fields_and_clears_nulls() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let uri = format!(
            "/api/workspaces/{workspace_id}/stores/{}",
            store["id"].as_str().expect("id")
        );

        let (status, body) = send(
            &app,
            Method::PATCH,
            &uri,
            Some(&owner.access_token),
            Some(json!({ "name": "Renamed", "free_shipping_threshold_cents": null })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Renamed");
        assert_eq!(body["slug"], "acme");
        assert_eq!(body["support_email"], "help@acme.test");
        assert!(body.get("free_shipping_threshold_cents").is_none());
    }

    #[tokio::test]
    async fn members_read_but_only_admins_write() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let member = register_user(&app, "member@example.com", "Member").await;
        send(
            &app,
            Method::POST,
            &format!("/api/workspaces/{workspace_id}/members"),
            Some(&owner.access_token),
            Some(json!({ "email": "member@example.com", "role": "MEMBER" })),
        )
        .await;
        create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let uri = format!("/api/workspaces/{workspace_id}/stores");

        let (status, body) = send(&app, Method::GET, &uri, Some(&member.access_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, _) = send(
            &app,
            Method::POST,
            &uri,
            Some(&member.access_token),
            Some(json!({ "name": "Mine", "slug": "mine" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn legal_sets_must_belong_to_the_workspace() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let store_uri = format!(
            "/api/workspaces/{workspace_id}/stores/{}",
            store["id"].as_str().expect("id")
        );

        let (_, other) = send(
            &app,
            Method::POST,
            "/api/workspaces",
            Some(&owner.access_token),
            Some(json!({ "name": "Other" })),
        )
        .await;
        let other_id = other["id"].as_str().expect("id");
        let (_, foreign_set) = send(
            &app,
            Method::POST,
            &format!("/api/workspaces/{other_id}/legal-sets"),
            Some(&owner.access_token),
            Some(json!({ "name": "Foreign" })),
        )
        .await;

        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("{store_uri}/legal-set"),
            Some(&owner.access_token),
            Some(json!({ "legal_set_id": foreign_set["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, own_set) = send(
            &app,
            Method::POST,
            &format!("/api/workspaces/{workspace_id}/legal-sets"),
            Some(&owner.access_token),
            Some(json!({ "name": "Default" })),
        )
        .await;
        let (status, body) = send(
            &app,
            Method::PUT,
            &format!("{store_uri}/legal-set"),
            Some(&owner.access_token),
            Some(json!({ "legal_set_id": own_set["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["legal_set_id"], own_set["id"]);

        let (status, body) = send(
            &app,
            Method::PUT,
            &format!("{store_uri}/legal-set"),
            Some(&owner.access_token),
            Some(json!({ "legal_set_id": null })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("legal_set_id").is_none());
    }

    #[tokio::test]
    async fn stores_with_orders_cannot_be_deleted() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let empty = create_store(&app, &owner.access_token, &workspace_id, "empty").await;
        let product = create_product(&app, &owner.access_token, &workspace_id, "TEE-M", 2000, 5).await;
        place_order(&app, "acme", &product, 1).await;

        let uri = format!(
            "/api/workspaces/{workspace_id}/stores/{}",
            store["id"].as_str().expect("id")
        );
        let (status, body) = send(&app, Method::DELETE, &uri, Some(&owner.access_token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "store_has_orders");
        let (status, _) = send(&app, Method::GET, &uri, Some(&owner.access_token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!(
                "/api/workspaces/{workspace_id}/stores/{}",
                empty["id"].as_str().expect("id")
            ),
            Some(&owner.access_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}

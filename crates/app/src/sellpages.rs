use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use shopfront_core::sections::validate_sections;
use shopfront_core::types::{MemberRole, ProductStatus, Section, Sellpage, SellpageStatus};
use shopfront_core::validation::{require_text, validate_slug};
use shopfront_storage::{NewSellpage, SellpageUpdate};

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
pub struct CreateSellpageRequest {
    product_id: String,
    slug: String,
    title: String,
    #[serde(default)]
    sections: Vec<Section>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSellpageRequest {
    product_id: Option<String>,
    slug: Option<String>,
    title: Option<String>,
    status: Option<SellpageStatus>,
    sections: Option<Vec<Section>>,
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<CreateSellpageRequest>,
) -> Result<(StatusCode, Json<Sellpage>), ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;

    let slug = body.slug.trim().to_string();
    validate_slug("slug", &slug)?;
    let title = require_text("title", &body.title, 200)?;
    validate_sections(&body.sections)?;
    state
        .storage()
        .products()
        .fetch(&workspace_id, &body.product_id)
        .await?;

    let page = state
        .storage()
        .sellpages()
        .create(&NewSellpage {
            store_id: &store_id,
            product_id: &body.product_id,
            slug: &slug,
            title: &title,
            sections: &body.sections,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "sellpages", sellpage_id = %page.id, %store_id, "sellpage created");

    Ok((StatusCode::CREATED, Json(page)))
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Sellpage>>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Member).await?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SellpageStatus>)
        .transpose()?;
    Ok(Json(
        state.storage().sellpages().list(&store_id, status).await?,
    ))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, sellpage_id)): Path<(String, String, String)>,
) -> Result<Json<Sellpage>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Member).await?;
    Ok(Json(
        state
            .storage()
            .sellpages()
            .fetch(&store_id, &sellpage_id)
            .await?,
    ))
}

pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, sellpage_id)): Path<(String, String, String)>,
    ApiJson(body): ApiJson<UpdateSellpageRequest>,
) -> Result<Json<Sellpage>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;
    let repo = state.storage().sellpages();
    let current = repo.fetch(&store_id, &sellpage_id).await?;

    let slug = match body.slug {
        Some(slug) => {
            let slug = slug.trim().to_string();
            validate_slug("slug", &slug)?;
            slug
        }
        None => current.slug,
    };
    let title = match body.title {
        Some(title) => require_text("title", &title, 200)?,
        None => current.title,
    };
    let sections = match body.sections {
        Some(sections) => {
            validate_sections(&sections)?;
            sections
        }
        None => current.sections,
    };
    let product_id = body.product_id.unwrap_or(current.product_id);
    let status = body.status.unwrap_or(current.status);

    let product = state
        .storage()
        .products()
        .fetch(&workspace_id, &product_id)
        .await?;
    if status == SellpageStatus::Published && product.status != ProductStatus::Active {
        return Err(ProblemResponse::conflict(
            "product_not_active",
            "only sellpages of ACTIVE products can be published",
        ));
    }

    let page = repo
        .update(
            &store_id,
            &sellpage_id,
            &SellpageUpdate {
                product_id: &product_id,
                slug: &slug,
                title: &title,
                status,
                sections: &sections,
                updated_at: state.now(),
            },
        )
        .await?;
    if page.status != current.status {
        info!(stage = "sellpages", %sellpage_id, status = page.status.as_str(), "sellpage status changed");
    }
    Ok(Json(page))
}

pub async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, sellpage_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;
    state
        .storage()
        .sellpages()
        .delete(&store_id, &sellpage_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use serde_json::{json, Value};

    use crate::router::app_router;
    use crate::test_support::{create_product, create_store, owner_with_workspace, send, test_state};

    async fn setup() -> (axum::Router, String, String, Value) {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let product = create_product(&app, &owner.access_token, &workspace_id, "TEE-M", 2500, 10).await;
        let uri = format!(
            "/api/workspaces/{workspace_id}/stores/{}/sellpages",
            store["id"].as_str().expect("id")
        );
        (app, owner.access_token, uri, product)
    }

    #[tokio::test]
    async fn sections_are_validated_and_kept_in_order() {
        let (app, token, uri, product) = setup().await;

        let (status, body) = send(
            &app,
            Method::POST,
            &uri,
            Some(&token),
            Some(json!({
                "product_id": product["id"],
                "slug": "summer",
                "title": "Summer Sale",
                "sections": [{ "kind": "hero", "config": "not an object" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let (status, page) = send(
            &app,
            Method::POST,
            &uri,
            Some(&token),
            Some(json!({
                "product_id": product["id"],
                "slug": "summer",
                "title": "Summer Sale",
                "sections": [
                    { "kind": "hero", "config": { "headline": "Hi" } },
                    { "kind": "faq", "config": { "items": [] } },
                    { "kind": "call_to_action" }
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(page["status"], "DRAFT");
        let kinds: Vec<&str> = page["sections"]
            .as_array()
            .expect("sections")
            .iter()
            .map(|section| section["kind"].as_str().expect("kind"))
            .collect();
        assert_eq!(kinds, ["hero", "faq", "call_to_action"]);

        let (status, body) = send(
            &app,
            Method::POST,
            &uri,
            Some(&token),
            Some(json!({ "product_id": product["id"], "slug": "summer", "title": "Again" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "slug_taken");
    }

    #[tokio::test]
    async fn publishing_requires_an_active_product() {
        let (app, token, uri, product) = setup().await;
        let (_, page) = send(
            &app,
            Method::POST,
            &uri,
            Some(&token),
            Some(json!({ "product_id": product["id"], "slug": "summer", "title": "Summer" })),
        )
        .await;
        let page_uri = format!("{uri}/{}", page["id"].as_str().expect("id"));
        let product_uri = format!(
            "/api/workspaces/{}/products/{}",
            product["workspace_id"].as_str().expect("ws"),
            product["id"].as_str().expect("id")
        );

        send(
            &app,
            Method::PATCH,
            &product_uri,
            Some(&token),
            Some(json!({ "status": "DRAFT" })),
        )
        .await;
        let (status, body) = send(
            &app,
            Method::PATCH,
            &page_uri,
            Some(&token),
            Some(json!({ "status": "PUBLISHED" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "product_not_active");

        send(
            &app,
            Method::PATCH,
            &product_uri,
            Some(&token),
            Some(json!({ "status": "ACTIVE" })),
        )
        .await;
        let (status, body) = send(
            &app,
            Method::PATCH,
            &page_uri,
            Some(&token),
            Some(json!({ "status": "PUBLISHED" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "PUBLISHED");

        let (_, published) = send(
            &app,
            Method::GET,
            &format!("{uri}?status=PUBLISHED"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(published.as_array().map(Vec::len), Some(1));

        let (status, _) = send(&app, Method::DELETE, &page_uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::GET, &page_uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

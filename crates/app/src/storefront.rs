use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use shopfront_core::legal::{default_variables, render};
use shopfront_core::pricing::ShippingRule;
use shopfront_core::types::{
    LegalDocumentKind, ProductStatus, Section, SellpageStatus, Store,
};
use shopfront_core::validation::{normalize_hostname, MAX_LINE_QUANTITY};
use shopfront_storage::StoreError;

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Loads a store by its public slug.
pub(crate) async fn load_store(state: &AppState, slug: &str) -> Result<Store, ProblemResponse> {
    match state.storage().stores().fetch_by_slug(slug).await {
        Ok(store) => Ok(store),
        Err(StoreError::NotFound) => Err(ProblemResponse::not_found("store not found")),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn shipping_rule(store: &Store) -> ShippingRule {
    ShippingRule {
        flat_cents: store.shipping_flat_cents,
        free_threshold_cents: store.free_shipping_threshold_cents,
    }
}

#[derive(Debug, Serialize)]
pub struct HostResolution {
    hostname: String,
    store_slug: String,
}

#[derive(Debug, Serialize)]
pub struct PageSummary {
    slug: String,
    title: String,
}

#[derive(Debug, Serialize)]
pub struct StoreProfile {
    name: String,
    slug: String,
    currency: String,
    theme: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    support_email: Option<String>,
    shipping_flat_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    free_shipping_threshold_cents: Option<i64>,
    legal_documents: Vec<LegalDocumentKind>,
    pages: Vec<PageSummary>,
}

#[derive(Debug, Serialize)]
pub struct PublicVariant {
    id: String,
    sku: String,
    title: String,
    price_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    compare_at_cents: Option<i64>,
    in_stock: bool,
    max_quantity: i64,
}

#[derive(Debug, Serialize)]
pub struct PublicProduct {
    id: String,
    title: String,
    description: String,
    available: bool,
    variants: Vec<PublicVariant>,
}

#[derive(Debug, Serialize)]
pub struct PublicPage {
    store_slug: String,
    currency: String,
    slug: String,
    title: String,
    sections: Vec<Section>,
    product: PublicProduct,
}

#[derive(Debug, Serialize)]
pub struct RenderedDocument {
    kind: LegalDocumentKind,
    title: String,
    body_html: String,
    updated_at: DateTime<Utc>,
}

pub async fn by_host(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<HostResolution>, ProblemResponse> {
    let hostname = normalize_hostname(&hostname)?;
    let store_slug = state
        .storage()
        .domains()
        .resolve_store_slug(&hostname)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("no verified domain matches this host"))?;
    Ok(Json(HostResolution {
        hostname,
        store_slug,
    }))
}

pub async fn profile(
    State(state): State<AppState>,
    Path(store_slug): Path<String>,
) -> Result<Json<StoreProfile>, ProblemResponse> {
    let store = load_store(&state, &store_slug).await?;
    let pages = state
        .storage()
        .sellpages()
        .list(&store.id, Some(SellpageStatus::Published))
        .await?
        .into_iter()
        .map(|page| PageSummary {
            slug: page.slug,
            title: page.title,
        })
        .collect();
    let legal_documents = if store.legal_set_id.is_some() {
        LegalDocumentKind::ALL.to_vec()
    } else {
        Vec::new()
    };

    Ok(Json(StoreProfile {
        name: store.name,
        slug: store.slug,
        currency: store.currency,
        theme: store.theme,
        support_email: store.support_email,
        shipping_flat_cents: store.shipping_flat_cents,
        free_shipping_threshold_cents: store.free_shipping_threshold_cents,
        legal_documents,
        pages,
    }))
}

pub async fn page(
    State(state): State<AppState>,
    Path((store_slug, page_slug)): Path<(String, String)>,
) -> Result<Json<PublicPage>, ProblemResponse> {
    let store = load_store(&state, &store_slug).await?;
    let page = state
        .storage()
        .sellpages()
        .fetch_published(&store.id, &page_slug)
        .await?;
    let product = state
        .storage()
        .products()
        .fetch(&store.workspace_id, &page.product_id)
        .await?;

    let available = product.status == ProductStatus::Active;
    let variants = product
        .variants
        .into_iter()
        .map(|variant| PublicVariant {
            in_stock: available && variant.stock > 0,
            max_quantity: if available {
                variant.stock.clamp(0, MAX_LINE_QUANTITY)
            } else {
                0
            },
            id: variant.id,
            sku: variant.sku,
            title: variant.title,
            price_cents: variant.price_cents,
            compare_at_cents: variant.compare_at_cents,
        })
        .collect();

    Ok(Json(PublicPage {
        store_slug: store.slug,
        currency: store.currency,
        slug: page.slug,
        title: page.title,
        sections: page.sections,
        product: PublicProduct {
            id: product.id,
            title: product.title,
            description: product.description,
            available,
            variants,
        },
    }))
}

/// Renders one policy of the store's legal set.
///
/// Placeholder values come from the built-in defaults, then the store
/// itself, then the set's own variables.
pub async fn legal_document(
    State(state): State<AppState>,
    Path((store_slug, kind)): Path<(String, String)>,
) -> Result<Json<RenderedDocument>, ProblemResponse> {
    let kind: LegalDocumentKind = kind
        .parse()
        .map_err(|_| ProblemResponse::not_found("unknown legal document"))?;
    let store = load_store(&state, &store_slug).await?;
    let legal_set_id = store
        .legal_set_id
        .as_deref()
        .ok_or_else(|| ProblemResponse::not_found("store has no legal documents"))?;
    let set = state
        .storage()
        .legal_sets()
        .fetch(&store.workspace_id, legal_set_id)
        .await?;
    let document = set
        .documents
        .iter()
        .find(|document| document.kind == kind)
        .ok_or_else(|| ProblemResponse::not_found("legal document not found"))?;

    let variables = document_variables(&state, &store, &set.variables).await?;
    Ok(Json(RenderedDocument {
        kind,
        title: render(&document.title, &variables),
        body_html: render(&document.body_html, &variables),
        updated_at: document.updated_at,
    }))
}

async fn document_variables(
    state: &AppState,
    store: &Store,
    overrides: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ProblemResponse> {
    let host = match store.primary_domain_id.as_deref() {
        Some(domain_id) => state
            .storage()
            .domains()
            .fetch(&store.id, domain_id)
            .await?
            .hostname,
        None => format!("{}.shopfront.app", store.slug),
    };

    let mut variables = default_variables();
    variables.insert("store_name".to_string(), store.name.clone());
    variables.insert("company_name".to_string(), store.name.clone());
    if let Some(email) = &store.support_email {
        variables.insert("support_email".to_string(), email.clone());
    }
    variables.insert("store_url".to_string(), format!("https://{host}"));
    variables.extend(
        overrides
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    Ok(variables)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::router::app_router;
    use crate::test_support::{create_product, create_store, owner_with_workspace, send, test_state};

    #[tokio::test]
    async fn profile_lists_only_published_pages() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;
        let product = create_product(&app, &owner.access_token, &workspace_id, "TEE-M", 2500, 3).await;
        let pages_uri = format!(
            "/api/workspaces/{workspace_id}/stores/{}/sellpages",
            store["id"].as_str().expect("id")
        );
        for (slug, status) in [("live", "PUBLISHED"), ("draft", "DRAFT")] {
            let (_, page) = send(
                &app,
                Method::POST,
                &pages_uri,
                Some(&owner.access_token),
                Some(json!({
                    "product_id": product["id"],
                    "slug": slug,
                    "title": slug,
                    "sections": [{ "kind": "hero", "config": { "headline": "Hello" } }]
                })),
            )
            .await;
            send(
                &app,
                Method::PATCH,
                &format!("{pages_uri}/{}", page["id"].as_str().expect("id")),
                Some(&owner.access_token),
                Some(json!({ "status": status })),
            )
            .await;
        }

        let (status, profile) = send(&app, Method::GET, "/storefront/acme", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["currency"], "USD");
        assert_eq!(profile["pages"], json!([{ "slug": "live", "title": "live" }]));
        assert_eq!(profile["legal_documents"], json!([]));

        let (status, page) = send(&app, Method::GET, "/storefront/acme/pages/live", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["sections"][0]["kind"], "hero");
        assert_eq!(page["product"]["available"], true);
        assert_eq!(page["product"]["variants"][0]["price_cents"], 2500);
        assert_eq!(page["product"]["variants"][0]["max_quantity"], 3);
        assert!(page["product"]["variants"][0].get("stock").is_none());

        let (status, _) = send(&app, Method::GET, "/storefront/acme/pages/draft", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::GET, "/storefront/nope", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn legal_documents_render_store_and_set_variables() {
        let app = app_router(test_state().await);
        let (owner, workspace_id) = owner_with_workspace(&app).await;
        let store = create_store(&app, &owner.access_token, &workspace_id, "acme").await;

        let (status, _) = send(&app, Method::GET, "/storefront/acme/legal/refund", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, set) = send(
            &app,
            Method::POST,
            &format!("/api/workspaces/{workspace_id}/legal-sets"),
            Some(&owner.access_token),
            Some(json!({
                "name": "Default",
                "variables": { "refund_window_days": "14", "company_name": "Acme <Holdings>" }
            })),
        )
        .await;
        send(
            &app,
            Method::PUT,
            &format!(
                "/api/workspaces/{workspace_id}/stores/{}/legal-set",
                store["id"].as_str().expect("id")
            ),
            Some(&owner.access_token),
            Some(json!({ "legal_set_id": set["id"] })),
        )
        .await;

        let (status, refund) = send(&app, Method::GET, "/storefront/acme/legal/refund", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let body = refund["body_html"].as_str().expect("body");
        assert!(body.contains("Acme Goods"));
        assert!(body.contains("within 14 days"));
        assert!(body.contains("help@acme.test"));

        let (_, privacy) = send(&app, Method::GET, "/storefront/acme/legal/privacy", None, None).await;
        let body = privacy["body_html"].as_str().expect("body");
        assert!(body.contains("Acme &lt;Holdings&gt;"));
        assert!(body.contains("https://acme.shopfront.app"));

        let (status, _) = send(&app, Method::GET, "/storefront/acme/legal/cookies", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_hosts_are_not_found() {
        let app = app_router(test_state().await);
        let (status, _) = send(&app, Method::GET, "/storefront/by-host/shop.example.com", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

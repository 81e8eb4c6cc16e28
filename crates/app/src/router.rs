use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use shopfront_dns::DomainCheck;
use shopfront_storage::Database;
use shopfront_util::AppConfig;

use crate::auth::{self, PasswordHasher, TokenService};
use crate::cart::{self, CartCookies};
use crate::{
    checkout, domains, legal, orders, products, sellpages, storefront, stores, telemetry,
    workspaces,
};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    clock: Clock,
    tokens: TokenService,
    passwords: PasswordHasher,
    cart_cookies: CartCookies,
    domain_check: DomainCheck,
    refresh_token_ttl: Duration,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        config: &AppConfig,
        domain_check: DomainCheck,
    ) -> Self {
        Self {
            metrics,
            storage,
            clock: Arc::new(Utc::now),
            tokens: TokenService::new(&config.jwt_secret, config.access_token_ttl),
            passwords: PasswordHasher::new(),
            cart_cookies: CartCookies::new(
                &config.cart_cookie_secret,
                config.cart_ttl,
                config.environment.is_production(),
            ),
            domain_check,
            refresh_token_ttl: config.refresh_token_ttl,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn with_password_hasher(mut self, passwords: PasswordHasher) -> Self {
        self.passwords = passwords;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn passwords(&self) -> &PasswordHasher {
        &self.passwords
    }

    pub fn cart_cookies(&self) -> &CartCookies {
        &self.cart_cookies
    }

    pub fn domain_check(&self) -> &DomainCheck {
        &self.domain_check
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }
}

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route(
            "/workspaces",
            get(workspaces::list).post(workspaces::create),
        )
        .route(
            "/workspaces/:workspace_id",
            get(workspaces::show).patch(workspaces::rename),
        )
        .route(
            "/workspaces/:workspace_id/members",
            get(workspaces::list_members).post(workspaces::add_member),
        )
        .route(
            "/workspaces/:workspace_id/members/:user_id",
            delete(workspaces::remove_member),
        )
        .route(
            "/workspaces/:workspace_id/stores",
            get(stores::list).post(stores::create),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id",
            get(stores::show).patch(stores::update).delete(stores::remove),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/legal-set",
            put(stores::assign_legal_set),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/sellpages",
            get(sellpages::list).post(sellpages::create),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/sellpages/:sellpage_id",
            get(sellpages::show)
                .patch(sellpages::update)
                .delete(sellpages::remove),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/orders",
            get(orders::list),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/orders/:order_id",
            get(orders::show).patch(orders::update_status),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/domains",
            get(domains::list).post(domains::create),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/domains/:domain_id",
            get(domains::show).delete(domains::remove),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/domains/:domain_id/verify",
            post(domains::verify),
        )
        .route(
            "/workspaces/:workspace_id/stores/:store_id/domains/:domain_id/primary",
            post(domains::make_primary),
        )
        .route(
            "/workspaces/:workspace_id/products",
            get(products::list).post(products::create),
        )
        .route(
            "/workspaces/:workspace_id/products/:product_id",
            get(products::show)
                .patch(products::update)
                .delete(products::remove),
        )
        .route(
            "/workspaces/:workspace_id/products/:product_id/variants",
            post(products::add_variant),
        )
        .route(
            "/workspaces/:workspace_id/products/:product_id/variants/:variant_id",
            patch(products::update_variant).delete(products::remove_variant),
        )
        .route(
            "/workspaces/:workspace_id/legal-sets",
            get(legal::list).post(legal::create),
        )
        .route(
            "/workspaces/:workspace_id/legal-sets/:legal_set_id",
            get(legal::show).patch(legal::update).delete(legal::remove),
        )
        .route(
            "/workspaces/:workspace_id/legal-sets/:legal_set_id/documents/:kind",
            put(legal::put_document),
        )
        .route(
            "/workspaces/:workspace_id/legal-sets/:legal_set_id/documents/:kind/reset",
            post(legal::reset_document),
        );

    let storefront = Router::new()
        .route("/by-host/:hostname", get(storefront::by_host))
        .route("/:store_slug", get(storefront::profile))
        .route("/:store_slug/pages/:page_slug", get(storefront::page))
        .route("/:store_slug/legal/:kind", get(storefront::legal_document))
        .route("/:store_slug/cart", get(cart::show))
        .route("/:store_slug/cart/items", post(cart::add_item))
        .route(
            "/:store_slug/cart/items/:variant_id",
            patch(cart::update_item).delete(cart::remove_item),
        )
        .route("/:store_slug/checkout", post(checkout::checkout))
        .route("/:store_slug/orders/:order_number", get(checkout::confirmation));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .nest("/storefront", storefront)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

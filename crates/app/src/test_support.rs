use std::{net::Ipv4Addr, time::Duration};

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use shopfront_dns::{DohClient, DomainCheck};
use shopfront_storage::Database;
use shopfront_util::{AppConfig, Environment};
use tower::ServiceExt;
use url::Url;

use crate::auth::PasswordHasher;
use crate::router::AppState;
use crate::telemetry;

pub fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        environment: Environment::Test,
        database_url: "sqlite::memory:".to_string(),
        jwt_secret: b"test-jwt-secret".to_vec(),
        cart_cookie_secret: b"test-cart-secret".to_vec(),
        access_token_ttl: Duration::from_secs(900),
        refresh_token_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        cart_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        doh_endpoint: "http://127.0.0.1:9/dns-query".to_string(),
        edge_ips: Vec::new(),
    }
}

pub async fn test_database() -> Database {
    let database = Database::connect("sqlite::memory:")
        .await
        .expect("connect");
    database.run_migrations().await.expect("migrations");
    database
}

pub async fn test_state() -> AppState {
    let config = test_config();
    test_state_with_doh(&config.doh_endpoint, Vec::new()).await
}

pub async fn test_state_with_doh(endpoint: &str, edge_ips: Vec<Ipv4Addr>) -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let client = DohClient::new(
        Url::parse(endpoint).expect("doh url"),
        reqwest::Client::builder().build().expect("http client"),
    );
    AppState::new(
        metrics,
        test_database().await,
        &test_config(),
        DomainCheck::new(client, edge_ips),
    )
    .with_password_hasher(PasswordHasher::insecure_fast())
}

pub fn request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

/// Sends a request and returns the status, headers and JSON body (`Null` when empty).
pub async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("handler should respond");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should read")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, headers, body)
}

pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _, body) = send_request(app, request(method, uri, token, body)).await;
    (status, body)
}

pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
}

pub async fn register_user(app: &Router, email: &str, name: &str) -> Session {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/auth/register",
        None,
        Some(json!({ "email": email, "password": "password123", "name": name })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {body}");
    Session {
        user_id: body["user"]["id"].as_str().expect("user id").to_string(),
        access_token: body["access_token"].as_str().expect("access").to_string(),
        refresh_token: body["refresh_token"].as_str().expect("refresh").to_string(),
    }
}

/// Registers an owner and returns the session with the id of their personal workspace.
pub async fn owner_with_workspace(app: &Router) -> (Session, String) {
    let session = register_user(app, "owner@example.com", "Owner").await;
    let (_, body) = send(app, Method::GET, "/api/workspaces", Some(&session.access_token), None).await;
    let workspace_id = body[0]["id"].as_str().expect("workspace id").to_string();
    (session, workspace_id)
}

pub async fn create_store(app: &Router, token: &str, workspace_id: &str, slug: &str) -> Value {
    let (status, body) = send(
        app,
        Method::POST,
        &format!("/api/workspaces/{workspace_id}/stores"),
        Some(token),
        Some(json!({
            "name": "Acme Goods",
            "slug": slug,
            "currency": "usd",
            "support_email": "help@acme.test",
            "shipping_flat_cents": 500,
            "free_shipping_threshold_cents": 5000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create store failed: {body}");
    body
}

pub async fn create_product(
    app: &Router,
    token: &str,
    workspace_id: &str,
    sku: &str,
    price_cents: i64,
    stock: i64,
) -> Value {
    let (status, body) = send(
        app,
        Method::POST,
        &format!("/api/workspaces/{workspace_id}/products"),
        Some(token),
        Some(json!({
            "title": "T-Shirt",
            "description": "Soft cotton",
            "status": "ACTIVE",
            "variants": [
                { "sku": sku, "title": "Medium", "price_cents": price_cents, "stock": stock }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create product failed: {body}");
    body
}

/// Returns the `name=value` pair of the cart cookie set by a response.
pub fn cart_cookie(headers: &HeaderMap) -> String {
    let set_cookie = headers
        .get(header::SET_COOKIE)
        .expect("set-cookie header")
        .to_str()
        .expect("ascii cookie");
    set_cookie
        .split(';')
        .next()
        .expect("cookie pair")
        .trim()
        .to_string()
}

pub fn storefront_request(
    method: Method,
    uri: &str,
    cookie: &str,
    body: Option<Value>,
) -> Request<Body> {
    let mut request = request(method, uri, None, body);
    request.headers_mut().insert(
        header::COOKIE,
        cookie.parse().expect("cookie header"),
    );
    request
}

/// Adds `quantity` units of the product's first variant to a fresh cart and checks out.
pub async fn place_order(app: &Router, store_slug: &str, product: &Value, quantity: i64) -> Value {
    let (status, headers, body) = send_request(
        app,
        request(
            Method::POST,
            &format!("/storefront/{store_slug}/cart/items"),
            None,
            Some(json!({ "variant_id": product["variants"][0]["id"], "quantity": quantity })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "add to cart failed: {body}");
    let cookie = cart_cookie(&headers);

    let (status, _, order) = send_request(
        app,
        storefront_request(
            Method::POST,
            &format!("/storefront/{store_slug}/checkout"),
            &cookie,
            Some(checkout_body("buyer@example.com")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "checkout failed: {order}");
    order
}

pub fn checkout_body(email: &str) -> Value {
    json!({
        "email": email,
        "shipping_address": {
            "name": "Pat Buyer",
            "line1": "1 Main St",
            "city": "Springfield",
            "postal_code": "12345",
            "country": "us"
        }
    })
}

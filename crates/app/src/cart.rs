use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue,
    },
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use shopfront_core::pricing::{compute_totals, PricedLine, Totals};
use shopfront_core::types::{Cart, CartStatus, ProductStatus, Store};
use shopfront_core::validation::{validate_quantity, MAX_LINE_QUANTITY};
use shopfront_storage::CartSummary;

use crate::problem::{internal_error, ApiJson, ProblemResponse};
use crate::router::AppState;
use crate::storefront::{load_store, shipping_rule};

pub const CART_COOKIE: &str = "shopfront_cart";

/// Signs and verifies the `shopfront_cart` cookie (`<cart_id>.<hex hmac>`).
#[derive(Clone)]
pub struct CartCookies {
    secret: Vec<u8>,
    max_age: Duration,
    secure: bool,
}

impl CartCookies {
    pub fn new(secret: &[u8], max_age: Duration, secure: bool) -> Self {
        Self {
            secret: secret.to_vec(),
            max_age,
            secure,
        }
    }

    fn mac(&self, cart_id: &str) -> Option<Hmac<Sha256>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).ok()?;
        mac.update(cart_id.as_bytes());
        Some(mac)
    }

    pub fn sign(&self, cart_id: &str) -> Result<String, ProblemResponse> {
        let mac = self
            .mac(cart_id)
            .ok_or_else(|| internal_error("failed to initialize cart signer"))?;
        Ok(format!(
            "{cart_id}.{}",
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    /// Returns the cart id of a correctly signed value.
    pub fn verify<'a>(&self, value: &'a str) -> Option<&'a str> {
        let (cart_id, signature) = value.rsplit_once('.')?;
        if cart_id.is_empty() {
            return None;
        }
        let provided = hex::decode(signature).ok()?;
        let expected = self.mac(cart_id)?.finalize().into_bytes();
        let expected: &[u8] = expected.as_ref();
        if expected.ct_eq(provided.as_slice()).into() {
            Some(cart_id)
        } else {
            None
        }
    }

    /// Extracts a verified cart id from the request's `Cookie` headers.
    pub fn cart_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(name, _)| *name == CART_COOKIE)
            .find_map(|(_, value)| self.verify(value).map(str::to_string))
    }

    /// `Set-Cookie` value scoping the cart to one store's storefront path.
    pub fn set_cookie(&self, store_slug: &str, cart_id: &str) -> Result<HeaderValue, ProblemResponse> {
        let mut cookie = format!(
            "{CART_COOKIE}={}; Path=/storefront/{store_slug}; Max-Age={}; HttpOnly; SameSite=Lax",
            self.sign(cart_id)?,
            self.max_age.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).map_err(|_| internal_error("failed to encode cart cookie"))
    }
}

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    variant_id: String,
    #[serde(default = "default_quantity")]
    quantity: i64,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    quantity: i64,
}

/// The open cart of this store referenced by the cookie, if any.
///
/// Carts of another store, converted carts and unknown ids are ignored.
async fn current_cart(
    state: &AppState,
    store: &Store,
    headers: &HeaderMap,
) -> Result<Option<CartSummary>, ProblemResponse> {
    let Some(cart_id) = state.cart_cookies().cart_id(headers) else {
        return Ok(None);
    };
    let cart = state.storage().carts().fetch(&cart_id).await?;
    Ok(cart.filter(|cart| cart.store_id == store.id && cart.status == CartStatus::Open))
}

/// Prices a cart from the current variant prices.
pub(crate) async fn cart_view(
    state: &AppState,
    store: &Store,
    summary: Option<&CartSummary>,
) -> Result<Cart, ProblemResponse> {
    let lines = match summary {
        Some(summary) => state.storage().carts().lines(&summary.id).await?,
        None => Vec::new(),
    };
    let priced: Vec<PricedLine> = lines
        .iter()
        .map(|line| PricedLine {
            unit_price_cents: line.unit_price_cents,
            quantity: line.quantity,
        })
        .collect();
    let totals: Totals = compute_totals(&priced, shipping_rule(store))
        .map_err(|err| ProblemResponse::bad_request("amount_out_of_range", err.to_string()))?;

    Ok(Cart {
        id: summary.map(|summary| summary.id.clone()),
        store_id: store.id.clone(),
        status: summary.map_or(CartStatus::Open, |summary| summary.status),
        currency: store.currency.clone(),
        lines,
        totals,
        updated_at: summary.map(|summary| summary.updated_at),
    })
}

pub async fn show(
    State(state): State<AppState>,
    Path(store_slug): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Cart>, ProblemResponse> {
    let store = load_store(&state, &store_slug).await?;
    let cart = current_cart(&state, &store, &headers).await?;
    Ok(Json(cart_view(&state, &store, cart.as_ref()).await?))
}

pub async fn add_item(
    State(state): State<AppState>,
    Path(store_slug): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<AddItemRequest>,
) -> Result<Response, ProblemResponse> {
    let store = load_store(&state, &store_slug).await?;
    validate_quantity(body.quantity)?;

    let carts = state.storage().carts();
    match carts
        .sellable_variant(&store.workspace_id, &body.variant_id)
        .await?
    {
        Some((_, ProductStatus::Active)) => {}
        Some(_) => {
            return Err(ProblemResponse::conflict(
                "product_unavailable",
                "this product is not for sale",
            ))
        }
        None => return Err(ProblemResponse::not_found("variant not found")),
    }

    let (cart, created) = match current_cart(&state, &store, &headers).await? {
        Some(cart) => (cart, false),
        None => {
            let cart = carts.create(&store.id, state.now()).await?;
            debug!(stage = "cart", cart_id = %cart.id, store_id = %store.id, "cart started");
            (cart, true)
        }
    };

    let quantity = carts
        .add_item(
            &cart.id,
            &body.variant_id,
            body.quantity,
            MAX_LINE_QUANTITY,
            state.now(),
        )
        .await?;
    counter!("cart_mutations_total", "action" => "add").increment(1);
    info!(stage = "cart", cart_id = %cart.id, variant_id = %body.variant_id, quantity, "cart item added");

    let refreshed = carts.fetch(&cart.id).await?;
    let view = cart_view(&state, &store, refreshed.as_ref().or(Some(&cart))).await?;
    let mut response = Json(view).into_response();
    if created {
        let cookie = state.cart_cookies().set_cookie(&store.slug, &cart.id)?;
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    Ok(response)
}

pub async fn update_item(
    State(state): State<AppState>,
    Path((store_slug, variant_id)): Path<(String, String)>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<UpdateItemRequest>,
) -> Result<Json<Cart>, ProblemResponse> {
    let store = load_store(&state, &store_slug).await?;
    if body.quantity != 0 {
        validate_quantity(body.quantity)?;
    }
    let cart = current_cart(&state, &store, &headers)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("variant is not in the cart"))?;

    let carts = state.storage().carts();
    carts
        .set_quantity(&cart.id, &variant_id, body.quantity, state.now())
        .await?;
    let action = if body.quantity == 0 { "remove" } else { "update" };
    counter!("cart_mutations_total", "action" => action).increment(1);

    let refreshed = carts.fetch(&cart.id).await?;
    Ok(Json(
        cart_view(&state, &store, refreshed.as_ref().or(Some(&cart))).await?,
    ))
}

pub async fn remove_item(
    State(state): State<AppState>,
    Path((store_slug, variant_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Cart>, ProblemResponse> {
    let store = load_store(&state, &store_slug).await?;
    let cart = current_cart(&state, &store, &headers)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("variant is not in the cart"))?;

    let carts = state.storage().carts();
    carts
        .set_quantity(&cart.id, &variant_id, 0, state.now())
        .await?;
    counter!("cart_mutations_total", "action" => "remove").increment(1);

    let refreshed = carts.fetch(&cart.id).await?;
    Ok(Json(
        cart_view(&state, &store, refreshed.as_ref().or(Some(&cart))).await?,
    ))
}

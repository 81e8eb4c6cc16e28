use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use shopfront_core::types::UnknownVariant;
use shopfront_core::validation::ValidationError;
use shopfront_storage::{
    CartError, CheckoutError, DomainError, LegalSetError, OrderError, ProductError,
    RefreshTokenError, SellpageError, StoreError, UserError, WorkspaceError,
};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }

    pub fn conflict(problem_type: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, problem_type, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    pub fn unauthorized(problem_type: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, problem_type, detail)
    }

    pub fn bad_request(problem_type: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, problem_type, detail)
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

pub fn internal_error(message: impl Into<String>) -> ProblemResponse {
    ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
}

/// JSON body extractor whose rejections are problem documents.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ProblemResponse))]
pub struct ApiJson<T>(pub T);

impl From<JsonRejection> for ProblemResponse {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_body", rejection.body_text())
    }
}

impl From<ValidationError> for ProblemResponse {
    fn from(err: ValidationError) -> Self {
        Self::bad_request("validation_error", err.to_string())
    }
}

impl From<UnknownVariant> for ProblemResponse {
    fn from(err: UnknownVariant) -> Self {
        Self::bad_request("validation_error", err.to_string())
    }
}

fn storage_failure(err: &dyn std::error::Error) -> ProblemResponse {
    error!(stage = "storage", error = %err, "storage operation failed");
    internal_error("storage operation failed")
}

impl From<UserError> for ProblemResponse {
    fn from(err: UserError) -> Self {
        match err {
            UserError::DuplicateEmail => {
                Self::conflict("email_taken", "an account with this email already exists")
            }
            other => storage_failure(&other),
        }
    }
}

impl From<RefreshTokenError> for ProblemResponse {
    fn from(err: RefreshTokenError) -> Self {
        match err {
            RefreshTokenError::AlreadyRevoked => {
                Self::unauthorized("invalid_refresh_token", "refresh token is no longer valid")
            }
            other => storage_failure(&other),
        }
    }
}

impl From<WorkspaceError> for ProblemResponse {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::NotFound => Self::not_found("workspace not found"),
            WorkspaceError::AlreadyMember => {
                Self::conflict("already_member", "user is already a member of this workspace")
            }
            other => storage_failure(&other),
        }
    }
}

impl From<StoreError> for ProblemResponse {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::not_found("store not found"),
            StoreError::DuplicateSlug => Self::conflict("slug_taken", "store slug is already taken"),
            StoreError::HasOrders => {
                Self::conflict("store_has_orders", "stores with orders cannot be deleted")
            }
            other => storage_failure(&other),
        }
    }
}

impl From<ProductError> for ProblemResponse {
    fn from(err: ProductError) -> Self {
        match err {
            ProductError::NotFound => Self::not_found("product not found"),
            ProductError::VariantNotFound => Self::not_found("variant not found"),
            ProductError::DuplicateSku => {
                Self::conflict("sku_taken", "sku is already used in this workspace")
            }
            ProductError::LastVariant => {
                Self::conflict("last_variant", "a product must keep at least one variant")
            }
            ProductError::InUse => {
                Self::conflict("product_in_use", "product is still used by a sellpage")
            }
            other => storage_failure(&other),
        }
    }
}

impl From<SellpageError> for ProblemResponse {
    fn from(err: SellpageError) -> Self {
        match err {
            SellpageError::NotFound => Self::not_found("sellpage not found"),
            SellpageError::DuplicateSlug => {
                Self::conflict("slug_taken", "sellpage slug is already used in this store")
            }
            other => storage_failure(&other),
        }
    }
}

impl From<CartError> for ProblemResponse {
    fn from(err: CartError) -> Self {
        match err {
            CartError::VariantNotFound => Self::not_found("variant not found"),
            CartError::LineNotFound => Self::not_found("variant is not in the cart"),
            CartError::ProductUnavailable => {
                Self::conflict("product_unavailable", "this product is not for sale")
            }
            CartError::InsufficientStock { available } => Self::conflict(
                "insufficient_stock",
                format!("only {available} units are in stock"),
            ),
            CartError::QuantityLimit { max } => Self::bad_request(
                "validation_error",
                format!("quantity: at most {max} units per line are allowed"),
            ),
            other => storage_failure(&other),
        }
    }
}

impl From<CheckoutError> for ProblemResponse {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::CartEmpty => Self::conflict("cart_empty", "cart is empty"),
            CheckoutError::InsufficientStock { sku } => {
                Self::conflict("insufficient_stock", format!("not enough stock for {sku}"))
            }
            CheckoutError::ProductUnavailable { sku } => {
                Self::conflict("product_unavailable", format!("{sku} is no longer for sale"))
            }
            CheckoutError::Pricing(err) => {
                Self::bad_request("amount_out_of_range", err.to_string())
            }
            other => storage_failure(&other),
        }
    }
}

impl From<OrderError> for ProblemResponse {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::NotFound => Self::not_found("order not found"),
            OrderError::InvalidTransition { .. } => {
                Self::conflict("invalid_transition", err.to_string())
            }
            other => storage_failure(&other),
        }
    }
}

impl From<LegalSetError> for ProblemResponse {
    fn from(err: LegalSetError) -> Self {
        match err {
            LegalSetError::NotFound => Self::not_found("legal set not found"),
            LegalSetError::InUse => {
                Self::conflict("legal_set_in_use", "legal set is assigned to a store")
            }
            other => storage_failure(&other),
        }
    }
}

impl From<DomainError> for ProblemResponse {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => Self::not_found("domain not found"),
            DomainError::DuplicateHostname => {
                Self::conflict("hostname_taken", "hostname is already registered")
            }
            other => storage_failure(&other),
        }
    }
}

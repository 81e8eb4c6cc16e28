use std::time::Duration;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use shopfront_core::types::User;
use shopfront_core::validation::{normalize_email, require_text, validate_password};
use shopfront_storage::{NewRefreshToken, NewUser, RefreshTokenError};

use crate::problem::{internal_error, ApiJson, ProblemResponse};
use crate::router::AppState;

const ACCESS_TOKEN_TYPE: &str = "access";
const REFRESH_TOKEN_BYTES: usize = 32;

/// Issues and validates HS256 access tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub typ: String,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
    #[error("invalid token: {0}")]
    Invalid(String),
}

impl TokenService {
    pub fn new(secret: &[u8], access_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        // Expiry is checked against the application clock below.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue_access(&self, user_id: &str, now: DateTime<Utc>) -> Result<String, TokenError> {
        let iat = now.timestamp();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            iat,
            exp: iat + self.access_ttl.as_secs() as i64,
            typ: ACCESS_TOKEN_TYPE.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(TokenError::Sign)
    }

    pub fn verify_access(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, TokenError> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Invalid(format!("{err}")))?;
        let claims = data.claims;
        if claims.typ != ACCESS_TOKEN_TYPE {
            return Err(TokenError::Invalid("token_type_mismatch".to_string()));
        }
        if now.timestamp() >= claims.exp {
            return Err(TokenError::Invalid("token_expired".to_string()));
        }
        Ok(claims)
    }
}

/// Argon2id password hashing, run on the blocking pool.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }

    /// Minimal cost parameters so tests do not spend seconds hashing.
    #[cfg(test)]
    pub fn insecure_fast() -> Self {
        let params = argon2::Params::new(argon2::Params::MIN_M_COST, 1, 1, None)
            .expect("valid argon2 params");
        Self {
            argon2: Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params),
        }
    }

    pub async fn hash(&self, password: String) -> Result<String, ProblemResponse> {
        let argon2 = self.argon2.clone();
        let result = tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
        })
        .await;

        match result {
            Ok(Ok(hash)) => Ok(hash),
            Ok(Err(err)) => {
                error!(stage = "auth", error = %err, "password hashing failed");
                Err(internal_error("failed to hash password"))
            }
            Err(err) => {
                error!(stage = "auth", error = %err, "password hashing task failed");
                Err(internal_error("failed to hash password"))
            }
        }
    }

    /// Returns `false` for mismatches and for unparseable stored hashes.
    pub async fn verify(&self, password: String, stored: String) -> bool {
        let argon2 = self.argon2.clone();
        tokio::task::spawn_blocking(move || match PasswordHash::new(&stored) {
            Ok(parsed) => argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(err) => {
                warn!(stage = "auth", error = %err, "stored password hash is malformed");
                false
            }
        })
        .await
        .unwrap_or(false)
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a fresh opaque refresh token and the digest persisted for it.
pub fn generate_refresh_token() -> (String, String) {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);
    let digest = hash_refresh_token(&token);
    (token, digest)
}

pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Authenticated caller resolved from a bearer access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ProblemResponse;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ProblemResponse::unauthorized("missing_token", "bearer token is required")
            })?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ProblemResponse::unauthorized("missing_token", "bearer token is required")
            })?;

        let claims = state
            .tokens()
            .verify_access(token, state.now())
            .map_err(|err| {
                info!(stage = "auth", error = %err, "rejected access token");
                ProblemResponse::unauthorized("invalid_token", "access token is invalid or expired")
            })?;

        Ok(Self {
            user_id: claims.sub,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    email: String,
    password: String,
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    user: User,
    #[serde(flatten)]
    tokens: TokenPair,
}

pub async fn register(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ProblemResponse> {
    let email = normalize_email(&body.email)?;
    validate_password(&body.password)?;
    let name = require_text("name", &body.name, 100)?;

    let password_hash = state.passwords().hash(body.password).await?;
    let now = state.now();
    let (user, _) = state
        .storage()
        .users()
        .register(
            &NewUser {
                email: &email,
                name: &name,
                password_hash: &password_hash,
                created_at: now,
            },
            &format!("{name}'s workspace"),
        )
        .await
        .inspect_err(|_| {
            counter!("auth_events_total", "action" => "register", "result" => "rejected")
                .increment(1);
        })?;

    let tokens = issue_token_pair(&state, &user.id, now).await?;
    counter!("auth_events_total", "action" => "register", "result" => "ok").increment(1);
    info!(stage = "auth", user_id = %user.id, "user registered");

    Ok((StatusCode::CREATED, Json(SessionResponse { user, tokens })))
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> Result<Json<SessionResponse>, ProblemResponse> {
    let invalid = || {
        counter!("auth_events_total", "action" => "login", "result" => "rejected").increment(1);
        ProblemResponse::unauthorized("invalid_credentials", "email or password is incorrect")
    };

    let Ok(email) = normalize_email(&body.email) else {
        return Err(invalid());
    };
    let Some(credentials) = state.storage().users().find_credentials(&email).await? else {
        return Err(invalid());
    };
    if !state
        .passwords()
        .verify(body.password, credentials.password_hash)
        .await
    {
        return Err(invalid());
    }

    let user = credentials.user;
    let tokens = issue_token_pair(&state, &user.id, state.now()).await?;
    counter!("auth_events_total", "action" => "login", "result" => "ok").increment(1);

    Ok(Json(SessionResponse { user, tokens }))
}

pub async fn refresh(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RefreshRequest>,
) -> Result<Json<TokenPair>, ProblemResponse> {
    let now = state.now();
    let repo = state.storage().refresh_tokens();
    let invalid = || {
        counter!("auth_events_total", "action" => "refresh", "result" => "rejected").increment(1);
        ProblemResponse::unauthorized("invalid_refresh_token", "refresh token is no longer valid")
    };

    let Some(record) = repo
        .find_by_hash(&hash_refresh_token(&body.refresh_token))
        .await?
    else {
        return Err(invalid());
    };

    if record.is_revoked() {
        revoke_after_reuse(&state, &record.user_id, now).await?;
        return Err(invalid());
    }
    if record.is_expired(now) {
        return Err(invalid());
    }

    let (refresh_token, token_hash) = generate_refresh_token();
    let replacement = NewRefreshToken {
        user_id: &record.user_id,
        token_hash: &token_hash,
        expires_at: now + refresh_ttl(&state),
        created_at: now,
    };
    match repo.rotate(&record.id, &replacement).await {
        Ok(_) => {}
        Err(RefreshTokenError::AlreadyRevoked) => {
            revoke_after_reuse(&state, &record.user_id, now).await?;
            return Err(invalid());
        }
        Err(err) => return Err(err.into()),
    }

    let access_token = sign_access(&state, &record.user_id, now)?;
    counter!("auth_events_total", "action" => "refresh", "result" => "ok").increment(1);

    Ok(Json(TokenPair {
        access_token,
        refresh_token,
        token_type: "Bearer",
        expires_in: state.tokens().access_ttl().as_secs(),
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RefreshRequest>,
) -> Result<StatusCode, ProblemResponse> {
    let revoked = state
        .storage()
        .refresh_tokens()
        .revoke(&hash_refresh_token(&body.refresh_token), state.now())
        .await?;
    counter!("auth_events_total", "action" => "logout", "result" => "ok").increment(1);
    info!(stage = "auth", revoked, "logout processed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<User>, ProblemResponse> {
    state
        .storage()
        .users()
        .fetch(&user.user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ProblemResponse::unauthorized("invalid_token", "account no longer exists"))
}

async fn issue_token_pair(
    state: &AppState,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<TokenPair, ProblemResponse> {
    let (refresh_token, token_hash) = generate_refresh_token();
    state
        .storage()
        .refresh_tokens()
        .insert(&NewRefreshToken {
            user_id,
            token_hash: &token_hash,
            expires_at: now + refresh_ttl(state),
            created_at: now,
        })
        .await?;

    Ok(TokenPair {
        access_token: sign_access(state, user_id, now)?,
        refresh_token,
        token_type: "Bearer",
        expires_in: state.tokens().access_ttl().as_secs(),
    })
}

fn sign_access(state: &AppState, user_id: &str, now: DateTime<Utc>) -> Result<String, ProblemResponse> {
    state.tokens().issue_access(user_id, now).map_err(|err| {
        error!(stage = "auth", error = %err, "failed to sign access token");
        internal_error("failed to issue access token")
    })
}

fn refresh_ttl(state: &AppState) -> chrono::Duration {
    chrono::Duration::seconds(state.refresh_token_ttl().as_secs() as i64)
}

async fn revoke_after_reuse(
    state: &AppState,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(), ProblemResponse> {
    let revoked = state
        .storage()
        .refresh_tokens()
        .revoke_all_for_user(user_id, now)
        .await?;
    counter!("refresh_token_reuse_total").increment(1);
    warn!(stage = "auth", %user_id, revoked, "revoked refresh token presented again; session family revoked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    use crate::router::app_router;
    use crate::test_support::{register_user, send, test_state};

    #[test]
    fn access_tokens_round_trip_and_expire() {
        let service = TokenService::new(b"secret", Duration::from_secs(60));
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let token = service.issue_access("user-1", now).expect("sign");

        let claims = service.verify_access(&token, now).expect("valid");
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.typ, "access");

        let later = now + chrono::Duration::seconds(60);
        assert!(matches!(
            service.verify_access(&token, later),
            Err(TokenError::Invalid(reason)) if reason == "token_expired"
        ));

        let other = TokenService::new(b"other", Duration::from_secs(60));
        assert!(other.verify_access(&token, now).is_err());
    }

    #[test]
    fn refresh_tokens_are_random_and_hashed() {
        let (first, first_hash) = generate_refresh_token();
        let (second, _) = generate_refresh_token();
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert_eq!(first_hash, hash_refresh_token(&first));
        assert_eq!(first_hash.len(), 64);
    }

    #[tokio::test]
    async fn passwords_verify_only_with_the_right_secret() {
        let hasher = PasswordHasher::insecure_fast();
        let hash = hasher.hash("correct horse".to_string()).await.expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse".to_string(), hash.clone()).await);
        assert!(!hasher.verify("wrong horse".to_string(), hash).await);
        assert!(!hasher.verify("x".to_string(), "not-a-hash".to_string()).await);
    }

    #[tokio::test]
    async fn register_creates_personal_workspace_and_rejects_duplicates() {
        let app = app_router(test_state().await);
        let session = register_user(&app, "Ada@Example.com", "Ada").await;

        let (status, body) = send(&app, Method::GET, "/api/workspaces", Some(&session.access_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "Ada's workspace");
        assert_eq!(body[0]["role"], "OWNER");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({ "email": "ada@example.com", "password": "password123", "name": "Ada" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "email_taken");
    }

    #[tokio::test]
    async fn register_validates_input() {
        let app = app_router(test_state().await);
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({ "email": "ada@example.com", "password": "short", "name": "Ada" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "validation_error");
    }

    #[tokio::test]
    async fn login_uses_one_response_for_every_failure() {
        let app = app_router(test_state().await);
        register_user(&app, "ada@example.com", "Ada").await;

        for (email, password) in [
            ("ada@example.com", "wrong-password"),
            ("nobody@example.com", "password123"),
        ] {
            let (status, body) = send(
                &app,
                Method::POST,
                "/api/auth/login",
                None,
                Some(json!({ "email": email, "password": password })),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["type"], "invalid_credentials");
        }

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": " ADA@example.com ", "password": "password123" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], "ada@example.com");
        assert_eq!(body["token_type"], "Bearer");
    }

    #[tokio::test]
    async fn refresh_rotates_and_reuse_revokes_the_family() {
        let app = app_router(test_state().await);
        let session = register_user(&app, "ada@example.com", "Ada").await;

        let (status, rotated) = send(
            &app,
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": session.refresh_token })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rotated_token = rotated["refresh_token"].as_str().expect("token").to_string();
        assert_ne!(rotated_token, session.refresh_token);

        // Presenting the first token again is reuse.
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": session.refresh_token })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "invalid_refresh_token");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": rotated_token })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_refresh_tokens_are_rejected() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let state = test_state().await;
        let app = app_router(state.clone().with_clock(Arc::new(move || start)));
        let session = register_user(&app, "ada@example.com", "Ada").await;

        let later = start + chrono::Duration::days(31);
        let app = app_router(state.with_clock(Arc::new(move || later)));
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": session.refresh_token })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let app = app_router(test_state().await);
        let session = register_user(&app, "ada@example.com", "Ada").await;

        for _ in 0..2 {
            let (status, _) = send(
                &app,
                Method::POST,
                "/api/auth/logout",
                None,
                Some(json!({ "refresh_token": session.refresh_token })),
            )
            .await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
    }

    #[tokio::test]
    async fn me_requires_a_valid_bearer_token() {
        let app = app_router(test_state().await);
        let session = register_user(&app, "ada@example.com", "Ada").await;

        let (status, body) = send(&app, Method::GET, "/api/auth/me", Some(&session.access_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Ada");

        let (status, body) = send(&app, Method::GET, "/api/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "missing_token");

        let (status, body) = send(&app, Method::GET, "/api/auth/me", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "invalid_token");
    }
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use metrics::counter;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use shopfront_core::types::{Domain, DomainStatus, MemberRole, Store};
use shopfront_core::validation::normalize_hostname;
use shopfront_dns::{verification_host, verification_value, VerificationOutcome};
use shopfront_storage::{DomainVerificationUpdate, NewDomain};

use crate::auth::AuthUser;
use crate::problem::{ApiJson, ProblemResponse};
use crate::router::AppState;
use crate::stores::authorize_store;

const VERIFICATION_TOKEN_BYTES: usize = 16;

#[derive(Debug, Deserialize)]
pub struct CreateDomainRequest {
    hostname: String,
}

#[derive(Debug, Serialize)]
pub struct TxtInstruction {
    name: String,
    value: String,
}

/// DNS records the store owner has to publish.
#[derive(Debug, Serialize)]
pub struct DnsInstructions {
    txt: TxtInstruction,
    a: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DomainResponse {
    #[serde(flatten)]
    domain: Domain,
    instructions: DnsInstructions,
}

impl DomainResponse {
    fn new(state: &AppState, domain: Domain) -> Self {
        let instructions = DnsInstructions {
            txt: TxtInstruction {
                name: verification_host(&domain.hostname),
                value: verification_value(&domain.verification_token),
            },
            a: state
                .domain_check()
                .edge_ips()
                .iter()
                .map(ToString::to_string)
                .collect(),
        };
        Self {
            domain,
            instructions,
        }
    }
}

fn generate_verification_token() -> String {
    let mut bytes = [0u8; VERIFICATION_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<CreateDomainRequest>,
) -> Result<(StatusCode, Json<DomainResponse>), ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;
    let hostname = normalize_hostname(&body.hostname)?;
    let token = generate_verification_token();

    let domain = state
        .storage()
        .domains()
        .create(&NewDomain {
            store_id: &store_id,
            hostname: &hostname,
            verification_token: &token,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "domains", domain_id = %domain.id, %hostname, "domain registered");

    Ok((StatusCode::CREATED, Json(DomainResponse::new(&state, domain))))
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id)): Path<(String, String)>,
) -> Result<Json<Vec<Domain>>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Member).await?;
    Ok(Json(state.storage().domains().list(&store_id).await?))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, domain_id)): Path<(String, String, String)>,
) -> Result<Json<DomainResponse>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Member).await?;
    let domain = state.storage().domains().fetch(&store_id, &domain_id).await?;
    Ok(Json(DomainResponse::new(&state, domain)))
}

/// Runs the DNS checks now and records VERIFIED or FAILED.
///
/// Resolver transport failures leave the stored status untouched and surface
/// as 502. Error rcodes for the zone are recorded as FAILED.
pub async fn verify(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, domain_id)): Path<(String, String, String)>,
) -> Result<Json<Domain>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;
    let repo = state.storage().domains();
    let domain = repo.fetch(&store_id, &domain_id).await?;

    let outcome = match state
        .domain_check()
        .check(&domain.hostname, &domain.verification_token)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(stage = "domains", %domain_id, hostname = %domain.hostname, error = %err, "dns lookup failed");
            counter!("domain_verifications_total", "trigger" => "manual", "result" => "error")
                .increment(1);
            return Err(ProblemResponse::new(
                StatusCode::BAD_GATEWAY,
                "dns_lookup_failed",
                "the DNS resolver could not be reached, try again later",
            ));
        }
    };

    let (status, reason) = match &outcome {
        VerificationOutcome::Verified => (DomainStatus::Verified, None),
        VerificationOutcome::Failed(reason) => (DomainStatus::Failed, Some(reason.as_str())),
    };
    repo.record_verification(
        &domain_id,
        &DomainVerificationUpdate {
            status,
            failure_reason: reason,
            checked_at: state.now(),
        },
    )
    .await?;
    counter!(
        "domain_verifications_total",
        "trigger" => "manual",
        "result" => status.as_str().to_ascii_lowercase()
    )
    .increment(1);
    info!(stage = "domains", %domain_id, status = status.as_str(), "domain checked");

    Ok(Json(repo.fetch(&store_id, &domain_id).await?))
}

pub async fn make_primary(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, domain_id)): Path<(String, String, String)>,
) -> Result<Json<Store>, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;
    let domain = state.storage().domains().fetch(&store_id, &domain_id).await?;
    if domain.status != DomainStatus::Verified {
        return Err(ProblemResponse::conflict(
            "domain_not_verified",
            "only VERIFIED domains can become the primary domain",
        ));
    }

    let stores = state.storage().stores();
    stores
        .set_primary_domain(&store_id, Some(&domain_id), state.now())
        .await?;
    Ok(Json(stores.fetch(&workspace_id, &store_id).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, store_id, domain_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    authorize_store(&state, &user, &workspace_id, &store_id, MemberRole::Admin).await?;
    state
        .storage()
        .domains()
        .delete(&store_id, &domain_id)
        .await?;
    info!(stage = "domains", %domain_id, "domain removed");
    Ok(StatusCode::NO_CONTENT)
}

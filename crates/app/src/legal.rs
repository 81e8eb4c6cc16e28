use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use shopfront_core::types::{LegalDocument, LegalDocumentKind, LegalSet, MemberRole};
use shopfront_core::validation::{require_text, ValidationError};
use shopfront_storage::NewLegalSet;

use crate::auth::AuthUser;
use crate::problem::{ApiJson, ProblemResponse};
use crate::router::AppState;
use crate::workspaces::require_role;

const MAX_VARIABLES: usize = 50;
const MAX_VARIABLE_VALUE_LEN: usize = 2_000;
const MAX_BODY_LEN: usize = 200_000;

#[derive(Debug, Deserialize)]
pub struct CreateLegalSetRequest {
    name: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLegalSetRequest {
    name: Option<String>,
    variables: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct DocumentRequest {
    title: String,
    body_html: String,
}

fn check_variables(variables: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if variables.len() > MAX_VARIABLES {
        return Err(ValidationError::new(
            "variables",
            format!("at most {MAX_VARIABLES} variables are allowed"),
        ));
    }
    for (name, value) in variables {
        let valid_name = !name.is_empty()
            && name.len() <= 64
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if !valid_name {
            return Err(ValidationError::new(
                "variables",
                format!("{name:?} is not a valid variable name"),
            ));
        }
        if value.chars().count() > MAX_VARIABLE_VALUE_LEN {
            return Err(ValidationError::new(
                "variables",
                format!("value of {name} is too long"),
            ));
        }
    }
    Ok(())
}

fn parse_kind(raw: &str) -> Result<LegalDocumentKind, ProblemResponse> {
    Ok(raw.parse::<LegalDocumentKind>()?)
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
    ApiJson(body): ApiJson<CreateLegalSetRequest>,
) -> Result<(StatusCode, Json<LegalSet>), ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let name = require_text("name", &body.name, 100)?;
    check_variables(&body.variables)?;

    let set = state
        .storage()
        .legal_sets()
        .create(&NewLegalSet {
            workspace_id: &workspace_id,
            name: &name,
            variables: &body.variables,
            created_at: state.now(),
        })
        .await?;
    info!(stage = "legal", legal_set_id = %set.id, "legal set created");

    Ok((StatusCode::CREATED, Json(set)))
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<LegalSet>>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    Ok(Json(state.storage().legal_sets().list(&workspace_id).await?))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, legal_set_id)): Path<(String, String)>,
) -> Result<Json<LegalSet>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    Ok(Json(
        state
            .storage()
            .legal_sets()
            .fetch(&workspace_id, &legal_set_id)
            .await?,
    ))
}

pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, legal_set_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<UpdateLegalSetRequest>,
) -> Result<Json<LegalSet>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let repo = state.storage().legal_sets();
    let current = repo.fetch(&workspace_id, &legal_set_id).await?;

    let name = match body.name {
        Some(name) => require_text("name", &name, 100)?,
        None => current.name,
    };
    let variables = match body.variables {
        Some(variables) => {
            check_variables(&variables)?;
            variables
        }
        None => current.variables,
    };

    let set = repo
        .update(&workspace_id, &legal_set_id, &name, &variables, state.now())
        .await?;
    Ok(Json(set))
}

pub async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, legal_set_id)): Path<(String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    state
        .storage()
        .legal_sets()
        .delete(&workspace_id, &legal_set_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn put_document(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, legal_set_id, kind)): Path<(String, String, String)>,
    ApiJson(body): ApiJson<DocumentRequest>,
) -> Result<Json<LegalDocument>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let kind = parse_kind(&kind)?;
    let title = require_text("title", &body.title, 200)?;
    if body.body_html.chars().count() > MAX_BODY_LEN {
        return Err(ValidationError::new("body_html", "is too long").into());
    }

    let document = state
        .storage()
        .legal_sets()
        .put_document(
            &workspace_id,
            &legal_set_id,
            kind,
            &title,
            &body.body_html,
            state.now(),
        )
        .await?;
    Ok(Json(document))
}

pub async fn reset_document(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, legal_set_id, kind)): Path<(String, String, String)>,
) -> Result<Json<LegalDocument>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let kind = parse_kind(&kind)?;
    let document = state
        .storage()
        .legal_sets()
        .reset_document(&workspace_id, &legal_set_id, kind, state.now())
        .await?;
    info!(stage = "legal", %legal_set_id, kind = %kind, "legal document reset to boilerplate");
    Ok(Json(document))
}

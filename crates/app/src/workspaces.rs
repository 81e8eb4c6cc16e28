use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use shopfront_core::types::{Member, MemberRole, WorkspaceMembership};
use shopfront_core::validation::{normalize_email, require_text};

use crate::auth::AuthUser;
use crate::problem::{ApiJson, ProblemResponse};
use crate::router::AppState;

/// Resolves the caller's membership and checks the role it grants.
///
/// Non-members get the same 404 as a missing workspace so tenant ids do not
/// leak. Members below `required` get 403.
pub async fn require_role(
    state: &AppState,
    user: &AuthUser,
    workspace_id: &str,
    required: MemberRole,
) -> Result<WorkspaceMembership, ProblemResponse> {
    let membership = state
        .storage()
        .workspaces()
        .fetch_membership(workspace_id, &user.user_id)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("workspace not found"))?;

    if !membership.role.satisfies(required) {
        return Err(ProblemResponse::forbidden(format!(
            "{} role is required",
            required.as_str()
        )));
    }
    Ok(membership)
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    email: String,
    role: MemberRole,
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<WorkspaceRequest>,
) -> Result<(StatusCode, Json<WorkspaceMembership>), ProblemResponse> {
    let name = require_text("name", &body.name, 100)?;
    let workspace = state
        .storage()
        .workspaces()
        .create_with_owner(&name, &user.user_id, state.now())
        .await?;
    info!(stage = "workspaces", workspace_id = %workspace.id, "workspace created");

    Ok((
        StatusCode::CREATED,
        Json(WorkspaceMembership {
            workspace,
            role: MemberRole::Owner,
        }),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<WorkspaceMembership>>, ProblemResponse> {
    let workspaces = state
        .storage()
        .workspaces()
        .list_for_user(&user.user_id)
        .await?;
    Ok(Json(workspaces))
}

pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
) -> Result<Json<WorkspaceMembership>, ProblemResponse> {
    let membership = require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    Ok(Json(membership))
}

pub async fn rename(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
    ApiJson(body): ApiJson<WorkspaceRequest>,
) -> Result<Json<WorkspaceMembership>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    let name = require_text("name", &body.name, 100)?;
    state
        .storage()
        .workspaces()
        .rename(&workspace_id, &name, state.now())
        .await?;

    let membership = require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    Ok(Json(membership))
}

pub async fn list_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<Member>>, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Member).await?;
    let members = state
        .storage()
        .workspaces()
        .list_members(&workspace_id)
        .await?;
    Ok(Json(members))
}

pub async fn add_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<String>,
    ApiJson(body): ApiJson<AddMemberRequest>,
) -> Result<(StatusCode, Json<Vec<Member>>), ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;
    if body.role == MemberRole::Owner {
        return Err(ProblemResponse::bad_request(
            "validation_error",
            "role: OWNER cannot be granted",
        ));
    }

    let email = normalize_email(&body.email)?;
    let invitee = state
        .storage()
        .users()
        .find_by_email(&email)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("no account exists for this email"))?;

    let repo = state.storage().workspaces();
    repo.add_member(&workspace_id, &invitee.id, body.role, state.now())
        .await?;
    info!(
        stage = "workspaces",
        %workspace_id,
        user_id = %invitee.id,
        role = body.role.as_str(),
        "member added"
    );

    Ok((StatusCode::CREATED, Json(repo.list_members(&workspace_id).await?)))
}

pub async fn remove_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, member_id)): Path<(String, String)>,
) -> Result<StatusCode, ProblemResponse> {
    require_role(&state, &user, &workspace_id, MemberRole::Admin).await?;

    let repo = state.storage().workspaces();
    let target = repo
        .fetch_membership(&workspace_id, &member_id)
        .await?
        .ok_or_else(|| ProblemResponse::not_found("member not found"))?;
    if target.role == MemberRole::Owner {
        return Err(ProblemResponse::conflict(
            "owner_not_removable",
            "the workspace owner cannot be removed",
        ));
    }

    if !repo.remove_member(&workspace_id, &member_id).await? {
        return Err(ProblemResponse::not_found("member not found"));
    }
    info!(stage = "workspaces", %workspace_id, user_id = %member_id, "member removed");
    Ok(StatusCode::NO_CONTENT)
}

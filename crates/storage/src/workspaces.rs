use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use shopfront_core::types::{Member, MemberRole, Workspace, WorkspaceMembership};

use crate::{is_unique_violation, new_id, to_rfc3339, DecodeError};

/// Repository for workspaces and memberships.
#[derive(Clone)]
pub struct WorkspaceRepository {
    pub(crate) pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    role: String,
}

impl MembershipRow {
    fn into_domain(self) -> Result<WorkspaceMembership, DecodeError> {
        Ok(WorkspaceMembership {
            role: self.role.parse()?,
            workspace: Workspace {
                id: self.id,
                name: self.name,
                created_at: self.created_at,
                updated_at: self.updated_at,
            },
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MemberRow {
    user_id: String,
    email: String,
    name: String,
    role: String,
    joined_at: DateTime<Utc>,
}

impl MemberRow {
    fn into_domain(self) -> Result<Member, DecodeError> {
        Ok(Member {
            role: self.role.parse()?,
            user_id: self.user_id,
            email: self.email,
            name: self.name,
            joined_at: self.joined_at,
        })
    }
}

impl WorkspaceRepository {
    /// Creates a workspace and registers `owner_id` as its owner.
    pub async fn create_with_owner(
        &self,
        name: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Workspace, WorkspaceError> {
        let mut tx = self.pool.begin().await?;
        let workspace = insert_owned_workspace(&mut tx, name, owner_id, now).await?;
        tx.commit().await?;
        Ok(workspace)
    }

    /// Lists every workspace the user belongs to, oldest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<WorkspaceMembership>, WorkspaceError> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            "SELECT w.id, w.name, w.created_at, w.updated_at, m.role \
               FROM workspaces AS w \
               JOIN workspace_members AS m ON m.workspace_id = w.id \
              WHERE m.user_id = ? \
              ORDER BY w.created_at, w.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(WorkspaceError::from))
            .collect()
    }

    /// Returns the workspace as seen by `user_id`, or `None` for non-members.
    pub async fn fetch_membership(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Option<WorkspaceMembership>, WorkspaceError> {
        let row = sqlx::query_as::<_, MembershipRow>(
            "SELECT w.id, w.name, w.created_at, w.updated_at, m.role \
               FROM workspaces AS w \
               JOIN workspace_members AS m ON m.workspace_id = w.id \
              WHERE w.id = ? AND m.user_id = ?",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MembershipRow::into_domain)
            .transpose()
            .map_err(WorkspaceError::from)
    }

    pub async fn rename(
        &self,
        workspace_id: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkspaceError> {
        let result = sqlx::query("UPDATE workspaces SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(to_rfc3339(now))
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(WorkspaceError::NotFound);
        }
        Ok(())
    }

    pub async fn list_members(&self, workspace_id: &str) -> Result<Vec<Member>, WorkspaceError> {
        let rows = sqlx::query_as::<_, MemberRow>(
            "SELECT u.id AS user_id, u.email, u.name, m.role, m.created_at AS joined_at \
               FROM workspace_members AS m \
               JOIN users AS u ON u.id = m.user_id \
              WHERE m.workspace_id = ? \
              ORDER BY m.created_at, u.email",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain().map_err(WorkspaceError::from))
            .collect()
    }

    pub async fn add_member(
        &self,
        workspace_id: &str,
        user_id: &str,
        role: MemberRole,
        now: DateTime<Utc>,
    ) -> Result<(), WorkspaceError> {
        sqlx::query(
            "INSERT INTO workspace_members (workspace_id, user_id, role, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(workspace_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                WorkspaceError::AlreadyMember
            } else {
                WorkspaceError::Database(err)
            }
        })?;
        Ok(())
    }

    /// Removes a non-owner member. Returns `false` when the user was not a member.
    pub async fn remove_member(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<bool, WorkspaceError> {
        let result = sqlx::query(
            "DELETE FROM workspace_members \
              WHERE workspace_id = ? AND user_id = ? AND role <> 'OWNER'",
        )
        .bind(workspace_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Inserts a workspace and its OWNER membership inside `tx`.
pub(crate) async fn insert_owned_workspace(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<Workspace, sqlx::Error> {
    let id = new_id();
    let timestamp = to_rfc3339(now);

    sqlx::query("INSERT INTO workspaces (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(name)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "INSERT INTO workspace_members (workspace_id, user_id, role, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(owner_id)
    .bind(MemberRole::Owner.as_str())
    .bind(&timestamp)
    .execute(&mut **tx)
    .await?;

    Ok(Workspace {
        id,
        name: name.to_string(),
        created_at: now,
        updated_at: now,
    })
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace not found")]
    NotFound,
    #[error("user is already a member of this workspace")]
    AlreadyMember,
    #[error("failed to decode workspace row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

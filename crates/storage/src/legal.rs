use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use shopfront_core::legal::boilerplate;
use shopfront_core::types::{LegalDocument, LegalDocumentKind, LegalSet};

use crate::{is_foreign_key_violation, new_id, to_rfc3339, DecodeError};

/// Repository for legal sets and their documents.
#[derive(Clone)]
pub struct LegalSetRepository {
    pub(crate) pool: SqlitePool,
}

pub struct NewLegalSet<'a> {
    pub workspace_id: &'a str,
    pub name: &'a str,
    pub variables: &'a BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct LegalSetRow {
    id: String,
    workspace_id: String,
    name: String,
    variables_json: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LegalSetRow {
    fn into_domain(self, documents: Vec<LegalDocument>) -> Result<LegalSet, DecodeError> {
        Ok(LegalSet {
            variables: serde_json::from_str(&self.variables_json)?,
            id: self.id,
            workspace_id: self.workspace_id,
            name: self.name,
            documents,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    legal_set_id: String,
    kind: String,
    title: String,
    body_html: String,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn into_domain(self) -> Result<LegalDocument, DecodeError> {
        Ok(LegalDocument {
            kind: self.kind.parse()?,
            title: self.title,
            body_html: self.body_html,
            updated_at: self.updated_at,
        })
    }
}

const SET_COLUMNS: &str = "id, workspace_id, name, variables_json, created_at, updated_at";
const DOCUMENT_COLUMNS: &str = "legal_set_id, kind, title, body_html, updated_at";

impl LegalSetRepository {
    /// Creates a set with every document kind seeded from boilerplate.
    pub async fn create(&self, set: &NewLegalSet<'_>) -> Result<LegalSet, LegalSetError> {
        let id = new_id();
        let timestamp = to_rfc3339(set.created_at);
        let variables_json = serde_json::to_string(set.variables).map_err(DecodeError::from)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO legal_sets (id, workspace_id, name, variables_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(set.workspace_id)
        .bind(set.name)
        .bind(&variables_json)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await?;

        let mut documents = Vec::with_capacity(LegalDocumentKind::ALL.len());
        for kind in LegalDocumentKind::ALL {
            let template = boilerplate(kind);
            let document = write_document(
                &mut tx,
                &id,
                kind,
                template.title,
                template.body_html,
                set.created_at,
            )
            .await?;
            documents.push(document);
        }

        tx.commit().await?;

        Ok(LegalSet {
            id,
            workspace_id: set.workspace_id.to_string(),
            name: set.name.to_string(),
            variables: set.variables.clone(),
            documents,
            created_at: set.created_at,
            updated_at: set.created_at,
        })
    }

    pub async fn list(&self, workspace_id: &str) -> Result<Vec<LegalSet>, LegalSetError> {
        let rows = sqlx::query_as::<_, LegalSetRow>(&format!(
            "SELECT {SET_COLUMNS} FROM legal_sets WHERE workspace_id = ? ORDER BY created_at, id"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        let document_rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM legal_documents \
              WHERE legal_set_id IN (SELECT id FROM legal_sets WHERE workspace_id = ?)"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<LegalDocument>> = HashMap::new();
        for row in document_rows {
            let set_id = row.legal_set_id.clone();
            grouped.entry(set_id).or_default().push(row.into_domain()?);
        }

        rows.into_iter()
            .map(|row| {
                let mut documents = grouped.remove(&row.id).unwrap_or_default();
                sort_documents(&mut documents);
                row.into_domain(documents).map_err(LegalSetError::from)
            })
            .collect()
    }

    pub async fn fetch(&self, workspace_id: &str, set_id: &str) -> Result<LegalSet, LegalSetError> {
        let row = sqlx::query_as::<_, LegalSetRow>(&format!(
            "SELECT {SET_COLUMNS} FROM legal_sets WHERE workspace_id = ? AND id = ?"
        ))
        .bind(workspace_id)
        .bind(set_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LegalSetError::NotFound)?;

        let mut documents = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM legal_documents WHERE legal_set_id = ?"
        ))
        .bind(set_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(DocumentRow::into_domain)
        .collect::<Result<Vec<_>, _>>()?;
        sort_documents(&mut documents);

        Ok(row.into_domain(documents)?)
    }

    pub async fn update(
        &self,
        workspace_id: &str,
        set_id: &str,
        name: &str,
        variables: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<LegalSet, LegalSetError> {
        let variables_json = serde_json::to_string(variables).map_err(DecodeError::from)?;
        let result = sqlx::query(
            "UPDATE legal_sets SET name = ?, variables_json = ?, updated_at = ? \
              WHERE workspace_id = ? AND id = ?",
        )
        .bind(name)
        .bind(&variables_json)
        .bind(to_rfc3339(now))
        .bind(workspace_id)
        .bind(set_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LegalSetError::NotFound);
        }
        self.fetch(workspace_id, set_id).await
    }

    /// Replaces the title and body of one document.
    pub async fn put_document(
        &self,
        workspace_id: &str,
        set_id: &str,
        kind: LegalDocumentKind,
        title: &str,
        body_html: &str,
        now: DateTime<Utc>,
    ) -> Result<LegalDocument, LegalSetError> {
        let mut tx = self.pool.begin().await?;
        touch_set(&mut tx, workspace_id, set_id, now).await?;
        let document = write_document(&mut tx, set_id, kind, title, body_html, now).await?;
        tx.commit().await?;
        Ok(document)
    }

    /// Restores the built-in boilerplate for one document.
    pub async fn reset_document(
        &self,
        workspace_id: &str,
        set_id: &str,
        kind: LegalDocumentKind,
        now: DateTime<Utc>,
    ) -> Result<LegalDocument, LegalSetError> {
        let template = boilerplate(kind);
        self.put_document(
            workspace_id,
            set_id,
            kind,
            template.title,
            template.body_html,
            now,
        )
        .await
    }

    /// Deletes a set unless a store still uses it.
    pub async fn delete(&self, workspace_id: &str, set_id: &str) -> Result<(), LegalSetError> {
        let result = sqlx::query("DELETE FROM legal_sets WHERE workspace_id = ? AND id = ?")
            .bind(workspace_id)
            .bind(set_id)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    LegalSetError::InUse
                } else {
                    LegalSetError::Database(err)
                }
            })?;
        if result.rows_affected() == 0 {
            return Err(LegalSetError::NotFound);
        }
        Ok(())
    }
}

fn sort_documents(documents: &mut [LegalDocument]) {
    documents.sort_by_key(|document| document.kind);
}

async fn touch_set(
    tx: &mut Transaction<'_, Sqlite>,
    workspace_id: &str,
    set_id: &str,
    now: DateTime<Utc>,
) -> Result<(), LegalSetError> {
    let result =
        sqlx::query("UPDATE legal_sets SET updated_at = ? WHERE workspace_id = ? AND id = ?")
            .bind(to_rfc3339(now))
            .bind(workspace_id)
            .bind(set_id)
            .execute(&mut **tx)
            .await?;
    if result.rows_affected() == 0 {
        return Err(LegalSetError::NotFound);
    }
    Ok(())
}

async fn write_document(
    tx: &mut Transaction<'_, Sqlite>,
    set_id: &str,
    kind: LegalDocumentKind,
    title: &str,
    body_html: &str,
    now: DateTime<Utc>,
) -> Result<LegalDocument, LegalSetError> {
    sqlx::query(
        "INSERT INTO legal_documents (legal_set_id, kind, title, body_html, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(legal_set_id, kind) DO UPDATE SET \
            title = excluded.title, body_html = excluded.body_html, updated_at = excluded.updated_at",
    )
    .bind(set_id)
    .bind(kind.as_str())
    .bind(title)
    .bind(body_html)
    .bind(to_rfc3339(now))
    .execute(&mut **tx)
    .await?;

    Ok(LegalDocument {
        kind,
        title: title.to_string(),
        body_html: body_html.to_string(),
        updated_at: now,
    })
}

#[derive(Debug, Error)]
pub enum LegalSetError {
    #[error("legal set not found")]
    NotFound,
    #[error("legal set is assigned to a store")]
    InUse,
    #[error("failed to decode legal set row: {0}")]
    Decode(#[from] DecodeError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

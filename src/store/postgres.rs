//! Postgres-backed stores
//!
//! Each logical table holds one JSONB document per key. The schema is created
//! lazily, once per process, on first use of a table.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{ConnectionRecord, ProfileStore, ProfileUpdate, ScanPage, SessionStore, DEFAULT_PAGE_SIZE};
use crate::config::TableNames;
use crate::error::AdvisorError;
use crate::models::UserProfile;
use crate::session::SessionRecord;
use crate::Result;

/// A key/document table.
struct DocumentTable {
    pool: PgPool,
    name: String,
    schema_ready: Arc<OnceCell<()>>,
}

impl DocumentTable {
    fn new(pool: PgPool, name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AdvisorError::Config(format!("invalid table name: {:?}", name)));
        }
        Ok(Self {
            pool,
            name: name.to_string(),
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS "{}" (
                      id TEXT PRIMARY KEY,
                      doc JSONB NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                    self.name
                ))
                .execute(&self.pool)
                .await?;
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AdvisorError::Persistence(format!("Failed to initialize table {}: {}", self.name, e))
            })?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        self.ensure_schema().await?;
        let row = sqlx::query(&format!(r#"SELECT doc FROM "{}" WHERE id = $1"#, self.name))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let doc: Value = row.try_get("doc")?;
                Ok(Some(serde_json::from_value(doc)?))
            }
            None => Ok(None),
        }
    }

    async fn put<T: Serialize>(&self, id: &str, doc: &T) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(&format!(
            r#"
            INSERT INTO "{}" (id, doc, updated_at) VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW()
            "#,
            self.name
        ))
        .bind(id)
        .bind(serde_json::to_value(doc)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Shallow-merges `fields` into an existing document; false if absent.
    async fn merge(&self, id: &str, fields: Value) -> Result<bool> {
        self.ensure_schema().await?;
        let result = sqlx::query(&format!(
            r#"UPDATE "{}" SET doc = doc || $2, updated_at = NOW() WHERE id = $1"#,
            self.name
        ))
        .bind(id)
        .bind(fields)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_schema().await?;
        sqlx::query(&format!(r#"DELETE FROM "{}" WHERE id = $1"#, self.name))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Up to `limit` documents after `start_after`, plus whether more follow.
    async fn scan<T: DeserializeOwned>(&self, limit: usize, start_after: Option<&str>) -> Result<(Vec<(String, T)>, bool)> {
        self.ensure_schema().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, doc FROM "{}"
            WHERE $1::TEXT IS NULL OR id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
            self.name
        ))
        .bind(start_after)
        .bind((limit + 1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let more = rows.len() > limit;
        let mut items = Vec::with_capacity(rows.len().min(limit));
        for row in rows.into_iter().take(limit) {
            let id: String = row.try_get("id")?;
            let doc: Value = row.try_get("doc")?;
            items.push((id, serde_json::from_value(doc)?));
        }
        Ok((items, more))
    }
}

pub struct PostgresProfileStore {
    table: DocumentTable,
}

#[async_trait::async_trait]
impl ProfileStore for PostgresProfileStore {
    async fn get(&self, asu_id: &str) -> Result<Option<UserProfile>> {
        self.table.get(asu_id).await
    }

    async fn put(&self, profile: &UserProfile) -> Result<()> {
        self.table.put(&profile.asu_id, profile).await
    }

    async fn update(&self, asu_id: &str, update: ProfileUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let fields = Value::Object(update.fields().clone());
        if self.table.merge(asu_id, fields).await? {
            Ok(())
        } else {
            Err(AdvisorError::NotFound(format!("profile {}", asu_id)))
        }
    }

    async fn scan(&self, limit: Option<usize>, start_after: Option<&str>) -> Result<ScanPage> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let (rows, more) = self.table.scan::<UserProfile>(limit, start_after).await?;
        let last_key = if more { rows.last().map(|(id, _)| id.clone()) } else { None };
        Ok(ScanPage {
            items: rows.into_iter().map(|(_, p)| p).collect(),
            last_key,
        })
    }
}

pub struct PostgresSessionStore {
    sessions: DocumentTable,
    connections: DocumentTable,
}

#[async_trait::async_trait]
impl SessionStore for PostgresSessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.sessions.get(session_id).await
    }

    async fn put_session(&self, session: &SessionRecord) -> Result<()> {
        self.sessions.put(&session.session_id, session).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.delete(session_id).await
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRecord>> {
        self.connections.get(connection_id).await
    }

    async fn put_connection(&self, connection: &ConnectionRecord) -> Result<()> {
        self.connections.put(&connection.connection_id, connection).await
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<()> {
        self.connections.delete(connection_id).await
    }
}

pub struct PostgresStores {
    pub profiles: PostgresProfileStore,
    pub sessions: PostgresSessionStore,
}

impl PostgresStores {
    pub fn new(pool: PgPool, tables: &TableNames) -> Result<Self> {
        Ok(Self {
            profiles: PostgresProfileStore {
                table: DocumentTable::new(pool.clone(), &tables.profiles)?,
            },
            sessions: PostgresSessionStore {
                sessions: DocumentTable::new(pool.clone(), &tables.sessions)?,
                connections: DocumentTable::new(pool, &tables.connections)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_unsafe_table_names() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/advisor")
            .unwrap();
        assert!(DocumentTable::new(pool.clone(), "asu-user-profiles").is_ok());
        assert!(DocumentTable::new(pool.clone(), "profiles\"; DROP TABLE x; --").is_err());
        assert!(DocumentTable::new(pool, "").is_err());
    }
}

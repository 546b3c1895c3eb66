//! Persistence layer
//!
//! Profiles, chat sessions and connections. In-memory by default; Postgres
//! when `DATABASE_URL` is configured. Every write is a plain overwrite, so
//! concurrent writers to the same key resolve last-write-wins.

pub mod memory;
pub mod postgres;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AdvisorConfig;
use crate::models::UserProfile;
use crate::session::SessionRecord;
use crate::Result;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Partial profile update: named camelCase attributes set to new values.
/// Attributes not named are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    fields: Map<String, Value>,
}

impl ProfileUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize + ?Sized>(mut self, attribute: &str, value: &T) -> Result<Self> {
        self.fields
            .insert(attribute.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Applies the update to a profile through its JSON form.
    pub fn apply_to(&self, profile: &UserProfile) -> Result<UserProfile> {
        let mut doc = serde_json::to_value(profile)?;
        if let Some(obj) = doc.as_object_mut() {
            for (k, v) in &self.fields {
                obj.insert(k.clone(), v.clone());
            }
        }
        Ok(serde_json::from_value(doc)?)
    }
}

/// One page of a profile scan. `last_key` is set when more items may follow.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<UserProfile>,
    pub last_key: Option<String>,
}

#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, asu_id: &str) -> Result<Option<UserProfile>>;

    /// Full replace.
    async fn put(&self, profile: &UserProfile) -> Result<()>;

    /// Fails with `NotFound` when the profile does not exist.
    async fn update(&self, asu_id: &str, update: ProfileUpdate) -> Result<()>;

    /// Profiles ordered by id, strictly after `start_after`.
    async fn scan(&self, limit: Option<usize>, start_after: Option<&str>) -> Result<ScanPage>;
}

/// Connection to session link for the chat surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub connection_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    async fn put_session(&self, session: &SessionRecord) -> Result<()>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRecord>>;
    async fn put_connection(&self, connection: &ConnectionRecord) -> Result<()>;
    async fn delete_connection(&self, connection_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Stores {
    pub profiles: Arc<dyn ProfileStore>,
    pub sessions: Arc<dyn SessionStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            profiles: Arc::new(memory::MemoryProfileStore::default()),
            sessions: Arc::new(memory::MemorySessionStore::default()),
        }
    }
}

/// Postgres when a database URL is configured and usable, otherwise memory.
pub fn build_stores(config: &AdvisorConfig) -> Stores {
    if let Some(url) = &config.database_url {
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
        {
            Ok(pool) => match postgres::PostgresStores::new(pool, &config.tables) {
                Ok(pg) => {
                    info!("Persistence backend: postgres");
                    return Stores {
                        profiles: Arc::new(pg.profiles),
                        sessions: Arc::new(pg.sessions),
                    };
                }
                Err(error) => warn!("Invalid table configuration, falling back to in-memory: {}", error),
            },
            Err(error) => {
                warn!(
                    "Failed to initialize postgres backend, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Persistence backend: in-memory");
    Stores::in_memory()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApprovalStatus;
    use serde_json::json;

    #[test]
    fn test_update_touches_only_named_fields() {
        let mut profile = UserProfile::new("1234567890");
        profile.first_name = Some("Ada".into());
        profile.extra.insert("monthly_emi".into(), json!(410.5));

        let update = ProfileUpdate::new()
            .set("approvalStatus", &ApprovalStatus::Approved)
            .unwrap();
        let updated = update.apply_to(&profile).unwrap();

        assert_eq!(updated.approval_status, Some(ApprovalStatus::Approved));
        assert_eq!(updated.first_name.as_deref(), Some("Ada"));
        assert_eq!(updated.extra.get("monthly_emi"), Some(&json!(410.5)));
    }
}

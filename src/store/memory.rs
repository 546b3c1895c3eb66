//! In-memory stores for development and tests

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ConnectionRecord, ProfileStore, ProfileUpdate, ScanPage, SessionStore, DEFAULT_PAGE_SIZE};
use crate::error::AdvisorError;
use crate::models::UserProfile;
use crate::session::SessionRecord;
use crate::Result;

/// Profiles keyed by ASU ID; ordered so scans paginate deterministically.
pub struct MemoryProfileStore {
    profiles: Arc<RwLock<BTreeMap<String, UserProfile>>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self {
            profiles: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get(&self, asu_id: &str) -> Result<Option<UserProfile>> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(asu_id).cloned())
    }

    async fn put(&self, profile: &UserProfile) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        profiles.insert(profile.asu_id.clone(), profile.clone());
        Ok(())
    }

    async fn update(&self, asu_id: &str, update: ProfileUpdate) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        let existing = profiles
            .get(asu_id)
            .ok_or_else(|| AdvisorError::NotFound(format!("profile {}", asu_id)))?;
        let updated = update.apply_to(existing)?;
        profiles.insert(asu_id.to_string(), updated);
        Ok(())
    }

    async fn scan(&self, limit: Option<usize>, start_after: Option<&str>) -> Result<ScanPage> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let profiles = self.profiles.read().await;

        let lower = match start_after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut iter = profiles.range::<str, _>((lower, Bound::Unbounded));

        let items: Vec<UserProfile> = iter.by_ref().take(limit).map(|(_, p)| p.clone()).collect();
        let last_key = match iter.next() {
            Some(_) => items.last().map(|p| p.asu_id.clone()),
            None => None,
        };

        Ok(ScanPage { items, last_key })
    }
}

pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    connections: Arc<RwLock<HashMap<String, ConnectionRecord>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn put_session(&self, session: &SessionRecord) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRecord>> {
        Ok(self.connections.read().await.get(connection_id).cloned())
    }

    async fn put_connection(&self, connection: &ConnectionRecord) -> Result<()> {
        self.connections
            .write()
            .await
            .insert(connection.connection_id.clone(), connection.clone());
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<()> {
        self.connections.write().await.remove(connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApprovalStatus;

    #[tokio::test]
    async fn test_update_requires_existing_profile() {
        let store = MemoryProfileStore::new();
        let update = ProfileUpdate::new().set("approvalStatus", &ApprovalStatus::Pending).unwrap();

        let err = store.update("0000000000", update.clone()).await.unwrap_err();
        assert_eq!(err.status_code(), 404);

        store.put(&UserProfile::new("0000000000")).await.unwrap();
        store.update("0000000000", update).await.unwrap();
        let profile = store.get("0000000000").await.unwrap().unwrap();
        assert_eq!(profile.approval_status, Some(ApprovalStatus::Pending));
    }

    #[tokio::test]
    async fn test_scan_paginates() {
        let store = MemoryProfileStore::new();
        for i in 0..5 {
            store.put(&UserProfile::new(format!("100000000{}", i))).await.unwrap();
        }

        let first = store.scan(Some(2), None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.last_key.as_deref(), Some("1000000001"));

        let second = store.scan(Some(2), first.last_key.as_deref()).await.unwrap();
        assert_eq!(second.items[0].asu_id, "1000000002");

        let last = store.scan(Some(2), Some("1000000003")).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.last_key.is_none());
    }

    #[tokio::test]
    async fn test_connections_round_trip() {
        let store = MemorySessionStore::new();
        let record = ConnectionRecord {
            connection_id: "conn-1".into(),
            session_id: Some("session_1".into()),
            connected_at: chrono::Utc::now(),
        };
        store.put_connection(&record).await.unwrap();
        assert_eq!(store.get_connection("conn-1").await.unwrap(), Some(record));

        store.delete_connection("conn-1").await.unwrap();
        assert!(store.get_connection("conn-1").await.unwrap().is_none());
    }
}

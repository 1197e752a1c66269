use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{StoreError, StoreResult};
use crate::record::ApiKeyRecord;
use crate::token::TokenHash;

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Persistence for key records.
///
/// `compare_and_update` is the only write path for counters: it must replace
/// the stored record with `new` if and only if the stored `version` still
/// equals `expected_version`, as one indivisible operation.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn find_by_hash(&self, hash: &TokenHash) -> StoreResult<Option<ApiKeyRecord>>;

    /// Fails with [`StoreError::Duplicate`] if the hash is already present.
    async fn insert(&self, record: ApiKeyRecord) -> StoreResult<()>;

    async fn compare_and_update(
        &self,
        hash: &TokenHash,
        expected_version: u64,
        new: ApiKeyRecord,
    ) -> StoreResult<bool>;

    /// Flips `is_active` off for the active key matching both owner and hash.
    /// Returns `false` when nothing matched.
    async fn deactivate(&self, owner_id: &str, hash: &TokenHash) -> StoreResult<bool>;

    /// Every key of `owner_id`, active or not, in any order.
    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<ApiKeyRecord>>;

    async fn count_active(&self, owner_id: &str) -> StoreResult<u32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub plan: String,
    pub plan_expiry: Option<DateTime<Utc>>,
}

impl Owner {
    pub fn plan_expired(&self, now: DateTime<Utc>) -> bool {
        self.plan_expiry.is_some_and(|expiry| now > expiry)
    }
}

/// Read-only view of the user store.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn find_owner(&self, owner_id: &str) -> StoreResult<Option<Owner>>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// `DashMap`-backed store. Conditional updates run under the entry's shard lock.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: DashMap<TokenHash, ApiKeyRecord>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn find_by_hash(&self, hash: &TokenHash) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(self.keys.get(hash).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, record: ApiKeyRecord) -> StoreResult<()> {
        match self.keys.entry(record.token_hash) {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn compare_and_update(
        &self,
        hash: &TokenHash,
        expected_version: u64,
        new: ApiKeyRecord,
    ) -> StoreResult<bool> {
        match self.keys.get_mut(hash) {
            Some(mut current) if current.version == expected_version => {
                *current = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate(&self, owner_id: &str, hash: &TokenHash) -> StoreResult<bool> {
        match self.keys.get_mut(hash) {
            Some(mut current) if current.is_active && current.owner_id == owner_id => {
                current.is_active = false;
                current.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<ApiKeyRecord>> {
        Ok(self
            .keys
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn count_active(&self, owner_id: &str) -> StoreResult<u32> {
        let count = self
            .keys
            .iter()
            .filter(|entry| entry.owner_id == owner_id && entry.is_active)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Default)]
pub struct MemoryOwnerDirectory {
    owners: DashMap<String, Owner>,
}

impl MemoryOwnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, owner_id: impl Into<String>, owner: Owner) {
        self.owners.insert(owner_id.into(), owner);
    }
}

#[async_trait]
impl OwnerDirectory for MemoryOwnerDirectory {
    async fn find_owner(&self, owner_id: &str) -> StoreResult<Option<Owner>> {
        Ok(self.owners.get(owner_id).map(|o| o.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, seed: u8) -> ApiKeyRecord {
        ApiKeyRecord::new(
            TokenHash::from_bytes([seed; 32]),
            "veh_00000000".into(),
            owner.into(),
            "test".into(),
            "free".into(),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_hashes() {
        let store = MemoryKeyStore::new();
        store.insert(record("alice", 1)).await.unwrap();
        let err = store.insert(record("bob", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_update_checks_version() {
        let store = MemoryKeyStore::new();
        let original = record("alice", 2);
        let hash = original.token_hash;
        store.insert(original.clone()).await.unwrap();

        let mut next = original.clone();
        next.daily_window.count = 1;
        next.version = 1;
        assert!(store.compare_and_update(&hash, 0, next.clone()).await.unwrap());

        let mut stale = original;
        stale.daily_window.count = 99;
        assert!(!store.compare_and_update(&hash, 0, stale).await.unwrap());

        let stored = store.find_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(stored, next);
    }

    #[tokio::test]
    async fn deactivate_requires_owner_and_active_key() {
        let store = MemoryKeyStore::new();
        let key = record("alice", 3);
        let hash = key.token_hash;
        store.insert(key).await.unwrap();

        assert!(!store.deactivate("mallory", &hash).await.unwrap());
        assert!(store.deactivate("alice", &hash).await.unwrap());
        assert!(!store.deactivate("alice", &hash).await.unwrap());

        let stored = store.find_by_hash(&hash).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.version, 1);
        assert_eq!(store.count_active("alice").await.unwrap(), 0);
        assert_eq!(store.list_by_owner("alice").await.unwrap().len(), 1);
    }

    #[test]
    fn plan_expiry_is_strict() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let owner = Owner {
            plan: "basic".into(),
            plan_expiry: Some(now),
        };
        assert!(!owner.plan_expired(now));
        assert!(owner.plan_expired(now + chrono::Duration::seconds(1)));

        let forever = Owner {
            plan: "basic".into(),
            plan_expiry: None,
        };
        assert!(!forever.plan_expired(now));
    }
}

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;

use crate::clock::Clock;
use crate::engine::KeyLocks;
use crate::error::{guarded, ApiKeyError, ApiKeyResult, StoreError};
use crate::plan::PlanCatalog;
use crate::record::{ApiKeyInfo, ApiKeyRecord, ApiKeySecret};
use crate::store::{KeyStore, Owner, OwnerDirectory};
use crate::token::TokenHasher;

const MAX_NAME_LEN: usize = 32;
const TOKEN_ATTEMPTS: usize = 3;

/// Caller-side pagination over an owner's keys. `page` is 1-based.
/// Only constructible through [`Page::new`], which clamps both values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    page: u32,
    limit: u32,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 10;
    pub const MAX_LIMIT: u32 = 50;

    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn offset(&self) -> usize {
        (self.page as usize)
            .saturating_sub(1)
            .saturating_mul(self.limit as usize)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyPage {
    pub keys: Vec<ApiKeyInfo>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
    pub total_pages: usize,
    /// Keys the owner may still create under the current plan
    pub remaining_slots: u32,
}

fn normalize_name(name: &str) -> ApiKeyResult<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ApiKeyError::InvalidName);
    }
    Ok(name.to_string())
}

/// Creates, lists, rotates and revokes keys.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    owners: Arc<dyn OwnerDirectory>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    hasher: TokenHasher,
    owner_locks: KeyLocks<String>,
    store_timeout: Duration,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        owners: Arc<dyn OwnerDirectory>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        hasher: TokenHasher,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            owners,
            catalog,
            clock,
            hasher,
            owner_locks: KeyLocks::new(),
            store_timeout,
        }
    }

    async fn owner_in_good_standing(&self, owner_id: &str) -> ApiKeyResult<Owner> {
        let owner = guarded(
            "find_owner",
            self.store_timeout,
            self.owners.find_owner(owner_id),
        )
        .await?
        .ok_or(ApiKeyError::OwnerNotFound)?;

        if owner.plan_expired(self.clock.now()) {
            return Err(ApiKeyError::PlanExpired);
        }
        Ok(owner)
    }

    /// Generates a token, retrying on the (astronomically unlikely) hash collision.
    async fn issue(&self, owner_id: &str, name: String, plan: String) -> ApiKeyResult<ApiKeySecret> {
        for _ in 0..TOKEN_ATTEMPTS {
            let token = self.hasher.generate();
            let record = ApiKeyRecord::new(
                self.hasher.hash(&token),
                TokenHasher::display_prefix(&token),
                owner_id.to_string(),
                name.clone(),
                plan.clone(),
                self.clock.now(),
            );
            let info = record.info();

            let inserted = guarded("insert", self.store_timeout, async {
                match self.store.insert(record).await {
                    Ok(()) => Ok(true),
                    Err(StoreError::Duplicate) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

            if inserted {
                info!(
                    "api key created: id={} owner={} plan={} prefix={}",
                    info.id, info.owner_id, info.plan, info.key_prefix
                );
                return Ok(ApiKeySecret {
                    info,
                    api_key: token,
                });
            }
            warn!("token hash collision for owner {owner_id}, regenerating");
        }
        Err(ApiKeyError::EngineUnavailable)
    }

    /// Issues a new key for `owner_id`. The returned token is the only copy.
    pub async fn create(&self, owner_id: &str, name: &str) -> ApiKeyResult<ApiKeySecret> {
        let name = normalize_name(name)?;
        let _guard = self.owner_locks.lock(&owner_id.to_string()).await;

        let owner = self.owner_in_good_standing(owner_id).await?;
        let limits = self.catalog.limits(&owner.plan);

        let active = guarded(
            "count_active",
            self.store_timeout,
            self.store.count_active(owner_id),
        )
        .await?;
        if active >= limits.max_keys {
            return Err(ApiKeyError::KeyLimitReached {
                max_keys: limits.max_keys,
            });
        }

        self.issue(owner_id, name, owner.plan).await
    }

    /// Permanently deactivates the owner's key. Revoking an unknown or already
    /// revoked key reports [`ApiKeyError::KeyNotFound`].
    ///
    /// Matching is by hash only, so keys issued under an earlier
    /// `API_KEY_PREFIX` can still be revoked.
    pub async fn revoke(&self, owner_id: &str, token: &str) -> ApiKeyResult<()> {
        let hash = self.hasher.hash(token);
        let revoked = guarded(
            "deactivate",
            self.store_timeout,
            self.store.deactivate(owner_id, &hash),
        )
        .await?;
        if !revoked {
            return Err(ApiKeyError::KeyNotFound);
        }
        info!(
            "api key revoked: owner={owner_id} prefix={}",
            TokenHasher::display_prefix(token)
        );
        Ok(())
    }

    /// Replaces an active key with a new one carrying the same name and the
    /// owner's current plan, then revokes the old key. The active-key count
    /// does not change, so the ceiling is not consulted.
    ///
    /// If the old key cannot be revoked the new one is revoked again before the
    /// error is returned, so a failed rotation leaves only the old key active.
    pub async fn rotate(&self, owner_id: &str, token: &str) -> ApiKeyResult<ApiKeySecret> {
        let _guard = self.owner_locks.lock(&owner_id.to_string()).await;

        let owner = self.owner_in_good_standing(owner_id).await?;
        let hash = self.hasher.hash(token);
        let old = guarded(
            "find_by_hash",
            self.store_timeout,
            self.store.find_by_hash(&hash),
        )
        .await?
        .filter(|record| record.is_active && record.owner_id == owner_id)
        .ok_or(ApiKeyError::KeyNotFound)?;

        let fresh = self.issue(owner_id, old.name.clone(), owner.plan).await?;

        let revoked = match guarded(
            "deactivate",
            self.store_timeout,
            self.store.deactivate(owner_id, &hash),
        )
        .await
        {
            Ok(revoked) => revoked,
            Err(err) => {
                self.discard(owner_id, &fresh).await;
                return Err(err);
            }
        };
        if !revoked {
            warn!("key {} was revoked while being rotated", old.id);
        }
        info!(
            "api key rotated: owner={owner_id} old={} new={}",
            old.id, fresh.info.id
        );
        Ok(fresh)
    }

    /// Revokes a key whose token never reached the caller.
    async fn discard(&self, owner_id: &str, secret: &ApiKeySecret) {
        let hash = self.hasher.hash(&secret.api_key);
        match guarded(
            "deactivate",
            self.store_timeout,
            self.store.deactivate(owner_id, &hash),
        )
        .await
        {
            Ok(true) => warn!(
                "rotation failed, replacement key {} revoked again",
                secret.info.id
            ),
            Ok(false) | Err(_) => error!(
                "rotation failed and replacement key {} is still active",
                secret.info.id
            ),
        }
    }

    /// All of the owner's keys, active and revoked, oldest first.
    pub async fn list(&self, owner_id: &str) -> ApiKeyResult<Vec<ApiKeyInfo>> {
        let mut records = guarded(
            "list_by_owner",
            self.store_timeout,
            self.store.list_by_owner(owner_id),
        )
        .await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records.iter().map(ApiKeyRecord::info).collect())
    }

    pub async fn list_page(&self, owner_id: &str, page: Page) -> ApiKeyResult<KeyPage> {
        let page = Page::new(page.page, page.limit);
        let owner = guarded(
            "find_owner",
            self.store_timeout,
            self.owners.find_owner(owner_id),
        )
        .await?
        .ok_or(ApiKeyError::OwnerNotFound)?;
        let max_keys = self.catalog.limits(&owner.plan).max_keys;

        let all = self.list(owner_id).await?;
        let total = all.len();
        let active = all.iter().filter(|k| k.is_active).count();
        let keys = all
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .collect();

        Ok(KeyPage {
            keys,
            total,
            page: page.page,
            limit: page.limit,
            total_pages: total.div_ceil(page.limit as usize),
            remaining_slots: max_keys.saturating_sub(u32::try_from(active).unwrap_or(u32::MAX)),
        })
    }
}

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::engine::QuotaEngine;
use crate::error::ApiKeyResult;
use crate::gate::{KeyStatus, Validation, ValidationGate};
use crate::lifecycle::{KeyManager, KeyPage, Page};
use crate::plan::PlanCatalog;
use crate::record::{ApiKeyInfo, ApiKeySecret};
use crate::store::{KeyStore, OwnerDirectory};
use crate::token::TokenHasher;

struct Inner {
    manager: KeyManager,
    gate: ValidationGate,
}

/// Everything the HTTP layer calls, wired from one [`AppConfig`].
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ApiKeyService {
    inner: Arc<Inner>,
}

impl ApiKeyService {
    pub fn new(
        config: &AppConfig,
        catalog: PlanCatalog,
        store: Arc<dyn KeyStore>,
        owners: Arc<dyn OwnerDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let timeout = config.quota.store_timeout();
        let hasher = TokenHasher::new(
            config.quota.key_prefix.clone(),
            config.secrets.hash_pepper.clone(),
        );

        let engine = Arc::new(QuotaEngine::new(
            store.clone(),
            catalog.clone(),
            clock.clone(),
            timeout,
            config.quota.conflict_retries,
        ));
        let gate = ValidationGate::new(engine, store.clone(), clock.clone(), hasher.clone(), timeout);
        let manager = KeyManager::new(store, owners, catalog, clock, hasher, timeout);

        Self {
            inner: Arc::new(Inner { manager, gate }),
        }
    }

    /// Built-in plans and the system clock.
    pub fn with_defaults(
        config: &AppConfig,
        store: Arc<dyn KeyStore>,
        owners: Arc<dyn OwnerDirectory>,
    ) -> Self {
        Self::new(config, PlanCatalog::builtin(), store, owners, Arc::new(SystemClock))
    }

    pub fn keys(&self) -> &KeyManager {
        &self.inner.manager
    }

    pub fn gate(&self) -> &ValidationGate {
        &self.inner.gate
    }

    pub async fn create_key(&self, owner_id: &str, name: &str) -> ApiKeyResult<ApiKeySecret> {
        self.inner.manager.create(owner_id, name).await
    }

    pub async fn revoke_key(&self, owner_id: &str, token: &str) -> ApiKeyResult<()> {
        self.inner.manager.revoke(owner_id, token).await
    }

    pub async fn rotate_key(&self, owner_id: &str, token: &str) -> ApiKeyResult<ApiKeySecret> {
        self.inner.manager.rotate(owner_id, token).await
    }

    pub async fn list_keys(&self, owner_id: &str) -> ApiKeyResult<Vec<ApiKeyInfo>> {
        self.inner.manager.list(owner_id).await
    }

    pub async fn list_keys_page(&self, owner_id: &str, page: Page) -> ApiKeyResult<KeyPage> {
        self.inner.manager.list_page(owner_id, page).await
    }

    pub async fn validate(&self, token: &str) -> ApiKeyResult<Validation> {
        self.inner.gate.validate(token).await
    }

    pub async fn key_status(&self, token: &str) -> ApiKeyResult<KeyStatus> {
        self.inner.gate.inspect(token).await
    }
}

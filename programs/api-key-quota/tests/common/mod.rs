#![allow(dead_code)]

use std::sync::{Arc, RwLock};

use api_key_quota::{
    windows, ApiKeyService, AppConfig, Clock, MemoryKeyStore, MemoryOwnerDirectory, Owner,
    PlanCatalog, PlanLimits, DEFAULT_PLAN,
};
use chrono::{DateTime, Utc};

pub const OWNER: &str = "owner-alice";
pub const PEPPER: &str = "test-pepper";

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Clock that stays put until a test moves it.
#[derive(Debug)]
pub struct TestClock {
    now: RwLock<DateTime<Utc>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write().unwrap() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write().unwrap();
        *now = *now + by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap()
    }
}

pub fn default_owner() -> Owner {
    Owner {
        plan: DEFAULT_PLAN.to_string(),
        plan_expiry: None,
    }
}

pub struct Harness {
    pub service: ApiKeyService,
    pub store: Arc<MemoryKeyStore>,
    pub owners: Arc<MemoryOwnerDirectory>,
    pub clock: Arc<TestClock>,
}

impl Harness {
    pub fn new(catalog: PlanCatalog) -> Self {
        let store = Arc::new(MemoryKeyStore::new());
        let owners = Arc::new(MemoryOwnerDirectory::new());
        let clock = Arc::new(TestClock::new(t0()));
        owners.upsert(OWNER, default_owner());
        let service = ApiKeyService::new(
            &AppConfig::with_pepper(PEPPER),
            catalog,
            store.clone(),
            owners.clone(),
            clock.clone(),
        );
        Self {
            service,
            store,
            owners,
            clock,
        }
    }

    pub fn builtin() -> Self {
        Self::new(PlanCatalog::builtin())
    }

    /// A second service over the same store, owners and clock.
    pub fn service_with(&self, config: &AppConfig, catalog: PlanCatalog) -> ApiKeyService {
        ApiKeyService::new(
            config,
            catalog,
            self.store.clone(),
            self.owners.clone(),
            self.clock.clone(),
        )
    }

    pub fn at(&self, secs_after_t0: i64) {
        self.clock.set(t0() + chrono::Duration::seconds(secs_after_t0));
    }

    pub fn set_owner_plan(&self, plan: &str, plan_expiry: Option<DateTime<Utc>>) {
        self.owners.upsert(
            OWNER,
            Owner {
                plan: plan.to_string(),
                plan_expiry,
            },
        );
    }
}

/// Catalog whose default plan has the given limits and a one-minute rate window.
pub fn catalog(daily_limit: u32, rate_limit: u32, max_keys: u32) -> PlanCatalog {
    PlanCatalog::from_plans([
        (
            DEFAULT_PLAN,
            PlanLimits::new(daily_limit, rate_limit, windows::ONE_MINUTE, max_keys),
        ),
        (
            "basic",
            PlanLimits::new(daily_limit * 10, rate_limit * 2, windows::ONE_MINUTE, max_keys * 5),
        ),
    ])
    .unwrap()
}

//! # API Key Quota Engine
//!
//! Issues per-owner API keys bound to a subscription plan and admits or rejects
//! every request made with them against two independent quota dimensions: a short
//! fixed-window rate limit and a 24-hour usage cap.
//!
//! ## Architecture
//!
//! - **PlanCatalog** ([`plan`]): immutable plan id -> limits table, loaded once.
//!   Unknown plans resolve to [`plan::DEFAULT_PLAN`].
//!
//! - **ApiKeyRecord** ([`record`]): one per issued key. Stores a peppered SHA-256
//!   hash of the token (never the raw token), a display prefix, the plan fixed at
//!   creation, and both counter windows.
//!
//! - **KeyManager** ([`lifecycle`]): create / list / revoke / rotate, bounded by
//!   the owner's plan-derived key ceiling.
//!
//! - **QuotaEngine** ([`engine`]): the per-key state machine. Evaluates both
//!   windows and persists the result with a single conditional update while
//!   holding a per-key lock.
//!
//! - **ValidationGate** ([`gate`]): token lookup + admission. The one entry point
//!   request middleware calls before protected work runs.
//!
//! - **ApiKeyService** ([`service`]): wires the above from an [`AppConfig`] for the
//!   HTTP layer.
//!
//! ## Key Design Decisions
//!
//! 1. Raw API keys are returned once at creation and never stored
//! 2. Fixed windows (1s/60s/3600s/86400s), no token bucket, no grace period
//! 3. The daily window is checked before the rate window
//! 4. Window resets are persisted even when the request is rejected
//! 5. Storage failures and timeouts reject the request (`EngineUnavailable`)
//! 6. Revocation is terminal; records are never deleted

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod plan;
pub mod record;
pub mod service;
pub mod store;
pub mod token;

pub use clock::{Clock, SystemClock};
#[cfg(feature = "test-util")]
pub use clock::ManualClock;
pub use config::{AppConfig, QuotaConfig, Secrets};
pub use engine::{Admission, Decision, QuotaEngine, Usage};
pub use error::{ApiKeyError, ApiKeyResult, StoreError, StoreResult};
pub use gate::{KeyStatus, RejectReason, Validation, ValidationGate};
pub use lifecycle::{KeyManager, KeyPage, Page};
pub use plan::{PlanCatalog, PlanLimits, DEFAULT_PLAN};
pub use record::{ApiKeyInfo, ApiKeyRecord, ApiKeySecret, WindowCounter};
pub use service::ApiKeyService;
pub use store::{KeyStore, MemoryKeyStore, MemoryOwnerDirectory, Owner, OwnerDirectory};
pub use token::{TokenHash, TokenHasher};

/// Window durations in seconds.
/// Only these lengths are accepted for a plan's rate window.
pub mod windows {
    pub const ONE_SECOND: i64 = 1;
    pub const ONE_MINUTE: i64 = 60;
    pub const ONE_HOUR: i64 = 3600;
    pub const ONE_DAY: i64 = 86400;

    /// Length of the daily usage window.
    pub const DAILY: i64 = ONE_DAY;

    pub fn is_valid(window: i64) -> bool {
        window == ONE_SECOND || window == ONE_MINUTE || window == ONE_HOUR || window == ONE_DAY
    }
}

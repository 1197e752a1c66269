use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::engine::{Admission, Decision, QuotaEngine};
use crate::error::{guarded, ApiKeyError, ApiKeyResult};
use crate::record::{ApiKeyInfo, ApiKeyRecord};
use crate::store::KeyStore;
use crate::token::TokenHasher;
use crate::windows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    KeyInactive,
    RateLimitExceeded,
    DailyLimitExceeded,
}

/// What the transport layer needs to answer a validated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub admitted: bool,
    pub key_id: uuid::Uuid,
    pub owner_id: String,
    pub plan: String,
    pub daily_limit: u32,
    pub daily_remaining: u32,
    pub rate_remaining: u32,
    /// e.g. "100 requests per 60 seconds"
    pub rate_limit: String,
    pub reject_reason: Option<RejectReason>,
    pub retry_after_seconds: Option<u64>,
    pub message: Option<String>,
    #[serde(skip)]
    error: Option<ApiKeyError>,
}

impl Validation {
    fn from_admission(admission: Admission) -> Self {
        let usage = admission.usage();
        let error = match admission.decision {
            Decision::Admitted(_) => None,
            Decision::RejectedInactive => Some(ApiKeyError::KeyInactive),
            Decision::RejectedRateLimited { retry_after } => {
                Some(ApiKeyError::RateLimited { retry_after })
            }
            Decision::RejectedDailyLimitExceeded { retry_after } => {
                Some(ApiKeyError::DailyLimitExceeded { retry_after })
            }
        };
        let reject_reason = error.as_ref().map(|e| match e {
            ApiKeyError::RateLimited { .. } => RejectReason::RateLimitExceeded,
            ApiKeyError::DailyLimitExceeded { .. } => RejectReason::DailyLimitExceeded,
            _ => RejectReason::KeyInactive,
        });
        let record = admission.record;

        Self {
            admitted: error.is_none(),
            key_id: record.id,
            owner_id: record.owner_id,
            plan: record.plan,
            daily_limit: usage.daily_limit,
            daily_remaining: usage.daily_remaining(),
            rate_remaining: usage.rate_remaining(),
            rate_limit: admission.limits.describe_rate(),
            reject_reason,
            retry_after_seconds: error.as_ref().and_then(ApiKeyError::retry_after_secs),
            message: error.as_ref().map(ToString::to_string),
            error,
        }
    }

    /// `Ok(self)` when admitted, otherwise the matching typed error.
    pub fn into_result(self) -> ApiKeyResult<Validation> {
        match self.error {
            None => Ok(self),
            Some(error) => Err(error),
        }
    }
}

/// Read-only snapshot of a key's quota, as if expired windows had been reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub key: ApiKeyInfo,
    pub daily_used: u32,
    pub daily_limit: u32,
    pub daily_remaining: u32,
    pub rate_remaining: u32,
    pub rate_limit: String,
    /// When the current daily window closes, or `None` if it already has
    pub daily_resets_at: Option<DateTime<Utc>>,
}

/// Entry point for request middleware: token in, admission decision out.
pub struct ValidationGate {
    engine: Arc<QuotaEngine>,
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    hasher: TokenHasher,
    store_timeout: Duration,
}

impl ValidationGate {
    pub fn new(
        engine: Arc<QuotaEngine>,
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        hasher: TokenHasher,
        store_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            clock,
            hasher,
            store_timeout,
        }
    }

    async fn load(&self, token: &str) -> ApiKeyResult<ApiKeyRecord> {
        if !self.hasher.is_well_formed(token) {
            return Err(ApiKeyError::UnknownKey);
        }
        let hash = self.hasher.hash(token);
        guarded(
            "find_by_hash",
            self.store_timeout,
            self.store.find_by_hash(&hash),
        )
        .await?
        .ok_or(ApiKeyError::UnknownKey)
    }

    /// Looks the token up and consumes one unit of quota if admitted.
    ///
    /// Unknown tokens and storage failures are errors; quota and revocation
    /// rejections come back as a [`Validation`] with `admitted == false`.
    pub async fn validate(&self, token: &str) -> ApiKeyResult<Validation> {
        let record = self.load(token).await?;
        let admission = self.engine.admit(&record).await?;
        Ok(Validation::from_admission(admission))
    }

    /// Quota status without consuming any.
    pub async fn inspect(&self, token: &str) -> ApiKeyResult<KeyStatus> {
        let record = self.load(token).await?;
        let limits = self.engine.catalog().limits(&record.plan);
        let now = self.clock.now();
        let daily_len = chrono::Duration::seconds(windows::DAILY);

        let daily_used = record.daily_window.effective_count(now, daily_len);
        let rate_used = record.rate_window.effective_count(now, limits.rate_window());
        let daily_resets_at = if record.daily_window.is_expired(now, daily_len) {
            None
        } else {
            Some(record.daily_window.ends_at(daily_len))
        };

        Ok(KeyStatus {
            key: record.info(),
            daily_used,
            daily_limit: limits.daily_limit,
            daily_remaining: limits.daily_limit.saturating_sub(daily_used),
            rate_remaining: limits.rate_limit.saturating_sub(rate_used),
            rate_limit: limits.describe_rate(),
            daily_resets_at,
        })
    }
}

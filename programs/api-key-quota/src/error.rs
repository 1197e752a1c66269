use std::future::Future;
use std::time::Duration;

use log::error;
use thiserror::Error;

// ============================================================================
// Storage errors (never cross the engine boundary)
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("duplicate key hash")]
    Duplicate,

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Public taxonomy
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiKeyError {
    #[error("Owner not found")]
    OwnerNotFound,

    #[error("Subscription plan has expired")]
    PlanExpired,

    #[error("Maximum API keys limit reached ({max_keys}) for your plan")]
    KeyLimitReached { max_keys: u32 },

    #[error("API key not found")]
    KeyNotFound,

    #[error("Name must be 1-32 characters")]
    InvalidName,

    #[error("Invalid plan configuration: {0}")]
    InvalidPlan(String),

    #[error("Invalid API key")]
    UnknownKey,

    #[error("API key is inactive")]
    KeyInactive,

    #[error("Rate limit exceeded. Please wait {} seconds.", retry_after_secs(.retry_after))]
    RateLimited { retry_after: chrono::Duration },

    #[error("Daily limit exceeded. Resets in {} seconds.", retry_after_secs(.retry_after))]
    DailyLimitExceeded { retry_after: chrono::Duration },

    #[error("API key service temporarily unavailable")]
    EngineUnavailable,
}

pub type ApiKeyResult<T> = Result<T, ApiKeyError>;

impl ApiKeyError {
    /// HTTP status the transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiKeyError::OwnerNotFound | ApiKeyError::KeyNotFound => 404,
            ApiKeyError::PlanExpired
            | ApiKeyError::KeyLimitReached { .. }
            | ApiKeyError::InvalidName => 400,
            ApiKeyError::UnknownKey | ApiKeyError::KeyInactive => 401,
            ApiKeyError::RateLimited { .. } | ApiKeyError::DailyLimitExceeded { .. } => 429,
            ApiKeyError::InvalidPlan(_) | ApiKeyError::EngineUnavailable => 503,
        }
    }

    /// Machine-readable reason string.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ApiKeyError::OwnerNotFound => "OWNER_NOT_FOUND",
            ApiKeyError::PlanExpired => "PLAN_EXPIRED",
            ApiKeyError::KeyLimitReached { .. } => "KEY_LIMIT_REACHED",
            ApiKeyError::KeyNotFound => "KEY_NOT_FOUND",
            ApiKeyError::InvalidName => "INVALID_NAME",
            ApiKeyError::InvalidPlan(_) => "INVALID_PLAN",
            ApiKeyError::UnknownKey => "UNKNOWN_KEY",
            ApiKeyError::KeyInactive => "KEY_INACTIVE",
            ApiKeyError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ApiKeyError::DailyLimitExceeded { .. } => "DAILY_LIMIT_EXCEEDED",
            ApiKeyError::EngineUnavailable => "ENGINE_UNAVAILABLE",
        }
    }

    /// Seconds the client should wait, for the two quota rejections only.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiKeyError::RateLimited { retry_after }
            | ApiKeyError::DailyLimitExceeded { retry_after } => {
                Some(retry_after_secs(retry_after))
            }
            _ => None,
        }
    }
}

/// Whole seconds, rounded up, never below one.
pub fn retry_after_secs(retry_after: &chrono::Duration) -> u64 {
    let millis = retry_after.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

/// Runs a store call under `timeout`, normalizing every failure to
/// [`ApiKeyError::EngineUnavailable`]. The detail is logged here and dropped.
pub(crate) async fn guarded<T, F>(
    op: &'static str,
    timeout: Duration,
    fut: F,
) -> ApiKeyResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    };
    result.map_err(|e| {
        error!("key store {op} failed: {e}");
        ApiKeyError::EngineUnavailable
    })
}

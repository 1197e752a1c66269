use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::token::TokenHash;

/// One fixed window: when it opened and how many admissions it has seen.
/// `count` only means something relative to `start`; both are reset together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowCounter {
    pub start: DateTime<Utc>,
    pub count: u32,
}

impl WindowCounter {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { start: now, count: 0 }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, length: Duration) -> bool {
        now.signed_duration_since(self.start) >= length
    }

    /// Opens a fresh window if this one has run its length. Returns whether it did.
    pub fn roll(&mut self, now: DateTime<Utc>, length: Duration) -> bool {
        if !self.is_expired(now, length) {
            return false;
        }
        *self = Self::new(now);
        true
    }

    /// Count as it would read after a roll at `now`, without rolling.
    pub fn effective_count(&self, now: DateTime<Utc>, length: Duration) -> u32 {
        if self.is_expired(now, length) {
            0
        } else {
            self.count
        }
    }

    pub fn ends_at(&self, length: Duration) -> DateTime<Utc> {
        self.start + length
    }

    /// Time until this window closes, never negative.
    pub fn retry_after(&self, now: DateTime<Utc>, length: Duration) -> Duration {
        self.ends_at(length)
            .signed_duration_since(now)
            .max(Duration::zero())
    }
}

/// Persisted state of one issued key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    /// Peppered SHA-256 of the token; the token itself is never stored
    pub token_hash: TokenHash,
    /// First characters of the token, for display
    pub key_prefix: String,
    pub owner_id: String,
    pub name: String,
    /// Fixed at creation
    pub plan: String,
    /// `false` is terminal
    pub is_active: bool,
    pub rate_window: WindowCounter,
    pub daily_window: WindowCounter,
    /// `None` until the first admission
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every persisted mutation
    pub version: u64,
}

impl ApiKeyRecord {
    pub fn new(
        token_hash: TokenHash,
        key_prefix: String,
        owner_id: String,
        name: String,
        plan: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            token_hash,
            key_prefix,
            owner_id,
            name,
            plan,
            is_active: true,
            rate_window: WindowCounter::new(now),
            daily_window: WindowCounter::new(now),
            last_used_at: None,
            created_at: now,
            version: 0,
        }
    }

    pub fn info(&self) -> ApiKeyInfo {
        ApiKeyInfo {
            id: self.id,
            key_prefix: self.key_prefix.clone(),
            owner_id: self.owner_id.clone(),
            name: self.name.clone(),
            plan: self.plan.clone(),
            is_active: self.is_active,
            daily_usage_count: self.daily_window.count,
            rate_window_count: self.rate_window.count,
            last_used_at: self.last_used_at,
            created_at: self.created_at,
        }
    }
}

/// A key as shown to its owner: no token, no hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyInfo {
    pub id: Uuid,
    pub key_prefix: String,
    pub owner_id: String,
    pub name: String,
    pub plan: String,
    pub is_active: bool,
    pub daily_usage_count: u32,
    pub rate_window_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Returned exactly once, when a key is issued. `api_key` is unrecoverable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeySecret {
    #[serde(flatten)]
    pub info: ApiKeyInfo,
    pub api_key: String,
}

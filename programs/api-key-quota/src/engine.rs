//! Per-key admission state machine.
//!
//! Each key carries two fixed windows, daily and rate. On every evaluation an
//! expired window is replaced by a fresh one (count 0, start = now) before its
//! limit is checked; there is no intermediate state and no partial decay.
//! The daily window is evaluated first, so a key that is out of daily quota is
//! reported as such even when its rate window is also full.
//!
//! [`QuotaEngine::admit`] makes the read-evaluate-write sequence atomic per key:
//! callers for the same key are queued on a per-key mutex, and the write is a
//! single versioned [`KeyStore::compare_and_update`].

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::clock::Clock;
use crate::error::{guarded, ApiKeyError, ApiKeyResult};
use crate::plan::{PlanCatalog, PlanLimits};
use crate::record::ApiKeyRecord;
use crate::store::KeyStore;
use crate::token::TokenHash;
use crate::windows;

/// Counter values after an evaluation. A window that has already run its
/// length counts as empty even if the record still holds its old count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub daily_used: u32,
    pub daily_limit: u32,
    pub rate_used: u32,
    pub rate_limit: u32,
}

impl Usage {
    fn of(record: &ApiKeyRecord, limits: &PlanLimits, now: DateTime<Utc>) -> Self {
        Self {
            daily_used: record
                .daily_window
                .effective_count(now, Duration::seconds(windows::DAILY)),
            daily_limit: limits.daily_limit,
            rate_used: record.rate_window.effective_count(now, limits.rate_window()),
            rate_limit: limits.rate_limit,
        }
    }

    pub fn daily_remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.daily_used)
    }

    pub fn rate_remaining(&self) -> u32 {
        self.rate_limit.saturating_sub(self.rate_used)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted(Usage),
    RejectedRateLimited { retry_after: Duration },
    RejectedDailyLimitExceeded { retry_after: Duration },
    RejectedInactive,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted(_))
    }
}

/// Outcome of one evaluation against a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    /// Whether the record was modified and must be persisted
    pub changed: bool,
}

/// Applies one admission attempt to `record` at `now`. Pure: no I/O.
pub fn evaluate(record: &mut ApiKeyRecord, limits: &PlanLimits, now: DateTime<Utc>) -> Evaluation {
    if !record.is_active {
        return Evaluation {
            decision: Decision::RejectedInactive,
            changed: false,
        };
    }

    let daily_len = Duration::seconds(windows::DAILY);
    let mut changed = record.daily_window.roll(now, daily_len);
    if record.daily_window.count >= limits.daily_limit {
        return Evaluation {
            decision: Decision::RejectedDailyLimitExceeded {
                retry_after: record.daily_window.retry_after(now, daily_len),
            },
            changed,
        };
    }

    let rate_len = limits.rate_window();
    changed |= record.rate_window.roll(now, rate_len);
    if record.rate_window.count >= limits.rate_limit {
        return Evaluation {
            decision: Decision::RejectedRateLimited {
                retry_after: record.rate_window.retry_after(now, rate_len),
            },
            changed,
        };
    }

    // both counts are below their limits, so neither can overflow
    record.daily_window.count += 1;
    record.rate_window.count += 1;
    record.last_used_at = Some(now);

    Evaluation {
        decision: Decision::Admitted(Usage::of(record, limits, now)),
        changed: true,
    }
}

// ============================================================================
// Per-key serialization
// ============================================================================

/// Lazily created async mutex per key. Entries are dropped once nobody holds
/// or waits on them.
pub(crate) struct KeyLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub(crate) async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

pub(crate) struct KeyGuard<'a, K: Eq + Hash> {
    owner: &'a KeyLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // map's own reference is the only one left: nobody holds or waits
        self.owner
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub decision: Decision,
    /// The record as persisted after this evaluation
    pub record: ApiKeyRecord,
    pub limits: PlanLimits,
    pub evaluated_at: DateTime<Utc>,
}

impl Admission {
    pub fn usage(&self) -> Usage {
        Usage::of(&self.record, &self.limits, self.evaluated_at)
    }
}

pub struct QuotaEngine {
    store: Arc<dyn KeyStore>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks<TokenHash>,
    store_timeout: StdDuration,
    conflict_retries: u32,
}

impl QuotaEngine {
    pub fn new(
        store: Arc<dyn KeyStore>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        store_timeout: StdDuration,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            locks: KeyLocks::new(),
            store_timeout,
            conflict_retries,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Evaluates one request against `record` and persists the result.
    ///
    /// `record` only identifies the key; the evaluation always runs against the
    /// stored copy, re-read under the key's lock. An inactive key is rejected
    /// without touching the store. Any storage failure or timeout yields
    /// [`ApiKeyError::EngineUnavailable`], never an admission.
    pub async fn admit(&self, record: &ApiKeyRecord) -> ApiKeyResult<Admission> {
        if !record.is_active {
            return Ok(Admission {
                decision: Decision::RejectedInactive,
                record: record.clone(),
                limits: self.catalog.limits(&record.plan),
                evaluated_at: self.clock.now(),
            });
        }

        let hash = record.token_hash;
        let _guard = self.locks.lock(&hash).await;

        // The lock serializes callers in this process; a conflict means some
        // other writer (revocation, another process) got in between.
        for attempt in 0..=self.conflict_retries {
            let mut current = guarded(
                "find_by_hash",
                self.store_timeout,
                self.store.find_by_hash(&hash),
            )
            .await?
            .ok_or(ApiKeyError::UnknownKey)?;

            let limits = self.catalog.limits(&current.plan);
            let now = self.clock.now();
            let Evaluation { decision, changed } = evaluate(&mut current, &limits, now);

            if !changed {
                log_rejection(&current, &decision);
                return Ok(Admission {
                    decision,
                    record: current,
                    limits,
                    evaluated_at: now,
                });
            }

            let expected = current.version;
            current.version += 1;
            let stored = guarded(
                "compare_and_update",
                self.store_timeout,
                self.store
                    .compare_and_update(&hash, expected, current.clone()),
            )
            .await?;

            if stored {
                log_rejection(&current, &decision);
                return Ok(Admission {
                    decision,
                    record: current,
                    limits,
                    evaluated_at: now,
                });
            }
            warn!(
                "version conflict on key {} (expected {expected}, attempt {})",
                current.id,
                attempt + 1
            );
        }

        warn!("giving up on key {:?} after repeated conflicts", hash);
        Err(ApiKeyError::EngineUnavailable)
    }
}

fn log_rejection(record: &ApiKeyRecord, decision: &Decision) {
    match decision {
        Decision::Admitted(_) => {}
        Decision::RejectedInactive => debug!("key {} rejected: inactive", record.id),
        Decision::RejectedDailyLimitExceeded { retry_after } => debug!(
            "key {} rejected: daily limit, retry in {}s",
            record.id,
            retry_after.num_seconds()
        ),
        Decision::RejectedRateLimited { retry_after } => debug!(
            "key {} rejected: rate limit, retry in {}s",
            record.id,
            retry_after.num_seconds()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn record_at(now: DateTime<Utc>) -> ApiKeyRecord {
        ApiKeyRecord::new(
            TokenHash::from_bytes([7; 32]),
            "veh_00000000".into(),
            "owner".into(),
            "test".into(),
            "free".into(),
            now,
        )
    }

    #[test]
    fn admitted_request_increments_both_counters() {
        let limits = PlanLimits::new(10, 5, windows::ONE_MINUTE, 1);
        let mut record = record_at(t0());
        let now = t0() + Duration::seconds(1);

        let eval = evaluate(&mut record, &limits, now);
        assert!(eval.changed);
        assert_eq!(
            eval.decision,
            Decision::Admitted(Usage {
                daily_used: 1,
                daily_limit: 10,
                rate_used: 1,
                rate_limit: 5,
            })
        );
        assert_eq!(record.last_used_at, Some(now));
    }

    #[test]
    fn inactive_record_is_untouched() {
        let limits = PlanLimits::new(10, 5, windows::ONE_MINUTE, 1);
        let mut record = record_at(t0());
        record.is_active = false;
        let before = record.clone();

        let eval = evaluate(&mut record, &limits, t0() + Duration::days(3));
        assert_eq!(eval.decision, Decision::RejectedInactive);
        assert!(!eval.changed);
        assert_eq!(record, before);
    }

    #[test]
    fn daily_reason_wins_when_both_windows_are_full() {
        let limits = PlanLimits::new(3, 3, windows::ONE_MINUTE, 1);
        let mut record = record_at(t0());
        record.daily_window.count = 3;
        record.rate_window.count = 3;

        let eval = evaluate(&mut record, &limits, t0() + Duration::seconds(10));
        assert_eq!(
            eval.decision,
            Decision::RejectedDailyLimitExceeded {
                retry_after: Duration::seconds(windows::DAILY - 10)
            }
        );
        assert!(!eval.changed);
    }

    #[test]
    fn rate_rejection_reports_time_to_window_end() {
        let limits = PlanLimits::new(100, 2, windows::ONE_MINUTE, 1);
        let mut record = record_at(t0());
        record.rate_window.count = 2;

        let eval = evaluate(&mut record, &limits, t0() + Duration::seconds(20));
        assert_eq!(
            eval.decision,
            Decision::RejectedRateLimited {
                retry_after: Duration::seconds(40)
            }
        );
    }

    #[test]
    fn daily_reset_is_kept_even_when_rate_rejects() {
        let limits = PlanLimits::new(5, 1, windows::ONE_DAY, 1);
        let mut record = record_at(t0());
        record.daily_window.count = 5;
        record.rate_window = crate::record::WindowCounter {
            start: t0() + Duration::hours(12),
            count: 1,
        };

        let now = t0() + Duration::days(1);
        let eval = evaluate(&mut record, &limits, now);
        assert!(matches!(eval.decision, Decision::RejectedRateLimited { .. }));
        assert!(eval.changed);
        assert_eq!(record.daily_window.start, now);
        assert_eq!(record.daily_window.count, 0);
    }

    #[test]
    fn rollover_exactly_at_boundary_gets_fresh_budget() {
        let limits = PlanLimits::new(5, 100, windows::ONE_MINUTE, 1);
        let mut record = record_at(t0());
        record.daily_window.count = 5;

        let eval = evaluate(&mut record, &limits, t0() + Duration::seconds(windows::DAILY));
        assert!(eval.decision.is_admitted());
        assert_eq!(record.daily_window.count, 1);
    }

    #[test]
    fn usage_ignores_expired_rate_window_on_daily_rejection() {
        let limits = PlanLimits::new(3, 3, windows::ONE_MINUTE, 1);
        let mut record = record_at(t0());
        record.daily_window.count = 3;
        record.rate_window.count = 3;

        let now = t0() + Duration::minutes(2);
        let eval = evaluate(&mut record, &limits, now);
        assert!(matches!(eval.decision, Decision::RejectedDailyLimitExceeded { .. }));
        // rate window was not rolled, but it has expired
        assert_eq!(record.rate_window.count, 3);
        let usage = Usage::of(&record, &limits, now);
        assert_eq!(usage.rate_remaining(), 3);
        assert_eq!(usage.daily_remaining(), 0);
    }

    #[tokio::test]
    async fn key_locks_are_released_after_use() {
        let locks = KeyLocks::new();
        {
            let _a = locks.lock(&"a".to_string()).await;
            let _b = locks.lock(&"b".to_string()).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn key_lock_excludes_second_holder() {
        let locks = Arc::new(KeyLocks::new());
        let key = "k".to_string();
        let guard = locks.lock(&key).await;

        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&key).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{ApiKeyError, ApiKeyResult};
use crate::windows;

/// Plan every unknown or missing plan id resolves to. It is the most restrictive
/// built-in tier, so an unrecognized plan never gets more headroom than this.
pub const DEFAULT_PLAN: &str = "free";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    /// Admissions per daily window
    pub daily_limit: u32,
    /// Admissions per rate window
    pub rate_limit: u32,
    /// Rate window length in seconds (see [`windows`])
    pub rate_window_secs: i64,
    /// Maximum active keys one owner may hold
    pub max_keys: u32,
}

impl PlanLimits {
    pub const fn new(
        daily_limit: u32,
        rate_limit: u32,
        rate_window_secs: i64,
        max_keys: u32,
    ) -> Self {
        Self {
            daily_limit,
            rate_limit,
            rate_window_secs,
            max_keys,
        }
    }

    fn validate(&self, plan: &str) -> ApiKeyResult<()> {
        if self.daily_limit == 0 || self.rate_limit == 0 || self.max_keys == 0 {
            return Err(ApiKeyError::InvalidPlan(format!("{plan}: limits must be non-zero")));
        }
        if !windows::is_valid(self.rate_window_secs) {
            return Err(ApiKeyError::InvalidPlan(format!(
                "{plan}: rate window must be 1, 60, 3600 or 86400 seconds"
            )));
        }
        Ok(())
    }

    pub fn rate_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.rate_window_secs)
    }

    /// Human-readable rate limit, used in 429 bodies.
    pub fn describe_rate(&self) -> String {
        let unit = if self.rate_limit == 1 { "request" } else { "requests" };
        let per = if self.rate_window_secs == 1 {
            "second".to_string()
        } else {
            format!("{} seconds", self.rate_window_secs)
        };
        format!("{} {unit} per {per}", self.rate_limit)
    }
}

const BUILTIN_PLANS: [(&str, PlanLimits); 4] = [
    (DEFAULT_PLAN, PlanLimits::new(1_000, 100, windows::ONE_MINUTE, 100)),
    ("basic", PlanLimits::new(5_000, 200, windows::ONE_MINUTE, 500)),
    ("premium", PlanLimits::new(20_000, 600, windows::ONE_MINUTE, 1_000)),
    ("enterprise", PlanLimits::new(100_000, 1, windows::ONE_SECOND, 2_000)),
];

/// Immutable plan table. Build it once at startup and share it.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<String, PlanLimits>,
}

impl PlanCatalog {
    pub fn builtin() -> Self {
        let plans = BUILTIN_PLANS
            .iter()
            .map(|(id, limits)| (id.to_string(), *limits))
            .collect();
        Self { plans }
    }

    /// Builds a catalog from explicit entries. The default plan must be present.
    pub fn from_plans<I, S>(entries: I) -> ApiKeyResult<Self>
    where
        I: IntoIterator<Item = (S, PlanLimits)>,
        S: Into<String>,
    {
        let mut plans = HashMap::new();
        for (id, limits) in entries {
            let id = id.into();
            limits.validate(&id)?;
            plans.insert(id, limits);
        }
        if !plans.contains_key(DEFAULT_PLAN) {
            return Err(ApiKeyError::InvalidPlan(format!(
                "default plan '{DEFAULT_PLAN}' is missing"
            )));
        }
        Ok(Self { plans })
    }

    pub fn contains(&self, plan: &str) -> bool {
        self.plans.contains_key(plan)
    }

    /// Limits for `plan`, or the default plan's limits if it is unknown.
    pub fn limits(&self, plan: &str) -> PlanLimits {
        match self.plans.get(plan) {
            Some(limits) => *limits,
            None => self.default_limits(),
        }
    }

    pub fn default_limits(&self) -> PlanLimits {
        // from_plans and builtin both guarantee the entry exists
        self.plans
            .get(DEFAULT_PLAN)
            .copied()
            .unwrap_or(BUILTIN_PLANS[0].1)
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

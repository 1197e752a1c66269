use std::fmt;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Debug, Clone, Envconfig)]
pub struct QuotaConfig {
    /// Prefix of newly issued tokens. Changing it stops older tokens from
    /// validating; their owners can still revoke them.
    #[envconfig(from = "API_KEY_PREFIX", default = "veh_")]
    pub key_prefix: String,

    #[envconfig(from = "API_KEY_STORE_TIMEOUT_MS", default = "2000")]
    pub store_timeout_ms: u64,

    #[envconfig(from = "API_KEY_CONFLICT_RETRIES", default = "3")]
    pub conflict_retries: u32,
}

impl QuotaConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            key_prefix: "veh_".to_string(),
            store_timeout_ms: 2000,
            conflict_retries: 3,
        }
    }
}

#[derive(Clone, Envconfig)]
pub struct Secrets {
    /// Mixed into every token hash. Changing it invalidates all issued keys.
    #[envconfig(from = "API_KEY_HASH_PEPPER")]
    pub hash_pepper: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("hash_pepper", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub quota: QuotaConfig,
    pub secrets: Secrets,
}

impl AppConfig {
    pub fn fetch() -> Result<Self, envconfig::Error> {
        let quota = QuotaConfig::init_from_env()?;
        let secrets = Secrets::init_from_env()?;
        Ok(Self { quota, secrets })
    }

    /// Default settings with the given pepper.
    pub fn with_pepper(pepper: impl Into<String>) -> Self {
        Self {
            quota: QuotaConfig::default(),
            secrets: Secrets {
                hash_pepper: pepper.into(),
            },
        }
    }
}

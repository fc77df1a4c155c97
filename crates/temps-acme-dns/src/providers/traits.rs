//! Challenge provider trait definitions
//!
//! A provider publishes and removes the `_acme-challenge` TXT record through
//! some hosting API. Propagation is verified independently of the provider,
//! over public DNS, so the trait only covers the write side plus the polling
//! parameters the provider knows best.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Default time to wait for a record to propagate
pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default pause between two propagation checks
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);

/// How long to poll for propagation, and how often
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTimeout {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for ProviderTimeout {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROPAGATION_TIMEOUT,
            interval: DEFAULT_POLLING_INTERVAL,
        }
    }
}

impl ProviderTimeout {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "polling interval must be greater than zero".to_string(),
            ));
        }
        if self.interval > self.timeout {
            return Err(ConfigError::InvalidTimeout(format!(
                "polling interval {:?} exceeds timeout {:?}",
                self.interval, self.timeout
            )));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Publishes DNS-01 challenge records
///
/// `present` and `clean_up` receive the challenged domain, the ACME token and
/// the key authorization; the provider derives the record name and value
/// itself (see [`crate::challenge::ChallengeInfo`]).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// Short provider name used in logs
    fn name(&self) -> &str;

    /// Create the TXT record for the challenge
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> anyhow::Result<()>;

    /// Remove the TXT record created by `present`
    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> anyhow::Result<()>;

    /// Propagation timeout and polling interval suited to this provider
    fn timeout(&self) -> ProviderTimeout {
        ProviderTimeout::default()
    }

    /// Pause between challenges when the backend cannot take concurrent
    /// updates. `None` lets challenges run concurrently.
    fn sequential(&self) -> Option<Duration> {
        None
    }
}

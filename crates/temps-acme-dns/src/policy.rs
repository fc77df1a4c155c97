//! Challenge options and check layers
//!
//! A [`ChallengeOption`] is a named mutation of a [`PropagationPolicy`],
//! applied once when a challenge is built. Options that change *how* the
//! check runs install a [`CheckLayer`]; layers nest like middleware around
//! the propagation checker, the last one applied being the outermost.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{ConfigError, PropagationError};
use crate::providers::ProviderTimeout;
use crate::services::propagation_service::{PreCheck, PropagationRequirements};

/// Arguments of a single propagation check
#[derive(Debug, Clone, Copy)]
pub struct CheckRequest<'a> {
    pub cancel: &'a CancellationToken,
    pub domain: &'a str,
    pub fqdn: &'a str,
    pub value: &'a str,
}

/// Decorator around the propagation check
///
/// A layer decides whether and when to call `next`; it must hand back the
/// result of `next` unchanged or return its own verdict, and must not
/// swallow cancellation.
#[async_trait]
pub trait CheckLayer: Send + Sync {
    async fn check(
        &self,
        request: CheckRequest<'_>,
        next: Next<'_>,
    ) -> Result<bool, PropagationError>;
}

/// The rest of the layer chain, ending in the checker
#[derive(Clone, Copy)]
pub struct Next<'a> {
    layers: &'a [Arc<dyn CheckLayer>],
    inner: &'a dyn PreCheck,
}

impl<'a> Next<'a> {
    pub fn new(layers: &'a [Arc<dyn CheckLayer>], inner: &'a dyn PreCheck) -> Self {
        Self { layers, inner }
    }

    /// Runs the remaining chain, outermost (last applied) layer first.
    pub async fn run(self, request: CheckRequest<'_>) -> Result<bool, PropagationError> {
        match self.layers.split_last() {
            Some((layer, rest)) => {
                layer
                    .check(
                        request,
                        Next {
                            layers: rest,
                            inner: self.inner,
                        },
                    )
                    .await
            }
            None => {
                self.inner
                    .check(request.cancel, request.fqdn, request.value)
                    .await
            }
        }
    }
}

/// Configuration assembled from challenge options
#[derive(Clone, Default)]
pub struct PropagationPolicy {
    pub requirements: PropagationRequirements,
    pub layers: Vec<Arc<dyn CheckLayer>>,
    /// Overrides the provider's timeout and polling interval
    pub timeout: Option<ProviderTimeout>,
    skips_check: bool,
}

impl fmt::Debug for PropagationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagationPolicy")
            .field("requirements", &self.requirements)
            .field("layers", &self.layers.len())
            .field("timeout", &self.timeout)
            .field("skips_check", &self.skips_check)
            .finish()
    }
}

impl PropagationPolicy {
    /// Applies `options` in order to `base` and validates the result.
    pub fn build(
        base: PropagationRequirements,
        options: impl IntoIterator<Item = ChallengeOption>,
    ) -> Result<Self, ConfigError> {
        let mut policy = Self {
            requirements: base,
            ..Default::default()
        };
        for option in options {
            option.apply(&mut policy)?;
        }
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_options(options: impl IntoIterator<Item = ChallengeOption>) -> Result<Self, ConfigError> {
        Self::build(PropagationRequirements::default(), options)
    }

    /// Whether a layer answers without ever querying DNS.
    pub fn skips_check(&self) -> bool {
        self.skips_check
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.skips_check && self.requirements.recursive {
            return Err(ConfigError::Conflict(
                "recursive propagation is required but the propagation check is skipped"
                    .to_string(),
            ));
        }
        if let Some(timeout) = &self.timeout {
            timeout.validate()?;
        }
        Ok(())
    }
}

type ApplyFn = Box<dyn FnOnce(&mut PropagationPolicy) -> Result<(), ConfigError> + Send>;

/// A mutation applied to the policy when a challenge is built
pub struct ChallengeOption(ApplyFn);

impl ChallengeOption {
    pub fn new(
        apply: impl FnOnce(&mut PropagationPolicy) -> Result<(), ConfigError> + Send + 'static,
    ) -> Self {
        Self(Box::new(apply))
    }

    /// Option that changes nothing.
    pub fn noop() -> Self {
        Self::new(|_| Ok(()))
    }

    pub fn apply(self, policy: &mut PropagationPolicy) -> Result<(), ConfigError> {
        (self.0)(policy)
    }
}

impl fmt::Debug for ChallengeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChallengeOption")
    }
}

/// Skip the authoritative nameservers and only check the recursive resolver.
pub fn disable_authoritative_nss_propagation_requirement() -> ChallengeOption {
    ChallengeOption::new(|policy| {
        policy.requirements.authoritative = false;
        Ok(())
    })
}

/// Additionally require the recursive resolvers to serve the record.
pub fn recursive_nss_propagation_requirement() -> ChallengeOption {
    ChallengeOption::new(|policy| {
        policy.requirements.recursive = true;
        Ok(())
    })
}

/// Wait `wait` before checking. With `skip_check`, report success after the
/// wait without querying DNS at all.
pub fn propagation_wait(wait: Duration, skip_check: bool) -> ChallengeOption {
    ChallengeOption::new(move |policy| {
        policy.skips_check |= skip_check;
        policy
            .layers
            .push(Arc::new(PropagationWait::new(wait, skip_check)));
        Ok(())
    })
}

/// Wraps the check in `layer`.
pub fn wrap_pre_check(layer: impl CheckLayer + 'static) -> ChallengeOption {
    let layer: Arc<dyn CheckLayer> = Arc::new(layer);
    ChallengeOption::new(move |policy| {
        policy.layers.push(layer);
        Ok(())
    })
}

/// Override the provider's propagation timeout and polling interval.
pub fn propagation_timeout(timeout: Duration, interval: Duration) -> ChallengeOption {
    ChallengeOption::new(move |policy| {
        let timeout = ProviderTimeout { timeout, interval };
        timeout.validate()?;
        policy.timeout = Some(timeout);
        Ok(())
    })
}

/// `option` when `condition` holds, a no-op otherwise.
pub fn cond_option(condition: bool, option: ChallengeOption) -> ChallengeOption {
    if condition {
        option
    } else {
        ChallengeOption::noop()
    }
}

/// Sleeps before delegating to the inner check
#[derive(Debug, Clone, Copy)]
pub struct PropagationWait {
    wait: Duration,
    skip_check: bool,
}

impl PropagationWait {
    pub fn new(wait: Duration, skip_check: bool) -> Self {
        Self { wait, skip_check }
    }
}

#[async_trait]
impl CheckLayer for PropagationWait {
    async fn check(
        &self,
        request: CheckRequest<'_>,
        next: Next<'_>,
    ) -> Result<bool, PropagationError> {
        debug!(domain = %request.domain, wait = ?self.wait, "Waiting before propagation check");

        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(PropagationError::Cancelled),
            _ = tokio::time::sleep(self.wait) => {}
        }

        if self.skip_check {
            return Ok(true);
        }
        next.run(request).await
    }
}

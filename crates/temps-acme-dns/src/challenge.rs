//! DNS-01 challenge orchestration
//!
//! Ties a [`ChallengeProvider`] to the propagation checker:
//! 1. Publish the TXT record through the provider
//! 2. Poll public DNS until every required nameserver serves it
//! 3. Remove the record once the CA has validated it

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{RData, RecordType};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, DnsError, PropagationError};
use crate::fqdn::{challenge_fqdn, parse_name, to_fqdn};
use crate::policy::{ChallengeOption, CheckRequest, Next, PropagationPolicy};
use crate::providers::{ChallengeProvider, ProviderTimeout};
use crate::services::propagation_service::{PropagationChecker, PropagationRequirements};
use crate::services::zone_service::ZoneCache;
use crate::transport::DnsClient;
use crate::wait::wait_for;

/// Longest CNAME chain followed from the challenge record name
pub const MAX_CNAME_HOPS: usize = 50;

/// Everything needed to publish and verify one DNS-01 challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeInfo {
    /// Identifier being validated, as given by the CA
    pub domain: String,
    pub token: String,
    pub key_auth: String,
    /// `_acme-challenge.<domain>.`
    pub fqdn: String,
    /// Name the record actually lives at, after following CNAMEs
    pub effective_fqdn: String,
    /// TXT value the CA expects
    pub expected_value: String,
}

impl ChallengeInfo {
    /// Challenge info for `domain` without any DNS lookup.
    pub fn new(domain: &str, token: &str, key_auth: &str) -> Self {
        let fqdn = challenge_fqdn(domain);
        Self {
            domain: domain.to_string(),
            token: token.to_string(),
            key_auth: key_auth.to_string(),
            effective_fqdn: fqdn.clone(),
            fqdn,
            expected_value: key_authorization_digest(key_auth),
        }
    }

    /// Challenge info whose `effective_fqdn` follows the CNAME chain of the
    /// challenge record through the recursive nameservers.
    pub async fn resolve(
        client: &DnsClient,
        cancel: &CancellationToken,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> Result<Self, DnsError> {
        let mut info = Self::new(domain, token, key_auth);
        info.effective_fqdn = follow_cnames(client, cancel, &info.fqdn).await?;
        if info.effective_fqdn != info.fqdn {
            info!(
                fqdn = %info.fqdn,
                effective_fqdn = %info.effective_fqdn,
                "Challenge record delegated through CNAME"
            );
        }
        Ok(info)
    }
}

/// DNS-01 TXT value: base64url (no padding) of the SHA-256 of the key authorization.
pub fn key_authorization_digest(key_auth: &str) -> String {
    let digest = Sha256::digest(key_auth.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Follows CNAME records from `fqdn`.
///
/// A failed lookup ends the chain at the current name; the provider record
/// is then expected there.
async fn follow_cnames(
    client: &DnsClient,
    cancel: &CancellationToken,
    fqdn: &str,
) -> Result<String, DnsError> {
    let mut current = to_fqdn(fqdn);
    let mut seen = vec![current.clone()];

    loop {
        let name = parse_name(&current)?;
        let response = match client.recursive_query(cancel, &name, RecordType::CNAME).await {
            Ok(response) => response,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(name = %current, error = %e, "CNAME lookup failed, stopping here");
                return Ok(current);
            }
        };

        if response.response_code() != ResponseCode::NoError {
            return Ok(current);
        }

        let target = response
            .answers()
            .iter()
            .filter(|record| record.name() == &name)
            .find_map(|record| match record.data() {
                RData::CNAME(cname) => Some(to_fqdn(&cname.0.to_string())),
                _ => None,
            });

        let Some(target) = target else {
            return Ok(current);
        };

        if seen.contains(&target) {
            return Err(DnsError::new(format!(
                "CNAME loop detected for '{}': {} -> {}",
                fqdn,
                seen.join(" -> "),
                target
            ))
            .with_msg_in(response));
        }
        if seen.len() > MAX_CNAME_HOPS {
            return Err(DnsError::new(format!(
                "too many CNAME records following '{}' (more than {})",
                fqdn, MAX_CNAME_HOPS
            ))
            .with_msg_in(response));
        }

        debug!(from = %current, to = %target, "Following CNAME");
        seen.push(target.clone());
        current = target;
    }
}

/// Publishes challenge records and waits for them to propagate
pub struct Dns01Challenge {
    provider: Arc<dyn ChallengeProvider>,
    checker: PropagationChecker,
    policy: PropagationPolicy,
}

impl Dns01Challenge {
    /// Applies `options` on top of the requirements derived from the client
    /// configuration. Invalid or conflicting options, and an invalid provider
    /// timeout that no option overrides, are rejected here.
    pub fn new(
        provider: Arc<dyn ChallengeProvider>,
        client: DnsClient,
        zone_cache: Arc<ZoneCache>,
        options: impl IntoIterator<Item = ChallengeOption>,
    ) -> Result<Self, ConfigError> {
        client.config().validate()?;

        let base = PropagationRequirements {
            authoritative: client.config().require_complete_propagation,
            ..Default::default()
        };
        let policy = PropagationPolicy::build(base, options)?;
        if policy.timeout.is_none() {
            provider.timeout().validate()?;
        }
        let checker = PropagationChecker::new(client, zone_cache).with_requirements(policy.requirements);

        Ok(Self {
            provider,
            checker,
            policy,
        })
    }

    pub fn policy(&self) -> &PropagationPolicy {
        &self.policy
    }

    pub fn checker(&self) -> &PropagationChecker {
        &self.checker
    }

    /// Polling parameters: an explicit option wins over the provider's own.
    pub fn timeout(&self) -> ProviderTimeout {
        self.policy.timeout.unwrap_or_else(|| self.provider.timeout())
    }

    /// Challenge info for `domain`, following CNAMEs unless disabled.
    pub async fn challenge_info(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> Result<ChallengeInfo, PropagationError> {
        if !self.checker.client().config().follow_cname {
            return Ok(ChallengeInfo::new(domain, token, key_auth));
        }
        Ok(ChallengeInfo::resolve(self.checker.client(), cancel, domain, token, key_auth).await?)
    }

    /// One propagation check through the configured layers.
    pub async fn check_propagation(
        &self,
        cancel: &CancellationToken,
        info: &ChallengeInfo,
    ) -> Result<bool, PropagationError> {
        let request = CheckRequest {
            cancel,
            domain: &info.domain,
            fqdn: &info.effective_fqdn,
            value: &info.expected_value,
        };
        Next::new(&self.policy.layers, &self.checker).run(request).await
    }

    /// Publishes the record and waits until it has propagated.
    pub async fn pre_solve(
        &self,
        cancel: &CancellationToken,
        info: &ChallengeInfo,
    ) -> Result<(), PropagationError> {
        info!(
            domain = %info.domain,
            record = %info.effective_fqdn,
            provider = %self.provider.name(),
            "Creating DNS-01 challenge record"
        );

        self.provider
            .present(&info.domain, &info.token, &info.key_auth)
            .await
            .map_err(|error| PropagationError::Provider {
                action: "present",
                domain: info.domain.clone(),
                error,
            })?;

        let timeout = self.timeout();
        info!(
            domain = %info.domain,
            fqdn = %info.effective_fqdn,
            timeout = ?timeout.timeout,
            interval = ?timeout.interval,
            "Waiting for DNS record propagation"
        );

        wait_for(cancel, "propagation", timeout.timeout, timeout.interval, || {
            self.check_propagation(cancel, info)
        })
        .await?;

        info!(domain = %info.domain, "DNS-01 challenge record propagated");
        Ok(())
    }

    /// Removes the challenge record.
    pub async fn clean_up(&self, info: &ChallengeInfo) -> Result<(), PropagationError> {
        debug!(domain = %info.domain, record = %info.effective_fqdn, "Removing DNS-01 challenge record");

        self.provider
            .clean_up(&info.domain, &info.token, &info.key_auth)
            .await
            .map_err(|error| PropagationError::Provider {
                action: "clean up",
                domain: info.domain.clone(),
                error,
            })
    }

    /// Runs [`Dns01Challenge::pre_solve`] for every challenge.
    ///
    /// Challenges run concurrently unless the provider is sequential, in
    /// which case they run one at a time with the provider's pause between
    /// them. Results are returned in input order.
    pub async fn solve_all(
        &self,
        cancel: &CancellationToken,
        infos: &[ChallengeInfo],
    ) -> Vec<Result<(), PropagationError>> {
        let Some(pause) = self.provider.sequential() else {
            return future::join_all(infos.iter().map(|info| self.pre_solve(cancel, info))).await;
        };

        let mut results = Vec::with_capacity(infos.len());
        for (index, info) in infos.iter().enumerate() {
            if index > 0 {
                debug!(pause = ?pause, provider = %self.provider.name(), "Sequential provider, pausing");
                let cancelled = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(pause) => false,
                };
                if cancelled {
                    warn!(remaining = infos.len() - index, "Challenges cancelled");
                    results.extend(infos[index..].iter().map(|_| Err(PropagationError::Cancelled)));
                    break;
                }
            }
            results.push(self.pre_solve(cancel, info).await);
        }
        results
    }
}

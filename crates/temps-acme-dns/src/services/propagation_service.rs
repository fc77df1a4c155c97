//! DNS-01 propagation check
//!
//! Decides whether a TXT record is visible from the outside world by asking
//! the zone's authoritative nameservers directly instead of trusting a
//! caching resolver. Every queried server must answer with the expected
//! value; a single slow, failing or stale server makes the check fail.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{DnsError, PropagationError};
use crate::fqdn::{parse_name, rcode_name, to_fqdn};
use crate::services::authority_service::{AuthorityService, NameServer};
use crate::services::zone_service::{ZoneCache, ZoneService};
use crate::transport::DnsClient;

/// Which vantage points must see the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationRequirements {
    /// Every authoritative nameserver of the zone
    pub authoritative: bool,
    /// Every configured recursive nameserver
    pub recursive: bool,
}

impl Default for PropagationRequirements {
    fn default() -> Self {
        Self {
            authoritative: true,
            recursive: false,
        }
    }
}

/// The verification contract: `Ok(true)` once `value` is visible at `fqdn`.
///
/// `Ok(false)` and `Err(_)` both mean "not yet"; the error carries the
/// reason. Implementations must give up promptly when `cancel` fires.
#[async_trait]
pub trait PreCheck: Send + Sync {
    async fn check(
        &self,
        cancel: &CancellationToken,
        fqdn: &str,
        value: &str,
    ) -> Result<bool, PropagationError>;
}

/// A server taking part in a propagation check
#[derive(Debug, Clone)]
struct Target {
    label: String,
    addr: SocketAddr,
}

/// Checks TXT record propagation against authoritative and recursive nameservers
#[derive(Clone)]
pub struct PropagationChecker {
    client: DnsClient,
    zones: ZoneService,
    authority: AuthorityService,
    requirements: PropagationRequirements,
}

impl PropagationChecker {
    pub fn new(client: DnsClient, zone_cache: Arc<ZoneCache>) -> Self {
        let requirements = PropagationRequirements {
            authoritative: client.config().require_complete_propagation,
            ..Default::default()
        };
        Self {
            zones: ZoneService::new(client.clone(), zone_cache),
            authority: AuthorityService::new(client.clone()),
            client,
            requirements,
        }
    }

    pub fn with_requirements(mut self, requirements: PropagationRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn requirements(&self) -> PropagationRequirements {
        self.requirements
    }

    pub fn zones(&self) -> &ZoneService {
        &self.zones
    }

    pub fn client(&self) -> &DnsClient {
        &self.client
    }

    /// Checks that every required nameserver serves `value` at `fqdn`.
    ///
    /// Authoritative servers are found through the zone apex of `fqdn` and
    /// queried concurrently, each query with its own timeout. Recursive
    /// servers are consulted when required, and in place of the
    /// authoritative servers when those are not.
    pub async fn check_dns_propagation(
        &self,
        cancel: &CancellationToken,
        fqdn: &str,
        value: &str,
    ) -> Result<bool, PropagationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PropagationError::Cancelled),
            result = self.run_checks(cancel, fqdn, value) => result,
        }
    }

    async fn run_checks(
        &self,
        cancel: &CancellationToken,
        fqdn: &str,
        value: &str,
    ) -> Result<bool, PropagationError> {
        let fqdn = to_fqdn(fqdn);

        if self.requirements.authoritative {
            let targets = self.authoritative_targets(cancel, &fqdn).await?;
            self.check_targets(cancel, &fqdn, value, &targets, false)
                .await
                .map_err(|e| PropagationError::Authoritative(Box::new(e)))?;
        }

        if self.requirements.recursive || !self.requirements.authoritative {
            let targets: Vec<Target> = self
                .client
                .recursive_nameservers()
                .iter()
                .map(|addr| Target {
                    label: addr.to_string(),
                    addr: *addr,
                })
                .collect();
            self.check_targets(cancel, &fqdn, value, &targets, true)
                .await
                .map_err(|e| PropagationError::Recursive(Box::new(e)))?;
        }

        info!(fqdn = %fqdn, "DNS record propagated");
        Ok(true)
    }

    /// Every address of every authoritative nameserver of the zone of `fqdn`.
    async fn authoritative_targets(
        &self,
        cancel: &CancellationToken,
        fqdn: &str,
    ) -> Result<Vec<Target>, PropagationError> {
        let zone = self
            .zones
            .find_zone(cancel, fqdn)
            .await
            .map_err(|source| PropagationError::ZoneNotFound {
                fqdn: fqdn.to_string(),
                source,
            })?;

        let nameservers = self
            .authority
            .authoritative_servers(cancel, &zone.apex)
            .await?;

        let port = self.client.config().authoritative_port;
        Ok(targets_for(&nameservers, port))
    }

    /// Queries `targets` concurrently and requires all of them to serve `value`.
    ///
    /// Results are evaluated in target order, so the reported failure is
    /// stable for a stable set of servers.
    async fn check_targets(
        &self,
        cancel: &CancellationToken,
        fqdn: &str,
        value: &str,
        targets: &[Target],
        recursion_desired: bool,
    ) -> Result<(), PropagationError> {
        let name = parse_name(fqdn)?;
        let concurrency = self.client.config().max_concurrent_queries.max(1);

        debug!(fqdn = %fqdn, servers = targets.len(), "Checking TXT record on nameservers");

        let responses: Vec<(Target, Result<Message, DnsError>)> = stream::iter(targets.to_vec())
            .map(|target: Target| {
                let name = &name;
                async move {
                    let result = self
                        .client
                        .query(cancel, target.addr, name, RecordType::TXT, recursion_desired)
                        .await;
                    (target, result)
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        for (target, result) in responses {
            let response = result?;

            if response.response_code() != ResponseCode::NoError {
                return Err(DnsError::new(format!(
                    "NS {} returned {} for {}",
                    target.label,
                    rcode_name(response.response_code()),
                    fqdn
                ))
                .with_ns(target.addr)
                .with_msg_in(response)
                .into());
            }

            let observed = txt_values(&response);
            if !observed.iter().any(|txt| txt == value) {
                debug!(ns = %target.label, fqdn = %fqdn, "Expected TXT value not served yet");
                return Err(PropagationError::Mismatch {
                    ns: target.label.clone(),
                    fqdn: fqdn.to_string(),
                    value: value.to_string(),
                    observed,
                });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PreCheck for PropagationChecker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        fqdn: &str,
        value: &str,
    ) -> Result<bool, PropagationError> {
        self.check_dns_propagation(cancel, fqdn, value).await
    }
}

fn targets_for(nameservers: &[NameServer], port: u16) -> Vec<Target> {
    nameservers
        .iter()
        .flat_map(|ns| {
            ns.addresses.iter().map(move |ip| {
                let addr = SocketAddr::new(*ip, port);
                Target {
                    label: format!("{} ({})", ns.hostname, addr),
                    addr,
                }
            })
        })
        .collect()
}

/// TXT values in the answer section, character strings of a record joined.
pub fn txt_values(response: &Message) -> Vec<String> {
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::TXT(txt) => Some(
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>(),
            ),
            _ => None,
        })
        .collect()
}

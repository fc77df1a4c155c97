//! Authoritative nameserver discovery
//!
//! Looks up the NS records of a zone apex and resolves every nameserver
//! hostname to its addresses through the recursive resolver. Nothing is
//! cached: the set is rebuilt on every propagation check so NS changes are
//! picked up immediately.

use std::net::IpAddr;

use futures::stream::{self, StreamExt};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{DnsError, PropagationError};
use crate::fqdn::{parse_name, rcode_name, to_fqdn};
use crate::transport::DnsClient;

/// An authoritative nameserver and the addresses it is reachable on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServer {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

#[derive(Clone)]
pub struct AuthorityService {
    client: DnsClient,
}

impl AuthorityService {
    pub fn new(client: DnsClient) -> Self {
        Self { client }
    }

    /// NS hostnames of `zone_apex`, in answer order.
    pub async fn nameserver_hosts(
        &self,
        cancel: &CancellationToken,
        zone_apex: &str,
    ) -> Result<Vec<Name>, DnsError> {
        let zone = parse_name(zone_apex)?;
        let response = self
            .client
            .recursive_query(cancel, &zone, RecordType::NS)
            .await?;

        if response.response_code() != ResponseCode::NoError {
            return Err(DnsError::new(format!(
                "NS lookup for '{}' returned {}",
                zone,
                rcode_name(response.response_code())
            ))
            .with_msg_in(response));
        }

        let hosts: Vec<Name> = response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::NS(ns) => Some(ns.0.clone()),
                _ => None,
            })
            .collect();

        if hosts.is_empty() {
            return Err(
                DnsError::new(format!("could not determine authoritative nameservers for '{}'", zone))
                    .with_msg_in(response),
            );
        }

        Ok(hosts)
    }

    /// Authoritative nameservers of `zone_apex` with their addresses.
    ///
    /// A hostname that does not resolve is dropped with a warning. Only when
    /// every hostname fails is the lookup an error.
    pub async fn authoritative_servers(
        &self,
        cancel: &CancellationToken,
        zone_apex: &str,
    ) -> Result<Vec<NameServer>, PropagationError> {
        let hosts = self.nameserver_hosts(cancel, zone_apex).await?;
        let concurrency = self.client.config().max_concurrent_queries.max(1);

        let results: Vec<Result<NameServer, DnsError>> = stream::iter(hosts)
            .map(|host| self.resolve_host(cancel, host))
            .buffered(concurrency)
            .collect()
            .await;

        let mut servers = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(server) => servers.push(server),
                Err(e) if e.is_cancelled() => return Err(e.into()),
                Err(e) => {
                    warn!(zone = %zone_apex, error = %e, "Dropping unresolvable nameserver");
                    failures.push(e);
                }
            }
        }

        if servers.is_empty() {
            return Err(PropagationError::NoNameservers {
                zone: to_fqdn(zone_apex),
                failures,
            });
        }

        debug!(
            zone = %zone_apex,
            nameservers = servers.len(),
            dropped = failures.len(),
            "Resolved authoritative nameservers"
        );
        Ok(servers)
    }

    async fn resolve_host(&self, cancel: &CancellationToken, host: Name) -> Result<NameServer, DnsError> {
        let mut addresses = Vec::new();
        let mut last_error = None;
        let mut last_response = None;

        let mut record_types = vec![RecordType::A];
        if self.client.config().enable_ipv6 {
            record_types.push(RecordType::AAAA);
        }

        for record_type in record_types {
            match self.client.recursive_query(cancel, &host, record_type).await {
                Ok(response) => {
                    addresses.extend(addresses_in(&response));
                    last_response = Some(response);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        if addresses.is_empty() {
            return Err(match (last_error, last_response) {
                (Some(e), _) => e,
                (None, Some(response)) => {
                    DnsError::new(format!("no address found for nameserver '{}'", host))
                        .with_msg_in(response)
                }
                (None, None) => {
                    DnsError::new(format!("no address found for nameserver '{}'", host))
                }
            });
        }

        Ok(NameServer {
            hostname: host.to_string(),
            addresses,
        })
    }
}

fn addresses_in(response: &Message) -> Vec<IpAddr> {
    if response.response_code() != ResponseCode::NoError {
        return Vec::new();
    }
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

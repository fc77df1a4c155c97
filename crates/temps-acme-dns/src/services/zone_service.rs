//! Zone apex discovery
//!
//! The challenge record usually sits several labels below the point where
//! its zone is delegated (`_acme-challenge.www.example.com.` in the zone
//! `example.com.`). Only the apex's nameservers are authoritative, so the
//! apex is found by asking the recursive resolver for a SOA record at every
//! ancestor of the name, leaf first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DnsError;
use crate::fqdn::{parse_name, to_fqdn};
use crate::transport::DnsClient;

/// A DNS zone found for a queried name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    /// Zone apex, with trailing dot
    pub apex: String,
    /// Primary nameserver from the SOA record (MNAME)
    pub primary_ns: String,
    pub discovered_at: DateTime<Utc>,
}

/// Queried FQDN to zone cache
///
/// Entries never expire individually; [`ZoneCache::clear`] drops all of them.
#[derive(Debug, Default)]
pub struct ZoneCache {
    entries: Mutex<HashMap<String, Zone>>,
}

impl ZoneCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fqdn: &str) -> Option<Zone> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key(fqdn))
            .cloned()
    }

    pub fn insert(&self, fqdn: &str, zone: Zone) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key(fqdn), zone);
    }

    /// Invalidates every cached zone lookup.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cache_key(fqdn: &str) -> String {
    to_fqdn(fqdn).to_lowercase()
}

/// Finds the zone apex for a name through the recursive resolver
#[derive(Clone)]
pub struct ZoneService {
    client: DnsClient,
    cache: Arc<ZoneCache>,
}

impl ZoneService {
    pub fn new(client: DnsClient, cache: Arc<ZoneCache>) -> Self {
        Self { client, cache }
    }

    pub fn cache(&self) -> &Arc<ZoneCache> {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Zone apex for `fqdn`, e.g. `example.com.` for `_acme-challenge.www.example.com.`
    pub async fn find_zone_apex(
        &self,
        cancel: &CancellationToken,
        fqdn: &str,
    ) -> Result<String, DnsError> {
        self.find_zone(cancel, fqdn).await.map(|zone| zone.apex)
    }

    /// Climbs from `fqdn` towards the root until a SOA answer names a zone apex.
    ///
    /// NXDOMAIN and answers without a SOA (referrals, empty answers, CNAMEs)
    /// move on to the parent name. SERVFAIL and transport failures are retried
    /// up to `zone_lookup_attempts` times per name before giving up. Any other
    /// response code aborts the search.
    pub async fn find_zone(&self, cancel: &CancellationToken, fqdn: &str) -> Result<Zone, DnsError> {
        let fqdn = to_fqdn(fqdn);

        if let Some(zone) = self.cache.get(&fqdn) {
            debug!(fqdn = %fqdn, zone = %zone.apex, "Zone cache hit");
            return Ok(zone);
        }

        let mut candidate = parse_name(&fqdn)?;
        let mut last_response: Option<Message> = None;

        while !candidate.is_root() {
            let response = self.query_soa(cancel, &candidate).await?;

            match response.response_code() {
                ResponseCode::NoError => {
                    if let Some(zone) = soa_zone(&response, &candidate) {
                        info!(fqdn = %fqdn, zone = %zone.apex, "Found zone apex");
                        self.cache.insert(&fqdn, zone.clone());
                        return Ok(zone);
                    }
                    debug!(candidate = %candidate, "No SOA at candidate, trying parent");
                }
                ResponseCode::NXDomain => {
                    debug!(candidate = %candidate, "NXDOMAIN at candidate, trying parent");
                }
                _ => {
                    return Err(
                        DnsError::new(format!("unexpected response for '{}'", candidate))
                            .with_msg_in(response),
                    );
                }
            }

            last_response = Some(response);
            candidate = candidate.base_name();
        }

        let mut err = DnsError::new(format!(
            "could not find the start of authority for '{}'",
            fqdn
        ));
        if let Some(response) = last_response {
            err = err.with_msg_in(response);
        }
        Err(err)
    }

    /// SOA query for one candidate, retrying SERVFAIL and transport failures.
    async fn query_soa(&self, cancel: &CancellationToken, candidate: &Name) -> Result<Message, DnsError> {
        let attempts = self.client.config().zone_lookup_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = self
                .client
                .recursive_query(cancel, candidate, RecordType::SOA)
                .await;

            let retryable = match &result {
                Ok(response) => response.response_code() == ResponseCode::ServFail,
                Err(e) => !e.is_cancelled(),
            };

            if !retryable || attempt >= attempts {
                return match result {
                    Ok(response) if response.response_code() == ResponseCode::ServFail => Err(
                        DnsError::new(format!("unexpected response for '{}'", candidate))
                            .with_msg_in(response),
                    ),
                    other => other,
                };
            }

            warn!(
                candidate = %candidate,
                attempt,
                attempts,
                "Transient failure looking up SOA, retrying"
            );
            attempt += 1;
        }
    }
}

/// Zone described by a positive SOA answer for `candidate`.
///
/// The SOA must be owned by the candidate itself; the SOA of a parent zone
/// in the authority section only says the name has no data. A CNAME cannot
/// live at a zone apex, so answers carrying one are ignored.
fn soa_zone(response: &Message, candidate: &Name) -> Option<Zone> {
    let has_cname = response
        .answers()
        .iter()
        .any(|record| record.record_type() == RecordType::CNAME);
    if has_cname {
        return None;
    }

    response
        .answers()
        .iter()
        .chain(response.name_servers().iter())
        .filter(|record| record.name() == candidate)
        .find_map(|record| match record.data() {
            RData::SOA(soa) => Some(Zone {
                apex: to_fqdn(&record.name().to_string()),
                primary_ns: soa.mname().to_string(),
                discovered_at: Utc::now(),
            }),
            _ => None,
        })
}

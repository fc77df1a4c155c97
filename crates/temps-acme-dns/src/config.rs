//! Resolver configuration
//!
//! Settings come from code, from serde (embedded in a larger config file) or
//! from `TEMPS_DNS_*` environment variables:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `TEMPS_DNS_RESOLVERS` | comma separated recursive nameservers (`host[:port]`) |
//! | `TEMPS_DNS_TIMEOUT` | per-query timeout in seconds |
//! | `TEMPS_DNS_ENABLE_IPV6` | also resolve AAAA addresses of authoritative nameservers |
//! | `TEMPS_DNS_DISABLE_CP` | skip the authoritative nameserver check |
//! | `TEMPS_DNS_DISABLE_CNAME_SUPPORT` | do not follow CNAMEs of the challenge record |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;
use crate::fqdn::parse_nameserver;

pub const ENV_RESOLVERS: &str = "TEMPS_DNS_RESOLVERS";
pub const ENV_TIMEOUT: &str = "TEMPS_DNS_TIMEOUT";
pub const ENV_ENABLE_IPV6: &str = "TEMPS_DNS_ENABLE_IPV6";
pub const ENV_DISABLE_CP: &str = "TEMPS_DNS_DISABLE_CP";
pub const ENV_DISABLE_CNAME_SUPPORT: &str = "TEMPS_DNS_DISABLE_CNAME_SUPPORT";

/// Configuration shared by every DNS component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Recursive nameservers used for SOA, NS and address lookups
    pub nameservers: Vec<SocketAddr>,
    /// Timeout applied to every single query, in seconds
    pub timeout_secs: u64,
    /// Port authoritative nameservers are queried on
    pub authoritative_port: u16,
    /// Resolve AAAA addresses of authoritative nameservers too
    pub enable_ipv6: bool,
    /// Attempts per candidate name when the zone lookup hits SERVFAIL or a timeout
    pub zone_lookup_attempts: u32,
    /// Upper bound on simultaneous queries during a fan-out
    pub max_concurrent_queries: usize,
    /// Follow CNAMEs of the challenge record to its effective name
    pub follow_cname: bool,
    /// Require every authoritative nameserver to serve the record
    pub require_complete_propagation: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            nameservers: system_nameservers(),
            timeout_secs: default_timeout().as_secs(),
            authoritative_port: 53,
            enable_ipv6: false,
            zone_lookup_attempts: 3,
            max_concurrent_queries: 16,
            follow_cname: true,
            require_complete_propagation: true,
        }
    }
}

impl ResolverConfig {
    /// Configuration using the given recursive nameservers
    pub fn with_nameservers(nameservers: Vec<SocketAddr>) -> Self {
        Self {
            nameservers,
            ..Default::default()
        }
    }

    /// Default configuration overridden by `TEMPS_DNS_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(resolvers) = std::env::var(ENV_RESOLVERS) {
            let nameservers = resolvers
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(parse_nameserver)
                .collect::<Result<Vec<_>, _>>()?;
            if !nameservers.is_empty() {
                config.nameservers = nameservers;
            }
        }

        if let Ok(timeout) = std::env::var(ENV_TIMEOUT) {
            config.timeout_secs = timeout.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_TIMEOUT.to_string(),
                value: timeout.clone(),
            })?;
        }

        config.enable_ipv6 = env_flag(ENV_ENABLE_IPV6)?.unwrap_or(config.enable_ipv6);
        if let Some(disabled) = env_flag(ENV_DISABLE_CP)? {
            config.require_complete_propagation = !disabled;
        }
        if let Some(disabled) = env_flag(ENV_DISABLE_CNAME_SUPPORT)? {
            config.follow_cname = !disabled;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nameservers.is_empty() {
            return Err(ConfigError::InvalidNameserver(
                "at least one recursive nameserver is required".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "timeout_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.zone_lookup_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "zone_lookup_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_concurrent_queries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_queries".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Query timeout used when none is configured.
///
/// Windows needs longer: its UDP sockets report write failures late.
pub fn default_timeout() -> Duration {
    if cfg!(windows) {
        Duration::from_secs(20)
    } else {
        Duration::from_secs(10)
    }
}

/// Public resolvers used when the system configuration cannot be read
pub fn fallback_nameservers() -> Vec<SocketAddr> {
    vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)), 53),
    ]
}

/// Recursive nameservers from the system resolver configuration
pub fn system_nameservers() -> Vec<SocketAddr> {
    match hickory_resolver::system_conf::read_system_conf() {
        Ok((config, _)) => {
            let mut nameservers: Vec<SocketAddr> = Vec::new();
            for ns in config.name_servers() {
                if !nameservers.contains(&ns.socket_addr) {
                    nameservers.push(ns.socket_addr);
                }
            }
            if !nameservers.is_empty() {
                return nameservers;
            }
            debug!("System resolver configuration lists no nameservers, using defaults");
        }
        Err(e) => {
            debug!(error = %e, "Could not read system resolver configuration, using defaults");
        }
    }
    fallback_nameservers()
}

fn env_flag(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        },
        Err(_) => Ok(None),
    }
}

//! DNS-01 propagation verification for Temps
//!
//! This crate decides when an ACME DNS-01 challenge record is visible to the
//! certificate authority, by asking the zone's authoritative nameservers
//! directly instead of trusting a caching resolver.
//!
//! # Features
//!
//! - **Zone discovery**: Finds the zone apex of a name with SOA queries, cached per name
//! - **Authoritative checks**: Queries every authoritative nameserver concurrently
//! - **Composable policy**: Options to skip authoritative checks, require recursive
//!   agreement, wait before checking, or wrap the check in custom layers
//! - **Polling driver**: Retries until the provider's timeout, reporting the last failure
//!
//! # Usage
//!
//! The main entry point is [`Dns01Challenge`], built from a
//! [`ChallengeProvider`] and a list of options:
//!
//! ```ignore
//! use temps_acme_dns::{policy, Dns01Challenge, DnsClient, ResolverConfig, ZoneCache};
//!
//! let client = DnsClient::new(ResolverConfig::from_env()?);
//! let challenge = Dns01Challenge::new(
//!     provider,
//!     client,
//!     Arc::new(ZoneCache::new()),
//!     vec![policy::propagation_wait(Duration::from_secs(10), false)],
//! )?;
//!
//! let info = challenge.challenge_info(&cancel, "example.com", &token, &key_auth).await?;
//! challenge.pre_solve(&cancel, &info).await?;
//! // ... let the CA validate ...
//! challenge.clean_up(&info).await?;
//! ```

pub mod challenge;
pub mod config;
pub mod errors;
pub mod fqdn;
pub mod policy;
pub mod providers;
pub mod services;
pub mod transport;
pub mod wait;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use challenge::{key_authorization_digest, ChallengeInfo, Dns01Challenge};
pub use config::ResolverConfig;
pub use errors::{ConfigError, DnsError, PropagationError};
pub use policy::{
    cond_option, disable_authoritative_nss_propagation_requirement, propagation_timeout,
    propagation_wait, recursive_nss_propagation_requirement, wrap_pre_check, ChallengeOption,
    CheckLayer, CheckRequest, Next, PropagationPolicy, PropagationWait,
};
pub use providers::{ChallengeProvider, ManualProvider, ProviderTimeout};
pub use services::{PreCheck, PropagationChecker, PropagationRequirements, Zone, ZoneCache};
pub use transport::{DnsClient, DnsTransport, NetworkTransport};
pub use wait::wait_for;

//! DNS services
//!
//! This module contains the resolvers behind a propagation check: zone apex
//! discovery, authoritative nameserver lookup and the check itself.

pub mod authority_service;
pub mod propagation_service;
pub mod zone_service;

pub use authority_service::{AuthorityService, NameServer};
pub use propagation_service::{txt_values, PreCheck, PropagationChecker, PropagationRequirements};
pub use zone_service::{Zone, ZoneCache, ZoneService};

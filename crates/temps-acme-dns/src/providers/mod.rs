//! Challenge providers
//!
//! This module contains the provider trait the challenge flow publishes
//! records through, and the manual provider for hand-managed zones.

pub mod manual;
pub mod traits;

// Re-export commonly used types
pub use manual::{ManualInstructions, ManualProvider};
pub use traits::{
    ChallengeProvider, ProviderTimeout, DEFAULT_POLLING_INTERVAL, DEFAULT_PROPAGATION_TIMEOUT,
};

#[cfg(test)]
pub use traits::MockChallengeProvider;

//! Manual challenge provider
//!
//! For domains whose DNS is not reachable through any API. The provider
//! prints the record the operator has to create, then waits until the
//! operator confirms it through [`ManualProvider::confirm`]. Given a
//! [`DnsClient`], the record name follows CNAMEs of the challenge record the
//! same way the propagation check does.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::challenge::ChallengeInfo;
use crate::providers::traits::ChallengeProvider;
use crate::transport::DnsClient;

/// TTL suggested to the operator
pub const MANUAL_RECORD_TTL: u32 = 120;

/// Instructions for creating or removing a record by hand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualInstructions {
    pub record_type: String,
    /// Fully qualified record name
    pub name: String,
    pub value: String,
    pub ttl: u32,
    /// Human-readable instructions
    pub instructions: String,
}

impl ManualInstructions {
    pub fn present(info: &ChallengeInfo) -> Self {
        Self {
            record_type: "TXT".to_string(),
            name: info.effective_fqdn.clone(),
            value: info.expected_value.clone(),
            ttl: MANUAL_RECORD_TTL,
            instructions: format!(
                "Please create a TXT record for '{}' with the value '{}' at your DNS provider.",
                info.effective_fqdn, info.expected_value
            ),
        }
    }

    pub fn clean_up(info: &ChallengeInfo) -> Self {
        Self {
            record_type: "TXT".to_string(),
            name: info.effective_fqdn.clone(),
            value: info.expected_value.clone(),
            ttl: 0,
            instructions: format!(
                "You can now remove the TXT record for '{}' from your DNS provider.",
                info.effective_fqdn
            ),
        }
    }
}

/// Provider that delegates record changes to a human
#[derive(Default, Clone)]
pub struct ManualProvider {
    confirmation: Option<Arc<Notify>>,
    client: Option<DnsClient>,
}

impl ManualProvider {
    /// A provider that returns as soon as the instructions are logged.
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose `present` blocks until [`ManualProvider::confirm`].
    pub fn with_confirmation() -> Self {
        Self {
            confirmation: Some(Arc::new(Notify::new())),
            client: None,
        }
    }

    /// Resolve the record name through `client`, following CNAMEs unless
    /// its configuration disables them.
    pub fn with_client(mut self, client: DnsClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Signals that the operator created the record.
    pub fn confirm(&self) {
        if let Some(confirmation) = &self.confirmation {
            confirmation.notify_one();
        }
    }

    async fn challenge_info(
        &self,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> anyhow::Result<ChallengeInfo> {
        match &self.client {
            Some(client) if client.config().follow_cname => {
                let cancel = CancellationToken::new();
                Ok(ChallengeInfo::resolve(client, &cancel, domain, token, key_auth).await?)
            }
            _ => Ok(ChallengeInfo::new(domain, token, key_auth)),
        }
    }

    /// What the operator has to create for this challenge.
    pub async fn present_instructions(
        &self,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> anyhow::Result<ManualInstructions> {
        let info = self.challenge_info(domain, token, key_auth).await?;
        Ok(ManualInstructions::present(&info))
    }
}

#[async_trait]
impl ChallengeProvider for ManualProvider {
    fn name(&self) -> &str {
        "manual"
    }

    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> anyhow::Result<()> {
        let instructions = self.present_instructions(domain, token, key_auth).await?;

        info!(
            domain = %domain,
            record_type = %instructions.record_type,
            name = %instructions.name,
            value = %instructions.value,
            ttl = instructions.ttl,
            "{}",
            instructions.instructions
        );

        if let Some(confirmation) = &self.confirmation {
            confirmation.notified().await;
            info!(domain = %domain, "Manual DNS record confirmed");
        }
        Ok(())
    }

    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> anyhow::Result<()> {
        let info = self.challenge_info(domain, token, key_auth).await?;
        let instructions = ManualInstructions::clean_up(&info);
        info!(domain = %domain, name = %instructions.name, "{}", instructions.instructions);
        Ok(())
    }
}

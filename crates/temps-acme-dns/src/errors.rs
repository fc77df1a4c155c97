//! Error types for DNS-01 propagation checks

use std::fmt;

use hickory_proto::op::{Message, Query};
use thiserror::Error;

use crate::fqdn::rcode_name;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failure while talking to a nameserver.
///
/// Carries the nameserver that was involved, the outgoing query and, when one
/// arrived, the response, so that the rendered message names the server, the
/// question and the response code.
#[derive(Debug, Default)]
pub struct DnsError {
    /// Human readable summary. Rendered as `DNS error` when absent.
    pub message: Option<String>,
    /// Address (or name) of the nameserver involved.
    pub ns: Option<String>,
    /// Response received from the nameserver.
    pub msg_in: Option<Box<Message>>,
    /// Query sent to the nameserver.
    pub msg_out: Option<Box<Message>>,
    /// Underlying cause.
    pub source: Option<BoxError>,
}

impl DnsError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_ns(mut self, ns: impl ToString) -> Self {
        self.ns = Some(ns.to_string());
        self
    }

    pub fn with_msg_out(mut self, msg: Message) -> Self {
        self.msg_out = Some(Box::new(msg));
        self
    }

    pub fn with_msg_in(mut self, msg: Message) -> Self {
        self.msg_in = Some(Box::new(msg));
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether the failure was caused by the caller cancelling the operation.
    pub fn is_cancelled(&self) -> bool {
        self.source
            .as_deref()
            .is_some_and(|source| source.is::<Cancelled>())
    }

    /// Whether the failure was a query timeout.
    pub fn is_timeout(&self) -> bool {
        self.source
            .as_deref()
            .and_then(|source| source.downcast_ref::<std::io::Error>())
            .is_some_and(|err| err.kind() == std::io::ErrorKind::TimedOut)
    }
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message.as_deref().unwrap_or("DNS error"))?;

        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }

        let mut details = Vec::new();

        if let Some(ns) = &self.ns {
            details.push(format!("ns={}", ns));
        }

        let questions = self
            .msg_in
            .as_deref()
            .filter(|msg| !msg.queries().is_empty())
            .or(self.msg_out.as_deref());
        if let Some(msg) = questions.filter(|msg| !msg.queries().is_empty()) {
            details.push(format!("question='{}'", format_questions(msg.queries())));
        }

        // an outgoing query always carries NOERROR
        if let Some(msg) = self.msg_in.as_deref() {
            details.push(format!("code={}", rcode_name(msg.response_code())));
        }

        if !details.is_empty() {
            write!(f, " [{}]", details.join(", "))?;
        }

        Ok(())
    }
}

impl std::error::Error for DnsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

/// Renders questions as `name class type`, joined with `;`.
pub fn format_questions(queries: &[Query]) -> String {
    queries
        .iter()
        .map(|query| {
            format!(
                "{} {} {}",
                query.name(),
                query.query_class(),
                query.query_type()
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Marker cause for operations aborted through a cancellation token.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("context canceled")]
pub struct Cancelled;

/// Errors surfaced by a propagation check or by the polling driver.
#[derive(Error, Debug)]
pub enum PropagationError {
    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(
        "NS {ns} did not return the expected TXT record [fqdn: {fqdn}, value: {value}]: {}",
        .observed.join(" ,")
    )]
    Mismatch {
        ns: String,
        fqdn: String,
        value: String,
        observed: Vec<String>,
    },

    #[error("could not find zone for domain {fqdn:?}: {source}")]
    ZoneNotFound { fqdn: String, source: DnsError },

    #[error(
        "could not resolve any authoritative nameserver for zone {zone:?}: {}",
        join_errors(.failures)
    )]
    NoNameservers {
        zone: String,
        failures: Vec<DnsError>,
    },

    #[error("recursive nameservers: {0}")]
    Recursive(#[source] Box<PropagationError>),

    #[error("authoritative nameservers: {0}")]
    Authoritative(#[source] Box<PropagationError>),

    #[error("provider failed to {action} record for {domain}: {error:#}")]
    Provider {
        action: &'static str,
        domain: String,
        error: anyhow::Error,
    },

    #[error("time limit exceeded{}", last_error_suffix(.last_error))]
    TimeLimitExceeded {
        last_error: Option<Box<PropagationError>>,
    },

    #[error("context canceled")]
    Cancelled,
}

impl PropagationError {
    /// Whether the error means the record is visible but does not carry the
    /// expected value yet.
    pub fn is_mismatch(&self) -> bool {
        match self {
            PropagationError::Mismatch { .. } => true,
            PropagationError::Recursive(inner) | PropagationError::Authoritative(inner) => {
                inner.is_mismatch()
            }
            _ => false,
        }
    }

    /// Whether the operation was aborted through its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        match self {
            PropagationError::Cancelled => true,
            PropagationError::Dns(err) => err.is_cancelled(),
            PropagationError::ZoneNotFound { source, .. } => source.is_cancelled(),
            PropagationError::Recursive(inner) | PropagationError::Authoritative(inner) => {
                inner.is_cancelled()
            }
            _ => false,
        }
    }
}

fn join_errors(errors: &[DnsError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn last_error_suffix(last_error: &Option<Box<PropagationError>>) -> String {
    match last_error {
        Some(err) => format!(": last error: {}", err),
        None => String::new(),
    }
}

/// Invalid configuration, reported when a challenge is constructed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid nameserver address: {0}")]
    InvalidNameserver(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid propagation timeout: {0}")]
    InvalidTimeout(String),

    #[error("Conflicting options: {0}")]
    Conflict(String),
}

//! Domain name helpers shared by the resolvers

use std::net::{IpAddr, SocketAddr};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::Name;

use crate::errors::{ConfigError, DnsError};

/// Label prepended to a domain to form its DNS-01 challenge record name.
pub const CHALLENGE_LABEL: &str = "_acme-challenge";

/// Returns `name` with a trailing dot.
pub fn to_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Returns `name` without its trailing dot.
pub fn un_fqdn(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Record name for the DNS-01 challenge of `domain`.
///
/// Wildcard identifiers are validated against the base domain, so a leading
/// `*.` is dropped.
pub fn challenge_fqdn(domain: &str) -> String {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    format!("{}.{}", CHALLENGE_LABEL, to_fqdn(domain))
}

/// Parses an absolute domain name.
pub fn parse_name(name: &str) -> Result<Name, DnsError> {
    Name::from_ascii(to_fqdn(name))
        .map_err(|e| DnsError::new(format!("invalid domain name '{}'", name)).with_source(e))
}

/// Mnemonic for a response code (`NOERROR`, `NXDOMAIN`, ...).
pub fn rcode_name(code: ResponseCode) -> String {
    match code {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        ResponseCode::YXDomain => "YXDOMAIN".to_string(),
        ResponseCode::YXRRSet => "YXRRSET".to_string(),
        ResponseCode::NXRRSet => "NXRRSET".to_string(),
        ResponseCode::NotAuth => "NOTAUTH".to_string(),
        ResponseCode::NotZone => "NOTZONE".to_string(),
        other => format!("RCODE{}", u16::from(other)),
    }
}

/// Parses `host[:port]` into a socket address, defaulting to port 53.
///
/// Accepts `1.1.1.1`, `1.1.1.1:5353`, `2606:4700::1111` and `[2606:4700::1111]:53`.
pub fn parse_nameserver(value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let host = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);

    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| ConfigError::InvalidNameserver(value.to_string()))
}

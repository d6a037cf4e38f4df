//! URL safety validation
//!
//! Gates every webhook target against server-side request forgery. The
//! validator is pure: it never touches the network and works only on the
//! syntactic host (or an IP the caller has already resolved and pinned).
//!
//! Checks run in order and the first failure wins:
//! 1. the URL parses and has a host
//! 2. the scheme is `http` or `https`
//! 3. the host is not loopback, unspecified or link-local
//! 4. the host is not in a private or otherwise internal range
//! 5. the host is not a cloud metadata endpoint
//! 6. the host does not end in a blocked suffix
//! 7. an explicit port is not on the blocked list

use qahub_core::SafetyConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use url::{Host, Url};

/// Why a URL was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "rule", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("invalid URL: {0}")]
    Parse(String),

    #[error("protocol not allowed: {0}")]
    ProtocolNotAllowed(String),

    #[error("private/internal address: {0} is a loopback, unspecified or link-local address")]
    Loopback(String),

    #[error("private/internal address: {0}")]
    PrivateAddress(String),

    #[error("private/internal address: {0} is a cloud metadata endpoint")]
    MetadataEndpoint(String),

    #[error("blocked pattern: {host} matches {pattern}")]
    BlockedPattern { host: String, pattern: String },

    #[error("blocked port: {0}")]
    BlockedPort(u16),
}

impl RejectReason {
    /// Coarse category shown to operators
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse error",
            Self::ProtocolNotAllowed(_) => "protocol not allowed",
            Self::Loopback(_) | Self::PrivateAddress(_) | Self::MetadataEndpoint(_) => {
                "private/internal"
            }
            Self::BlockedPattern { .. } => "blocked pattern",
            Self::BlockedPort(_) => "blocked port",
        }
    }
}

/// Result of validating a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Allowed => None,
            Self::Rejected(reason) => Some(reason),
        }
    }

    pub fn into_result(self) -> std::result::Result<(), RejectReason> {
        match self {
            Self::Allowed => Ok(()),
            Self::Rejected(reason) => Err(reason),
        }
    }
}

/// Stateless SSRF gate for webhook targets
#[derive(Debug, Clone)]
pub struct UrlValidator {
    blocked_suffixes: Vec<String>,
    blocked_hostnames: HashSet<String>,
    blocked_ports: HashSet<u16>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new(&SafetyConfig::default())
    }
}

impl UrlValidator {
    pub fn new(config: &SafetyConfig) -> Self {
        let blocked_suffixes = config
            .blocked_host_suffixes
            .iter()
            .map(|s| normalize_suffix(s))
            .filter(|s| s.len() > 1)
            .collect();

        Self {
            blocked_suffixes,
            blocked_hostnames: config
                .blocked_hostnames
                .iter()
                .map(|h| normalize_host(h))
                .collect(),
            blocked_ports: config.blocked_ports.iter().copied().collect(),
        }
    }

    /// Validate a candidate webhook URL
    pub fn validate(&self, url: &str) -> Verdict {
        let parsed = match Url::parse(url.trim()) {
            Ok(parsed) => parsed,
            Err(e) => return Verdict::Rejected(RejectReason::Parse(e.to_string())),
        };
        self.validate_url(&parsed)
    }

    /// Validate an already parsed URL (used for redirect targets)
    pub fn validate_url(&self, url: &Url) -> Verdict {
        match self.check(url) {
            Ok(()) => Verdict::Allowed,
            Err(reason) => Verdict::Rejected(reason),
        }
    }

    fn check(&self, url: &Url) -> std::result::Result<(), RejectReason> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(RejectReason::ProtocolNotAllowed(other.to_string())),
        }

        let host = url
            .host()
            .ok_or_else(|| RejectReason::Parse("URL must have a host".to_string()))?;

        match host {
            Host::Ipv4(ip) => self.check_ip(IpAddr::V4(ip))?,
            Host::Ipv6(ip) => self.check_ip(IpAddr::V6(ip))?,
            Host::Domain(domain) => self.check_domain(domain)?,
        }

        if let Some(port) = url.port() {
            if self.blocked_ports.contains(&port) {
                return Err(RejectReason::BlockedPort(port));
            }
        }

        Ok(())
    }

    /// Apply the address rules to a literal or pinned IP
    pub fn check_ip(&self, ip: IpAddr) -> std::result::Result<(), RejectReason> {
        let ip = canonical_ip(ip);

        if is_loopback_or_link_local(&ip) {
            return Err(RejectReason::Loopback(ip.to_string()));
        }
        // Covers the metadata literals too: 169.254.169.254 is link-local and
        // fd00:ec2::254 is unique-local
        if is_private(&ip) {
            return Err(RejectReason::PrivateAddress(ip.to_string()));
        }
        Ok(())
    }

    fn check_domain(&self, domain: &str) -> std::result::Result<(), RejectReason> {
        let host = normalize_host(domain);

        // Some resolvers accept numeric forms that the URL parser leaves as domains
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.check_ip(ip);
        }

        if host == "localhost" {
            return Err(RejectReason::Loopback(host));
        }
        if self.blocked_hostnames.contains(&host) {
            return Err(RejectReason::MetadataEndpoint(host));
        }

        for suffix in &self.blocked_suffixes {
            if host.ends_with(suffix.as_str()) || host == suffix[1..] {
                return Err(RejectReason::BlockedPattern {
                    host,
                    pattern: suffix.clone(),
                });
            }
        }

        Ok(())
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `*.svc.cluster.local`, `svc.cluster.local` and `.svc.cluster.local` are equivalent
fn normalize_suffix(suffix: &str) -> String {
    let trimmed = normalize_host(suffix);
    let trimmed = trimmed.trim_start_matches('*').trim_start_matches('.');
    format!(".{trimmed}")
}

/// Unwrap IPv4-mapped and IPv4-compatible IPv6 forms so the IPv4 rules apply
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => {
                let segments = v6.segments();
                if segments[..6].iter().all(|s| *s == 0) && !v6.is_loopback() && !v6.is_unspecified()
                {
                    let [a, b] = segments[6].to_be_bytes();
                    let [c, d] = segments[7].to_be_bytes();
                    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
                } else {
                    IpAddr::V6(v6)
                }
            }
        },
        v4 => v4,
    }
}

fn is_loopback_or_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()                // 127.0.0.0/8
                || v4.is_unspecified()      // 0.0.0.0
                || v4.octets()[0] == 0      // 0.0.0.0/8
                || v4.is_link_local() // 169.254.0.0/16, includes the metadata address
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10
        }
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            v4.is_private()                      // 10/8, 172.16/12, 192.168/16
                || v4.is_broadcast()
                || v4.is_multicast()
                || (a == 100 && (b & 0xc0) == 64)    // 100.64.0.0/10 (CGNAT)
                || (a == 198 && (b & 0xfe) == 18)    // 198.18.0.0/15 (benchmarking)
                || a >= 240 // reserved
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            (first & 0xfe00) == 0xfc00          // fc00::/7 unique local
                || (first & 0xffc0) == 0xfec0   // fec0::/10 deprecated site-local
                || v6.is_multicast()
        }
    }
}

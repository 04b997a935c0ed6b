//! Backend target authorization
//!
//! Every stream request names the backend it wants the proxy to dial. The
//! guard decides whether that target is reachable under the configured
//! policy before any session or connection exists.

use std::net::IpAddr;

use tracing::{info, warn};
use url::{Host, Url};

use crate::config::{AllowlistConfig, AllowlistMode};
use crate::error::GuardError;

/// Plain and TLS transports; `ws` pairs with `http`, `wss` with `https`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeClass {
    Plain,
    Secure,
}

impl SchemeClass {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "ws" | "http" => Some(SchemeClass::Plain),
            "wss" | "https" => Some(SchemeClass::Secure),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            SchemeClass::Plain => 80,
            SchemeClass::Secure => 443,
        }
    }
}

/// One `[scheme://]host[:port]` allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowEntry {
    scheme: Option<SchemeClass>,
    host: String,
    port: Option<u16>,
}

impl AllowEntry {
    pub fn parse(raw: &str) -> Result<Self, GuardError> {
        let trimmed = raw.trim();
        let invalid = || GuardError::InvalidEntry(raw.to_string());
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (Some(SchemeClass::parse(scheme).ok_or_else(invalid)?), rest),
            None => (None, trimmed),
        };

        // Let the URL parser deal with IPv6 brackets and port syntax.
        let parsed = Url::parse(&format!("http://{}", rest.trim_end_matches('/'))).map_err(|_| invalid())?;
        if parsed.path() != "/" || parsed.query().is_some() {
            return Err(invalid());
        }
        let host = normalize_host(parsed.host().ok_or_else(invalid)?);
        // `http://host:80` reports no port, so recover an explicit one from the text.
        let port = parsed.port().or_else(|| {
            rest.rsplit_once(':')
                .and_then(|(_, p)| p.trim_end_matches('/').parse::<u16>().ok())
                .filter(|p| *p == 80)
        });

        Ok(Self { scheme, host, port })
    }

    fn matches(&self, target: &Target) -> bool {
        if self.host != target.host {
            return false;
        }
        if let Some(scheme) = self.scheme {
            if scheme != target.scheme {
                return false;
            }
        }
        match self.port {
            Some(port) => port == target.port,
            None => true,
        }
    }
}

fn normalize_host(host: Host<&str>) -> String {
    match host {
        Host::Domain(d) => d.to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    }
}

/// A backend URL reduced to what the policy looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    scheme: SchemeClass,
    host: String,
    port: u16,
    loopback: bool,
}

impl Target {
    fn from_url(url: &Url) -> Result<Self, GuardError> {
        let scheme = SchemeClass::parse(url.scheme())
            .ok_or_else(|| GuardError::NotAllowed(url.to_string()))?;
        let host = url.host().ok_or_else(|| GuardError::MissingHost(url.to_string()))?;
        let loopback = match &host {
            Host::Domain(d) => d.eq_ignore_ascii_case("localhost"),
            Host::Ipv4(ip) => IpAddr::V4(*ip).is_loopback(),
            Host::Ipv6(ip) => IpAddr::V6(*ip).is_loopback(),
        };
        Ok(Self {
            scheme,
            host: normalize_host(host),
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            loopback,
        })
    }
}

#[derive(Debug, Clone)]
pub enum AllowPolicy {
    List(Vec<AllowEntry>),
    Loopback,
    Any,
}

#[derive(Debug, Clone)]
pub struct HostGuard {
    policy: AllowPolicy,
}

impl HostGuard {
    pub fn new(policy: AllowPolicy) -> Self {
        match &policy {
            AllowPolicy::Any => warn!(
                "UNSAFE: backend allow-list disabled, the proxy will connect to ANY host on a client's behalf"
            ),
            AllowPolicy::Loopback => info!("Backend targets restricted to loopback addresses"),
            AllowPolicy::List(entries) => info!("Backend allow-list loaded with {} entries", entries.len()),
        }
        Self { policy }
    }

    pub fn from_config(config: &AllowlistConfig) -> Result<Self, GuardError> {
        let policy = match config.mode {
            AllowlistMode::Any => AllowPolicy::Any,
            AllowlistMode::Loopback => AllowPolicy::Loopback,
            AllowlistMode::List => AllowPolicy::List(
                config
                    .hosts
                    .iter()
                    .map(|h| AllowEntry::parse(h))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        Ok(Self::new(policy))
    }

    pub fn policy(&self) -> &AllowPolicy {
        &self.policy
    }

    pub fn authorize(&self, url: &Url) -> Result<(), GuardError> {
        let target = Target::from_url(url)?;
        let allowed = match &self.policy {
            AllowPolicy::Any => {
                warn!(target = %url, "UNSAFE: allowing backend target because any host is permitted");
                true
            }
            AllowPolicy::Loopback => target.loopback,
            AllowPolicy::List(entries) => entries.iter().any(|e| e.matches(&target)),
        };

        if allowed {
            Ok(())
        } else {
            warn!(target = %url, "Rejected backend target");
            Err(GuardError::NotAllowed(url.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn list(entries: &[&str]) -> HostGuard {
        HostGuard::new(AllowPolicy::List(
            entries.iter().map(|e| AllowEntry::parse(e).unwrap()).collect(),
        ))
    }

    #[test]
    fn loopback_policy_allows_any_port() {
        let guard = HostGuard::new(AllowPolicy::Loopback);
        assert!(guard.authorize(&url("ws://localhost:9000/socket")).is_ok());
        assert!(guard.authorize(&url("ws://127.0.0.1:1")).is_ok());
        assert!(guard.authorize(&url("wss://127.8.8.8")).is_ok());
        assert!(guard.authorize(&url("ws://[::1]:4000")).is_ok());
        assert!(guard.authorize(&url("ws://example.com")).is_err());
        assert!(guard.authorize(&url("ws://10.0.0.1:80")).is_err());
    }

    #[test]
    fn any_policy_allows_everything() {
        let guard = HostGuard::new(AllowPolicy::Any);
        assert!(guard.authorize(&url("wss://example.com/feed")).is_ok());
        assert!(guard.authorize(&url("ws://10.1.2.3:9999")).is_ok());
    }

    #[test]
    fn host_entry_without_port_allows_all_ports() {
        let guard = list(&["example.com"]);
        assert!(guard.authorize(&url("ws://example.com")).is_ok());
        assert!(guard.authorize(&url("wss://EXAMPLE.com:8443/x")).is_ok());
        assert!(guard.authorize(&url("ws://api.example.com")).is_err());
    }

    #[test]
    fn host_entry_with_port_uses_scheme_default_port() {
        let guard = list(&["example.com:443"]);
        assert!(guard.authorize(&url("wss://example.com")).is_ok());
        assert!(guard.authorize(&url("ws://example.com")).is_err());
        assert!(guard.authorize(&url("ws://example.com:443")).is_ok());

        let guard = list(&["example.com:80"]);
        assert!(guard.authorize(&url("ws://example.com")).is_ok());
        assert!(guard.authorize(&url("wss://example.com")).is_err());
    }

    #[test]
    fn scheme_classes_are_normalized() {
        let guard = list(&["https://secure.example.com"]);
        assert!(guard.authorize(&url("wss://secure.example.com")).is_ok());
        assert!(guard.authorize(&url("ws://secure.example.com")).is_err());

        let guard = list(&["ws://plain.example.com:8080"]);
        assert!(guard.authorize(&url("ws://plain.example.com:8080")).is_ok());
        assert!(guard.authorize(&url("wss://plain.example.com:8080")).is_err());
        assert!(guard.authorize(&url("ws://plain.example.com:8081")).is_err());
    }

    #[test]
    fn empty_list_denies() {
        let guard = list(&[]);
        assert!(matches!(
            guard.authorize(&url("ws://localhost:1234")),
            Err(GuardError::NotAllowed(_))
        ));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        assert!(AllowEntry::parse("").is_err());
        assert!(AllowEntry::parse("ftp://example.com").is_err());
        assert!(AllowEntry::parse("example.com/path").is_err());
        assert!(AllowEntry::parse("example.com:notaport").is_err());

        let config = AllowlistConfig {
            mode: AllowlistMode::List,
            hosts: vec!["ok.example.com".into(), "bad host".into()],
        };
        assert!(HostGuard::from_config(&config).is_err());
    }

    #[test]
    fn ipv6_entries_parse() {
        let entry = AllowEntry::parse("[2001:db8::1]:9000").unwrap();
        assert_eq!(entry.port, Some(9000));
        let guard = HostGuard::new(AllowPolicy::List(vec![entry]));
        assert!(guard.authorize(&url("ws://[2001:db8::1]:9000")).is_ok());
    }
}

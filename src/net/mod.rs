//! Network guard: the single egress choke point.
//!
//! Every outbound request — including each manual redirect hop — must be
//! cleared by [`NetworkGuard::check_url`] before a socket is opened.

pub mod dns;

use crate::config::{NetworkConfig, NetworkRule};
use dns::{DnsCache, DnsResolver};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Hostnames and addresses of cloud metadata services. Checked before DNS so
/// a metadata hostname is never even resolved.
const METADATA_HOSTS: &[&str] = &[
    "169.254.169.254",
    "100.100.100.200",
    "metadata.google.internal",
    "metadata.internal",
];

/// Result of an egress check.
#[derive(Debug, Clone)]
pub struct NetworkCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub resolved_ip: Option<IpAddr>,
}

impl NetworkCheck {
    fn allow(ip: Option<IpAddr>) -> Self {
        Self {
            allowed: true,
            reason: None,
            resolved_ip: ip,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            resolved_ip: None,
        }
    }
}

/// Host matching mode for a tool's own network policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPolicyMode {
    /// Only listed hosts are permitted.
    Allowlist,
    /// Listed hosts are rejected; everything else passes to the global rules.
    Blocklist,
}

/// Per-tool network policy, applied after the global allowlist.
#[derive(Debug, Clone)]
pub struct ToolNetworkPolicy {
    pub mode: HostPolicyMode,
    pub hosts: Vec<String>,
    /// Additional ports to block on top of the global set.
    pub blocked_ports: Vec<u16>,
}

impl ToolNetworkPolicy {
    pub fn allowlist(hosts: Vec<String>) -> Self {
        Self {
            mode: HostPolicyMode::Allowlist,
            hosts,
            blocked_ports: Vec::new(),
        }
    }

    pub fn blocklist(hosts: Vec<String>) -> Self {
        Self {
            mode: HostPolicyMode::Blocklist,
            hosts,
            blocked_ports: Vec::new(),
        }
    }
}

/// Match a host against an allowlist pattern: exact, or `*.suffix` which
/// also covers the bare base domain.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{}", suffix))
    } else {
        host == pattern
    }
}

/// Singleton egress gate. Owns the allowlist and the DNS cache; shared by
/// all sessions in the process.
pub struct NetworkGuard {
    config: NetworkConfig,
    resolver: Arc<dyn DnsResolver>,
    // Lock discipline: the cache is only mutated here
    cache: Mutex<DnsCache>,
}

impl NetworkGuard {
    pub fn new(config: NetworkConfig, resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            config,
            resolver,
            cache: Mutex::new(DnsCache::new()),
        }
    }

    pub fn max_redirects(&self) -> usize {
        self.config.max_redirects
    }

    /// Validate a candidate URL + method against the global allowlist, the
    /// tool's own policy, and the SSRF rules. Returns the resolved IP on
    /// success so callers can pin it.
    pub async fn check_url(
        &self,
        url_str: &str,
        method: &str,
        tool_policy: Option<&ToolNetworkPolicy>,
    ) -> NetworkCheck {
        let Ok(url) = url::Url::parse(url_str) else {
            return NetworkCheck::deny(format!("Invalid URL: {}", url_str));
        };

        if !matches!(url.scheme(), "http" | "https") {
            return NetworkCheck::deny(format!(
                "Only http/https allowed, got '{}'",
                url.scheme()
            ));
        }

        let Some(host) = url.host_str() else {
            return NetworkCheck::deny("URL has no host");
        };
        let host = host.to_ascii_lowercase();

        // Metadata endpoints, checked first so they are never resolved and
        // the reason is specific even when the host is also un-allowlisted
        if METADATA_HOSTS.contains(&host.as_str()) {
            return NetworkCheck::deny("Cloud metadata endpoint blocked");
        }

        // Global allowlist
        let Some(rule) = self.find_rule(&host) else {
            let check = NetworkCheck::deny(format!("Host '{}' is not in the allowlist", host));
            warn!("network guard: {}", check.reason.as_deref().unwrap_or(""));
            return check;
        };

        // Method restriction: GET is always allowed on a matched rule
        if let Some(methods) = &rule.methods {
            let method_upper = method.to_ascii_uppercase();
            if method_upper != "GET" && !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
                return NetworkCheck::deny(format!(
                    "Method {} not allowed for host '{}'",
                    method_upper, host
                ));
            }
        }

        // Per-tool policy
        if let Some(policy) = tool_policy {
            let matched = policy.hosts.iter().any(|p| host_matches(p, &host));
            match policy.mode {
                HostPolicyMode::Allowlist if !matched => {
                    return NetworkCheck::deny(format!(
                        "Host '{}' is not in this tool's allowlist",
                        host
                    ));
                }
                HostPolicyMode::Blocklist if matched => {
                    return NetworkCheck::deny(format!(
                        "Host '{}' is blocked for this tool",
                        host
                    ));
                }
                _ => {}
            }
        }

        // Port restrictions (explicit port or scheme default)
        let port = url.port_or_known_default().unwrap_or(0);
        let tool_ports = tool_policy.map(|p| p.blocked_ports.as_slice()).unwrap_or(&[]);
        if self.config.blocked_ports.contains(&port) || tool_ports.contains(&port) {
            return NetworkCheck::deny(format!("Port {} is blocked", port));
        }

        // IP-literal hosts skip DNS but get the same address screening
        // (url::Host handles bracketed IPv6 forms)
        let literal = match url.host() {
            Some(url::Host::Ipv4(v4)) => Some(IpAddr::V4(v4)),
            Some(url::Host::Ipv6(v6)) => Some(IpAddr::V6(v6)),
            _ => None,
        };
        if let Some(ip) = literal {
            if let Some(reason) = screen_ip(ip) {
                return NetworkCheck::deny(reason);
            }
            return NetworkCheck::allow(Some(ip));
        }

        // Resolve and detect rebinding against the non-expired cache entry
        let ips = match self.resolver.resolve(&host).await {
            Ok(ips) => ips,
            // Failing open here would break egress closure: no address, no socket
            Err(e) => return NetworkCheck::deny(e),
        };

        let ttl = Duration::from_secs(self.config.dns_ttl_secs);
        {
            let mut cache = self.cache.lock().expect("dns cache lock poisoned");
            if let Some(entry) = cache.get(&host) {
                if !ips.contains(&entry.ip) {
                    warn!(
                        "network guard: DNS rebinding detected for {} (cached {}, now {:?})",
                        host, entry.ip, ips
                    );
                    return NetworkCheck::deny("DNS rebinding detected");
                }
            }
            cache.prune();
            cache.insert(&host, ips[0], ttl);
        }

        for ip in &ips {
            if METADATA_HOSTS.contains(&ip.to_string().as_str()) {
                return NetworkCheck::deny("Cloud metadata endpoint blocked");
            }
            if let Some(reason) = screen_ip(*ip) {
                return NetworkCheck::deny(reason);
            }
        }

        debug!("network guard: allowed {} {} → {}", method, host, ips[0]);
        NetworkCheck::allow(Some(ips[0]))
    }

    fn find_rule(&self, host: &str) -> Option<&NetworkRule> {
        self.config
            .allowlist
            .iter()
            .find(|rule| host_matches(&rule.host, host))
    }
}

/// Reject loopback, private, link-local, carrier-grade NAT, broadcast, and
/// unspecified addresses (and their IPv6 equivalents).
fn screen_ip(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let cgnat = octets[0] == 100 && (64..128).contains(&octets[1]);
            if v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || octets[0] == 0
                || cgnat
            {
                return Some(format!("Blocked: requests to {} are not allowed", v4));
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return Some(format!("Blocked: requests to {} are not allowed", v6));
            }
            // IPv4-mapped addresses pointing into private space (::ffff:10.0.0.1)
            if let Some(v4) = v6.to_ipv4_mapped() {
                return screen_ip(IpAddr::V4(v4));
            }
            let segments = v6.segments();
            // fe80::/10 link-local
            if segments[0] & 0xffc0 == 0xfe80 {
                return Some(format!("Blocked: requests to {} are not allowed", v6));
            }
            // fc00::/7 unique local
            if segments[0] & 0xfe00 == 0xfc00 {
                return Some(format!("Blocked: requests to {} are not allowed", v6));
            }
        }
    }
    None
}

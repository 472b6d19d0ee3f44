use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Name resolution seam. The system resolver is used in production; tests
/// inject scripted resolvers to exercise rebinding paths.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, String>;
}

/// Resolver backed by the OS stub resolver via tokio.
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, String> {
        let addrs = tokio::net::lookup_host((host, 80u16))
            .await
            .map_err(|e| format!("DNS resolution failed for {}: {}", host, e))?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(format!("DNS resolution returned no addresses for {}", host));
        }
        Ok(ips)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub ip: IpAddr,
    pub expires_at: Instant,
}

/// TTL-bounded host → IP cache used for rebinding detection: a fresh lookup
/// that no longer includes the cached address within the TTL is treated as
/// an attack, not a rotation.
#[derive(Default)]
pub struct DnsCache {
    entries: HashMap<String, CacheEntry>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Non-expired entry for a host, if any.
    pub fn get(&self, host: &str) -> Option<&CacheEntry> {
        self.entries
            .get(host)
            .filter(|e| e.expires_at > Instant::now())
    }

    pub fn insert(&mut self, host: &str, ip: IpAddr, ttl: Duration) {
        self.entries.insert(
            host.to_string(),
            CacheEntry {
                ip,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop expired entries. Called opportunistically on writes.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Subdomains the proxy answers for, both under the official base host and
/// under `localhost` (the game resolves either family to loopback once the
/// hosts block is in place).
const PROXIED_SUBDOMAINS: &[&str] = &["osu", "c", "b", "a", "i", "s"];

/// Extra official subdomains the certificate must cover. The client picks a
/// numbered or regional Bancho endpoint on its own, so the certificate has
/// to be valid for all of them.
const EXTRA_CERT_SUBDOMAINS: &[&str] =
    &["c1", "c2", "c3", "c4", "c5", "c6", "ce", "api", "notify"];

/// Proxy configuration, immutable for the lifetime of a single run.
/// Reconfiguration requires stop + start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the listener binds to; loopback only.
    pub bind_address: IpAddr,
    pub https_port: u16,
    /// Base host of the official servers, e.g. `ppy.sh`.
    pub official_base_host: String,
    /// Base URL of the mirror search API.
    pub mirror_api_base_url: String,
    /// Base URL of the mirror download host.
    pub mirror_direct_base_url: String,
    /// Set the supporter bit in Bancho `UserPrivileges` packets.
    pub inject_supporter: bool,
    /// Resolver used for upstream lookups. Queried directly because the
    /// hosts block maps the official hosts to loopback, so the OS resolver
    /// would route the proxy back onto itself.
    pub upstream_dns: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            https_port: 443,
            official_base_host: "ppy.sh".to_string(),
            mirror_api_base_url: "https://api.rai.moe".to_string(),
            mirror_direct_base_url: "https://direct.rai.moe".to_string(),
            inject_supporter: false,
            upstream_dns: SocketAddr::from(([1, 1, 1, 1], 53)),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ProxyConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.https_port)
    }

    pub fn bancho_host(&self) -> String {
        format!("c.{}", self.official_base_host)
    }

    /// Hostnames the hosts block maps to `127.0.0.1`.
    pub fn hosts_aliases(&self) -> Vec<String> {
        let mut aliases = Vec::new();
        for sub in PROXIED_SUBDOMAINS {
            aliases.push(format!("{}.{}", sub, self.official_base_host));
        }
        for sub in PROXIED_SUBDOMAINS {
            aliases.push(format!("{}.localhost", sub));
        }
        aliases
    }

    /// Hostnames the generated certificate must be valid for.
    pub fn certificate_domains(&self) -> Vec<String> {
        let mut domains = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        domains.extend(self.hosts_aliases());
        for sub in EXTRA_CERT_SUBDOMAINS {
            domains.push(format!("{}.{}", sub, self.official_base_host));
        }
        domains
    }
}

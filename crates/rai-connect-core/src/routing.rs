//! Request classification. A fixed decision procedure over
//! (SNI host, method, path): first match wins, unknown hosts are misdirected.

use thiserror::Error;

use crate::config::ProxyConfig;

/// Bancho endpoints the client may pick on its own; all of them splice.
const BANCHO_SUBDOMAINS: &[&str] = &["c", "c1", "c2", "c3", "c4", "c5", "c6", "ce"];

/// Mirror-handled search endpoints under `osu.<official>`.
const MIRROR_API_PATHS: &[&str] = &[
    "/web/osu-search.php",
    "/web/osu-search-set.php",
    "/web/osu-getbeatmapinfo.php",
];

/// How a single request is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Answer directly with `302 Found` at `location`; no upstream contact.
    MirrorRedirect { location: String },
    /// Proxy the request through to the mirror API host.
    MirrorForward { target_host: String, path: String },
    /// Hand the connection to the Bancho splicer.
    BanchoSplice,
    /// Forward verbatim to the official host on :443.
    UpstreamPassthrough { target_host: String },
    /// Host we do not answer for: `421 Misdirected Request`.
    Misdirected,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid mirror base url: {0}")]
    InvalidBaseUrl(String),
}

/// Scheme-less base URL split into host and path prefix.
#[derive(Debug, Clone)]
struct BaseUrl {
    host: String,
    path_prefix: String,
}

impl BaseUrl {
    fn parse(url: &str) -> Result<Self, RouteError> {
        let rest = url
            .strip_prefix("https://")
            .ok_or_else(|| RouteError::InvalidBaseUrl(url.to_string()))?;
        if rest.is_empty() {
            return Err(RouteError::InvalidBaseUrl(url.to_string()));
        }

        let (host, prefix) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(RouteError::InvalidBaseUrl(url.to_string()));
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            path_prefix: prefix.to_string(),
        })
    }
}

/// Precomputed routing table for one proxy run.
#[derive(Debug, Clone)]
pub struct RouteTable {
    official: String,
    official_suffix: String,
    bancho_target: String,
    api: BaseUrl,
    direct_base: String,
}

impl RouteTable {
    pub fn new(config: &ProxyConfig) -> Result<Self, RouteError> {
        let official = config.official_base_host.to_ascii_lowercase();
        Ok(Self {
            official_suffix: format!(".{}", official),
            bancho_target: format!("c.{}", official),
            api: BaseUrl::parse(&config.mirror_api_base_url)?,
            direct_base: config
                .mirror_direct_base_url
                .trim_end_matches('/')
                .to_string(),
            official,
        })
    }

    /// Canonical Bancho host the splicer dials.
    pub fn bancho_target(&self) -> &str {
        &self.bancho_target
    }

    /// Classify one request. Pure: the result depends only on the table and
    /// the (host, method, path) triple.
    pub fn classify(&self, sni_host: &str, method: &str, path: &str) -> Route {
        let host = sni_host
            .split(':')
            .next()
            .unwrap_or(sni_host)
            .to_ascii_lowercase();

        let Some((label, official_family)) = self.subdomain_label(&host) else {
            return Route::Misdirected;
        };

        if BANCHO_SUBDOMAINS.contains(&label.as_str()) {
            return Route::BanchoSplice;
        }

        if label == "osu" && method == "GET" {
            if MIRROR_API_PATHS.iter().any(|p| path.starts_with(p)) {
                return Route::MirrorForward {
                    target_host: self.api.host.clone(),
                    path: format!("{}{}", self.api.path_prefix, path),
                };
            }
            if is_beatmap_download(path) {
                return Route::MirrorRedirect {
                    location: format!("{}{}", self.direct_base, path),
                };
            }
        }

        if label == "b"
            && method == "GET"
            && (path.starts_with("/thumb/") || path.starts_with("/preview/"))
        {
            return Route::MirrorRedirect {
                location: format!("{}{}", self.direct_base, path),
            };
        }

        // Everything else goes to the official servers: hosts from the
        // official family keep their name, localhost aliases map onto it.
        let target_host = if official_family {
            host
        } else {
            format!("{}.{}", label, self.official)
        };
        Route::UpstreamPassthrough { target_host }
    }

    /// Splits a host we answer for into its subdomain label. Returns the
    /// label plus whether the host belongs to the official family.
    fn subdomain_label(&self, host: &str) -> Option<(String, bool)> {
        if host == self.official {
            return Some(("osu".to_string(), true));
        }
        if let Some(label) = host.strip_suffix(&self.official_suffix) {
            if !label.is_empty() {
                return Some((label.to_string(), true));
            }
        }
        if host == "localhost" {
            return Some(("osu".to_string(), false));
        }
        if let Some(label) = host.strip_suffix(".localhost") {
            if !label.is_empty() {
                return Some((label.to_string(), false));
            }
        }
        None
    }
}

/// `/d/<id>` or `/d/<id>n`: a non-empty numeric beatmap set id, optionally
/// marked no-video.
pub fn is_beatmap_download(path: &str) -> bool {
    let Some(id) = path.strip_prefix("/d/") else {
        return false;
    };
    let id = id.strip_suffix('n').unwrap_or(id);
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

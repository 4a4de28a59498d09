use regex::Regex;
use roxy_shared::uri::Scheme;
use rustls::SupportedProtocolVersion;
use serde::{Deserialize, Serialize};

/// Configuration recognized by the core. Endpoint discrimination lives here
/// too since it is immutable for a connection's lifetime, same as the rest
/// of this struct.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub buffer_size: usize,
    pub supported_ssl_protocols: Vec<&'static SupportedProtocolVersion>,
    pub enable_100_continue: bool,
    pub enable_win_auth: bool,
    pub include_https_patterns: Vec<Regex>,
    pub exclude_https_patterns: Vec<Regex>,
    pub upstream_http_proxy: Option<UpstreamProxy>,
    pub upstream_https_proxy: Option<UpstreamProxy>,
    pub endpoint: EndpointConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            supported_ssl_protocols: roxy_shared::tls::TlsConfig::default().supported_versions(),
            enable_100_continue: true,
            enable_win_auth: false,
            include_https_patterns: Vec::new(),
            exclude_https_patterns: Vec::new(),
            upstream_http_proxy: None,
            upstream_https_proxy: None,
            endpoint: EndpointConfig::Explicit,
        }
    }
}

impl ProxyConfig {
    /// Tie-break for TLS interception exclusion: if any include patterns are
    /// configured, a host must match one of them, and the exclude list is
    /// not consulted at all. Otherwise a host is excluded iff it matches an
    /// exclude pattern.
    pub fn is_excluded(&self, host: &str) -> bool {
        if !self.include_https_patterns.is_empty() {
            return !self
                .include_https_patterns
                .iter()
                .any(|re| re.is_match(host));
        }
        self.exclude_https_patterns
            .iter()
            .any(|re| re.is_match(host))
    }
}

/// Discriminates the two listening modes the client dispatcher supports.
#[derive(Debug, Clone)]
pub enum EndpointConfig {
    Explicit,
    Transparent {
        tls_enabled: bool,
        generic_cert_name: String,
    },
}

/// An upstream HTTP or HTTPS proxy this proxy chains through instead of
/// contacting the origin directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
    #[serde(with = "scheme_serde")]
    pub scheme: Scheme,
}

mod scheme_serde {
    use roxy_shared::uri::Scheme;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(scheme: &Scheme, s: S) -> Result<S::Ok, S::Error> {
        scheme.to_string().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Scheme, D::Error> {
        let raw = String::deserialize(d)?;
        Scheme::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown scheme {raw}")))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_patterns_take_precedence_over_exclude() {
        let mut cfg = ProxyConfig {
            include_https_patterns: vec![Regex::new("^allowed\\.com$").unwrap()],
            exclude_https_patterns: vec![Regex::new("^allowed\\.com$").unwrap()],
            ..ProxyConfig::default()
        };
        assert!(!cfg.is_excluded("allowed.com"));
        assert!(cfg.is_excluded("other.com"));

        cfg.include_https_patterns.clear();
        assert!(cfg.is_excluded("allowed.com"));
    }

    #[test]
    fn no_patterns_means_nothing_excluded() {
        let cfg = ProxyConfig::default();
        assert!(!cfg.is_excluded("anything.example.com"));
    }
}

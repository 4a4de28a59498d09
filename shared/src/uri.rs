use std::{fmt::Display, str::FromStr};

use http::{Uri, uri::InvalidUri};
use rustls::pki_types::{InvalidDnsNameError, ServerName};

/// A `http::Uri` with the host/port/scheme defaulting this proxy needs for
/// reconstructing an absolute request target from a request line, a `Host`
/// header, or a prior `CONNECT` authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RUri {
    pub inner: Uri,
}

impl Display for RUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.inner))
    }
}

impl RUri {
    pub fn new(uri: Uri) -> Self {
        RUri { inner: uri }
    }

    /// Merges `other`'s authority/path over `self`'s, falling back to `self`
    /// wherever `other` is missing that part. Used to combine a request-target
    /// with the authority carried by a `Host` header or a `CONNECT` line.
    pub fn and(&self, other: &Uri, scheme: http::uri::Scheme) -> Result<RUri, http::Error> {
        let mut uri = Uri::builder().scheme(scheme);

        if let Some(authority) = other.authority().or(self.inner.authority()) {
            uri = uri.authority(authority.clone());
        }

        if let Some(pg) = other.path_and_query().or(self.inner.path_and_query()) {
            uri = uri.path_and_query(pg.clone());
        }

        Ok(RUri::new(uri.build()?))
    }

    pub fn host(&self) -> &str {
        self.inner.host().unwrap_or("localhost")
    }

    pub fn path_and_query(&self) -> &str {
        self.inner
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or_else(|| self.inner.path())
    }

    pub fn port(&self) -> u16 {
        match self.inner.port_u16() {
            Some(port) => port,
            None => match self.inner.scheme() {
                Some(scheme) if scheme == &http::uri::Scheme::HTTPS => 443,
                _ => 80,
            },
        }
    }

    pub fn inner(&self) -> Uri {
        self.inner.clone()
    }

    pub fn valid_authority(&self) -> bool {
        self.inner.authority().is_some()
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// `Host` header value for the outbound request: the port is included
    /// only when it differs from the scheme's default, matching what a
    /// client omits in absolute-form URIs.
    pub fn host_header_value(&self) -> String {
        if self.port() == self.scheme().default_port() {
            self.host().to_string()
        } else {
            self.host_port()
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner.scheme_str(), Some("https"))
    }

    pub fn scheme(&self) -> Scheme {
        if self.is_tls() { Scheme::Https } else { Scheme::Http }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(value: &str) -> Option<Scheme> {
        match value {
            "https" => Some(Scheme::Https),
            "http" => Some(Scheme::Http),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<&RUri> for ServerName<'static> {
    type Error = InvalidDnsNameError;

    fn try_from(value: &RUri) -> Result<Self, Self::Error> {
        ServerName::try_from(value.host().to_string())
    }
}

impl FromStr for RUri {
    type Err = InvalidUri;

    #[inline]
    fn from_str(s: &str) -> Result<RUri, InvalidUri> {
        let inner = Uri::try_from(s.as_bytes())?;
        Ok(RUri { inner })
    }
}

impl From<Uri> for RUri {
    fn from(v: Uri) -> RUri {
        RUri::new(v)
    }
}

/// Replaces the leftmost label of `host` with `*`, e.g. `a.b.example.com` ->
/// `*.b.example.com`. Hosts with two labels or fewer (`example.com`,
/// `localhost`) and bare IP literals are returned unchanged: wildcarding a
/// bare registrable domain down to `*.com` would mint a cert that doesn't
/// even cover the host it was requested for.
pub fn wildcard_host(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    if host.split('.').count() <= 2 {
        return host.to_string();
    }
    match host.split_once('.') {
        Some((_, rest)) => format!("*.{rest}"),
        None => host.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_host_replaces_leftmost_label_when_three_or_more() {
        assert_eq!(wildcard_host("a.b.example.com"), "*.b.example.com");
        assert_eq!(wildcard_host("sub.a.b.example.com"), "*.a.b.example.com");
    }

    #[test]
    fn wildcard_host_leaves_two_label_single_label_and_ips_alone() {
        assert_eq!(wildcard_host("example.com"), "example.com");
        assert_eq!(wildcard_host("localhost"), "localhost");
        assert_eq!(wildcard_host("127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn host_header_value_omits_default_port_only() {
        let default_port: RUri = "http://example.com/a".parse().unwrap();
        assert_eq!(default_port.host_header_value(), "example.com");

        let custom_port: RUri = "http://example.com:8080/a".parse().unwrap();
        assert_eq!(custom_port.host_header_value(), "example.com:8080");

        let default_https: RUri = "https://example.com/a".parse().unwrap();
        assert_eq!(default_https.host_header_value(), "example.com");
    }
}

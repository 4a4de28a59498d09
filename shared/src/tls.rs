use std::sync::Arc;

use rustls::{
    ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite,
    crypto::CryptoProvider,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    version::{TLS12, TLS13},
};

use crate::{cert::CertifiedLeaf, crypto::init_crypto};

/// Wraps the installed `CryptoProvider` so the TLS Interceptor and the
/// Upstream Connector build their server/client configs from one consistent
/// source of supported protocol versions and cipher suites.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    crypto_provider: Arc<CryptoProvider>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        init_crypto();
        Self::from_provider(rustls::crypto::aws_lc_rs::default_provider())
    }
}

impl TlsConfig {
    pub fn from_provider(provider: CryptoProvider) -> Self {
        Self {
            crypto_provider: Arc::new(provider),
        }
    }

    /// The TLS protocol versions implied by the installed cipher suites;
    /// `ProxyConfig::supported_ssl_protocols` narrows this list further.
    pub fn supported_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        self.crypto_provider
            .cipher_suites
            .iter()
            .map(|cs| match cs {
                SupportedCipherSuite::Tls12(_) => &TLS12,
                SupportedCipherSuite::Tls13(_) => &TLS13,
            })
            .collect()
    }

    /// Builds a server config that always resolves to `leaf`, restricted to
    /// `versions` (a subset of `supported_versions()`), ALPN-negotiating
    /// `http/1.1` only since HTTP/2 interception is out of scope.
    pub fn server_config(
        &self,
        leaf: CertifiedLeaf,
        versions: &[&'static rustls::SupportedProtocolVersion],
    ) -> Result<ServerConfig, rustls::Error> {
        let key = self
            .crypto_provider
            .key_provider
            .load_private_key(leaf.key_der)?;
        let certified_key = CertifiedKey::new(vec![leaf.cert_der], key);

        let mut config = ServerConfig::builder_with_provider(self.crypto_provider.clone())
            .with_protocol_versions(versions)?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCertResolver(certified_key)));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Upstream-facing client config, trusting `roots` (default system trust,
    /// plus our own root when callers pass it in).
    pub fn client_config(&self, roots: Arc<RootCertStore>) -> Result<ClientConfig, rustls::Error> {
        let mut config = ClientConfig::builder_with_provider(self.crypto_provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates((*roots).clone())
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// `ResolvesServerCert` that always returns the same pre-signed leaf,
/// one per accepted `CONNECT` interception.
#[derive(Debug)]
struct FixedCertResolver(CertifiedKey);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::new(self.0.clone()))
    }
}

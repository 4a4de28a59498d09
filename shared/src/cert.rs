use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use p12_keystore::{KeyStore, KeyStoreEntry, PrivateKeyChain};
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    PKCS_RSA_SHA256,
};
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace, warn};

use crate::{crypto::init_crypto, uri::wildcard_host};

static ROXYMITM: &str = "roxymitm";
static ROXY_PWORD: &str = "roxy";

/// A signed leaf certificate plus its private key, ready to be handed to a
/// TLS server config's cert resolver.
#[derive(Debug, Clone)]
pub struct CertifiedLeaf {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// The certificate authority contract the TLS Interceptor consumes: mint (or
/// fetch a cached) leaf certificate for a host. Implementations must be safe
/// for concurrent use and mint at most once per wildcard-normalized hostname.
pub trait CertificateAuthority: Send + Sync {
    fn sign_leaf(&self, host: &str) -> Result<CertifiedLeaf, CaError>;

    /// DER-encoded root certificate, so it can be installed into a trust
    /// store by callers (e.g. integration tests trusting their own CA).
    fn root_der(&self) -> Vec<u8>;
}

/// Default `CertificateAuthority`: a persistent `rcgen` root CA that signs
/// per-wildcard-host leaves on demand and caches them so repeat requests for
/// hosts sharing a wildcard (`a.example.com`, `b.example.com`) mint once.
#[derive(Debug, Clone)]
pub struct RcgenCertificateAuthority {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    issuer: Issuer<'static, KeyPair>,
    ca_der: Vec<u8>,
    leaves: DashMap<String, CertifiedLeaf>,
}

impl RcgenCertificateAuthority {
    pub fn new(issuer: Issuer<'static, KeyPair>, ca_der: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer,
                ca_der,
                leaves: DashMap::new(),
            }),
        }
    }

    fn sign(&self, wildcard: &str) -> Result<CertifiedLeaf, CaError> {
        let mut params = CertificateParams::new(vec![wildcard.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, wildcard);
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate()?;
        let leaf = params.signed_by(&key_pair, &self.inner.issuer)?;
        let key_der =
            PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|_| CaError::KeyDer)?;

        Ok(CertifiedLeaf {
            cert_der: leaf.der().to_owned(),
            key_der,
        })
    }
}

impl CertificateAuthority for RcgenCertificateAuthority {
    fn sign_leaf(&self, host: &str) -> Result<CertifiedLeaf, CaError> {
        let wildcard = wildcard_host(host);
        if let Some(existing) = self.inner.leaves.get(&wildcard) {
            return Ok(existing.clone());
        }
        let leaf = self.sign(&wildcard)?;
        Ok(self
            .inner
            .leaves
            .entry(wildcard)
            .or_insert(leaf)
            .value()
            .clone())
    }

    fn root_der(&self) -> Vec<u8> {
        self.inner.ca_der.clone()
    }
}

struct CaFiles {
    bundle_path: PathBuf,
    bundle_path_ks: PathBuf,
    cert_path: PathBuf,
    cert_path_ks: PathBuf,
}

impl CaFiles {
    fn new(home: &Path) -> Self {
        CaFiles {
            bundle_path: home.join("roxy-ca.pem"),
            bundle_path_ks: home.join("roxy-ca.p12"),
            cert_path: home.join("roxy-ca-cert.pem"),
            cert_path_ks: home.join("roxy-ca-cert.p12"),
        }
    }
}

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    KeyStore(p12_keystore::error::Error),
    RustLSPem(rustls::pki_types::pem::Error),
    KeyDer,
}

impl Error for CaError {}

impl std::fmt::Display for CaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

impl From<p12_keystore::error::Error> for CaError {
    fn from(value: p12_keystore::error::Error) -> Self {
        CaError::KeyStore(value)
    }
}

impl From<rustls::pki_types::pem::Error> for CaError {
    fn from(value: rustls::pki_types::pem::Error) -> Self {
        CaError::RustLSPem(value)
    }
}

/// Generates or loads the root CA under `$HOME/.roxy`.
pub fn generate_root_ca() -> Result<RcgenCertificateAuthority, CaError> {
    generate_root_ca_with_path(None)
}

/// Generates or loads the root CA under `root/.roxy`, or `$HOME/.roxy` when
/// `root` is `None`. A directory is reused across runs so the CA a user has
/// already trusted in their browser stays valid.
pub fn generate_root_ca_with_path(
    root: Option<PathBuf>,
) -> Result<RcgenCertificateAuthority, CaError> {
    init_crypto();
    let root_dir = match root {
        Some(p) => p,
        None => {
            dirs::home_dir().ok_or_else(|| CaError::Io(std::io::Error::other("missing home dir")))?
        }
    };
    let home = root_dir.join(".roxy");
    fs::create_dir_all(&home)?;

    let ca_files = CaFiles::new(&home);

    let (issuer, ca_der) = if ca_files.bundle_path.exists() && ca_files.cert_path.exists() {
        trace!("roxy root CA already exists at {}", home.display());

        let pem = fs::read_to_string(&ca_files.bundle_path)?;
        let key_pair = rcgen::KeyPair::from_pem(pem.as_str())?;

        let ca_cert_pem = fs::read_to_string(&ca_files.cert_path)?;
        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, key_pair)?;
        let ca_der = CertificateDer::from_pem_file(&ca_files.bundle_path)?;

        (issuer, ca_der.to_vec())
    } else {
        generate(&ca_files)?
    };

    Ok(RcgenCertificateAuthority::new(issuer, ca_der))
}

fn generate(ca_files: &CaFiles) -> Result<(Issuer<'static, KeyPair>, Vec<u8>), CaError> {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    ca_params.distinguished_name = DistinguishedName::new();
    ca_params.distinguished_name.push(DnType::CountryName, "US");
    ca_params
        .distinguished_name
        .push(DnType::CommonName, ROXYMITM);
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, ROXYMITM);

    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::CrlSign);

    ca_params.not_before = OffsetDateTime::now_utc();
    ca_params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(365 * 10));

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let ca_cert = ca_params.self_signed(&key_pair)?;

    let cert_pem = ca_cert.pem();
    let key_pem = key_pair.serialize_pem();
    let bundle = format!("{}\n{}", key_pem.trim_end(), cert_pem.trim_end());

    fs::write(&ca_files.bundle_path, &bundle)?;
    fs::write(&ca_files.cert_path, &cert_pem)?;

    write_p12(ca_files, &ca_cert, &key_pair)?;

    debug!("roxy root CA generated at {}", ca_files.cert_path.display());

    let issuer = Issuer::new(ca_params, key_pair);
    Ok((issuer, ca_cert.der().to_vec()))
}

fn write_p12(
    ca_files: &CaFiles,
    ca_cert: &rcgen::Certificate,
    key_pair: &KeyPair,
) -> Result<(), CaError> {
    let mut key_store = KeyStore::new();
    let certificate = p12_keystore::Certificate::from_der(ca_cert.der())?;
    let mut local_key_id = vec![0u8; 20];
    rand::rng().fill_bytes(&mut local_key_id);

    let key_chain =
        PrivateKeyChain::new(key_pair.serialized_der(), local_key_id, vec![certificate]);
    key_store.add_entry(ROXYMITM, KeyStoreEntry::PrivateKeyChain(key_chain));
    let data = key_store.writer(ROXY_PWORD).write()?;
    fs::write(&ca_files.bundle_path_ks, data)?;

    let mut key_store = KeyStore::new();
    let mut local_key_id = vec![0u8; 20];
    rand::rng().fill_bytes(&mut local_key_id);
    let certificate = p12_keystore::Certificate::from_der(ca_cert.der())?;
    key_store.add_entry(ROXYMITM, KeyStoreEntry::Certificate(certificate));
    let data = key_store.writer(ROXY_PWORD).write()?;
    fs::write(&ca_files.cert_path_ks, data)?;

    Ok(())
}

/// Loads the system trust store, plus `extra` (typically the proxy's own
/// root), for upstream TLS connections. Kept alongside the CA module since
/// both deal in `RootCertStore` construction.
pub fn load_native_roots(extra: Option<CertificateDer<'static>>) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let cert_result = rustls_native_certs::load_native_certs();

    for err in cert_result.errors.iter() {
        warn!("load native cert error {err}");
    }
    for cert in cert_result.certs {
        if let Err(e) = roots.add(cert) {
            warn!("failed to parse trust anchor: {}", e);
        }
    }
    if let Some(extra) = extra
        && let Err(err) = roots.add(extra)
    {
        warn!("error adding extra root cert {err}");
    }
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let mut suffix = [0u8; 8];
        rand::rng().fill_bytes(&mut suffix);
        dir.push(format!("roxy-ca-test-{}", hex(&suffix)));
        dir
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn signs_same_cert_for_hosts_sharing_a_wildcard() {
        let tmp = tempfile_dir();
        let ca = generate_root_ca_with_path(Some(tmp)).expect("ca generation");
        let a = ca.sign_leaf("a.example.com").expect("sign a");
        let b = ca.sign_leaf("b.example.com").expect("sign b");
        assert_eq!(a.cert_der, b.cert_der);
    }

    #[test]
    fn signs_distinct_certs_for_different_wildcards() {
        let tmp = tempfile_dir();
        let ca = generate_root_ca_with_path(Some(tmp)).expect("ca generation");
        let a = ca.sign_leaf("example.com").expect("sign example");
        let b = ca.sign_leaf("other.org").expect("sign other");
        assert_ne!(a.cert_der, b.cert_der);
    }
}

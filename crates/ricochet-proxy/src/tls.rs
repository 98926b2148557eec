//! TLS loading for proxy listeners and upstream connections.
//!
//! A proxy may carry several keypairs; SNI picks between them. Explicit
//! `domains` in the config override the names baked into a certificate's
//! SANs. The first keypair is the default when no name matches. Upstream
//! connections accept self-signed certificates.

use std::fmt;
use std::sync::Arc;

use ricochet_config::TlsItem;
use tokio_rustls::rustls::{self, pki_types};
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use crate::error::ProxyError;

struct LoadedCert {
    domains: Vec<String>,
    key: Arc<rustls::sign::CertifiedKey>,
}

/// SNI-aware certificate resolver over the configured keypairs.
pub struct SniResolver {
    certs: Vec<LoadedCert>,
}

impl SniResolver {
    fn select(&self, server_name: Option<&str>) -> Option<Arc<rustls::sign::CertifiedKey>> {
        if let Some(name) = server_name {
            for cert in &self.certs {
                if cert.domains.iter().any(|d| domain_matches(d, name)) {
                    return Some(cert.key.clone());
                }
            }
        }
        self.certs.first().map(|c| c.key.clone())
    }
}

impl rustls::server::ResolvesServerCert for SniResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver")
            .field("certs", &self.certs.len())
            .finish()
    }
}

/// Match a certificate domain (possibly `*.`-wildcarded) against an SNI name.
fn domain_matches(domain: &str, name: &str) -> bool {
    if let Some(suffix) = domain.strip_prefix("*.") {
        return name
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.') && head.len() > 1);
    }
    domain.eq_ignore_ascii_case(name)
}

/// Build a server config from the configured keypair list.
///
/// Returns `None` when the list is empty (plaintext listener).
pub fn load_server_config(items: &[TlsItem]) -> Result<Option<rustls::ServerConfig>, ProxyError> {
    if items.is_empty() {
        return Ok(None);
    }

    let mut certs = Vec::with_capacity(items.len());
    for item in items {
        let chain = load_cert_chain(&item.cert)?;
        let key = load_private_key(&item.key)?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
            .map_err(|e| ProxyError::Cert(format!("{}: unsupported key: {e}", item.key)))?;

        let domains = if item.domains.is_empty() {
            san_dns_names(&chain[0])?
        } else {
            item.domains.clone()
        };
        debug!(cert = %item.cert, domains = ?domains, default = certs.is_empty(), "loaded tls certificate");

        certs.push(LoadedCert {
            domains,
            key: Arc::new(rustls::sign::CertifiedKey::new(chain, signing_key)),
        });
    }

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver { certs }));
    Ok(Some(config))
}

/// The one crypto provider this crate uses, pinned so feature unification in
/// dependent crates cannot leave rustls without a default.
fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn load_cert_chain(path: &str) -> Result<Vec<pki_types::CertificateDer<'static>>, ProxyError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Cert(format!("{path}: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Cert(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<pki_types::PrivateKeyDer<'static>, ProxyError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(pki_types::PrivateKeyDer::Pkcs8(key))
            }
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(pki_types::PrivateKeyDer::Pkcs1(key))
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(pki_types::PrivateKeyDer::Sec1(key))
            }
            Some(_) => continue,
            None => {
                return Err(ProxyError::Cert(format!("no private key found in {path}")))
            }
        }
    }
}

/// DNS names from the leaf certificate's subject alternative names.
fn san_dns_names(cert: &pki_types::CertificateDer<'_>) -> Result<Vec<String>, ProxyError> {
    let (_, parsed) = parse_x509_certificate(cert.as_ref())
        .map_err(|e| ProxyError::Cert(format!("can't parse leaf certificate: {e}")))?;
    let mut names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for general in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general {
                names.push(dns.to_string());
            }
        }
    }
    Ok(names)
}

/// Client config for upstream TLS targets: self-signed certs are expected.
pub fn insecure_client_config() -> Result<rustls::ClientConfig, ProxyError> {
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    Ok(config)
}

/// Accepts any upstream certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &pki_types::CertificateDer<'_>,
        _intermediates: &[pki_types::CertificateDer<'_>],
        _server_name: &pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

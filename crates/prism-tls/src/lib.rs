//! Root CA handling and per-flow leaf certificate minting.
//!
//! The proxy terminates TLS from clients with short-lived leaf
//! certificates signed by a locally trusted root. Leaves are minted fresh
//! for every CONNECT flow; nothing is cached, so no key material outlives
//! the flow that used it.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const LEAF_NOT_BEFORE_BACKDATE: Duration = Duration::minutes(5);
const LEAF_LIFETIME: Duration = Duration::hours(2);

#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to read {path}: {source}")]
    ReadMaterial {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
}

/// The process-wide root CA. Read-only after load; shared across flows
/// behind an `Arc`.
#[derive(Debug)]
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

/// One freshly minted leaf, valid from five minutes in the past to two
/// hours in the future.
pub struct MintedLeaf {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// PEM pair for a newly generated root CA, ready to be written to disk.
pub struct RootCaPem {
    pub cert_pem: String,
    pub key_pem: String,
}

impl RootAuthority {
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CaError> {
        let cert_pem = read_material(cert_path.as_ref())?;
        let key_pem = read_material(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            CaError::InvalidMaterial(format!("failed to parse root certificate PEM: {error}"))
        })?;
        let key = KeyPair::from_pem(key_pem).map_err(|error| {
            CaError::InvalidMaterial(format!("failed to parse root private key PEM: {error}"))
        })?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
            CaError::InvalidMaterial(format!("failed to build issuer from root certificate: {error}"))
        })?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
        })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Mints a leaf for `domain` signed by this root.
    ///
    /// A fresh keypair is generated per call. RSA keygen dominates the
    /// cost of a CONNECT flow; callers on an async runtime should run
    /// this on a blocking-friendly executor.
    pub fn mint(&self, domain: &str) -> Result<MintedLeaf, CaError> {
        let clean_domain = normalize_domain(domain);
        let key = generate_leaf_key()?;

        let not_before = OffsetDateTime::now_utc() - LEAF_NOT_BEFORE_BACKDATE;
        let not_after = OffsetDateTime::now_utc() + LEAF_LIFETIME;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.serial_number = Some(derive_serial(&clean_domain));
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, clean_domain.clone());
        params.distinguished_name = distinguished_name;

        if let Ok(ip) = clean_domain.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(clean_domain.as_str().try_into()?));
            params
                .subject_alt_names
                .push(SanType::DnsName(format!("*.{clean_domain}").try_into()?));
        }

        let cert = params.signed_by(&key, &self.issuer)?;

        Ok(MintedLeaf {
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
            not_before,
            not_after,
        })
    }
}

/// Generates a self-signed root CA, for first-run bootstrap and tests.
pub fn generate_root_ca(common_name: &str, organization: &str) -> Result<RootCaPem, CaError> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    distinguished_name.push(DnType::OrganizationName, organization);
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key)?;
    Ok(RootCaPem {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Builds the server-side TLS config presented to proxy clients.
///
/// The chain is [minted leaf, root]; TLS 1.2 is the floor. The default
/// provider's key-exchange order (X25519 first, then P-256) and rustls's
/// server-side cipher preference apply.
pub fn server_config_for_leaf(
    root: &RootAuthority,
    leaf: MintedLeaf,
) -> Result<Arc<ServerConfig>, CaError> {
    let chain = vec![leaf.cert_der.clone(), root.cert_der.clone()];
    let private_key = PrivateKeyDer::from(leaf.key_der);

    let mut config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_single_cert(chain, private_key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Builds the client-side TLS config used toward origins.
///
/// With `insecure_skip_verify` the origin certificate is accepted
/// unconditionally: the proxy is the man in the middle and trust is
/// re-anchored at the operator-installed root.
pub fn client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

fn read_material(path: &Path) -> Result<String, CaError> {
    fs::read_to_string(path).map_err(|source| CaError::ReadMaterial {
        path: path.to_string_lossy().to_string(),
        source,
    })
}

fn generate_leaf_key() -> Result<KeyPair, CaError> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
        .map_err(Into::into)
}

// Serial = SHA-256(domain || high-resolution timestamp), read as a
// positive big integer.
fn derive_serial(domain: &str) -> SerialNumber {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    hasher.update(nanos.to_string().as_bytes());
    SerialNumber::from_slice(&hasher.finalize())
}

fn normalize_domain(domain: &str) -> String {
    let host = domain.split(':').next().unwrap_or(domain);
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

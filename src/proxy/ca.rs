//! Root certificate authority for TLS impersonation.
//!
//! The outbound gateway terminates TLS for arbitrary federation hostnames.
//! Clients trust it because its root certificate is installed in their trust
//! store; this module holds that root and signs one leaf certificate per
//! hostname on demand.
//!
//! # Leaf certificates
//!
//! - RSA-2048 key (ECDSA P-256 when the backend cannot generate RSA)
//! - CN and SAN set to the hostname
//! - basicConstraints `CA:FALSE`, subject and authority key identifiers
//! - 160-bit random serial number
//! - valid from issuance for five years
//!
//! # Example
//!
//! ```ignore
//! use tim_gateway::proxy::CertificateAuthority;
//!
//! let ca = CertificateAuthority::load("/etc/tim-gateway/ca.crt".as_ref(), "/etc/tim-gateway/ca.key".as_ref())?;
//! let leaf = ca.issue("matrix.example.org", time::OffsetDateTime::now_utc())?;
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use super::error::CaError;

/// Validity of issued leaf certificates (five years).
const LEAF_VALIDITY_DAYS: i64 = 5 * 365;

/// Validity of a generated root (ten years).
const ROOT_VALIDITY_DAYS: i64 = 10 * 365;

/// File name of the root certificate written by [`CertificateAuthority::write_pem`].
pub const CA_CERT_FILE: &str = "ca.crt";

/// File name of the root key written by [`CertificateAuthority::write_pem`].
pub const CA_KEY_FILE: &str = "ca.key";

/// A leaf certificate and its private key.
#[derive(Debug)]
pub struct IssuedCertificate {
    /// Hostname in CN and SAN.
    pub hostname: String,
    /// DER-encoded leaf certificate.
    pub certificate: CertificateDer<'static>,
    /// PKCS#8 DER private key.
    pub private_key: PrivatePkcs8KeyDer<'static>,
    /// Start of validity.
    pub not_before: OffsetDateTime,
    /// End of validity.
    pub not_after: OffsetDateTime,
}

impl IssuedCertificate {
    /// The private key in the form rustls expects.
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.private_key.clone_key())
    }
}

/// Anything that can sign leaf certificates for the certificate cache.
pub trait CertificateIssuer: Send + Sync + 'static {
    /// Issue a fresh leaf certificate for `hostname`, valid from `now`.
    fn issue(&self, hostname: &str, now: OffsetDateTime) -> Result<IssuedCertificate, CaError>;

    /// The root certificate appended to served chains.
    fn root_certificate(&self) -> &CertificateDer<'static>;
}

/// The gateway's root CA: certificate plus signing key.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    root_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Load the root certificate and key from PEM files.
    ///
    /// Any problem here is fatal for the outbound gateway.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|source| CaError::ReadFile {
            path: cert_path.to_path_buf(),
            source,
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|source| CaError::ReadFile {
            path: key_path.to_path_buf(),
            source,
        })?;

        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!("Loaded root CA from {:?}", cert_path);
        Ok(ca)
    }

    /// Build from PEM strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::InvalidCertificate("no certificate in PEM".into()))?
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;

        let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| CaError::InvalidKey(e.to_string()))?
            .ok_or_else(|| CaError::InvalidKey("no private key in PEM".into()))?;
        let key_pair =
            KeyPair::try_from(&key_der).map_err(|e| CaError::InvalidKey(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_der(&root_der, key_pair)
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;

        Ok(Self {
            issuer,
            root_der,
            root_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// Generate a fresh self-signed root, held in memory only.
    pub fn generate(common_name: &str) -> Result<Self, CaError> {
        info!("Generating root CA '{}'", common_name);

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("tim-gateway".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }

    /// DER of the root certificate.
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// PEM of the root certificate, for installing into client trust stores.
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// Write `ca.crt` and `ca.key` into `dir`.
    ///
    /// The directory is created with mode 0700 if missing; the key is
    /// written with mode 0600.
    pub fn write_pem(&self, dir: &Path) -> Result<(PathBuf, PathBuf), CaError> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|source| CaError::WriteFile {
                path: dir.to_path_buf(),
                source,
            })?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|source| {
                CaError::WriteFile {
                    path: dir.to_path_buf(),
                    source,
                }
            })?;
        }

        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);
        if key_path.exists() {
            warn!("Overwriting existing CA key {:?}", key_path);
        }

        fs::write(&cert_path, &self.root_pem).map_err(|source| CaError::WriteFile {
            path: cert_path.clone(),
            source,
        })?;
        write_restricted_file(&key_path, &self.key_pem)?;

        debug!("Root CA written: cert={:?}, key={:?}", cert_path, key_path);
        Ok((cert_path, key_path))
    }

    /// Sign a leaf certificate for `hostname`.
    pub fn issue(&self, hostname: &str, now: OffsetDateTime) -> Result<IssuedCertificate, CaError> {
        debug!("Issuing certificate for {}", hostname);

        let san = match hostname.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => {
                let dns: rcgen::string::Ia5String = hostname
                    .try_into()
                    .map_err(|_| CaError::InvalidHostname(hostname.to_string()))?;
                SanType::DnsName(dns)
            }
        };

        let key_pair = generate_leaf_key()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(hostname.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());

        let not_before = now;
        let not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        Ok(IssuedCertificate {
            hostname: hostname.to_string(),
            certificate: cert.der().clone(),
            private_key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
            not_before,
            not_after,
        })
    }
}

impl CertificateIssuer for CertificateAuthority {
    fn issue(&self, hostname: &str, now: OffsetDateTime) -> Result<IssuedCertificate, CaError> {
        CertificateAuthority::issue(self, hostname, now)
    }

    fn root_certificate(&self) -> &CertificateDer<'static> {
        &self.root_der
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root_der_len", &self.root_der.len())
            .finish_non_exhaustive()
    }
}

fn generate_leaf_key() -> Result<KeyPair, CaError> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|e| {
            debug!("RSA key generation unavailable ({}), using ECDSA P-256", e);
            KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        })
        .map_err(|e| CaError::KeyGeneration(e.to_string()))
}

/// 160 random bits as a positive DER integer.
fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 20] = rand::random();
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let to_err = |source| CaError::WriteFile {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(to_err)?;
    file.write_all(content.as_bytes()).map_err(to_err)?;
    Ok(())
}

//! Certificate Authority - Dynamic certificate generation for MITM
//!
//! An in-memory root (generated, or loaded from PEM so clients can import it)
//! signs an in-memory intermediate, which signs short-lived leaf certificates
//! forged per hostname. Leaves are served with the chain `[leaf, intermediate]`
//! and cached for the lifetime of the authority.

use super::cert_cache::CertCache;
use super::error::{MitmError, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com, localhost)
    Domain(String),

    /// Wildcard domain (e.g., *.example.com)
    Wildcard(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from hostname string
    pub fn from_hostname(hostname: &str) -> Self {
        let trimmed = hostname
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.');

        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Self::IpAddress(ip);
        }

        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("*.") {
            return Self::Wildcard(lower);
        }

        Self::Domain(lower)
    }

    /// Name used as the subject common name and cache key
    pub fn name(&self) -> String {
        match self {
            Self::Domain(d) | Self::Wildcard(d) => d.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }

    fn san(&self) -> Result<SanType> {
        match self {
            Self::Domain(d) | Self::Wildcard(d) => {
                let name = d
                    .as_str()
                    .try_into()
                    .map_err(|_| MitmError::InvalidHost(d.clone()))?;
                Ok(SanType::DnsName(name))
            }
            Self::IpAddress(ip) => Ok(SanType::IpAddress(*ip)),
        }
    }
}

/// A leaf certificate forged for one hostname
pub struct ForgedCertificate {
    hostname: String,
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl ForgedCertificate {
    /// Assemble from DER parts (leaf first, then intermediates; PKCS#8 key)
    pub fn from_parts(hostname: String, chain: Vec<Vec<u8>>, key_der: Vec<u8>) -> Self {
        Self {
            hostname,
            chain: chain.into_iter().map(CertificateDer::from).collect(),
            key_der,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Leaf certificate DER
    pub fn leaf_der(&self) -> &[u8] {
        self.chain.first().map(|c| c.as_ref()).unwrap_or_default()
    }

    /// Full chain served to clients
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

impl fmt::Debug for ForgedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForgedCertificate")
            .field("hostname", &self.hostname)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// CA configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Root certificate PEM to load instead of generating one
    pub cert_path: Option<PathBuf>,

    /// Root private key PEM (required with `cert_path`)
    pub key_path: Option<PathBuf>,

    /// Leaf validity in days
    pub validity_days: u32,

    /// Organization name for generated certificates
    pub organization: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            validity_days: 30,
            organization: "relayscope".to_string(),
        }
    }
}

/// Certificate Authority - forges and caches leaf certificates
pub struct CertificateAuthority {
    root_cert: Certificate,
    issuer_cert: Certificate,
    issuer_key: KeyPair,
    cache: CertCache,
    config: CaConfig,
}

impl CertificateAuthority {
    /// Create a new Certificate Authority
    ///
    /// Loads the root from PEM when both paths are configured, otherwise
    /// generates one. The intermediate is always generated in memory.
    pub fn new(config: CaConfig) -> Result<Self> {
        let (root_cert, root_key) = match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(cert_path = %cert_path.display(), "Loading root CA from disk");
                Self::load_root(cert_path, key_path)?
            }
            (None, None) => Self::generate_root(&config)?,
            _ => {
                return Err(MitmError::ca_load(
                    "both a CA certificate and a CA key path are required",
                ))
            }
        };

        let (issuer_cert, issuer_key) =
            Self::generate_intermediate(&config, &root_cert, &root_key)?;

        info!(
            validity_days = config.validity_days,
            "Certificate Authority initialized"
        );

        Ok(Self {
            root_cert,
            issuer_cert,
            issuer_key,
            cache: CertCache::new(),
            config,
        })
    }

    fn ca_distinguished_name(config: &CaConfig, common_name: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, config.organization.as_str());
        dn.push(DnType::CommonName, common_name);
        dn
    }

    fn generate_root(config: &CaConfig) -> Result<(Certificate, KeyPair)> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name =
            Self::ca_distinguished_name(config, &format!("{} Root CA", config.organization));

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(3650);
        params.serial_number = Some(SerialNumber::from(generate_serial_number()));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| MitmError::ca_generation(format!("Failed to self-sign root: {}", e)))?;

        debug!("Root CA generated");
        Ok((cert, key))
    }

    fn load_root(cert_path: &PathBuf, key_path: &PathBuf) -> Result<(Certificate, KeyPair)> {
        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| MitmError::ca_load(format!("Failed to read cert file: {}", e)))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| MitmError::ca_load(format!("Failed to read key file: {}", e)))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;

        // Re-signing with the same key and subject yields an equivalent issuer
        let cert = params
            .self_signed(&key)
            .map_err(|e| MitmError::ca_load(format!("Failed to rebuild root: {}", e)))?;

        Ok((cert, key))
    }

    fn generate_intermediate(
        config: &CaConfig,
        root_cert: &Certificate,
        root_key: &KeyPair,
    ) -> Result<(Certificate, KeyPair)> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.distinguished_name = Self::ca_distinguished_name(
            config,
            &format!("{} Intermediate CA", config.organization),
        );

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(365);
        params.serial_number = Some(SerialNumber::from(generate_serial_number()));
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;
        let cert = params.signed_by(&key, root_cert, root_key).map_err(|e| {
            MitmError::ca_generation(format!("Failed to sign intermediate: {}", e))
        })?;

        Ok((cert, key))
    }

    /// Get or forge the certificate for a hostname
    pub async fn get_or_forge(&self, hostname: &str) -> Result<Arc<ForgedCertificate>> {
        self.get_or_forge_with_names(hostname, &[]).await
    }

    /// Get or forge, adding `extra_names` (e.g. SANs harvested from the real
    /// destination) to the subject alternative names on first generation
    pub async fn get_or_forge_with_names(
        &self,
        hostname: &str,
        extra_names: &[String],
    ) -> Result<Arc<ForgedCertificate>> {
        let host = HostIdentifier::from_hostname(hostname);
        let key = host.name();

        if let Some(cert) = self.cache.get(&key).await {
            debug!(host = %key, "Certificate cache hit");
            return Ok(cert);
        }

        // A failed forge returns before touching the cache
        let forged = Arc::new(self.forge(&host, extra_names)?);
        self.cache.insert(&key, Arc::clone(&forged)).await;

        debug!(host = %key, sans = extra_names.len() + 1, "Certificate forged and cached");
        Ok(forged)
    }

    /// Forge a fresh leaf certificate (uncached)
    pub fn forge(&self, host: &HostIdentifier, extra_names: &[String]) -> Result<ForgedCertificate> {
        let name = host.name();
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, self.config.organization.as_str());
        dn.push(DnType::CommonName, name.as_str());
        params.distinguished_name = dn;

        let mut sans = vec![host.san()?];
        for extra in extra_names {
            // Subject CNs are not always hostnames
            if extra.is_empty() || extra.contains(char::is_whitespace) {
                continue;
            }
            let extra_host = HostIdentifier::from_hostname(extra);
            if extra_host == *host {
                continue;
            }
            // Harvested names that rcgen cannot encode are skipped
            if let Ok(san) = extra_host.san() {
                if !sans.contains(&san) {
                    sans.push(san);
                }
            }
        }
        params.subject_alt_names = sans;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(i64::from(self.config.validity_days));
        params.serial_number = Some(SerialNumber::from(generate_serial_number()));
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate()
            .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.issuer_cert, &self.issuer_key)
            .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;

        Ok(ForgedCertificate::from_parts(
            name,
            vec![cert.der().to_vec(), self.issuer_cert.der().to_vec()],
            key.serialize_der(),
        ))
    }

    /// Root certificate PEM (for client installation)
    pub fn root_cert_pem(&self) -> String {
        self.root_cert.pem()
    }

    /// Root certificate DER (for trust stores in tests and tooling)
    pub fn root_cert_der(&self) -> CertificateDer<'static> {
        self.root_cert.der().clone()
    }

    /// Number of cached hostnames
    pub async fn cache_size(&self) -> usize {
        self.cache.len().await
    }

    pub fn cache(&self) -> &CertCache {
        &self.cache
    }
}

/// Names in a certificate's subject CN and SAN extension
///
/// Used to mirror the real destination's identity in the forged leaf.
pub fn subject_names_from_der(der: &[u8]) -> Vec<String> {
    let cert = match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => cert,
        Err(_) => return Vec::new(),
    };

    let mut names = Vec::new();
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        names.push(cn.to_string());
    }

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                x509_parser::extensions::GeneralName::DNSName(dns) => names.push(dns.to_string()),
                x509_parser::extensions::GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        names.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    names.dedup();
    names
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Generate unique serial number using crypto RNG + timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = time::OffsetDateTime::now_utc().unix_timestamp() as u32;

    ((timestamp_part as u64) << 32) | (random_part as u64)
}

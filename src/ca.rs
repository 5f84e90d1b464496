// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Root certificate authority, leaf issuance and the per-host certificate cache.

use crate::error::{ProxyError, Result};
use anyhow::Context;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type as aws_any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const CA_COMMON_NAME: &str = "mitm-capture CA";
const CA_ORGANIZATION: &str = "mitm-capture";

/// PEM-encoded leaf certificate and its private key.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Produces a leaf certificate for a hostname, signed by the local root.
///
/// Called from a blocking thread; implementations may shell out or do disk I/O.
pub trait LeafIssuer: Send + Sync {
    fn issue(&self, host: &str) -> anyhow::Result<IssuedLeaf>;
}

/// The local root CA. Loaded from disk or generated on first start.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    /// The CA private key used for signing.
    ca_key_pair: KeyPair,
}

impl CertificateAuthority {
    /// Loads the CA from the specified paths, or generates a new one if they don't exist.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<Self>> {
        if cert_path.exists() && key_path.exists() {
            info!("Loading existing CA from {:?}", cert_path);
            Self::load(cert_path, key_path).await
        } else {
            info!("Generating new CA at {:?}", cert_path);
            Self::generate_and_save(cert_path, key_path).await
        }
    }

    async fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .context("failed to read CA cert")?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .context("failed to read CA key")?;

        let key_pair =
            KeyPair::from_pem(&key_pem).context("failed to parse CA key pair from PEM")?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            ca_key_pair: key_pair,
        }))
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<Self>> {
        let params = Self::ca_params()?;
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, &key_pem).await?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            ca_key_pair: key_pair,
        }))
    }

    pub fn get_ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }

    fn ca_params() -> anyhow::Result<CertificateParams> {
        let mut params = CertificateParams::new(vec![]).context("failed to create CA params")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_ORGANIZATION);
        Ok(params)
    }
}

impl LeafIssuer for CertificateAuthority {
    fn issue(&self, host: &str) -> anyhow::Result<IssuedLeaf> {
        // IP literals become an iPAddress SAN, names a dNSName SAN.
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let issuer = Issuer::new(Self::ca_params()?, &self.ca_key_pair);
        let cert = params.signed_by(&key_pair, &issuer)?;

        Ok(IssuedLeaf {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Runs an external program `<program> <host>` which is expected to leave
/// `<certs_dir>/<host>.crt` behind, signed with the shared key at `key_path`.
pub struct CommandIssuer {
    program: PathBuf,
    certs_dir: PathBuf,
    key_path: PathBuf,
}

impl CommandIssuer {
    pub fn new(program: impl Into<PathBuf>, certs_dir: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            certs_dir: certs_dir.into(),
            key_path: key_path.into(),
        }
    }
}

impl LeafIssuer for CommandIssuer {
    fn issue(&self, host: &str) -> anyhow::Result<IssuedLeaf> {
        info!(%host, program = ?self.program, "running external certificate issuer");
        let status = Command::new(&self.program)
            .arg(host)
            .status()
            .with_context(|| format!("failed to spawn issuer {:?}", self.program))?;
        if !status.success() {
            anyhow::bail!("issuer exited with {}", status);
        }
        let cert_pem = std::fs::read_to_string(self.certs_dir.join(format!("{host}.crt")))
            .context("issuer did not produce a certificate")?;
        let key_pem =
            std::fs::read_to_string(&self.key_path).context("failed to read issuer key")?;
        Ok(IssuedLeaf { cert_pem, key_pem })
    }
}

type Slot = Arc<OnceCell<Arc<CertifiedKey>>>;

/// Per-host leaf cache in front of a [`LeafIssuer`].
///
/// Lookups go memory, then `<certs_dir>/<host>.{crt,key}`, then the issuer.
/// A `<host>.crt` without its own key is paired with the shared issuer key.
/// Concurrent first requests for one host share a single issuance.
pub struct CertificateManager {
    issuer: Arc<dyn LeafIssuer>,
    certs_dir: Option<PathBuf>,
    shared_key: Option<PathBuf>,
    slots: Mutex<HashMap<String, Slot>>,
    issued: AtomicUsize,
}

impl CertificateManager {
    pub fn new(issuer: Arc<dyn LeafIssuer>, certs_dir: Option<PathBuf>) -> Self {
        Self {
            issuer,
            certs_dir,
            shared_key: None,
            slots: Mutex::new(HashMap::new()),
            issued: AtomicUsize::new(0),
        }
    }

    /// Key used for cached `<host>.crt` files that have no `<host>.key`.
    pub fn with_shared_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.shared_key = Some(key_path.into());
        self
    }

    /// Returns the certificate for `host`, issuing it at most once per process.
    ///
    /// A failed issuance leaves the slot empty so a later connection can retry.
    pub async fn certificate_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let host = normalize_host(host);
        validate_host(&host)?;

        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|e| ProxyError::issuance(&host, format!("cache lock poisoned: {e}")))?;
            slots.entry(host.clone()).or_default().clone()
        };

        slot.get_or_try_init(|| self.load_or_issue(host.clone()))
            .await
            .cloned()
    }

    /// Synchronous cache lookup, used from inside the TLS handshake.
    pub fn cached(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let host = normalize_host(host);
        let slots = self.slots.lock().ok()?;
        slots.get(&host).and_then(|slot| slot.get().cloned())
    }

    /// Number of times the issuer has actually been invoked.
    pub fn issuance_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    /// TLS server configuration presenting per-SNI leaves, with `fallback`
    /// used for ClientHellos that carry no server name.
    pub fn server_config(
        self: &Arc<Self>,
        fallback: Arc<CertifiedKey>,
    ) -> Result<Arc<rustls::ServerConfig>> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::ClientTls(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver {
                certs: self.clone(),
                fallback,
            }));
        // The origin leg only speaks HTTP/1.1, so the client leg must too.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    async fn load_or_issue(&self, host: String) -> Result<Arc<CertifiedKey>> {
        let issuer = self.issuer.clone();
        let certs_dir = self.certs_dir.clone();
        let shared_key = self.shared_key.clone();
        let task_host = host.clone();

        let (leaf, fresh) = tokio::task::spawn_blocking(move || {
            if let Some(dir) = &certs_dir {
                if let Some(leaf) = read_cached_leaf(dir, &task_host, shared_key.as_deref()) {
                    return Ok((leaf, false));
                }
            }
            let leaf = issuer.issue(&task_host)?;
            if let Some(dir) = &certs_dir {
                if let Err(e) = write_cached_leaf(dir, &task_host, &leaf) {
                    warn!(host = %task_host, error = %e, "failed to persist leaf certificate");
                }
            }
            Ok::<_, anyhow::Error>((leaf, true))
        })
        .await
        .map_err(|e| ProxyError::issuance(&host, e))?
        .map_err(|e| ProxyError::issuance(&host, format!("{e:#}")))?;

        if fresh {
            self.issued.fetch_add(1, Ordering::SeqCst);
            info!(%host, "issued leaf certificate");
        } else {
            debug!(%host, "loaded leaf certificate from disk cache");
        }

        certified_key_from_pem(&leaf).map_err(|e| ProxyError::issuance(&host, format!("{e:#}")))
    }
}

/// Picks a leaf by SNI from the already-warmed cache. Unknown names yield
/// `None`, which aborts that handshake only.
struct SniResolver {
    certs: Arc<CertificateManager>,
    fallback: Arc<CertifiedKey>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.certs.cached(name),
            None => Some(self.fallback.clone()),
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

// Host names end up in file paths, so only a conservative alphabet is accepted.
fn validate_host(host: &str) -> Result<()> {
    let ok = !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('.')
        && !host.contains("..")
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '_'));
    if ok {
        Ok(())
    } else {
        Err(ProxyError::issuance(host, "invalid host name"))
    }
}

fn leaf_paths(dir: &Path, host: &str) -> (PathBuf, PathBuf) {
    (dir.join(format!("{host}.crt")), dir.join(format!("{host}.key")))
}

fn read_cached_leaf(dir: &Path, host: &str, shared_key: Option<&Path>) -> Option<IssuedLeaf> {
    let (cert_path, key_path) = leaf_paths(dir, host);
    let cert_pem = std::fs::read_to_string(cert_path).ok()?;
    let key_pem = match std::fs::read_to_string(&key_path) {
        Ok(pem) => pem,
        Err(_) => std::fs::read_to_string(shared_key?).ok()?,
    };
    Some(IssuedLeaf { cert_pem, key_pem })
}

fn write_cached_leaf(dir: &Path, host: &str, leaf: &IssuedLeaf) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let (cert_path, key_path) = leaf_paths(dir, host);
    std::fs::write(cert_path, &leaf.cert_pem)?;
    std::fs::write(key_path, &leaf.key_pem)
}

fn certified_key_from_pem(leaf: &IssuedLeaf) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes()).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates parsed from PEM");
    }
    let key = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())?
        .ok_or_else(|| anyhow::anyhow!("no private keys parsed from PEM"))?;
    let signer = aws_any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("failed to create leaf key signer: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signer)))
}

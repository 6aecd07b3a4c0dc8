use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tls::{ALPN_HTTP1, insecure_client_config_with_auth};
use crate::wildcard::{HostPattern, best_match};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Unable to open PFX archive: {0}")]
    Pfx(String),

    #[error("PFX archive contains no private key")]
    MissingKey,

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Certificate reference as configured: a file on disk and the hostname
/// wildcard it applies to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateSource {
    pub path: PathBuf,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    /// `.pem`, `.crt`, `.ca`
    Ca,
    /// `.pfx`
    ClientPfx,
}

impl MaterialKind {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pem" | "crt" | "ca" => Some(Self::Ca),
            "pfx" => Some(Self::ClientPfx),
            _ => None,
        }
    }
}

/// A loaded certificate. Client certificates carry a ready TLS config.
#[derive(Debug, Clone)]
pub struct Certificate {
    pattern: HostPattern,
    kind: MaterialKind,
    path: PathBuf,
    bytes: Arc<[u8]>,
    passphrase: Option<String>,
    client_config: Option<Arc<ClientConfig>>,
}

impl Certificate {
    pub fn pattern(&self) -> &HostPattern {
        &self.pattern
    }

    pub fn kind(&self) -> MaterialKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }

    pub fn client_config(&self) -> Option<&Arc<ClientConfig>> {
        self.client_config.as_ref()
    }
}

/// Certificates loaded once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct CertificateStore {
    entries: Arc<[Certificate]>,
}

impl CertificateStore {
    /// Load every configured certificate. Problems with an individual file
    /// are logged and that entry is skipped; loading itself never fails.
    pub async fn load(sources: &[CertificateSource]) -> Self {
        let mut entries = Vec::with_capacity(sources.len());
        for source in sources {
            if let Some(cert) = load_one(source).await {
                entries.push(cert);
            }
        }
        info!("Loaded {} certificate(s)", entries.len());
        Self {
            entries: entries.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best-matching certificate for `hostname`.
    pub fn find(&self, hostname: &str) -> Option<&Certificate> {
        best_match(self.entries.iter(), |c| &c.pattern, hostname)
    }
}

async fn load_one(source: &CertificateSource) -> Option<Certificate> {
    let pattern = match HostPattern::new(&source.hostname) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                "Warning: invalid hostname pattern \"{}\" for certificate {}: {}",
                source.hostname,
                source.path.display(),
                e
            );
            return None;
        }
    };

    let Some(kind) = MaterialKind::from_path(&source.path) else {
        let ext = source
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        warn!("Warning: certificate of type \"{}\" is not supported.", ext);
        return None;
    };

    let bytes = match tokio::fs::read(&source.path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(
                "Warning: certificate {} not found: {}",
                source.path.display(),
                e
            );
            return None;
        }
    };

    let name = source
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let client_config = match kind {
        MaterialKind::Ca => {
            let mut reader = bytes.as_slice();
            let parsed = rustls_pemfile::certs(&mut reader)
                .filter(|c| c.is_ok())
                .count();
            if parsed == 0 {
                warn!("Warning: no PEM certificate found in {}", name);
            }
            None
        }
        MaterialKind::ClientPfx => {
            match client_config_from_pfx(&bytes, source.passphrase.as_deref()) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(
                        "Error Loading Certificate: Wrong passphrase for certificate {} ({})",
                        name, e
                    );
                    return None;
                }
            }
        }
    };

    debug!(
        "Loaded {:?} certificate {} for {}",
        kind,
        source.path.display(),
        pattern
    );

    Some(Certificate {
        pattern,
        kind,
        path: source.path.clone(),
        bytes: bytes.into(),
        passphrase: source.passphrase.clone(),
        client_config,
    })
}

/// Open a PKCS#12 archive and build a TLS client config presenting its
/// certificate chain.
pub fn client_config_from_pfx(
    bytes: &[u8],
    passphrase: Option<&str>,
) -> Result<Arc<ClientConfig>, CertificateError> {
    let keystore = p12_keystore::KeyStore::from_pkcs12(bytes, passphrase.unwrap_or(""))
        .map_err(|e| CertificateError::Pfx(e.to_string()))?;

    let (_alias, key_chain) = keystore
        .private_key_chain()
        .ok_or(CertificateError::MissingKey)?;

    let chain: Vec<CertificateDer<'static>> = key_chain
        .chain()
        .iter()
        .map(|c| CertificateDer::from(c.as_der().to_vec()))
        .collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_chain.key().to_vec()));

    let config = insecure_client_config_with_auth(chain, key, &[ALPN_HTTP1])?;
    Ok(Arc::new(config))
}

/// Self-signed client certificate packed into a PKCS#12 archive. Returns
/// the archive and the certificate's DER.
#[cfg(test)]
pub(crate) fn test_pfx(passphrase: &str) -> (Vec<u8>, Vec<u8>) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["client.internal".to_string()]).unwrap();
    let der = cert.der().to_vec();

    let mut keystore = p12_keystore::KeyStore::new();
    let chain = p12_keystore::PrivateKeyChain::new(
        key_pair.serialize_der(),
        b"client-key",
        [p12_keystore::Certificate::from_der(&der).unwrap()],
    );
    keystore.add_entry(
        "client",
        p12_keystore::KeyStoreEntry::PrivateKeyChain(chain),
    );
    (keystore.writer(passphrase).write().unwrap(), der)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn ca_pem() -> String {
        rcgen::generate_simple_self_signed(vec!["internal.example".to_string()])
            .unwrap()
            .cert
            .pem()
    }

    #[tokio::test]
    async fn test_load_ca_and_match() {
        let dir = TempDir::new().unwrap();
        let wildcard = write(&dir, "wildcard.crt", ca_pem().as_bytes());
        let exact = write(&dir, "exact.pem", ca_pem().as_bytes());

        let store = CertificateStore::load(&[
            CertificateSource {
                path: wildcard.clone(),
                hostname: "*.example".to_string(),
                passphrase: None,
            },
            CertificateSource {
                path: exact.clone(),
                hostname: "api.example".to_string(),
                passphrase: None,
            },
        ])
        .await;

        assert_eq!(store.len(), 2);
        let found = store.find("api.example").unwrap();
        assert_eq!(found.path(), exact.as_path());
        assert_eq!(found.kind(), MaterialKind::Ca);
        assert!(found.client_config().is_none());

        let found = store.find("web.example").unwrap();
        assert_eq!(found.path(), wildcard.as_path());

        assert!(store.find("example.org").is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let store = CertificateStore::load(&[CertificateSource {
            path: PathBuf::from("/nonexistent/client.crt"),
            hostname: "*".to_string(),
            passphrase: None,
        }])
        .await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "client.der", b"\x30\x82");
        let store = CertificateStore::load(&[CertificateSource {
            path,
            hostname: "*".to_string(),
            passphrase: None,
        }])
        .await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_pfx_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "client.pfx", b"not a pkcs12 archive");
        let store = CertificateStore::load(&[CertificateSource {
            path,
            hostname: "*".to_string(),
            passphrase: Some("secret".to_string()),
        }])
        .await;
        assert!(store.is_empty());
    }

    #[test]
    fn test_client_config_from_pfx() {
        let (archive, _) = test_pfx("secret");
        let config = client_config_from_pfx(&archive, Some("secret")).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_HTTP1.to_vec()]);
        assert!(config.client_auth_cert_resolver.has_certs());

        assert!(matches!(
            client_config_from_pfx(&archive, Some("wrong")),
            Err(CertificateError::Pfx(_))
        ));
    }

    #[tokio::test]
    async fn test_pfx_with_passphrase_loads() {
        let dir = TempDir::new().unwrap();
        let (archive, _) = test_pfx("secret");
        let good = write(&dir, "good.pfx", &archive);
        let bad = write(&dir, "bad.pfx", &archive);

        let store = CertificateStore::load(&[
            CertificateSource {
                path: good.clone(),
                hostname: "*.internal".to_string(),
                passphrase: Some("secret".to_string()),
            },
            CertificateSource {
                path: bad,
                hostname: "*.corp".to_string(),
                passphrase: Some("guess".to_string()),
            },
        ])
        .await;

        // The archive opened with the wrong passphrase is dropped.
        assert_eq!(store.len(), 1);
        assert!(store.find("git.corp").is_none());

        let found = store.find("git.internal").unwrap();
        assert_eq!(found.kind(), MaterialKind::ClientPfx);
        assert_eq!(found.path(), good.as_path());
        assert_eq!(found.passphrase(), Some("secret"));
        assert_eq!(found.bytes(), archive.as_slice());
        assert!(found.client_config().is_some());
    }

    #[test]
    fn test_material_kind_from_extension() {
        assert_eq!(
            MaterialKind::from_path(Path::new("a/b.PEM")),
            Some(MaterialKind::Ca)
        );
        assert_eq!(
            MaterialKind::from_path(Path::new("b.ca")),
            Some(MaterialKind::Ca)
        );
        assert_eq!(
            MaterialKind::from_path(Path::new("c.pfx")),
            Some(MaterialKind::ClientPfx)
        );
        assert_eq!(MaterialKind::from_path(Path::new("d.key")), None);
        assert_eq!(MaterialKind::from_path(Path::new("noext")), None);
    }
}

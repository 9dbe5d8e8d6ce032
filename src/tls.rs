use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::config::ClientCertificatePaths;
use crate::error::Error;

/// Which trust anchors verify server certificates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootStore {
    /// Platform trust store only.
    System,
    /// Platform trust store plus `added` certificates from the certificates directory.
    SystemWithDirectory { added: usize },
    /// Server certificates are not verified.
    Insecure,
}

/// Certificate and key loaded for mutual TLS.
pub struct ClientIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientIdentity")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl ClientIdentity {
    pub fn load(paths: &ClientCertificatePaths) -> crate::Result<Self> {
        let cert_pem = read_file(paths.cert())?;
        let mut cert_chain = Vec::new();
        for item in CertificateDer::pem_slice_iter(&cert_pem) {
            let certificate = item.map_err(|source| Error::CertificateLoad {
                path: paths.cert().to_path_buf(),
                message: format!("failed to parse client certificate PEM: {source}"),
            })?;
            cert_chain.push(certificate);
        }
        if cert_chain.is_empty() {
            return Err(Error::CertificateLoad {
                path: paths.cert().to_path_buf(),
                message: "no certificate blocks found".to_owned(),
            });
        }

        let key_pem = read_file(paths.key())?;
        let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|source| Error::CertificateLoad {
            path: paths.key().to_path_buf(),
            message: format!("failed to parse client private key PEM: {source}"),
        })?;

        debug!(
            cert = %paths.cert().display(),
            chain_len = cert_chain.len(),
            "loaded client certificate"
        );
        Ok(Self { cert_chain, key })
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }
}

/// Assembled TLS configuration plus a description of what went into it.
#[derive(Clone, Debug)]
pub struct TlsMaterial {
    pub config: Arc<rustls::ClientConfig>,
    pub root_store: RootStore,
    pub client_certificates: usize,
}

/// Reads every PEM certificate found in the regular files of `path`.
///
/// The directory itself must be readable. Files without certificates are
/// skipped and subdirectories are not visited.
pub fn load_certificates_dir(path: &Path) -> crate::Result<Vec<CertificateDer<'static>>> {
    let unreadable = |source| Error::CertificatesDirUnreadable {
        path: path.to_path_buf(),
        source,
    };
    let entries = std::fs::read_dir(path).map_err(unreadable)?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(unreadable)?;
        let file_type = entry.file_type().map_err(unreadable)?;
        if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut certificates = Vec::new();
    for file in files {
        let contents = read_file(&file)?;
        let found = CertificateDer::pem_slice_iter(&contents)
            .filter_map(Result::ok)
            .collect::<Vec<_>>();
        if found.is_empty() {
            debug!(file = %file.display(), "no PEM certificates in file, skipping");
            continue;
        }
        debug!(file = %file.display(), count = found.len(), "loaded CA certificates");
        certificates.extend(found);
    }
    Ok(certificates)
}

pub(crate) fn build_tls_material(
    certificates_dir: Option<&Path>,
    insecure_tls: bool,
    client_certificate: Option<&ClientCertificatePaths>,
) -> crate::Result<TlsMaterial> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let directory_certificates = match certificates_dir {
        Some(path) => Some(load_certificates_dir(path)?),
        None => None,
    };

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsConfig {
            message: source.to_string(),
        })?;

    let (builder, root_store) = if insecure_tls {
        warn!("server certificate verification is disabled");
        let verifier = AcceptAnyServerCert::new(provider);
        (
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier)),
            RootStore::Insecure,
        )
    } else {
        let mut roots = system_roots();
        let root_store = match directory_certificates {
            Some(certificates) => {
                let (added, ignored) = roots.add_parsable_certificates(certificates);
                if ignored > 0 {
                    warn!(ignored, "some directory certificates are not valid trust anchors");
                }
                RootStore::SystemWithDirectory { added }
            }
            None => RootStore::System,
        };
        (builder.with_root_certificates(roots), root_store)
    };

    let (config, client_certificates) = match client_certificate {
        None => (builder.with_no_client_auth(), 0),
        Some(paths) => {
            let identity = ClientIdentity::load(paths)?;
            let config = builder
                .with_client_auth_cert(identity.cert_chain, identity.key)
                .map_err(|source| Error::CertificateLoad {
                    path: paths.key().to_path_buf(),
                    message: format!("client certificate rejected: {source}"),
                })?;
            (config, 1)
        }
    };

    Ok(TlsMaterial {
        config: Arc::new(config),
        root_store,
        client_certificates,
    })
}

fn system_roots() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    if !loaded.errors.is_empty() {
        warn!(
            error_count = loaded.errors.len(),
            "system root certificate loading returned partial errors"
        );
    }
    let (added, _ignored) = roots.add_parsable_certificates(loaded.certs);
    if added == 0 {
        warn!("no usable system root certificates, falling back to bundled webpki roots");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    roots
}

fn read_file(path: &Path) -> crate::Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::CertificateLoad {
        path: PathBuf::from(path),
        message: source.to_string(),
    })
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
pub(crate) struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{RootStore, build_tls_material, load_certificates_dir};
    use crate::config::ClientCertificatePaths;
    use crate::error::ErrorCode;

    fn fixture(relative: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(relative)
    }

    #[test]
    fn missing_directory_is_a_configuration_error() {
        let error = load_certificates_dir(&fixture("does-not-exist"))
            .expect_err("missing dir should fail");
        assert_eq!(error.code(), ErrorCode::CertificatesDirUnreadable);
        assert_eq!(error.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn files_without_certificates_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("README"), "not a certificate").expect("write readme");
        std::fs::copy(fixture("ca/ca.pem"), dir.path().join("ca.pem")).expect("copy ca");
        std::fs::create_dir(dir.path().join("nested")).expect("nested dir");
        std::fs::copy(fixture("ca/ca.pem"), dir.path().join("nested/ca.pem")).expect("copy nested");

        let certificates = load_certificates_dir(dir.path()).expect("load dir");
        assert_eq!(certificates.len(), 1);
    }

    #[test]
    fn no_directory_uses_system_trust() {
        let material = build_tls_material(None, false, None).expect("tls material");
        assert_eq!(material.root_store, RootStore::System);
        assert_eq!(material.client_certificates, 0);
        assert!(!material.config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn directory_certificates_extend_system_trust() {
        let material =
            build_tls_material(Some(&fixture("ca")), false, None).expect("tls material");
        assert_eq!(material.root_store, RootStore::SystemWithDirectory { added: 1 });
    }

    #[test]
    fn insecure_mode_still_validates_the_directory() {
        let error = build_tls_material(Some(&fixture("missing-ca")), true, None)
            .expect_err("unreadable dir should fail");
        assert_eq!(error.code(), ErrorCode::CertificatesDirUnreadable);

        let material = build_tls_material(None, true, None).expect("tls material");
        assert_eq!(material.root_store, RootStore::Insecure);
    }

    #[test]
    fn client_identity_is_attached_once() {
        let paths = ClientCertificatePaths::new(
            fixture("certs/client.pem"),
            fixture("certs/client.key"),
        );
        let material = build_tls_material(None, false, Some(&paths)).expect("tls material");
        assert_eq!(material.client_certificates, 1);
        assert!(material.config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn unreadable_client_key_is_reported() {
        let paths = ClientCertificatePaths::new(
            fixture("certs/client.pem"),
            fixture("certs/missing.key"),
        );
        let error = build_tls_material(None, false, Some(&paths)).expect_err("missing key");
        assert_eq!(error.code(), ErrorCode::CertificateLoad);
    }

    #[test]
    fn a_key_file_is_not_a_certificate_chain() {
        let paths = ClientCertificatePaths::new(
            fixture("certs/client.key"),
            fixture("certs/client.key"),
        );
        let error = build_tls_material(None, false, Some(&paths)).expect_err("no cert blocks");
        assert_eq!(error.code(), ErrorCode::CertificateLoad);
    }
}

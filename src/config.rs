use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use crate::context::CancellationContext;
use crate::error::Error;
use crate::kerberos::{KerberosLogin, KerberosSettings, KinitLogin};
use crate::redirect::RedirectPolicy;
use crate::retry::{Backoff, RetryClassifier, RetryPolicy};
use crate::transport::HttpTransport;
use crate::util::{parse_header_name, parse_header_value};

pub const DEFAULT_RETRIES: usize = 3;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::ZERO;

/// Fixed transport tuning for a REST client talking to one or a few hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportDefaults {
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    pub idle_connection_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// Recorded for completeness; hyper never sends `Expect: 100-continue` itself.
    pub expect_continue_timeout: Duration,
    /// Idle connections across all hosts. hyper-util pools per host only, so
    /// this is not enforced; the per-host bound below is.
    pub max_idle_connections: usize,
    pub max_idle_connections_per_host: usize,
}

impl TransportDefaults {
    pub const STANDARD: Self = Self {
        dial_timeout: Duration::from_secs(30),
        keep_alive: Duration::from_secs(20),
        idle_connection_timeout: Duration::from_secs(90),
        tls_handshake_timeout: Duration::from_secs(10),
        expect_continue_timeout: Duration::from_secs(1),
        max_idle_connections: 100,
        max_idle_connections_per_host: 2,
    };
}

impl Default for TransportDefaults {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Client certificate and private key for mutual TLS, always configured together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCertificatePaths {
    cert: PathBuf,
    key: PathBuf,
}

impl ClientCertificatePaths {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Pairs optional paths; one without the other is a configuration error.
    pub fn from_optional(
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    ) -> crate::Result<Option<Self>> {
        let cert = cert.filter(|path| !path.as_os_str().is_empty());
        let key = key.filter(|path| !path.as_os_str().is_empty());
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(Self::new(cert, key))),
            (cert, key) => Err(Error::ClientCertificatePairMismatch { cert, key }),
        }
    }

    pub fn cert(&self) -> &Path {
        &self.cert
    }

    pub fn key(&self) -> &Path {
        &self.key
    }
}

/// Everything [`HttpClient::build`](crate::HttpClient::build) reads.
///
/// Immutable once built; the client builder only ever borrows it.
#[derive(Clone)]
pub struct ClientConfiguration {
    certificates_dir: Option<PathBuf>,
    client_certificate: Option<ClientCertificatePaths>,
    insecure_tls: bool,
    dial_timeout: Duration,
    overall_request_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    redirect_policy: RedirectPolicy,
    custom_transport: Option<Arc<dyn HttpTransport>>,
    kerberos: KerberosSettings,
    kerberos_login: Arc<dyn KerberosLogin>,
    context: CancellationContext,
    transport_defaults: TransportDefaults,
    user_agent: String,
    default_headers: HeaderMap,
}

impl std::fmt::Debug for ClientConfiguration {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientConfiguration")
            .field("certificates_dir", &self.certificates_dir)
            .field("client_certificate", &self.client_certificate)
            .field("insecure_tls", &self.insecure_tls)
            .field("dial_timeout", &self.dial_timeout)
            .field("overall_request_timeout", &self.overall_request_timeout)
            .field("retry_policy", &self.retry_policy)
            .field("redirect_policy", &self.redirect_policy)
            .field("custom_transport", &self.custom_transport.is_some())
            .field("kerberos", &self.kerberos)
            .field("transport_defaults", &self.transport_defaults)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl ClientConfiguration {
    pub fn builder() -> ClientConfigurationBuilder {
        ClientConfigurationBuilder::default()
    }

    pub fn certificates_dir(&self) -> Option<&Path> {
        self.certificates_dir.as_deref()
    }

    pub fn client_certificate(&self) -> Option<&ClientCertificatePaths> {
        self.client_certificate.as_ref()
    }

    pub fn insecure_tls(&self) -> bool {
        self.insecure_tls
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn overall_request_timeout(&self) -> Option<Duration> {
        self.overall_request_timeout
    }

    pub fn retries(&self) -> usize {
        self.retry_policy.retries()
    }

    pub fn retry_wait(&self) -> Duration {
        self.retry_policy.wait()
    }

    pub fn backoff(&self) -> Backoff {
        self.retry_policy.backoff_mode()
    }

    pub fn custom_transport(&self) -> Option<&Arc<dyn HttpTransport>> {
        self.custom_transport.as_ref()
    }

    pub fn kerberos(&self) -> &KerberosSettings {
        &self.kerberos
    }

    pub fn kerberos_login(&self) -> &Arc<dyn KerberosLogin> {
        &self.kerberos_login
    }

    pub fn context(&self) -> &CancellationContext {
        &self.context
    }

    pub fn transport_defaults(&self) -> &TransportDefaults {
        &self.transport_defaults
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }
}

pub struct ClientConfigurationBuilder {
    certificates_dir: Option<PathBuf>,
    client_cert: Option<PathBuf>,
    client_key: Option<PathBuf>,
    insecure_tls: bool,
    dial_timeout: Option<Duration>,
    overall_request_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    redirect_policy: RedirectPolicy,
    custom_transport: Option<Arc<dyn HttpTransport>>,
    kerberos: KerberosSettings,
    kerberos_login: Option<Arc<dyn KerberosLogin>>,
    context: CancellationContext,
    transport_defaults: TransportDefaults,
    user_agent: Option<String>,
    default_headers: Vec<(String, String)>,
}

impl Default for ClientConfigurationBuilder {
    fn default() -> Self {
        Self {
            certificates_dir: None,
            client_cert: None,
            client_key: None,
            insecure_tls: false,
            dial_timeout: None,
            overall_request_timeout: None,
            retry_policy: RetryPolicy::new(DEFAULT_RETRIES, DEFAULT_RETRY_WAIT),
            redirect_policy: RedirectPolicy::default(),
            custom_transport: None,
            kerberos: KerberosSettings::Disabled,
            kerberos_login: None,
            context: CancellationContext::default(),
            transport_defaults: TransportDefaults::STANDARD,
            user_agent: None,
            default_headers: Vec::new(),
        }
    }
}

impl ClientConfigurationBuilder {
    /// Directory of extra CA certificates trusted on top of the system store.
    pub fn certificates_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificates_dir = Some(path.into());
        self
    }

    pub fn client_certificate(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(cert.into());
        self.client_key = Some(key.into());
        self
    }

    pub fn client_cert_path(mut self, cert: impl Into<PathBuf>) -> Self {
        self.client_cert = Some(cert.into());
        self
    }

    pub fn client_key_path(mut self, key: impl Into<PathBuf>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    /// Disables server certificate verification. Never the default.
    pub fn insecure_tls(mut self, insecure_tls: bool) -> Self {
        self.insecure_tls = insecure_tls;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Bound on one attempt including the body read. Zero means unbounded.
    pub fn overall_request_timeout(mut self, timeout: Duration) -> Self {
        self.overall_request_timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retry_policy = self.retry_policy.with_retries(retries);
        self
    }

    pub fn retry_wait(mut self, wait: Duration) -> Self {
        self.retry_policy = self.retry_policy.with_wait(wait);
        self
    }

    pub fn retry_wait_millis(self, millis: u64) -> Self {
        self.retry_wait(Duration::from_millis(millis))
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.retry_policy = self.retry_policy.backoff(backoff);
        self
    }

    pub fn retry_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_policy = self.retry_policy.retry_classifier(classifier);
        self
    }

    /// Replaces the whole retry policy, including retryable statuses,
    /// transport error kinds and jitter. Later `retries`/`retry_wait`/
    /// `backoff` calls adjust the replacement.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Follows up to ten redirects unless changed.
    pub fn redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.redirect_policy = policy;
        self
    }

    pub fn custom_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.custom_transport = Some(transport);
        self
    }

    pub fn kerberos(mut self, kerberos: KerberosSettings) -> Self {
        self.kerberos = kerberos;
        self
    }

    pub fn kerberos_login(mut self, login: Arc<dyn KerberosLogin>) -> Self {
        self.kerberos_login = Some(login);
        self
    }

    pub fn context(mut self, context: CancellationContext) -> Self {
        self.context = context;
        self
    }

    pub fn transport_defaults(mut self, defaults: TransportDefaults) -> Self {
        self.transport_defaults = defaults;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> crate::Result<ClientConfiguration> {
        let client_certificate =
            ClientCertificatePaths::from_optional(self.client_cert, self.client_key)?;
        let certificates_dir = self
            .certificates_dir
            .filter(|path| !path.as_os_str().is_empty());

        let dial_timeout = self
            .dial_timeout
            .unwrap_or(self.transport_defaults.dial_timeout);
        if dial_timeout.is_zero() {
            return Err(Error::InvalidConfiguration {
                field: "dial_timeout",
                message: "must be greater than zero".to_owned(),
            });
        }
        if self.transport_defaults.tls_handshake_timeout.is_zero() {
            return Err(Error::InvalidConfiguration {
                field: "transport_defaults.tls_handshake_timeout",
                message: "must be greater than zero".to_owned(),
            });
        }
        let overall_request_timeout = self
            .overall_request_timeout
            .filter(|timeout| !timeout.is_zero());

        let user_agent = self
            .user_agent
            .unwrap_or_else(|| format!("artifact-client/{}", env!("CARGO_PKG_VERSION")));
        if parse_header_value("user-agent", &user_agent).is_err() {
            return Err(Error::InvalidConfiguration {
                field: "user_agent",
                message: "not a valid header value".to_owned(),
            });
        }

        let mut default_headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let name = parse_header_name(name)?;
            let value = parse_header_value(name.as_str(), value)?;
            default_headers.insert(name, value);
        }

        Ok(ClientConfiguration {
            certificates_dir,
            client_certificate,
            insecure_tls: self.insecure_tls,
            dial_timeout,
            overall_request_timeout,
            retry_policy: self.retry_policy,
            redirect_policy: self.redirect_policy,
            custom_transport: self.custom_transport,
            kerberos: self.kerberos,
            kerberos_login: self
                .kerberos_login
                .unwrap_or_else(|| Arc::new(KinitLogin::default())),
            context: self.context,
            transport_defaults: self.transport_defaults,
            user_agent,
            default_headers,
        })
    }
}

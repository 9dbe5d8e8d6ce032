use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::stream::{self, StreamExt};
use http::header::{AUTHORIZATION, HeaderValue};
use serde::Deserialize;
use tracing::info;

use crate::client::HttpClient;
use crate::config::{ClientConfiguration, ClientConfigurationBuilder, DEFAULT_RETRIES};
use crate::context::CancellationContext;
use crate::error::Error;
use crate::kerberos::{KerberosLogin, KerberosSettings};
use crate::metrics::ClientMetricsSnapshot;
use crate::request::ExecuteRequest;
use crate::response::HttpResponse;
use crate::secret::Secret;
use crate::transport::HttpTransport;
use crate::util::{redact_uri_for_logs, resolve_uri, validate_base_url};

pub const DEFAULT_THREADS: usize = 3;

/// How requests to the service authenticate, independent of Kerberos.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    Anonymous,
    Basic { user: String, password: Secret },
    /// Sent as a bearer token, or as the Basic password when a user is known.
    AccessToken { user: Option<String>, token: Secret },
}

impl Credentials {
    pub fn basic(user: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn access_token(token: impl Into<Secret>) -> Self {
        Self::AccessToken {
            user: None,
            token: token.into(),
        }
    }

    /// Picks credentials from loosely specified inputs. A token wins over a
    /// password; nothing set means anonymous.
    pub fn from_parts(user: &str, password: &str, access_token: &str) -> Self {
        let user = Some(user.trim()).filter(|user| !user.is_empty());
        if !access_token.is_empty() {
            return Self::AccessToken {
                user: user.map(str::to_owned),
                token: Secret::new(access_token),
            };
        }
        match user {
            Some(user) if !password.is_empty() => Self::basic(user, password),
            _ => Self::Anonymous,
        }
    }

    pub(crate) fn authorization(&self) -> crate::Result<Option<HeaderValue>> {
        let text = match self {
            Self::Anonymous => return Ok(None),
            Self::Basic { user, password } => basic_authorization(user, password.expose()),
            Self::AccessToken {
                user: Some(user),
                token,
            } => basic_authorization(user, token.expose()),
            Self::AccessToken { user: None, token } => format!("Bearer {}", token.expose()),
        };
        let mut value = HeaderValue::from_str(&text).map_err(|_| Error::InvalidConfiguration {
            field: "credentials",
            message: "credentials contain characters not allowed in a header".to_owned(),
        })?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

fn basic_authorization(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

/// Where the service lives and who is calling it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDetails {
    url: String,
    credentials: Credentials,
}

impl ServiceDetails {
    pub fn new(url: impl Into<String>) -> crate::Result<Self> {
        let url = url.into();
        validate_base_url(&url)?;
        Ok(Self {
            url,
            credentials: Credentials::Anonymous,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

/// Per-service settings: the transport configuration plus service details,
/// fan-out width and dry-run.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    details: ServiceDetails,
    threads: usize,
    dry_run: bool,
    client: ClientConfiguration,
}

impl ServiceConfig {
    pub fn builder(details: ServiceDetails) -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            details,
            threads: DEFAULT_THREADS,
            dry_run: false,
            client: ClientConfiguration::builder(),
        }
    }

    pub fn service_details(&self) -> &ServiceDetails {
        &self.details
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn client_configuration(&self) -> &ClientConfiguration {
        &self.client
    }
}

pub struct ServiceConfigBuilder {
    details: ServiceDetails,
    threads: usize,
    dry_run: bool,
    client: ClientConfigurationBuilder,
}

impl ServiceConfigBuilder {
    /// Maximum requests [`ServiceClient::send_all`] keeps in flight.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn certificates_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.client = self.client.certificates_dir(path);
        self
    }

    pub fn client_certificate(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client = self.client.client_certificate(cert, key);
        self
    }

    pub fn insecure_tls(mut self, insecure_tls: bool) -> Self {
        self.client = self.client.insecure_tls(insecure_tls);
        self
    }

    pub fn context(mut self, context: CancellationContext) -> Self {
        self.client = self.client.context(context);
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.dial_timeout(timeout);
        self
    }

    pub fn overall_request_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.overall_request_timeout(timeout);
        self
    }

    pub fn http_retries(mut self, retries: usize) -> Self {
        self.client = self.client.retries(retries);
        self
    }

    pub fn http_retry_wait_millis(mut self, millis: u64) -> Self {
        self.client = self.client.retry_wait_millis(millis);
        self
    }

    pub fn custom_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.client = self.client.custom_transport(transport);
        self
    }

    pub fn kerberos(mut self, kerberos: KerberosSettings) -> Self {
        self.client = self.client.kerberos(kerberos);
        self
    }

    pub fn kerberos_login(mut self, login: Arc<dyn KerberosLogin>) -> Self {
        self.client = self.client.kerberos_login(login);
        self
    }

    /// Escape hatch for transport options without a service-level setter.
    pub fn configure_client(
        mut self,
        configure: impl FnOnce(ClientConfigurationBuilder) -> ClientConfigurationBuilder,
    ) -> Self {
        self.client = configure(self.client);
        self
    }

    pub fn build(self) -> crate::Result<ServiceConfig> {
        if self.threads == 0 {
            return Err(Error::InvalidConfiguration {
                field: "threads",
                message: "must be at least 1".to_owned(),
            });
        }
        Ok(ServiceConfig {
            details: self.details,
            threads: self.threads,
            dry_run: self.dry_run,
            client: self.client.build()?,
        })
    }
}

/// Service configuration as stored on disk. Keys are camelCase; an empty
/// string means "not set".
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub access_token: String,
    pub certificates_path: String,
    pub client_cert_path: String,
    pub client_cert_key_path: String,
    pub threads: Option<usize>,
    pub dry_run: bool,
    pub insecure_tls: bool,
    pub dial_timeout_ms: Option<u64>,
    pub overall_request_timeout_ms: Option<u64>,
    pub http_retries: Option<usize>,
    pub http_retry_wait_milli_secs: Option<u64>,
    pub kerberos: KerberosSettingsFile,
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KerberosSettingsFile {
    pub krb5_config_path: String,
    pub username: String,
    pub realm: String,
    pub password: String,
    pub keytab_path: String,
}

impl std::fmt::Debug for ServiceSettings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ServiceSettings")
            .field("url", &redact_uri_for_logs(&self.url))
            .field("user", &self.user)
            .field("certificates_path", &self.certificates_path)
            .field("threads", &self.threads)
            .field("dry_run", &self.dry_run)
            .field("insecure_tls", &self.insecure_tls)
            .field("http_retries", &self.http_retries)
            .field("kerberos", &self.kerberos)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for KerberosSettingsFile {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("KerberosSettingsFile")
            .field("krb5_config_path", &self.krb5_config_path)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("keytab_path", &self.keytab_path)
            .finish_non_exhaustive()
    }
}

impl ServiceSettings {
    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|source| Error::SettingsParse { source })
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::SettingsRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Validates the settings and turns them into a builder, so callers can
    /// still attach a context, custom transport or Kerberos login.
    pub fn into_builder(self) -> crate::Result<ServiceConfigBuilder> {
        let details = ServiceDetails::new(self.url)?.with_credentials(Credentials::from_parts(
            &self.user,
            &self.password,
            &self.access_token,
        ));
        let kerberos = KerberosSettings::from_parts(
            &self.kerberos.krb5_config_path,
            &self.kerberos.username,
            &self.kerberos.realm,
            &self.kerberos.password,
            &self.kerberos.keytab_path,
        )?;

        let mut builder = ServiceConfig::builder(details)
            .threads(self.threads.unwrap_or(DEFAULT_THREADS))
            .dry_run(self.dry_run)
            .insecure_tls(self.insecure_tls)
            .http_retries(self.http_retries.unwrap_or(DEFAULT_RETRIES))
            .http_retry_wait_millis(self.http_retry_wait_milli_secs.unwrap_or_default())
            .kerberos(kerberos);
        if !self.certificates_path.is_empty() {
            builder = builder.certificates_path(self.certificates_path);
        }
        if let Some(millis) = self.dial_timeout_ms {
            builder = builder.dial_timeout(Duration::from_millis(millis));
        }
        if let Some(millis) = self.overall_request_timeout_ms {
            builder = builder.overall_request_timeout(Duration::from_millis(millis));
        }

        let client_cert = Some(PathBuf::from(self.client_cert_path));
        let client_key = Some(PathBuf::from(self.client_cert_key_path));
        Ok(builder.configure_client(|client| {
            let client = match client_cert.filter(|path| !path.as_os_str().is_empty()) {
                Some(cert) => client.client_cert_path(cert),
                None => client,
            };
            match client_key.filter(|path| !path.as_os_str().is_empty()) {
                Some(key) => client.client_key_path(key),
                None => client,
            }
        }))
    }

    pub fn into_config(self) -> crate::Result<ServiceConfig> {
        self.into_builder()?.build()
    }
}

/// Result of [`ServiceClient::send`].
#[derive(Debug)]
pub enum Dispatched {
    Sent(HttpResponse),
    /// A mutating request that dry-run mode kept from reaching the transport.
    DryRun {
        method: http::Method,
        uri: String,
    },
}

impl Dispatched {
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::Sent(response) => Some(response),
            Self::DryRun { .. } => None,
        }
    }

    pub fn into_response(self) -> Option<HttpResponse> {
        match self {
            Self::Sent(response) => Some(response),
            Self::DryRun { .. } => None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun { .. })
    }
}

/// An [`HttpClient`] bound to one service url and set of credentials.
#[derive(Clone, Debug)]
pub struct ServiceClient {
    client: HttpClient,
    base_url: String,
    authorization: Option<HeaderValue>,
    threads: usize,
    dry_run: bool,
}

impl ServiceClient {
    pub async fn build(config: &ServiceConfig) -> crate::Result<Self> {
        let client = HttpClient::build(config.client_configuration()).await?;
        let details = config.service_details();
        Ok(Self {
            client,
            base_url: details.url().to_owned(),
            authorization: details.credentials().authorization()?,
            threads: config.threads(),
            dry_run: config.is_dry_run(),
        })
    }

    pub fn http_client(&self) -> &HttpClient {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.client.metrics_snapshot()
    }

    /// Resolves the request against the service url and executes it.
    ///
    /// An explicit `Authorization` header on the request wins over the
    /// configured credentials, which in turn win over Kerberos.
    pub async fn send(&self, request: ExecuteRequest) -> crate::Result<Dispatched> {
        let request = self.prepare(request)?;

        if self.dry_run && !request.is_read_only() {
            let uri = redact_uri_for_logs(request.url());
            info!(method = %request.method(), uri = %uri, "dry run, request not sent");
            self.client.metrics().record_dry_run_skip();
            return Ok(Dispatched::DryRun {
                method: request.method().clone(),
                uri,
            });
        }
        self.client.execute(request).await.map(Dispatched::Sent)
    }

    /// Sends a request that never changes server state, so dry-run mode
    /// does not apply.
    pub async fn fetch(&self, request: ExecuteRequest) -> crate::Result<HttpResponse> {
        let request = self.prepare(request.read_only(true))?;
        self.client.execute(request).await
    }

    fn prepare(&self, request: ExecuteRequest) -> crate::Result<ExecuteRequest> {
        let (uri_text, _) = resolve_uri(&self.base_url, request.url())?;
        let mut request = request.with_url(uri_text);
        if let Some(authorization) = &self.authorization
            && !request.headers().contains_key(AUTHORIZATION)
        {
            request
                .headers_mut()
                .insert(AUTHORIZATION, authorization.clone());
        }
        Ok(request)
    }

    /// Sends every request with at most `threads` in flight. Results keep the
    /// order of the input.
    pub async fn send_all<I>(&self, requests: I) -> Vec<crate::Result<Dispatched>>
    where
        I: IntoIterator<Item = ExecuteRequest>,
    {
        stream::iter(requests)
            .map(|request| self.send(request))
            .buffered(self.threads.max(1))
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Credentials, ServiceConfig, ServiceDetails, ServiceSettings};
    use crate::error::ErrorCode;

    #[test]
    fn credentials_become_authorization_headers() {
        let basic = Credentials::basic("deployer", "s3cret")
            .authorization()
            .expect("basic")
            .expect("header");
        assert_eq!(basic, "Basic ZGVwbG95ZXI6czNjcmV0");
        assert!(basic.is_sensitive());

        let bearer = Credentials::access_token("tok")
            .authorization()
            .expect("bearer")
            .expect("header");
        assert_eq!(bearer, "Bearer tok");

        assert!(
            Credentials::Anonymous
                .authorization()
                .expect("anonymous")
                .is_none()
        );
    }

    #[test]
    fn token_wins_over_password() {
        assert!(matches!(
            Credentials::from_parts("deployer", "s3cret", "tok"),
            Credentials::AccessToken { user: Some(_), .. }
        ));
        assert_eq!(
            Credentials::from_parts("", "s3cret", ""),
            Credentials::Anonymous
        );
    }

    #[test]
    fn service_url_must_be_absolute() {
        let error = ServiceDetails::new("artifacts.example.com").expect_err("no scheme");
        assert_eq!(error.code(), ErrorCode::InvalidUri);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let details = ServiceDetails::new("https://artifacts.example.com/artifactory/")
            .expect("details");
        let error = ServiceConfig::builder(details)
            .threads(0)
            .build()
            .expect_err("zero threads");
        assert_eq!(error.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn settings_file_maps_onto_the_configuration() {
        let settings = ServiceSettings::from_json(
            r#"{
                "url": "https://artifacts.example.com/artifactory/",
                "user": "deployer",
                "password": "s3cret",
                "threads": 8,
                "dryRun": true,
                "dialTimeoutMs": 5000,
                "overallRequestTimeoutMs": 0,
                "httpRetries": 5,
                "httpRetryWaitMilliSecs": 250,
                "kerberos": { "krb5ConfigPath": "", "password": "ignored" }
            }"#,
        )
        .expect("settings");
        let config = settings.into_config().expect("config");

        assert_eq!(config.threads(), 8);
        assert!(config.is_dry_run());
        let client = config.client_configuration();
        assert_eq!(client.dial_timeout(), Duration::from_secs(5));
        assert_eq!(client.overall_request_timeout(), None);
        assert_eq!(client.retries(), 5);
        assert_eq!(client.retry_wait(), Duration::from_millis(250));
        assert!(!client.kerberos().is_enabled());
    }

    #[test]
    fn defaults_apply_when_settings_are_silent() {
        let config = ServiceSettings::from_json(r#"{"url": "https://artifacts.example.com"}"#)
            .expect("settings")
            .into_config()
            .expect("config");
        assert_eq!(config.threads(), 3);
        assert!(!config.is_dry_run());
        assert_eq!(config.client_configuration().retries(), 3);
        assert_eq!(config.client_configuration().retry_wait(), Duration::ZERO);
    }

    #[test]
    fn half_a_client_certificate_in_settings_is_rejected() {
        let error = ServiceSettings::from_json(
            r#"{"url": "https://artifacts.example.com", "clientCertPath": "/etc/pki/client.pem"}"#,
        )
        .expect("settings")
        .into_config()
        .expect_err("missing key");
        assert_eq!(error.code(), ErrorCode::ClientCertificatePairMismatch);
    }

    #[test]
    fn malformed_settings_are_parse_errors() {
        let error = ServiceSettings::from_json("{\"threads\": \"many\"}").expect_err("bad type");
        assert_eq!(error.code(), ErrorCode::SettingsParse);
    }

    #[test]
    fn missing_settings_file_is_a_read_error() {
        let error = ServiceSettings::load("/nonexistent/artifact-client.json").expect_err("missing");
        assert_eq!(error.code(), ErrorCode::SettingsRead);
    }
}

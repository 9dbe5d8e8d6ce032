use std::path::PathBuf;

use http::{HeaderMap, Method};
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or unreadable configuration. Fatal, never retried.
    Configuration,
    /// Kerberos keytab or login failure while building a client.
    Authentication,
    /// Connection, handshake, read or timeout failure.
    Transport,
    /// The service answered with a non-success status.
    Remote,
    /// The configured context was cancelled or its deadline passed.
    Cancelled,
    /// The request itself could not be constructed.
    Request,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Configuration => "configuration",
            Self::Authentication => "authentication",
            Self::Transport => "transport",
            Self::Remote => "remote",
            Self::Cancelled => "cancelled",
            Self::Request => "request",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    Cancelled,
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Cancelled => "context cancelled",
            Self::DeadlineExceeded => "context deadline exceeded",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidConfiguration,
    ClientCertificatePairMismatch,
    CertificatesDirUnreadable,
    CertificateLoad,
    TlsConfig,
    KerberosConfigUnreadable,
    KerberosConfigMalformed,
    AmbiguousKerberosCredential,
    SettingsRead,
    SettingsParse,
    KeytabLoad,
    KerberosLogin,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    RequestBuild,
    SerializeJson,
    Deserialize,
    Transport,
    Timeout,
    HttpStatus,
    InvalidRedirectLocation,
    RedirectLimitExceeded,
    Cancelled,
    RetriesExhausted,
    AbortedAfterRetries,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "invalid_configuration",
            Self::ClientCertificatePairMismatch => "client_certificate_pair_mismatch",
            Self::CertificatesDirUnreadable => "certificates_dir_unreadable",
            Self::CertificateLoad => "certificate_load",
            Self::TlsConfig => "tls_config",
            Self::KerberosConfigUnreadable => "kerberos_config_unreadable",
            Self::KerberosConfigMalformed => "kerberos_config_malformed",
            Self::AmbiguousKerberosCredential => "ambiguous_kerberos_credential",
            Self::SettingsRead => "settings_read",
            Self::SettingsParse => "settings_parse",
            Self::KeytabLoad => "keytab_load",
            Self::KerberosLogin => "kerberos_login",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::RequestBuild => "request_build",
            Self::SerializeJson => "serialize_json",
            Self::Deserialize => "deserialize",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted => "retries_exhausted",
            Self::AbortedAfterRetries => "aborted_after_retries",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration for {field}: {message}")]
    InvalidConfiguration {
        field: &'static str,
        message: String,
    },
    #[error("client certificate and key must be configured together (cert={cert:?}, key={key:?})")]
    ClientCertificatePairMismatch {
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    },
    #[error("failed to read certificates directory {}: {source}", path.display())]
    CertificatesDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load certificate material from {}: {message}", path.display())]
    CertificateLoad { path: PathBuf, message: String },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("failed to read kerberos configuration {}: {source}", path.display())]
    KerberosConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed kerberos configuration {} at line {line}: {message}", path.display())]
    KerberosConfigMalformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("kerberos settings for {principal} supply both a password and a keytab")]
    AmbiguousKerberosCredential { principal: String },
    #[error("failed to read settings file {}: {source}", path.display())]
    SettingsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {source}")]
    SettingsParse {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to load keytab {}: {message}", path.display())]
    KeytabLoad { path: PathBuf, message: String },
    #[error("kerberos login failed for {principal}: {message}")]
    KerberosLogin { principal: String, message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        body: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("{reason} after {attempts} attempt(s) for {method} {uri}")]
    Cancelled {
        reason: CancelReason,
        attempts: usize,
        method: Method,
        uri: String,
    },
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("request failed on attempt {attempts}: {source}")]
    AbortedAfterRetries {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfiguration { .. } => ErrorCode::InvalidConfiguration,
            Self::ClientCertificatePairMismatch { .. } => ErrorCode::ClientCertificatePairMismatch,
            Self::CertificatesDirUnreadable { .. } => ErrorCode::CertificatesDirUnreadable,
            Self::CertificateLoad { .. } => ErrorCode::CertificateLoad,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::KerberosConfigUnreadable { .. } => ErrorCode::KerberosConfigUnreadable,
            Self::KerberosConfigMalformed { .. } => ErrorCode::KerberosConfigMalformed,
            Self::AmbiguousKerberosCredential { .. } => ErrorCode::AmbiguousKerberosCredential,
            Self::SettingsRead { .. } => ErrorCode::SettingsRead,
            Self::SettingsParse { .. } => ErrorCode::SettingsParse,
            Self::KeytabLoad { .. } => ErrorCode::KeytabLoad,
            Self::KerberosLogin { .. } => ErrorCode::KerberosLogin,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::AbortedAfterRetries { .. } => ErrorCode::AbortedAfterRetries,
        }
    }

    /// Taxonomy of the failure. Attempt annotations report the kind of the
    /// error they wrap.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration { .. }
            | Self::ClientCertificatePairMismatch { .. }
            | Self::CertificatesDirUnreadable { .. }
            | Self::CertificateLoad { .. }
            | Self::TlsConfig { .. }
            | Self::KerberosConfigUnreadable { .. }
            | Self::KerberosConfigMalformed { .. }
            | Self::AmbiguousKerberosCredential { .. }
            | Self::SettingsRead { .. }
            | Self::SettingsParse { .. } => ErrorKind::Configuration,
            Self::KeytabLoad { .. } | Self::KerberosLogin { .. } => ErrorKind::Authentication,
            Self::InvalidUri { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::RequestBuild { .. }
            | Self::Serialize { .. }
            | Self::Deserialize { .. } => ErrorKind::Request,
            Self::Transport { .. } | Self::Timeout { .. } => ErrorKind::Transport,
            Self::HttpStatus { .. }
            | Self::InvalidRedirectLocation { .. }
            | Self::RedirectLimitExceeded { .. } => ErrorKind::Remote,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::RetriesExhausted { source, .. } | Self::AbortedAfterRetries { source, .. } => {
                source.kind()
            }
        }
    }

    /// Number of attempts made before this error was returned, when known.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::Cancelled { attempts, .. }
            | Self::RetriesExhausted { attempts, .. }
            | Self::AbortedAfterRetries { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The innermost error, unwrapping attempt annotations.
    pub fn last_error(&self) -> &Error {
        match self {
            Self::RetriesExhausted { source, .. } | Self::AbortedAfterRetries { source, .. } => {
                source.last_error()
            }
            other => other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.last_error() {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the underlying failure is transient under the default retry
    /// policy. Advisory only; the client has already applied its own budget.
    pub fn is_retryable(&self) -> bool {
        match self.last_error() {
            Self::Transport { kind, .. } => matches!(
                kind,
                TransportErrorKind::Dns
                    | TransportErrorKind::Connect
                    | TransportErrorKind::Read
                    | TransportErrorKind::Timeout
            ),
            Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::{CancelReason, Error, ErrorCode, ErrorKind};

    fn status_error(status: u16) -> Error {
        Error::HttpStatus {
            status,
            method: Method::GET,
            uri: "https://artifacts.example.com/api/system/ping".to_owned(),
            headers: Box::default(),
            body: String::new(),
        }
    }

    #[test]
    fn attempt_annotations_report_the_wrapped_kind() {
        let error = Error::RetriesExhausted {
            attempts: 4,
            source: Box::new(status_error(503)),
        };

        assert_eq!(error.code(), ErrorCode::RetriesExhausted);
        assert_eq!(error.kind(), ErrorKind::Remote);
        assert_eq!(error.attempts(), Some(4));
        assert_eq!(error.status(), Some(503));
        assert!(matches!(error.last_error(), Error::HttpStatus { .. }));
    }

    #[test]
    fn cancellation_is_distinct_from_remote_failures() {
        let error = Error::Cancelled {
            reason: CancelReason::DeadlineExceeded,
            attempts: 1,
            method: Method::PUT,
            uri: "https://artifacts.example.com/libs/a.jar".to_owned(),
        };

        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert!(error.is_cancelled());
        assert_eq!(error.status(), None);
        assert!(error.to_string().starts_with("context deadline exceeded"));
    }

    #[test]
    fn error_codes_are_snake_case() {
        assert_eq!(ErrorCode::KerberosLogin.as_str(), "kerberos_login");
        assert_eq!(
            ErrorCode::ClientCertificatePairMismatch.as_str(),
            "client_certificate_pair_mismatch"
        );
    }
}

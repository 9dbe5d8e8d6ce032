use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::PROXY_AUTHORIZATION;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::MaybeHttpsStream;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tower_service::Service;

use crate::config::TransportDefaults;
use crate::error::{BoxError, TransportErrorKind};
use crate::proxy::{ProxyConnection, ProxyConnector, ProxySettings};
use crate::tls::RootStore;

// Delay before racing the second address family.
const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(300);

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response<Bytes>, TransportFailure>> + Send + 'a>>;

/// Sends one request and reads the whole response.
///
/// A configured custom transport replaces the pooled hyper transport and
/// skips all TLS and certificate handling.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_>;
}

/// A failed exchange, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
#[error("{kind} failure: {source}")]
pub struct TransportFailure {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportFailure {
    pub fn new(kind: TransportErrorKind, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Pooled,
    Custom,
}

/// What the client builder assembled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportSummary {
    pub kind: TransportKind,
    /// `None` for custom transports.
    pub root_store: Option<RootStore>,
    pub client_certificates: usize,
    pub kerberos_enabled: bool,
    pub defaults: TransportDefaults,
}

#[derive(Debug, thiserror::Error)]
#[error("tls handshake timed out after {0:?}")]
pub(crate) struct TlsHandshakeTimeout(Duration);

type TcpConnection = ProxyConnection<TokioIo<TcpStream>>;

/// Wraps the proxy-aware TCP connector with a bounded rustls handshake.
#[derive(Clone)]
pub(crate) struct TlsHandshakeConnector {
    inner: ProxyConnector,
    tls: tokio_rustls::TlsConnector,
    handshake_timeout: Duration,
}

impl TlsHandshakeConnector {
    pub(crate) fn new(
        inner: ProxyConnector,
        tls_config: Arc<rustls::ClientConfig>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            tls: tokio_rustls::TlsConnector::from(tls_config),
            handshake_timeout,
        }
    }
}

impl Service<Uri> for TlsHandshakeConnector {
    type Response = MaybeHttpsStream<TcpConnection>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let is_https = dst
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
        let host = dst
            .host()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let connecting = self.inner.call(dst);
        let tls = self.tls.clone();
        let handshake_timeout = self.handshake_timeout;

        Box::pin(async move {
            let connection = connecting.await?;
            if !is_https {
                return Ok(MaybeHttpsStream::Http(connection));
            }

            let server_name = ServerName::try_from(host)?;
            let handshake = tls.connect(server_name, TokioIo::new(connection));
            let stream = tokio::time::timeout(handshake_timeout, handshake)
                .await
                .map_err(|_| TlsHandshakeTimeout(handshake_timeout))??;
            Ok(MaybeHttpsStream::Https(TokioIo::new(stream)))
        })
    }
}

pub(crate) fn build_dialer(defaults: &TransportDefaults, dial_timeout: Duration) -> HttpConnector {
    let mut dialer = HttpConnector::new();
    dialer.enforce_http(false);
    dialer.set_connect_timeout(Some(dial_timeout));
    dialer.set_keepalive(Some(defaults.keep_alive));
    dialer.set_happy_eyeballs_timeout(Some(HAPPY_EYEBALLS_DELAY));
    dialer.set_nodelay(true);
    dialer
}

/// hyper's pooled HTTP/1.1 client behind the [`HttpTransport`] seam.
pub(crate) struct PooledTransport {
    client: Client<TlsHandshakeConnector, Full<Bytes>>,
    proxies: ProxySettings,
}

impl PooledTransport {
    pub(crate) fn new(
        connector: TlsHandshakeConnector,
        proxies: ProxySettings,
        defaults: &TransportDefaults,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(defaults.idle_connection_timeout)
            .pool_max_idle_per_host(defaults.max_idle_connections_per_host)
            .build(connector);
        Self { client, proxies }
    }

    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportFailure> {
        let (mut parts, body) = request.into_parts();
        let is_plain_http = parts
            .uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"));
        if is_plain_http
            && !parts.headers.contains_key(PROXY_AUTHORIZATION)
            && let Some(authorization) = self
                .proxies
                .proxy_for(&parts.uri)
                .and_then(|endpoint| endpoint.authorization())
        {
            parts
                .headers
                .insert(PROXY_AUTHORIZATION, authorization.clone());
        }

        let response = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|error| {
                let kind = classify_client_error(&error);
                TransportFailure::new(kind, error)
            })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|error| TransportFailure::new(TransportErrorKind::Read, error))?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

impl HttpTransport for PooledTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(self.round_trip(request))
    }
}

impl fmt::Debug for PooledTransport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PooledTransport")
            .field("proxies", &self.proxies)
            .finish_non_exhaustive()
    }
}

fn classify_client_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if let Some(kind) = classify_source_chain(error) {
        return kind;
    }
    if error.is_connect() {
        return TransportErrorKind::Connect;
    }

    let mut current: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = current {
        if let Some(hyper_error) = cause.downcast_ref::<hyper::Error>() {
            if hyper_error.is_user() {
                return TransportErrorKind::Other;
            }
            return TransportErrorKind::Read;
        }
        current = cause.source();
    }
    TransportErrorKind::Other
}

/// Looks through the whole cause chain, including errors wrapped inside
/// `io::Error`, for something more specific than "connect failed".
fn classify_source_chain(error: &(dyn StdError + 'static)) -> Option<TransportErrorKind> {
    let mut current = Some(error);
    while let Some(cause) = current {
        if cause.is::<TlsHandshakeTimeout>() {
            return Some(TransportErrorKind::Timeout);
        }
        if cause.is::<rustls::Error>() {
            return Some(TransportErrorKind::Tls);
        }
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>() {
            if let Some(inner) = io_error.get_ref()
                && let Some(kind) = classify_source_chain(inner)
            {
                return Some(kind);
            }
            match io_error.kind() {
                std::io::ErrorKind::TimedOut => return Some(TransportErrorKind::Timeout),
                std::io::ErrorKind::ConnectionRefused => {
                    return Some(TransportErrorKind::Connect);
                }
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return Some(TransportErrorKind::Read),
                _ => {}
            }
        }
        let text = cause.to_string().to_ascii_lowercase();
        if text.starts_with("dns error")
            || text.contains("failed to lookup address")
            || text.contains("name or service not known")
        {
            return Some(TransportErrorKind::Dns);
        }
        if text.contains("invalid dns name") {
            return Some(TransportErrorKind::Tls);
        }
        current = cause.source();
    }
    None
}

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Request, Response, Uri};
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::ClientConfiguration;
use crate::context::CancellationContext;
use crate::error::{CancelReason, Error};
use crate::kerberos::{KerberosClient, negotiate};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::proxy::{ProxyConnector, ProxySettings};
use crate::redirect::RedirectPolicy;
use crate::request::ExecuteRequest;
use crate::response::HttpResponse;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::tls::build_tls_material;
use crate::transport::{
    HttpTransport, PooledTransport, TlsHandshakeConnector, TransportFailure, TransportKind,
    TransportSummary, build_dialer,
};
use crate::util::{
    is_redirect_status, merge_headers, parse_absolute_uri, redact_uri_for_logs, redirect_location,
    redirect_method, resolve_redirect_uri, same_origin, sanitize_headers_for_redirect,
    truncate_body,
};

/// The assembled request executor.
///
/// Cheap to clone and safe to share between tasks; every clone uses the same
/// connection pool, Kerberos session and cancellation context.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn HttpTransport>,
    retry_policy: RetryPolicy,
    redirect_policy: RedirectPolicy,
    kerberos: Option<Arc<dyn KerberosClient>>,
    context: CancellationContext,
    overall_request_timeout: Option<Duration>,
    default_headers: HeaderMap,
    summary: TransportSummary,
    metrics: ClientMetrics,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("summary", &self.inner.summary)
            .field("retry_policy", &self.inner.retry_policy)
            .field("redirect_policy", &self.inner.redirect_policy)
            .field("kerberos", &self.inner.kerberos)
            .field("overall_request_timeout", &self.inner.overall_request_timeout)
            .finish_non_exhaustive()
    }
}

enum AttemptFailure {
    Transport(TransportFailure),
    TimedOut(Duration),
}

enum AttemptOutcome {
    Completed(Result<Response<Bytes>, AttemptFailure>),
    Cancelled(CancelReason),
}

struct Hop {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpClient {
    /// Assembles a client. Kerberos is negotiated first; a custom transport
    /// then short-circuits all TLS and certificate work.
    pub async fn build(config: &ClientConfiguration) -> crate::Result<Self> {
        let kerberos = negotiate(config.kerberos(), config.kerberos_login().as_ref()).await?;
        let kerberos_enabled = kerberos.is_some();
        let defaults = *config.transport_defaults();

        let (transport, summary): (Arc<dyn HttpTransport>, _) = match config.custom_transport() {
            Some(custom) => {
                debug!("using custom transport, skipping tls setup");
                (
                    custom.clone(),
                    TransportSummary {
                        kind: TransportKind::Custom,
                        root_store: None,
                        client_certificates: 0,
                        kerberos_enabled,
                        defaults,
                    },
                )
            }
            None => {
                let dialer = build_dialer(&defaults, config.dial_timeout());
                let proxies = ProxySettings::from_env()?;
                let tls = build_tls_material(
                    config.certificates_dir(),
                    config.insecure_tls(),
                    config.client_certificate(),
                )?;
                let connector = TlsHandshakeConnector::new(
                    ProxyConnector::new(dialer, proxies.clone()),
                    tls.config,
                    defaults.tls_handshake_timeout,
                );
                debug!(
                    root_store = ?tls.root_store,
                    client_certificates = tls.client_certificates,
                    proxied = !proxies.is_empty(),
                    "built pooled transport"
                );
                (
                    Arc::new(PooledTransport::new(connector, proxies, &defaults)),
                    TransportSummary {
                        kind: TransportKind::Pooled,
                        root_store: Some(tls.root_store),
                        client_certificates: tls.client_certificates,
                        kerberos_enabled,
                        defaults,
                    },
                )
            }
        };

        let mut default_headers = config.default_headers().clone();
        if !default_headers.contains_key(USER_AGENT) {
            let user_agent = HeaderValue::from_str(config.user_agent()).map_err(|_| {
                Error::InvalidConfiguration {
                    field: "user_agent",
                    message: "not a valid header value".to_owned(),
                }
            })?;
            default_headers.insert(USER_AGENT, user_agent);
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                retry_policy: config.retry_policy().clone(),
                redirect_policy: config.redirect_policy(),
                kerberos,
                context: config.context().clone(),
                overall_request_timeout: config.overall_request_timeout(),
                default_headers,
                summary,
                metrics: ClientMetrics::default(),
            }),
        })
    }

    pub fn summary(&self) -> &TransportSummary {
        &self.inner.summary
    }

    pub fn kerberos(&self) -> Option<&Arc<dyn KerberosClient>> {
        self.inner.kerberos.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.inner.redirect_policy
    }

    pub fn context(&self) -> &CancellationContext {
        &self.inner.context
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    /// Sends `request`, retrying transient failures within the retry budget.
    ///
    /// Redirects are followed per the configured [`RedirectPolicy`]; each hop
    /// gets its own retry budget. A redirect without a `Location` header, or
    /// one the policy does not follow, is returned as it is. Any status
    /// outside 2xx and 3xx is an [`Error::HttpStatus`].
    pub async fn execute(&self, request: ExecuteRequest) -> crate::Result<HttpResponse> {
        let _in_flight = self.inner.metrics.record_request_started();
        let result = self.execute_following_redirects(request).await;
        self.inner.metrics.record_outcome(&result);
        result
    }

    async fn execute_following_redirects(&self, request: ExecuteRequest) -> crate::Result<HttpResponse> {
        let mut hop = Hop {
            method: request.method().clone(),
            redacted_uri: redact_uri_for_logs(request.url()),
            uri: parse_absolute_uri(request.url())?,
            headers: merge_headers(&self.inner.default_headers, request.headers()),
            body: request.body_bytes().clone(),
        };
        let redirect_policy = self.inner.redirect_policy;
        let mut redirects = 0_usize;

        loop {
            let response = self.send_with_retries(&hop).await?;
            let status = response.status();
            if !redirect_policy.enabled() || !is_redirect_status(status) {
                return Ok(response);
            }
            let Some(location) = redirect_location(response.headers()) else {
                return Ok(response);
            };
            if redirects >= redirect_policy.max_redirects() {
                return Err(Error::RedirectLimitExceeded {
                    max_redirects: redirect_policy.max_redirects(),
                    method: hop.method,
                    uri: hop.redacted_uri,
                });
            }
            let Some(next_uri) = resolve_redirect_uri(&hop.uri, &location) else {
                return Err(Error::InvalidRedirectLocation {
                    location: redact_uri_for_logs(&location),
                    method: hop.method,
                    uri: hop.redacted_uri,
                });
            };

            let next_method = redirect_method(&hop.method, status);
            let method_changed_to_get = next_method == Method::GET && hop.method != Method::GET;
            sanitize_headers_for_redirect(
                &mut hop.headers,
                method_changed_to_get,
                same_origin(&hop.uri, &next_uri),
            );
            if method_changed_to_get {
                hop.body = Bytes::new();
            }
            let next_redacted_uri = redact_uri_for_logs(&next_uri.to_string());
            debug!(
                status = status.as_u16(),
                from = %hop.redacted_uri,
                to = %next_redacted_uri,
                "following redirect"
            );
            hop.method = next_method;
            hop.uri = next_uri;
            hop.redacted_uri = next_redacted_uri;
            redirects += 1;
        }
    }

    /// One hop of a request: attempts and retry waits against a single uri.
    async fn send_with_retries(&self, hop: &Hop) -> crate::Result<HttpResponse> {
        let Hop {
            method,
            uri,
            redacted_uri,
            headers,
            body,
        } = hop;
        let policy = &self.inner.retry_policy;
        let max_attempts = policy.max_attempts();
        let mut attempt = 0_usize;

        loop {
            if let Some(reason) = self.inner.context.check() {
                return Err(cancelled(reason, attempt, method, redacted_uri));
            }
            attempt += 1;
            self.inner.metrics.record_attempt();

            let span = info_span!(
                "artifact_client.request",
                method = %method,
                uri = %redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            let attempt_headers = self.attempt_headers(headers, uri).await;
            let http_request = build_request(method, uri, &attempt_headers, body.clone())?;
            let outcome = self
                .run_attempt(http_request)
                .instrument(span.clone())
                .await;

            let (error, decision) = match outcome {
                AttemptOutcome::Cancelled(reason) => {
                    return Err(cancelled(reason, attempt, method, redacted_uri));
                }
                AttemptOutcome::Completed(Ok(response)) => {
                    let (parts, body) = response.into_parts();
                    if parts.status.is_success() || parts.status.is_redirection() {
                        span.in_scope(|| {
                            debug!(status = parts.status.as_u16(), "request completed");
                        });
                        return Ok(HttpResponse::new(parts.status, parts.headers, body));
                    }
                    let decision = self
                        .decision(attempt, &method, &redacted_uri)
                        .with_status(parts.status);
                    let error = Error::HttpStatus {
                        status: parts.status.as_u16(),
                        method: method.clone(),
                        uri: redacted_uri.clone(),
                        headers: Box::new(parts.headers),
                        body: truncate_body(&body),
                    };
                    (error, decision)
                }
                AttemptOutcome::Completed(Err(AttemptFailure::Transport(failure))) => {
                    let kind = failure.kind();
                    let decision = self
                        .decision(attempt, &method, &redacted_uri)
                        .with_transport_error(kind);
                    let error = Error::Transport {
                        kind,
                        method: method.clone(),
                        uri: redacted_uri.clone(),
                        source: failure.into_source(),
                    };
                    (error, decision)
                }
                AttemptOutcome::Completed(Err(AttemptFailure::TimedOut(timeout))) => {
                    let decision = self.decision(attempt, method, redacted_uri).timed_out();
                    let error = Error::Timeout {
                        timeout_ms: timeout.as_millis(),
                        method: method.clone(),
                        uri: redacted_uri.clone(),
                    };
                    (error, decision)
                }
            };

            if !policy.should_retry(&decision) {
                return Err(annotate(error, attempt, policy.is_retryable(&decision)));
            }

            let wait = policy.backoff_for_retry(attempt);
            span.in_scope(|| {
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "request failed, retrying"
                );
            });
            self.inner.metrics.record_retry();
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    reason = self.inner.context.cancelled() => {
                        return Err(cancelled(reason, attempt, method, redacted_uri));
                    }
                    _ = sleep(wait) => {}
                }
            }
        }
    }

    async fn run_attempt(&self, request: Request<Bytes>) -> AttemptOutcome {
        let send = self.inner.transport.send(request);
        let bounded = async {
            match self.inner.overall_request_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, send).await {
                    Ok(result) => result.map_err(AttemptFailure::Transport),
                    Err(_) => Err(AttemptFailure::TimedOut(timeout)),
                },
                None => send.await.map_err(AttemptFailure::Transport),
            }
        };

        tokio::select! {
            biased;
            reason = self.inner.context.cancelled() => AttemptOutcome::Cancelled(reason),
            result = bounded => AttemptOutcome::Completed(result),
        }
    }

    async fn attempt_headers(&self, headers: &HeaderMap, uri: &Uri) -> HeaderMap {
        let mut headers = headers.clone();
        if !headers.contains_key(AUTHORIZATION)
            && let Some(authorization) = self.kerberos_authorization(uri).await
        {
            headers.insert(AUTHORIZATION, authorization);
        }
        headers
    }

    /// Negotiate tokens are minted per attempt; minting may reach the KDC,
    /// so it runs on the blocking pool.
    async fn kerberos_authorization(&self, uri: &Uri) -> Option<HeaderValue> {
        let kerberos = Arc::clone(self.inner.kerberos.as_ref()?);
        let uri = uri.clone();
        match tokio::task::spawn_blocking(move || kerberos.authorization(&uri)).await {
            Ok(authorization) => authorization,
            Err(error) => {
                warn!(error = %error, "kerberos token task failed");
                None
            }
        }
    }

    fn decision(&self, attempt: usize, method: &Method, uri: &str) -> RetryDecision {
        RetryDecision {
            attempt,
            max_attempts: self.inner.retry_policy.max_attempts(),
            method: method.clone(),
            uri: uri.to_owned(),
            status: None,
            transport_error_kind: None,
            timed_out: false,
        }
    }
}

fn build_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> crate::Result<Request<Bytes>> {
    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .body(body)
        .map_err(|source| Error::RequestBuild { source })?;
    *request.headers_mut() = headers.clone();
    Ok(request)
}

fn cancelled(reason: CancelReason, attempts: usize, method: &Method, uri: &str) -> Error {
    Error::Cancelled {
        reason,
        attempts,
        method: method.clone(),
        uri: uri.to_owned(),
    }
}

/// Marks errors that end a request after more than one attempt. A failure
/// on the first attempt is returned as it is.
fn annotate(error: Error, attempts: usize, retryable: bool) -> Error {
    if attempts <= 1 {
        return error;
    }
    let source = Box::new(error);
    if retryable {
        Error::RetriesExhausted { attempts, source }
    } else {
        Error::AbortedAfterRetries { attempts, source }
    }
}

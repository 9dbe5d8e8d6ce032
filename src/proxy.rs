use std::error::Error as StdError;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Uri;
use http::header::HeaderValue;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use percent_encoding::percent_decode_str;
use tower_service::Service;
use url::Url;

use crate::error::Error;
use crate::util::{default_port, redact_uri_for_logs};

pub(crate) type BoxConnectError = Box<dyn StdError + Send + Sync>;

/// A proxy endpoint taken from the environment.
#[derive(Clone, Debug)]
pub struct ProxyEndpoint {
    uri: Uri,
    authorization: Option<HeaderValue>,
}

impl ProxyEndpoint {
    /// Accepts `host:port` or a full url; userinfo becomes a Basic
    /// `Proxy-Authorization` value.
    pub fn parse(text: &str) -> crate::Result<Self> {
        let invalid = || Error::InvalidConfiguration {
            field: "proxy",
            message: format!("invalid proxy url {}", redact_uri_for_logs(text)),
        };
        let text = text.trim();
        let with_scheme = if text.contains("://") {
            text.to_owned()
        } else {
            format!("http://{text}")
        };
        let mut url = Url::parse(&with_scheme).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid());
        }

        let authorization = if url.username().is_empty() {
            None
        } else {
            let username = percent_decode(url.username());
            let password = url.password().map(percent_decode).unwrap_or_default();
            let encoded = BASE64.encode(format!("{username}:{password}"));
            let mut value =
                HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|_| invalid())?;
            value.set_sensitive(true);
            Some(value)
        };
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_path("");
        url.set_query(None);
        url.set_fragment(None);

        let uri = url.as_str().parse::<Uri>().map_err(|_| invalid())?;
        Ok(Self { uri, authorization })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }
}

fn percent_decode(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

#[derive(Clone, Debug)]
pub(crate) enum NoProxyRule {
    Any,
    Domain { host: String, port: Option<u16> },
}

impl NoProxyRule {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let mut candidate = text.trim().to_owned();
        let mut port = None;
        if candidate.is_empty() {
            return None;
        }
        if candidate == "*" {
            return Some(Self::Any);
        }
        candidate = candidate.trim_start_matches("*.").trim_start_matches('.').to_owned();
        if let Some(stripped) = candidate.strip_prefix('[') {
            let end = stripped.find(']')?;
            let suffix = &stripped[end + 1..];
            if let Some(raw_port) = suffix.strip_prefix(':') {
                port = Some(raw_port.parse::<u16>().ok()?);
            } else if !suffix.is_empty() {
                return None;
            }
            candidate = stripped[..end].to_owned();
        } else if candidate.matches(':').count() == 1 {
            let (host, raw_port) = candidate.rsplit_once(':')?;
            port = Some(raw_port.parse::<u16>().ok()?);
            candidate = host.to_owned();
        }
        if candidate.is_empty() {
            return None;
        }
        Some(Self::Domain {
            host: candidate.to_ascii_lowercase(),
            port,
        })
    }

    pub(crate) fn matches(&self, host: &str, port: Option<u16>) -> bool {
        match self {
            Self::Any => true,
            Self::Domain {
                host: domain,
                port: rule_port,
            } => {
                let host_matches = host == domain || host.ends_with(&format!(".{domain}"));
                host_matches && rule_port.is_none_or(|rule_port| port == Some(rule_port))
            }
        }
    }
}

/// Proxies chosen per target scheme, as `HTTP_PROXY`, `HTTPS_PROXY` and
/// `NO_PROXY` describe them.
///
/// Loopback targets never go through a proxy.
#[derive(Clone, Debug, Default)]
pub struct ProxySettings {
    http: Option<ProxyEndpoint>,
    https: Option<ProxyEndpoint>,
    no_proxy: Vec<NoProxyRule>,
}

impl ProxySettings {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Upper-case variables win over their lower-case spelling.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let read = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|value| !value.trim().is_empty())
        };

        let http = read("HTTP_PROXY", "http_proxy")
            .map(|value| ProxyEndpoint::parse(&value))
            .transpose()?;
        let https = read("HTTPS_PROXY", "https_proxy")
            .map(|value| ProxyEndpoint::parse(&value))
            .transpose()?;
        let no_proxy = read("NO_PROXY", "no_proxy")
            .map(|value| value.split(',').filter_map(NoProxyRule::parse).collect())
            .unwrap_or_default();

        Ok(Self {
            http,
            https,
            no_proxy,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }

    /// The proxy a request to `uri` goes through, if any.
    pub fn proxy_for(&self, uri: &Uri) -> Option<&ProxyEndpoint> {
        let endpoint = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => self.https.as_ref(),
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => self.http.as_ref(),
            _ => None,
        }?;

        let host = uri.host()?.trim_start_matches('[').trim_end_matches(']');
        let host = host.to_ascii_lowercase();
        if is_loopback(&host) {
            return None;
        }
        let port = default_port(uri);
        if self.no_proxy.iter().any(|rule| rule.matches(&host, port)) {
            return None;
        }
        Some(endpoint)
    }
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[derive(Debug)]
pub(crate) struct ProxyConnection<T> {
    inner: T,
    proxied: bool,
}

impl<T> ProxyConnection<T> {
    fn new(inner: T, proxied: bool) -> Self {
        Self { inner, proxied }
    }
}

impl<T> HyperRead for ProxyConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for ProxyConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.proxied)
    }
}

/// TCP connector that dials directly, tunnels https through a CONNECT proxy
/// or hands plain http to a forwarding proxy.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    direct: HttpConnector,
    settings: ProxySettings,
    http_proxy: Option<Uri>,
    https_tunnel: Option<Tunnel<HttpConnector>>,
}

impl ProxyConnector {
    pub(crate) fn new(direct: HttpConnector, settings: ProxySettings) -> Self {
        let http_proxy = settings.http.as_ref().map(|endpoint| endpoint.uri.clone());
        let https_tunnel = settings.https.as_ref().map(|endpoint| {
            let tunnel = Tunnel::new(endpoint.uri.clone(), direct.clone());
            match &endpoint.authorization {
                Some(authorization) => tunnel.with_auth(authorization.clone()),
                None => tunnel,
            }
        });
        Self {
            direct,
            settings,
            http_proxy,
            https_tunnel,
        }
    }

    fn connect_direct(&mut self, dst: Uri, proxied: bool) -> <Self as Service<Uri>>::Future {
        let connecting = self.direct.call(dst);
        Box::pin(async move {
            connecting
                .await
                .map(|connection| ProxyConnection::new(connection, proxied))
                .map_err(|error| Box::new(error) as _)
        })
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyConnection<<HttpConnector as Service<Uri>>::Response>;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let direct_ready = match self.direct.poll_ready(cx) {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(error)) => return Poll::Ready(Err(Box::new(error))),
            Poll::Pending => false,
        };
        let tunnel_ready = match &mut self.https_tunnel {
            Some(tunnel) => match tunnel.poll_ready(cx) {
                Poll::Ready(Ok(())) => true,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(Box::new(error))),
                Poll::Pending => false,
            },
            None => true,
        };
        if direct_ready && tunnel_ready {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        if self.settings.proxy_for(&dst).is_none() {
            return self.connect_direct(dst, false);
        }

        let is_https = dst
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
        if is_https && let Some(tunnel) = &mut self.https_tunnel {
            let connecting = tunnel.call(normalize_tunnel_target_uri(dst));
            return Box::pin(async move {
                connecting
                    .await
                    .map(|connection| ProxyConnection::new(connection, false))
                    .map_err(|error| Box::new(error) as _)
            });
        }
        if !is_https && let Some(proxy_uri) = self.http_proxy.clone() {
            return self.connect_direct(proxy_uri, true);
        }
        self.connect_direct(dst, false)
    }
}

pub(crate) fn normalize_tunnel_target_uri(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }
    let (Some(port), Some(host)) = (default_port(&dst), dst.host()) else {
        return dst;
    };
    let authority_text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}

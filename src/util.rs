use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, HeaderValue, LOCATION,
};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for (name, value) in request_headers {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// Strips userinfo, query and fragment so a uri can be logged or put into an error.
pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text
            .split(['?', '#'])
            .next()
            .unwrap_or(uri_text)
            .to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn validate_base_url(base_url: &str) -> Result<(), Error> {
    let invalid = || Error::InvalidUri {
        uri: redact_uri_for_logs(base_url),
    };
    let trimmed = base_url.trim();
    if trimmed.is_empty() || trimmed.len() != base_url.len() {
        return Err(invalid());
    }

    let parsed = url::Url::parse(trimmed).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid());
    }
    Ok(())
}

/// Resolves `path` against `base_url` unless it is already an absolute http(s) uri.
pub(crate) fn resolve_uri(base_url: &str, path: &str) -> Result<(String, Uri), Error> {
    let uri_text = match path.parse::<Uri>() {
        Ok(uri) if uri.host().is_some() => match uri.scheme_str() {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") =>
            {
                path.to_owned()
            }
            _ => {
                return Err(Error::InvalidUri {
                    uri: redact_uri_for_logs(path),
                });
            }
        },
        _ => join_base_path(base_url, path),
    };
    let uri = parse_absolute_uri(&uri_text)?;
    Ok((uri_text, uri))
}

pub(crate) fn parse_absolute_uri(uri_text: &str) -> Result<Uri, Error> {
    let invalid = || Error::InvalidUri {
        uri: redact_uri_for_logs(uri_text),
    };
    let uri = uri_text.parse::<Uri>().map_err(|_| invalid())?;
    match uri.scheme_str() {
        Some(scheme)
            if uri.host().is_some()
                && (scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")) =>
        {
            Ok(uri)
        }
        _ => Err(invalid()),
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Appends query parameters; a `None` value emits a bare flag such as `?list`.
pub(crate) fn append_query(path: &str, params: &[(&str, Option<String>)]) -> String {
    if params.is_empty() {
        return path.to_owned();
    }

    let mut query = String::new();
    for (name, value) in params {
        if !query.is_empty() {
            query.push('&');
        }
        query.extend(url::form_urlencoded::byte_serialize(name.as_bytes()));
        if let Some(value) = value {
            query.push('=');
            query.extend(url::form_urlencoded::byte_serialize(value.as_bytes()));
        }
    }

    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}{query}")
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn default_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or_else(|| match uri.scheme_str() {
        Some("https") => Some(443),
        Some("http") => Some(80),
        _ => None,
    })
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// 303 turns anything but `HEAD` into `GET`; 301 and 302 only rewrite `POST`.
pub(crate) fn redirect_method(method: &Method, status: StatusCode) -> Method {
    match status {
        StatusCode::SEE_OTHER if *method != Method::HEAD => Method::GET,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if *method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

pub(crate) fn redirect_location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|location| !location.is_empty())
        .map(ToOwned::to_owned)
}

pub(crate) fn same_origin(left: &Uri, right: &Uri) -> bool {
    let left_scheme = left.scheme_str().unwrap_or_default();
    let right_scheme = right.scheme_str().unwrap_or_default();
    if !left_scheme.eq_ignore_ascii_case(right_scheme) {
        return false;
    }

    let left_host = left.host().unwrap_or_default();
    let right_host = right.host().unwrap_or_default();
    if !left_host.eq_ignore_ascii_case(right_host) {
        return false;
    }

    default_port(left) == default_port(right)
}

/// Joins a `Location` value onto the uri that produced it. Only http(s)
/// targets are accepted.
pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current_uri.to_string()).ok()?;
    let joined = base.join(location).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.as_str().parse().ok()
}

pub(crate) fn sanitize_headers_for_redirect(
    headers: &mut HeaderMap,
    method_changed_to_get: bool,
    same_origin_redirect: bool,
) {
    if method_changed_to_get {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }
    if !same_origin_redirect {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

//! URL splitting and redirect-location resolution.
//!
//! The split is purely syntactic: hostnames are not validated here, and an
//! absent port is reported as `None` rather than being defaulted, so the
//! driver can decide whether the `Host` header needs an explicit port.

use http::Uri;

use crate::error::HttpError;

/// The components of a URL as used by the request driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedUrl {
    pub(crate) scheme: String,
    pub(crate) userinfo: String,
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
    /// Origin-form request target: path plus query, never empty.
    pub(crate) path: String,
}

impl ParsedUrl {
    /// The scheme's well-known port: 443 for `https`, 80 otherwise.
    pub(crate) fn default_port(&self) -> u16 {
        if self.scheme == "https" {
            443
        } else {
            80
        }
    }

    /// The effective port, falling back to the scheme default.
    pub(crate) fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.default_port())
    }
}

pub(crate) fn parse_url(url: &str) -> Result<ParsedUrl, HttpError> {
    let uri: Uri = url.parse().map_err(|_| HttpError::InvalidUrl)?;

    let scheme = uri
        .scheme_str()
        .ok_or(HttpError::InvalidUrl)?
        .to_ascii_lowercase();
    let authority = uri.authority().ok_or(HttpError::InvalidUrl)?;

    let userinfo = authority
        .as_str()
        .rsplit_once('@')
        .map(|(userinfo, _)| userinfo.to_owned())
        .unwrap_or_default();

    // IPv6 literals come back bracketed from the authority.
    let host = uri
        .host()
        .ok_or(HttpError::InvalidUrl)?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    if host.is_empty() {
        return Err(HttpError::InvalidUrl);
    }

    let path = match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_owned(),
        _ => "/".to_owned(),
    };

    Ok(ParsedUrl {
        scheme,
        userinfo,
        host,
        port: uri.port_u16(),
        path,
    })
}

/// Resolve a `Location` header value against the URL that produced it.
///
/// Absolute locations are taken verbatim. A location starting with `/`
/// replaces the base path; anything else replaces the last path segment.
pub(crate) fn resolve_redirect_location(base: &str, location: &str) -> String {
    if location.contains("://") {
        return location.to_owned();
    }

    let Ok(parsed) = parse_url(base) else {
        return location.to_owned();
    };

    let mut out = String::with_capacity(base.len() + location.len());
    out.push_str(&parsed.scheme);
    out.push_str("://");
    if !parsed.userinfo.is_empty() {
        out.push_str(&parsed.userinfo);
        out.push('@');
    }
    if parsed.host.contains(':') {
        out.push('[');
        out.push_str(&parsed.host);
        out.push(']');
    } else {
        out.push_str(&parsed.host);
    }
    if let Some(port) = parsed.port {
        out.push(':');
        out.push_str(&port.to_string());
    }

    if location.starts_with('/') {
        out.push_str(location);
    } else {
        let path = parsed
            .path
            .split_once('?')
            .map_or(parsed.path.as_str(), |(path, _)| path);
        let dir = match path.rfind('/') {
            Some(idx) => &path[..=idx],
            None => "/",
        };
        out.push_str(dir);
        out.push_str(location);
    }
    out
}

/// Encode userinfo or proxy credentials for a `Basic` authorization value.
pub(crate) fn basic_auth_token(credentials: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    STANDARD.encode(credentials.as_bytes())
}

//! Source/target URL parsing and the request rewriting rules.
//!
//! This is intentionally pure string logic (no pingora types) to keep it
//! easy to test.

use http::Uri;
use thiserror::Error;

/// Errors produced while parsing a source or target URL
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Invalid URL '{0}': {1}")]
    Invalid(String, String),

    #[error("URL '{0}' has no hostname")]
    MissingHost(String),

    #[error("Unsupported scheme in '{0}': only http and https are proxied")]
    UnsupportedScheme(String),
}

/// Upstream scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::Https)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A registration source: hostname plus path prefix. The port is ignored,
/// the listener fixes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    pub hostname: String,
    pub pathname: String,
}

/// A fully-parsed upstream target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub hostname: String,
    pub port: u16,
    /// Path prefix prepended to rewritten request paths. Empty when the
    /// target was given without an explicit path.
    pub path: String,
    pub ssl_redirect: bool,
    pub use_target_host_header: bool,
}

impl Target {
    /// Canonical form, used to match targets on unregister.
    pub fn href(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.hostname,
            self.port,
            if self.path.is_empty() { "/" } else { &self.path }
        )
    }

    /// Value for an outgoing `Host` header. The default port is omitted.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme.is_tls()
    }
}

/// Prepend a scheme when the input has none, then parse. Hostnames are
/// lowercased; only http and https are accepted.
pub fn prepare_url(input: &str) -> Result<Uri, UrlError> {
    let input = input.trim();
    let with_scheme = if input.starts_with("http://") || input.starts_with("https://") {
        input.to_string()
    } else {
        format!("http://{}", input)
    };

    let uri: Uri = with_scheme
        .parse()
        .map_err(|e: http::uri::InvalidUri| UrlError::Invalid(input.to_string(), e.to_string()))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(UrlError::UnsupportedScheme(input.to_string())),
    }

    if uri.host().is_none_or(str::is_empty) {
        return Err(UrlError::MissingHost(input.to_string()));
    }

    Ok(uri)
}

/// Parse a registration source. `example.com/api` splits into hostname
/// `example.com` and path prefix `/api`; the path defaults to `/`.
pub fn parse_source(input: &str) -> Result<SourceUrl, UrlError> {
    let uri = prepare_url(input)?;
    let hostname = uri.host().unwrap_or_default().to_ascii_lowercase();
    let pathname = match uri.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    Ok(SourceUrl { hostname, pathname })
}

pub(crate) struct TargetFlags {
    pub ssl_redirect: bool,
    pub use_target_host_header: bool,
}

/// Parse an upstream target and attach routing flags.
pub(crate) fn build_target(input: &str, flags: TargetFlags) -> Result<Target, UrlError> {
    let uri = prepare_url(input)?;
    let scheme = match uri.scheme_str() {
        Some("https") => Scheme::Https,
        _ => Scheme::Http,
    };
    let hostname = uri.host().unwrap_or_default().to_ascii_lowercase();
    let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
    // A bare "/" means the target carries no path of its own.
    let path = match uri.path() {
        "/" | "" => String::new(),
        p => p.trim_end_matches('/').to_string(),
    };

    Ok(Target {
        scheme,
        hostname,
        port,
        path,
        ssl_redirect: flags.ssl_redirect,
        use_target_host_header: flags.use_target_host_header,
    })
}

/// Prefix match with a path-boundary guard: `url` matches `prefix` iff it
/// equals it or the next character is `/` or `?`. `/foobar` does not match
/// the prefix `/foo`.
pub fn path_starts_with(url: &str, prefix: &str) -> bool {
    if !url.starts_with(prefix) {
        return false;
    }
    matches!(
        url.as_bytes().get(prefix.len()),
        None | Some(&b'/') | Some(&b'?')
    )
}

/// Strip a matched route path from the incoming path-and-query. Root routes
/// (`/`) strip nothing.
pub fn strip_route_prefix<'a>(path_and_query: &'a str, route_path: &str) -> &'a str {
    if route_path.len() > 1 && path_and_query.starts_with(route_path) {
        &path_and_query[route_path.len()..]
    } else {
        path_and_query
    }
}

/// Join a target path with the remainder of the incoming URL.
///
/// A query-only remainder is concatenated directly so no `/` appears before
/// the query; everything else is a POSIX-style join. An empty result
/// normalizes to `/`.
pub fn join_target_path(target_path: &str, remainder: &str) -> String {
    if target_path.is_empty() {
        return if remainder.is_empty() {
            "/".to_string()
        } else {
            remainder.to_string()
        };
    }

    if remainder.is_empty() {
        return target_path.to_string();
    }
    if remainder.starts_with('?') {
        return format!("{}{}", target_path, remainder);
    }
    if remainder.starts_with('/') {
        format!("{}{}", target_path.trim_end_matches('/'), remainder)
    } else {
        format!("{}/{}", target_path.trim_end_matches('/'), remainder)
    }
}

/// The full rewrite: strip the matched route path, then join the target's
/// own path with what is left.
pub fn rewrite_path(path_and_query: &str, route_path: &str, target_path: &str) -> String {
    let remainder = strip_route_prefix(path_and_query, route_path);
    join_target_path(target_path, remainder)
}

/// Strip an optional port from a `Host` header value. Handles bracketed
/// IPv6 literals.
pub fn strip_host_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

//! Origin normalisation for window-family endpoints.
//!
//! Origins are compared after reducing a URL to `scheme://host[:port]`.
//! The port is omitted when it equals the scheme default (80 for http/ws,
//! 443 for https/wss), and `file://` origins carry no host at all.

use thiserror::Error;

/// Error normalising an origin string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    #[error("origin must contain '://' separator, got: {0}")]
    MissingScheme(String),
    #[error("origin has an empty host: {0}")]
    EmptyHost(String),
}

/// Reduce a URL to its origin: `scheme://host[:port]`.
pub fn normalize_origin(url: &str) -> Result<String, OriginError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| OriginError::MissingScheme(url.to_string()))?;

    if scheme == "file" {
        return Ok("file://".to_string());
    }

    // Strip path, query, and fragment.
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("");
    if authority.is_empty() {
        return Err(OriginError::EmptyHost(url.to_string()));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !h.is_empty() => (h, Some(p)),
        _ => (authority, None),
    };

    let default_port = match scheme {
        "http" | "ws" => Some("80"),
        "https" | "wss" => Some("443"),
        _ => None,
    };

    match port {
        Some(p) if Some(p) != default_port => Ok(format!("{scheme}://{host}:{p}")),
        _ => Ok(format!("{scheme}://{host}")),
    }
}

/// Whether two origin strings name the same origin once normalised.
///
/// Strings that fail to normalise never match anything.
pub fn origin_matches(expected: &str, actual: &str) -> bool {
    match (normalize_origin(expected), normalize_origin(actual)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

//! Header transform pipeline
//!
//! Both directions first apply a fixed baseline (hop-by-hop stripping, plus
//! `host` and body-less method fixes on requests), then hand the map to an
//! optional caller hook whose output is used as-is.

use http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use sluice_core::{Error, HeaderRules, Origin, Result};
use std::fmt;

/// Headers that only describe the hop they arrive on
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Rewrites a header map.
///
/// Implemented for any `Fn(HeaderMap) -> HeaderMap`, so closures can be
/// passed directly.
pub trait HeaderRewrite: Send + Sync {
    /// Produce the headers to use from the normalized input
    fn rewrite(&self, headers: HeaderMap) -> HeaderMap;
}

impl<F> HeaderRewrite for F
where
    F: Fn(HeaderMap) -> HeaderMap + Send + Sync,
{
    fn rewrite(&self, headers: HeaderMap) -> HeaderMap {
        self(headers)
    }
}

/// Whether `name` is a hop-by-hop header
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Remove hop-by-hop headers, including any nominated by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Baseline request headers for the upstream.
///
/// Works on a copy; the inbound map is left untouched.
pub fn normalize_request_headers(inbound: &HeaderMap, method: &Method, origin: &Origin) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);

    if !method_has_body(method) {
        headers.remove(CONTENT_LENGTH);
    }

    match HeaderValue::from_str(&origin.authority()) {
        Ok(host) => {
            headers.insert(HOST, host);
        }
        Err(e) => {
            tracing::debug!(origin = %origin, error = %e, "upstream authority is not a valid host header");
        }
    }

    headers
}

/// Baseline response headers for the downstream
pub fn normalize_response_headers(mut headers: HeaderMap) -> HeaderMap {
    strip_hop_by_hop(&mut headers);
    headers
}

/// Whether requests with this method forward their body (not GET or HEAD)
pub fn method_has_body(method: &Method) -> bool {
    crate::codec::method_has_body(method)
}

/// [`HeaderRules`] compiled into a rewrite hook.
///
/// Removals apply before sets.
#[derive(Clone, Default)]
pub struct RuleRewrite {
    remove: Vec<HeaderName>,
    set: Vec<(HeaderName, HeaderValue)>,
}

impl RuleRewrite {
    /// Compile rules, rejecting invalid header names or values
    pub fn compile(rules: &HeaderRules) -> Result<Self> {
        let remove = rules
            .remove
            .iter()
            .map(|name| parse_name(name))
            .collect::<Result<Vec<_>>>()?;

        let set = rules
            .set
            .iter()
            .map(|(name, value)| {
                let value = HeaderValue::from_str(value).map_err(|e| {
                    Error::Config(format!("Invalid value for header '{name}': {e}"))
                })?;
                Ok((parse_name(name)?, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { remove, set })
    }
}

fn parse_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid header name '{name}': {e}")))
}

impl HeaderRewrite for RuleRewrite {
    fn rewrite(&self, mut headers: HeaderMap) -> HeaderMap {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }
}

impl fmt::Debug for RuleRewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRewrite")
            .field("remove", &self.remove)
            .field("set", &self.set.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

//! Upstream base address and origin definitions

use crate::error::{Error, Result};
use http::uri::PathAndQuery;
use std::fmt;
use url::{Host, Url};

/// Upstream origin: the key connections are pooled under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    host: String,
    port: u16,
    ipv6: bool,
}

impl Origin {
    /// Create an origin from a host name or address and a port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let ipv6 = host.contains(':');
        Self { host, port, ipv6 }
    }

    /// Host to dial (IPv6 addresses without brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port to dial
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for the `host` header
    pub fn authority(&self) -> String {
        if self.ipv6 {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority())
    }
}

/// Parsed upstream base address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    origin: Origin,
    base_path: String,
}

impl Upstream {
    /// Parse a base address such as `http://127.0.0.1:3000` or `http://svc:8080/api`
    pub fn parse(base: &str) -> Result<Self> {
        let url = Url::parse(base)
            .map_err(|e| Error::Config(format!("Invalid upstream base '{base}': {e}")))?;

        if url.scheme() != "http" {
            return Err(Error::Config(format!(
                "Unsupported upstream scheme '{}' (only http is supported)",
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(Error::Config(format!("Upstream base '{base}' has no host")));
            }
        };

        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Config(format!("Upstream base '{base}' has no port")))?;

        if url.query().is_some() || url.fragment().is_some() {
            return Err(Error::Config(format!(
                "Upstream base '{base}' must not carry a query or fragment"
            )));
        }

        let base_path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            origin: Origin::new(host, port),
            base_path,
        })
    }

    /// Origin connections are opened to
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Path prefix every target is joined below (empty for the root)
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Apply a target path and query to the base address
    pub fn resolve(&self, target: &str) -> Result<PathAndQuery> {
        let target = if target.is_empty() { "/" } else { target };
        if !target.starts_with('/') {
            return Err(Error::InvalidTarget(format!(
                "target '{target}' must start with '/'"
            )));
        }

        let joined = format!("{}{}", self.base_path, target);
        joined
            .parse::<PathAndQuery>()
            .map_err(|e| Error::InvalidTarget(format!("target '{target}': {e}")))
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.origin, self.base_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base() {
        let upstream = Upstream::parse("http://127.0.0.1:3000").unwrap();
        assert_eq!(upstream.origin().host(), "127.0.0.1");
        assert_eq!(upstream.origin().port(), 3000);
        assert_eq!(upstream.origin().authority(), "127.0.0.1:3000");
        assert_eq!(upstream.base_path(), "");
    }

    #[test]
    fn test_default_port_and_prefix() {
        let upstream = Upstream::parse("http://backend/api/").unwrap();
        assert_eq!(upstream.origin().port(), 80);
        assert_eq!(upstream.base_path(), "/api");
        assert_eq!(
            upstream.resolve("/users?id=1").unwrap().as_str(),
            "/api/users?id=1"
        );
        assert_eq!(upstream.to_string(), "http://backend:80/api");
    }

    #[test]
    fn test_ipv6_authority() {
        let upstream = Upstream::parse("http://[::1]:8080").unwrap();
        assert_eq!(upstream.origin().host(), "::1");
        assert_eq!(upstream.origin().authority(), "[::1]:8080");
        assert_eq!(upstream.origin().to_string(), "http://[::1]:8080");
    }

    #[test]
    fn test_resolve_target() {
        let upstream = Upstream::parse("http://127.0.0.1:3000").unwrap();
        assert_eq!(
            upstream.resolve("/service/get").unwrap().as_str(),
            "/service/get"
        );
        assert_eq!(upstream.resolve("").unwrap().as_str(), "/");
        assert!(upstream.resolve("service/get").is_err());
        assert!(upstream.resolve("/bad path").is_err());
    }

    #[test]
    fn test_rejects_unsupported_bases() {
        assert!(Upstream::parse("https://127.0.0.1:3000").is_err());
        assert!(Upstream::parse("not a url").is_err());
        assert!(Upstream::parse("http://127.0.0.1:3000/?q=1").is_err());
    }
}

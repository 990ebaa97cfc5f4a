use crate::Error;

/// Identity of the pool a request belongs to: host, port and whether the
/// transport is secure. Derived once per outbound request from the target
/// URI. Two requests with equal keys share the same connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    host: String,
    port: u16,
    secure: bool,
}

impl RequestKey {
    /// Derive a key from a target URI.
    ///
    /// The URI must carry a host. The port falls back on the scheme default
    /// (443 for https, 80 otherwise).
    pub fn from_uri(uri: &http::Uri) -> Result<Self, Error> {
        let host = uri
            .host()
            .ok_or_else(|| Error::User(format!("Request uri has no host: {}", uri)))?;

        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") | None => false,
            Some(s) => return Err(Error::User(format!("Unsupported scheme: {}", s))),
        };

        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(RequestKey {
            host: host.to_string(),
            port,
            secure,
        })
    }

    /// Target host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port, scheme default if the URI named none.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the transport must be secure.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// `host:port` form used by connectors.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_from_plain_uri() {
        let uri: http::Uri = "http://example.com/path".parse().unwrap();
        let key = RequestKey::from_uri(&uri).unwrap();
        assert_eq!(key.host(), "example.com");
        assert_eq!(key.port(), 80);
        assert!(!key.is_secure());
    }

    #[test]
    fn key_from_secure_uri_with_port() {
        let uri: http::Uri = "https://example.com:8443/".parse().unwrap();
        let key = RequestKey::from_uri(&uri).unwrap();
        assert_eq!(key.port(), 8443);
        assert!(key.is_secure());
        assert_eq!(key.authority(), "example.com:8443");
    }

    #[test]
    fn equal_keys_hash_alike() {
        use std::collections::HashSet;

        let a = RequestKey::from_uri(&"http://example.com/a".parse().unwrap()).unwrap();
        let b = RequestKey::from_uri(&"http://example.com:80/b".parse().unwrap()).unwrap();

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn uri_without_host_is_rejected() {
        let uri: http::Uri = "/just/a/path".parse().unwrap();
        assert!(RequestKey::from_uri(&uri).is_err());
    }
}

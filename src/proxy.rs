//! Proxy configuration for a single request.

/// The kind of proxy to traverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Plain HTTP proxy; requests use the absolute-form target.
    Http,
    /// HTTP proxy requiring basic credentials.
    HttpPw,
    /// SOCKS5 proxy without authentication.
    Socks5,
    /// SOCKS5 proxy with username/password authentication.
    Socks5Pw,
}

/// Proxy settings supplied per request.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Let the proxy resolve destination hostnames instead of resolving
    /// them locally. Only meaningful for SOCKS5.
    pub proxy_hostnames: bool,
}

impl ProxySettings {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            proxy_hostnames: false,
        }
    }

    /// Attach basic credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn is_http(&self) -> bool {
        matches!(self.kind, ProxyKind::Http | ProxyKind::HttpPw)
    }

    pub fn is_socks5(&self) -> bool {
        matches!(self.kind, ProxyKind::Socks5 | ProxyKind::Socks5Pw)
    }

    pub fn has_credentials(&self) -> bool {
        matches!(self.kind, ProxyKind::HttpPw | ProxyKind::Socks5Pw)
    }

    /// True when the proxy, not the local resolver, maps the destination
    /// hostname to an address.
    pub fn resolves_remotely(&self) -> bool {
        self.proxy_hostnames && self.is_socks5()
    }
}

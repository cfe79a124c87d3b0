//! 接続先エンドポイント

/// WebSocket の接続先
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// true なら wss://
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
            secure: false,
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// `ws://host:port` 形式の URL
    ///
    /// IPv6 リテラルは角括弧で囲む。
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_url() {
        assert_eq!(Endpoint::new("h", 9003).url(), "ws://h:9003");
    }

    #[test]
    fn test_secure_url() {
        let ep = Endpoint::new("viz.example.org", 443).with_secure(true);
        assert_eq!(ep.url(), "wss://viz.example.org:443");
    }

    #[test]
    fn test_ipv6_host_bracketed() {
        assert_eq!(Endpoint::new("::1", 9000).url(), "ws://[::1]:9000");
        assert_eq!(Endpoint::new("[::1]", 9000).url(), "ws://[::1]:9000");
    }
}

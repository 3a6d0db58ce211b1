//! Listener configuration shared by the HTTP intake and the gateway.

use std::time::Duration;

/// Configuration for one HTTP listener.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins. `"*"` allows any origin.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// Maximum time to wait for in-flight requests on shutdown.
    pub drain_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl HttpConfig {
    /// A loopback listener on an OS-assigned port.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn loopback_keeps_other_defaults() {
        let config = HttpConfig::loopback();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
    }
}

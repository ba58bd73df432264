use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

/// Fixed delay between a lost session and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MESSAGE_EVENT: &str = "message.sent";

const PROTOCOL_VERSION: u8 = 7;
const CLIENT_NAME: &str = "rust-realtime-channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    #[serde(alias = "http")]
    Ws,
    #[serde(alias = "https")]
    Wss,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

/// Connection settings for the realtime server and the channel-auth endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub app_key: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default = "default_auth_endpoint")]
    pub auth_endpoint: String,
    #[serde(default = "default_message_event")]
    pub message_event: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_activity_timeout_ms")]
    pub activity_timeout_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            host: default_host(),
            port: default_port(),
            scheme: Scheme::default(),
            auth_endpoint: default_auth_endpoint(),
            message_event: default_message_event(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            activity_timeout_ms: default_activity_timeout_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
        }
    }

    /// Loads `REVERB_*` environment variables, e.g. `REVERB_APP_KEY`,
    /// `REVERB_HOST`, `REVERB_RECONNECT_DELAY_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: ClientConfig = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("REVERB")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.normalize().validated()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = endpoint.into();
        self
    }

    pub fn with_message_event(mut self, event: impl Into<String>) -> Self {
        self.message_event = event.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = duration_ms(delay);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_keepalive(mut self, activity_timeout: Duration, pong_timeout: Duration) -> Self {
        self.activity_timeout_ms = duration_ms(activity_timeout);
        self.pong_timeout_ms = duration_ms(pong_timeout);
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// `{scheme}://{host}:{port}/app/{key}` with the protocol query the
    /// server uses to pick its framing.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        if self.app_key.trim().is_empty() {
            return Err(ConfigError::MissingAppKey);
        }
        let raw = format!(
            "{}://{}:{}/app/{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.app_key
        );
        let mut url = Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        url.query_pairs_mut()
            .append_pair("protocol", &PROTOCOL_VERSION.to_string())
            .append_pair("client", CLIENT_NAME)
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("flash", "false");
        Ok(url)
    }

    pub fn auth_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.auth_endpoint).map_err(|source| ConfigError::InvalidUrl {
            url: self.auth_endpoint.clone(),
            source,
        })
    }

    pub(crate) fn validated(self) -> Result<Self, ConfigError> {
        self.websocket_url()?;
        self.auth_url()?;
        Ok(self)
    }

    fn normalize(mut self) -> Self {
        self.app_key = self.app_key.trim().to_string();
        self.host = normalize_or(self.host, default_host);
        self.auth_endpoint = normalize_or(self.auth_endpoint, default_auth_endpoint);
        self.message_event = normalize_or(self.message_event, default_message_event);
        self
    }
}

fn normalize_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_auth_endpoint() -> String {
    "http://127.0.0.1:8000/broadcasting/auth".to_string()
}

fn default_message_event() -> String {
    DEFAULT_MESSAGE_EVENT.to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    duration_ms(DEFAULT_RECONNECT_DELAY)
}

fn default_connect_timeout_ms() -> u64 {
    duration_ms(DEFAULT_CONNECT_TIMEOUT)
}

fn default_auth_timeout_ms() -> u64 {
    duration_ms(DEFAULT_AUTH_TIMEOUT)
}

fn default_activity_timeout_ms() -> u64 {
    duration_ms(DEFAULT_ACTIVITY_TIMEOUT)
}

fn default_pong_timeout_ms() -> u64 {
    duration_ms(DEFAULT_PONG_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: [&str; 5] = [
        "REVERB_APP_KEY",
        "REVERB_HOST",
        "REVERB_PORT",
        "REVERB_SCHEME",
        "REVERB_RECONNECT_DELAY_MS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_use_five_second_reconnect() {
        let config = ClientConfig::new("app-key");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.message_event, "message.sent");
        assert_eq!(config.scheme, Scheme::Ws);
    }

    #[test]
    fn websocket_url_carries_protocol_query() {
        let config = ClientConfig::new("app-key")
            .with_host("chat.example.com")
            .with_port(443)
            .with_scheme(Scheme::Wss);
        let url = config.websocket_url().expect("valid url");
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("chat.example.com"));
        assert_eq!(url.path(), "/app/app-key");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("protocol".into(), "7".into())));
        assert!(query.contains(&("flash".into(), "false".into())));
    }

    #[test]
    fn empty_app_key_is_rejected() {
        let err = ClientConfig::new("  ").websocket_url().unwrap_err();
        assert!(matches!(err, ConfigError::MissingAppKey));
    }

    #[test]
    fn invalid_auth_endpoint_is_rejected() {
        let err = ClientConfig::new("key")
            .with_auth_endpoint("not a url")
            .validated()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    #[serial]
    fn from_env_reads_reverb_variables() {
        clear_env();
        env::set_var("REVERB_APP_KEY", "env-key");
        env::set_var("REVERB_HOST", "reverb.internal");
        env::set_var("REVERB_PORT", "6001");
        env::set_var("REVERB_SCHEME", "https");
        env::set_var("REVERB_RECONNECT_DELAY_MS", "250");

        let config = ClientConfig::from_env().expect("config loads");
        clear_env();

        assert_eq!(config.app_key, "env-key");
        assert_eq!(config.host, "reverb.internal");
        assert_eq!(config.port, 6001);
        assert_eq!(config.scheme, Scheme::Wss);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn from_env_requires_app_key() {
        clear_env();
        let err = ClientConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingAppKey));
    }
}

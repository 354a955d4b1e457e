//! Adapter configuration.
//!
//! Input and output each carry their own [`ConnectionConfig`]; the bridge
//! binary aggregates both into [`BridgeConfig`], which can be loaded from
//! YAML files or environment variables.

use serde::Deserialize;
use uuid::Uuid;

use crate::bus::topic::{validate_topic_filter, validate_topic_name};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "streambus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "STREAMBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STREAMBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "STREAMBUS_LOG";

/// Default broker endpoint.
pub const DEFAULT_URL: &str = "tcp://localhost:1883";
/// Prefix for generated client identifiers.
pub const CLIENT_ID_PREFIX: &str = "streambus";

/// Errors in adapter configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one broker URL is required")]
    NoUrls,

    #[error("At least one subscribe topic is required")]
    NoTopics,

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("Invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("TLS client certificate and key must be configured together")]
    IncompleteClientAuth,

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Broker delivery guarantee level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u8")]
pub enum QosLevel {
    /// Fire and forget (QoS 0).
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible (QoS 1).
    #[default]
    AtLeastOnce,
    /// Four-step handshake (QoS 2).
    ExactlyOnce,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(ConfigError::InvalidQos(other)),
        }
    }
}

/// Username/password authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// TLS settings. Any `ssl://`, `tls://` or `mqtts://` URL uses TLS even
/// without this block, trusting the platform roots.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM CA bundle to trust instead of the platform roots.
    pub ca_file: Option<String>,
    /// PEM client certificate for mutual TLS.
    pub client_cert_file: Option<String>,
    /// PEM client private key for mutual TLS.
    pub client_key_file: Option<String>,
}

/// Settings shared by input and output connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Client identifier. Generated when empty.
    pub client_id: String,
    /// Candidate broker URLs, tried in order; the first reachable wins.
    pub urls: Vec<String>,
    /// QoS for subscriptions (input) or publishes (output).
    pub qos: QosLevel,
    /// Start without broker-side session state.
    ///
    /// Unacknowledged deliveries are only redelivered across reconnects
    /// when this is false.
    pub clean_session: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Upper bound on waiting for the broker to accept a connection.
    pub connect_timeout_secs: u64,
    /// Username/password authentication (optional).
    pub credentials: Option<Credentials>,
    /// TLS settings (optional).
    pub tls: Option<TlsConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            urls: vec![DEFAULT_URL.to_string()],
            qos: QosLevel::default(),
            clean_session: true,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            credentials: None,
            tls: None,
        }
    }
}

impl ConnectionConfig {
    /// Create config for the given broker URLs.
    pub fn new<S: Into<String>>(urls: impl IntoIterator<Item = S>) -> Self {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Check the settings and fill in a client id when none is set.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.urls.is_empty() {
            return Err(ConfigError::NoUrls);
        }
        if let Some(tls) = &self.tls {
            if tls.client_cert_file.is_some() != tls.client_key_file.is_some() {
                return Err(ConfigError::IncompleteClientAuth);
            }
        }
        if self.client_id.is_empty() {
            self.client_id = format!("{}-{}", CLIENT_ID_PREFIX, Uuid::new_v4().simple());
        }
        Ok(self)
    }
}

/// Input adapter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttInputConfig {
    /// Connection settings.
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Topic filters to subscribe to.
    pub topics: Vec<String>,
}

impl MqttInputConfig {
    /// Create config subscribing to `topics` on `urls`.
    pub fn new<U, T>(urls: impl IntoIterator<Item = U>, topics: impl IntoIterator<Item = T>) -> Self
    where
        U: Into<String>,
        T: Into<String>,
    {
        Self {
            connection: ConnectionConfig::new(urls),
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Set the client identifier.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.connection.client_id = client_id.into();
        self
    }

    /// Set the subscription QoS.
    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.connection.qos = qos;
        self
    }

    /// Keep broker-side session state across reconnects.
    pub fn with_persistent_session(mut self) -> Self {
        self.connection.clean_session = false;
        self
    }

    /// Add username/password authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.connection.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set TLS settings.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.connection.tls = Some(tls);
        self
    }

    /// Check the settings and fill in a client id when none is set.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        for topic in &self.topics {
            validate_topic_filter(topic).map_err(|reason| ConfigError::InvalidTopic {
                topic: topic.clone(),
                reason,
            })?;
        }
        self.connection = self.connection.validated()?;
        Ok(self)
    }
}

/// Output adapter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttOutputConfig {
    /// Connection settings.
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Topic every part is published to.
    pub topic: String,
    /// Ask the broker to retain the last message on the topic.
    pub retained: bool,
}

impl MqttOutputConfig {
    /// Create config publishing to `topic` on `urls`.
    pub fn new<U: Into<String>>(urls: impl IntoIterator<Item = U>, topic: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(urls),
            topic: topic.into(),
            retained: false,
        }
    }

    /// Set the client identifier.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.connection.client_id = client_id.into();
        self
    }

    /// Set the publish QoS.
    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.connection.qos = qos;
        self
    }

    /// Set the retain flag on every publish.
    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Add username/password authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.connection.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set TLS settings.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.connection.tls = Some(tls);
        self
    }

    /// Check the settings and fill in a client id when none is set.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        validate_topic_name(&self.topic).map_err(|reason| ConfigError::InvalidTopic {
            topic: self.topic.clone(),
            reason,
        })?;
        self.connection = self.connection.validated()?;
        Ok(self)
    }
}

/// Configuration for the bridge binary: one input, one output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Where messages are read from.
    pub input: MqttInputConfig,
    /// Where messages are written to.
    pub output: MqttOutputConfig,
    /// Seconds to wait for each adapter to close on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            input: MqttInputConfig::default(),
            output: MqttOutputConfig::default(),
            shutdown_timeout_secs: 5,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `streambus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("input.urls")
                    .with_list_parse_key("input.topics")
                    .with_list_parse_key("output.urls")
                    .try_parsing(true),
            )
            .build()?;

        let config: BridgeConfig = config.try_deserialize()?;
        Ok(config)
    }
}

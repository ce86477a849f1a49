//! Per-instance configuration.
//!
//! Loaded from a TOML file and overridden from the command line:
//!
//! ```toml
//! title = "ward-7"
//! port = 6661
//! output_kvp = true
//! remove_phi = true
//! fields_to_remove = ["PID.PID_3", "ZPI"]
//! socket_timeout_secs = 30
//!
//! [sink]
//! index = "hl7"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;

use crate::ack::DEFAULT_ACK_TEXT;
use crate::emitter::OutputMode;
use crate::error::ConfigurationError;
use crate::filter::MessageFilter;
use crate::mllp::DEFAULT_MAX_FRAME_BYTES;
use crate::sink::RoutingAttributes;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Instance name, used for the default stanza
    #[serde(default = "default_title")]
    pub title: String,

    /// Address to listen on (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// TCP port to listen on; must be set, here or on the command line
    #[serde(default)]
    pub port: u16,

    /// Emit flattened key=value pairs instead of the raw message
    #[serde(default)]
    pub output_kvp: bool,

    /// Quote every flattened value, not only empty ones or ones with spaces
    #[serde(default = "default_true")]
    pub quote_values: bool,

    /// Strip the standard set of PHI fields before emitting
    #[serde(default)]
    pub remove_phi: bool,

    /// Extra paths to strip, e.g. `PID.PID_3`, or a bare segment name
    #[serde(default)]
    pub fields_to_remove: Vec<String>,

    /// Segments serializing to more than this many bytes are dropped (0 = no limit)
    #[serde(default)]
    pub max_long_segment: Option<usize>,

    /// Largest MLLP frame body accepted
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// MSA-3 text of positive acknowledgments
    #[serde(default = "default_ack_text")]
    pub ack_text: String,

    /// Seconds a connection may sit on a read or an ack write before it is closed (0 = wait
    /// forever)
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,

    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SinkConfig {
    /// Defaults to `hl7://<title>`
    #[serde(default)]
    pub stanza: Option<String>,

    #[serde(default = "default_index")]
    pub index: String,

    #[serde(default)]
    pub source: Option<String>,

    #[serde(default = "default_sourcetype")]
    pub sourcetype: String,

    #[serde(default)]
    pub host: Option<String>,
}

fn default_title() -> String {
    "hl7".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_ack_text() -> String {
    DEFAULT_ACK_TEXT.to_string()
}

fn default_socket_timeout_secs() -> u64 {
    30
}

fn default_index() -> String {
    "default".to_string()
}

fn default_sourcetype() -> String {
    "hl7".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: default_title(),
            bind_address: default_bind_address(),
            port: 0,
            output_kvp: false,
            quote_values: true,
            remove_phi: false,
            fields_to_remove: Vec::new(),
            max_long_segment: None,
            max_frame_bytes: default_max_frame_bytes(),
            ack_text: default_ack_text(),
            socket_timeout_secs: default_socket_timeout_secs(),
            sink: SinkConfig::default(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            stanza: None,
            index: default_index(),
            source: None,
            sourcetype: default_sourcetype(),
            host: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        Ok(toml::from_str(content)?)
    }

    /// Checks everything that must hold before the listener binds, including that nothing is
    /// already accepting connections on the port.
    pub async fn validate(&self) -> Result<(), ConfigurationError> {
        self.validate_settings()?;
        if port_in_use(self.port).await {
            return Err(ConfigurationError::PortInUse(self.port));
        }
        Ok(())
    }

    /// [`validate`](Self::validate) without the port checks, for a listener that is already bound.
    pub fn validate_settings(&self) -> Result<(), ConfigurationError> {
        if self.port == 0 {
            return Err(ConfigurationError::InvalidPort);
        }
        self.bind_ip()?;
        self.validate_paths()
    }

    pub(crate) fn validate_paths(&self) -> Result<(), ConfigurationError> {
        match MessageFilter::invalid_path(&self.fields_to_remove) {
            Some(path) => Err(ConfigurationError::InvalidFieldPath(path.to_string())),
            None => Ok(()),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigurationError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    fn bind_ip(&self) -> Result<IpAddr, ConfigurationError> {
        self.bind_address
            .trim()
            .parse()
            .map_err(|_| ConfigurationError::InvalidBindAddress(self.bind_address.clone()))
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.socket_timeout_secs)).filter(|t| !t.is_zero())
    }

    pub fn output_mode(&self) -> OutputMode {
        if self.output_kvp {
            OutputMode::KeyValue
        } else {
            OutputMode::Raw
        }
    }

    pub fn filter(&self) -> MessageFilter {
        MessageFilter::new(self.remove_phi, &self.fields_to_remove, self.max_long_segment)
    }

    pub fn routing(&self) -> RoutingAttributes {
        let non_empty = |s: &str| Some(s.to_string()).filter(|s| !s.is_empty());
        RoutingAttributes {
            stanza: self
                .sink
                .stanza
                .clone()
                .unwrap_or_else(|| format!("hl7://{}", self.title)),
            index: non_empty(&self.sink.index),
            source: self.sink.source.clone(),
            sourcetype: non_empty(&self.sink.sourcetype),
            host: self.sink.host.clone(),
        }
    }
}

async fn port_in_use(port: u16) -> bool {
    let probe = SocketAddr::from(([127, 0, 0, 1], port));
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(probe)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_a_minimal_file() {
        let config = Config::from_toml("port = 6661").unwrap();
        assert_eq!(config.port, 6661);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.ack_text, "received by sink");
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
        assert!(config.quote_values);
        assert_eq!(config.output_mode(), OutputMode::Raw);
        assert_eq!(config.sink, SinkConfig::default());
        assert!(config.filter().is_empty());
        assert_eq!(config.socket_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_socket_timeout_waits_forever() {
        let config = Config::from_toml("port = 6661\nsocket_timeout_secs = 0").unwrap();
        assert_eq!(config.socket_timeout(), None);
    }

    #[test]
    fn reads_every_section() {
        let config = Config::from_toml(
            r#"
            title = "ward-7"
            port = 6661
            output_kvp = true
            remove_phi = true
            fields_to_remove = ["PID.PID_3"]
            max_long_segment = 2048

            [sink]
            index = "clinical"
            host = "mllp-01"
            "#,
        )
        .unwrap();

        assert_eq!(config.output_mode(), OutputMode::KeyValue);
        assert!(config.filter().paths().iter().any(|p| p == "PID.PID_3"));
        assert!(config.filter().paths().iter().any(|p| p == "PID.PID_5"));

        let routing = config.routing();
        assert_eq!(routing.stanza, "hl7://ward-7");
        assert_eq!(routing.index.as_deref(), Some("clinical"));
        assert_eq!(routing.sourcetype.as_deref(), Some("hl7"));
        assert_eq!(routing.host.as_deref(), Some("mllp-01"));
        assert_eq!(routing.source, None);
    }

    #[test]
    fn malformed_toml_is_a_configuration_error() {
        assert!(matches!(
            Config::from_toml("port = \"not a number\""),
            Err(ConfigurationError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = Config::from_file(Path::new("/nonexistent/hl7.toml")).unwrap_err();
        assert!(matches!(err, ConfigurationError::Read { .. }));
    }

    #[tokio::test]
    async fn validation_rejects_port_zero() {
        assert!(matches!(
            Config::default().validate().await,
            Err(ConfigurationError::InvalidPort)
        ));
    }

    #[test]
    fn validation_rejects_bad_bind_address() {
        let config = Config {
            port: 6661,
            bind_address: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate_settings(),
            Err(ConfigurationError::InvalidBindAddress(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_field_paths() {
        let config = Config {
            port: 6661,
            fields_to_remove: vec!["PID.5".to_string()],
            ..Default::default()
        };
        match config.validate_settings() {
            Err(ConfigurationError::InvalidFieldPath(path)) => assert_eq!(path, "PID.5"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn validation_detects_a_port_in_use() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config {
            port,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().await,
            Err(ConfigurationError::PortInUse(p)) if p == port
        ));
    }
}

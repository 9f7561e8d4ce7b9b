use crate::protocol::ModelSelector;
use crate::stroke::CANVAS_SIZE;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub inference_service: InferenceServiceConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceServiceConfig {
    pub url: String,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_throttle_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    8
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl InferenceServiceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            throttle_ms: default_throttle_ms(),
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn get_throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn get_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn get_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    pub fn get_max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CanvasConfig {
    #[serde(default = "default_canvas_size")]
    pub size: u32,
    #[serde(default = "default_padding")]
    pub padding: u32,
    #[serde(default = "default_brush_size")]
    pub brush_size: u32,
    #[serde(default)]
    pub default_model: ModelSelector,
}

fn default_canvas_size() -> u32 {
    CANVAS_SIZE
}

fn default_padding() -> u32 {
    10
}

fn default_brush_size() -> u32 {
    10
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            size: default_canvas_size(),
            padding: default_padding(),
            brush_size: default_brush_size(),
            default_model: ModelSelector::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("DC")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> Result<Config, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = from_yaml(
            r#"
log_level: info
server:
  host: 127.0.0.1
  port: 8000
inference_service:
  url: ws://localhost:5000/socket
"#,
        )
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.server.get_address(), "127.0.0.1:8000");
        assert_eq!(
            config.inference_service.get_throttle_window(),
            Duration::from_millis(1000)
        );
        assert_eq!(config.canvas.size, 280);
        assert_eq!(config.canvas.padding, 10);
        assert_eq!(config.canvas.default_model, ModelSelector::Cnn);
    }

    #[test]
    fn test_overrides_are_read() {
        let config = from_yaml(
            r#"
log_level: DEBUG
server:
  host: 0.0.0.0
  port: 9000
inference_service:
  url: ws://backend:5000/socket
  throttle_ms: 250
  max_backoff_ms: 2000
canvas:
  padding: 4
  default_model: svm
"#,
        )
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.inference_service.throttle_ms, 250);
        assert_eq!(
            config.inference_service.get_max_backoff(),
            Duration::from_millis(2000)
        );
        assert_eq!(config.canvas.padding, 4);
        assert_eq!(config.canvas.brush_size, 10);
        assert_eq!(config.canvas.default_model, ModelSelector::Svm);
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let result = from_yaml(
            r#"
log_level: trace
server:
  host: 127.0.0.1
  port: 8000
inference_service:
  url: ws://localhost:5000/socket
"#,
        );

        assert!(result.is_err());
    }
}

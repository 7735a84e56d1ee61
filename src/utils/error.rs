use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Config document parse error: {message}")]
    ConfigParse { message: String },

    #[error("No free port in range {min}-{max}")]
    PortExhausted { min: u16, max: u16 },

    #[error("Port {port} cannot be assigned: {reason}")]
    PortUnavailable { port: u16, reason: String },

    #[error("Failed to spawn server process '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist config document to {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Content tool failed: {message}")]
    FetchTool { message: String },

    #[error("Server '{name}' is not running")]
    NotRunning { name: String },

    #[error("Server '{name}' is already registered")]
    AlreadyRunning { name: String },

    #[error("Invalid server name '{name}': {reason}")]
    InvalidServerName { name: String, reason: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration value: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid configuration value for {field} ('{value}'): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },
}

impl SupervisorError {
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// 會使整個請求失敗的錯誤；其餘 (例如內容下載失敗) 只作為資料回報
    pub fn is_request_fatal(&self) -> bool {
        !matches!(self, Self::FetchTool { .. })
    }
}

impl From<quick_xml::Error> for SupervisorError {
    fn from(err: quick_xml::Error) -> Self {
        Self::config_parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

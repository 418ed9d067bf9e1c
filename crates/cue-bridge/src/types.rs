use crate::sdk::ErrorCode;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Incompatible SDK ({sdk_version}) and server ({server_version}) versions")]
    IncompatibleProtocol {
        sdk_version: String,
        server_version: String,
    },

    #[error("Lighting SDK error: {0}")]
    Sdk(ErrorCode),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Session is not running")]
    NotRunning,
}

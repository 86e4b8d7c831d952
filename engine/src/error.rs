use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("provider connect failed after {attempts} attempts: {reason}")]
    ConnectExhausted { attempts: u32, reason: String },

    #[error("provider connect refused: {0}")]
    ConnectRefused(String),

    #[error("provider stream closed: {0}")]
    StreamClosed(String),

    #[error("telephony channel failed: {0}")]
    Channel(String),
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording name `{0}` already exists")]
    NameExists(String),

    #[error("recording command failed: {0}")]
    Command(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] aria_config::ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Recording(#[from] RecordingError),
}

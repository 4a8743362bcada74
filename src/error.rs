use thiserror::Error;

#[derive(Error, Debug)]
pub enum DqtError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Lookup failed for {instrument}: {message}")]
    Lookup { instrument: String, message: String },
    #[error("Retrieval failed for {instrument}: {message}")]
    Retrieval { instrument: String, message: String },
    #[error("A saved query named '{name}' already exists")]
    SaveConflict { name: String },
    #[error("Parse error: {message}")]
    Parse { message: String },
    #[error("Field {instrument},{field} is not selected")]
    NotSelected { instrument: String, field: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid node path: {0}")]
    InvalidPath(String),
    #[error("Run {generation} was superseded by a newer run")]
    Superseded { generation: u64 },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DqtError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, DqtError>;

// Helper conversions
impl From<serde_json::Error> for DqtError {
    fn from(e: serde_json::Error) -> Self { Self::parse(e.to_string()) }
}
impl From<config::ConfigError> for DqtError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<url::ParseError> for DqtError {
    fn from(e: url::ParseError) -> Self { Self::Config(e.to_string()) }
}

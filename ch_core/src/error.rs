/// Core error type for chime
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Handler failure: {0}")]
    Handler(String),

    #[error("Job canceled: {0}")]
    Canceled(String),

    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    #[error("No definition for job name: {0}")]
    DefinitionMissing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Bundler error: {0}")]
    Bundler(String),

    #[error("Dependency {id} is already registered as {kind}")]
    DuplicateDep { id: String, kind: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Optimizer is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

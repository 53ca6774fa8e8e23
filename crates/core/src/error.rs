use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not attached to a tab")]
    NotAttached,

    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("no backing element: {0}")]
    NoBackingElement(String),

    #[error("timed out: {0}")]
    CommandTimeout(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("denied by user: {0}")]
    UserDenied(String),

    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("browser control error: {0}")]
    Control(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

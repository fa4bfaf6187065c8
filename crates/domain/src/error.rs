/// Shared error type used across all Amargo crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("database: {0}")]
    Database(String),

    /// No cached artifact and every upstream candidate returned a clean
    /// not-found. Surfaced to clients as 404.
    #[error("not found")]
    NotFound,

    /// Network failure or non-404 upstream error. Surfaced as 502.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream rejected our credentials (401/403). Surfaced as 401.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Metadata or object-store write failed during a MISS. Non-fatal for
    /// the request — the client still receives the bytes.
    #[error("store: {0}")]
    Store(String),

    /// Adapter-level parse failure (malformed filename, invalid path).
    /// Surfaced as 400.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config: {0}")]
    Config(String),

    /// A precondition was violated (repository not initialised, missing
    /// wiring). Surfaced as 500.
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means "the artifact cleanly does not exist" as
    /// opposed to "something went wrong looking for it".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

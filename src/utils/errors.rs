use thiserror::Error;

/// Every failure the caching proxy can surface.
///
/// Lower-level I/O and HTTP failures are folded into this single type so the
/// serving path can stop a response without caring where the failure came
/// from.
#[derive(Error, Debug)]
pub enum ProxyCacheError {
    #[error("Malformed request: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Too many redirects: {0}")]
    TooManyRedirects(usize),

    #[error("Unexpected status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Cache file {0} is already completed")]
    SinkCompleted(String),

    #[error("Cache engine for {0} has been shut down")]
    Shutdown(String),

    #[error("Failed to bind proxy socket: {0}")]
    Bind(std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyCacheError>;

impl ProxyCacheError {
    /// Whether the peer simply went away (player closed the connection).
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

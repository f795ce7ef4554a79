use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid admin url: {0}")]
    InvalidUrl(String),

    #[error("failed to connect to proxy admin at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy admin request failed: {0}")]
    Http(String),

    #[error("proxy admin returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid route payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("no route for host {0}")]
    RouteNotFound(String),

    #[error("proxy admin request timed out")]
    Timeout,
}

impl ProxyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxyError::RouteNotFound(_))
    }
}

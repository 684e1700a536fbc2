use thiserror::Error;

#[derive(Error, Debug)]
pub enum KpiError {
    #[error("Buildkite not configured, missing: {}", .missing.join(", "))]
    Config { missing: Vec<String> },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Buildkite API returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Malformed builds page: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Failed to fetch builds ({failures} failed requests): {source}")]
    Fetch {
        failures: usize,
        #[source]
        source: Box<KpiError>,
    },
}

impl KpiError {
    /// Whether the error came from the caller giving up rather than from upstream.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, KpiError>;

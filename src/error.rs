//! Error types for the proxy-lanes crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating a proxy or building a client for it.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The proxy address could not be turned into a SOCKS5 URL.
    #[error("invalid proxy address {proxy}: {source}")]
    Parse {
        proxy: String,
        #[source]
        source: url::ParseError,
    },
    /// No client could be built for the proxy within the retry budget.
    #[error("failed to create dialer for {proxy} after {attempts} attempts: {reason}")]
    Dial {
        proxy: String,
        attempts: usize,
        reason: String,
    },
    /// The probe through the proxy failed or returned a non-success status.
    #[error("probe through {proxy} failed: {reason}")]
    Probe { proxy: String, reason: String },
    /// The proxy works but exits through an IP another proxy already owns.
    #[error("proxy {proxy} resolves to known egress {ip}")]
    DuplicateEgress { proxy: String, ip: String },
}

/// Errors raised while sending a single request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to build request: {0}")]
    Build(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("failed to read response body: {0}")]
    Read(String),
}

impl RequestError {
    /// Whether the request hit its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout(_))
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            RequestError::Build(err.to_string())
        } else if err.is_body() || err.is_decode() {
            RequestError::Read(err.to_string())
        } else if err.is_timeout() {
            RequestError::Timeout(err.to_string())
        } else {
            RequestError::Transport(err.to_string())
        }
    }
}

/// Configuration that no run can be started with.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal errors raised before any worker starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no {kind} found in {}", path.display())]
    EmptyList { kind: &'static str, path: PathBuf },
    #[error("failed to install logger: {0}")]
    Logger(#[from] log::SetLoggerError),
}

/// Errors that end a run early.
#[derive(Debug, Error)]
pub enum RunError {
    /// Every validator gave up before a single proxy could be dispatched.
    #[error("no viable proxies: {validated} of {wanted} lanes could be filled")]
    NoViableProxies { validated: usize, wanted: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

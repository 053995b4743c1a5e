//! Configuration for a load run.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// What to do when validation can no longer fill the proxy pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialPoolPolicy {
    /// Keep the pool open; lanes block until a proxy arrives (possibly forever).
    #[default]
    Wait,
    /// Close the pool once every validator gave up; lanes drain what is left and exit.
    FailFast,
}

/// Tuning for the HTTP transport each client is built on.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Overall timeout for a single request, also used as the per-request deadline.
    pub request_timeout: Duration,
    /// How long an idle pooled connection is kept.
    pub idle_timeout: Duration,
    /// Maximum idle connections kept per host.
    pub max_idle_connections: usize,
    /// Deadline for establishing a connection, TLS handshake included.
    pub tls_handshake_timeout: Duration,
    /// Speak HTTP/2 without negotiation.
    pub force_http2: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            max_idle_connections: 100,
            tls_handshake_timeout: Duration::from_secs(10),
            force_http2: false,
        }
    }
}

/// Configuration for a load run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Base URL every request is sent to, without the query string.
    pub target_url: String,
    /// URL that answers with the caller's public IP as the whole body.
    pub test_url: String,
    /// Number of lanes, which is also the proxy pool capacity.
    pub lanes: usize,
    /// Requests sent per batch (one batch per acquired proxy).
    pub requests_per_lane: usize,
    /// Attempts made to build a proxied client before giving up on a proxy.
    pub retry_count: usize,
    /// HTTP transport tuning.
    pub transport: TransportConfig,
    /// `Accept-Language` header sent with every request.
    pub accept_language: String,
    /// `Content-Type` header sent with every request.
    pub content_type: String,
    /// Inclusive range the random numeric token is drawn from.
    pub token_range: (u64, u64),
    /// Route lanes through validated proxies. When false, lanes go direct.
    pub use_proxy: bool,
    /// Recycle proxies and keep sending until the process is stopped.
    pub run_indefinitely: bool,
    /// Send requests without reading or timing their responses.
    pub fire_and_forget: bool,
    /// Probe attempts a single validator makes before giving up. `None` means never.
    pub max_validation_attempts: Option<usize>,
    /// Behaviour when fewer than `lanes` unique proxies can be found.
    pub partial_pool: PartialPoolPolicy,
    /// Optional cap on requests per second for each lane.
    pub lane_rate_limit: Option<f64>,
    /// How often the stats block is printed.
    pub stats_interval: Duration,
    /// Length of the window behind the requests-per-minute counter.
    pub rate_window: Duration,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
    /// File the request log is appended to.
    pub request_log: PathBuf,
    /// File the proxy-validation log is appended to.
    pub proxy_log: PathBuf,
}

impl RunConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::new()
    }

    /// Total number of requests a bounded run issues.
    pub fn request_budget(&self) -> u64 {
        (self.lanes as u64).saturating_mul(self.requests_per_lane as u64)
    }

    /// Reject configurations no run could make progress with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes == 0 {
            return Err(ConfigError::Invalid("lanes must be at least 1".into()));
        }
        if self.requests_per_lane == 0 {
            return Err(ConfigError::Invalid(
                "requests per lane must be at least 1".into(),
            ));
        }
        if self.retry_count == 0 {
            return Err(ConfigError::Invalid("retry count must be at least 1".into()));
        }
        if self.token_range.0 > self.token_range.1 {
            return Err(ConfigError::Invalid(format!(
                "token range {}..={} is empty",
                self.token_range.0, self.token_range.1
            )));
        }
        if let Some(rps) = self.lane_rate_limit {
            if !(rps.is_finite() && rps > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "lane rate limit must be positive, got {rps}"
                )));
            }
        }
        url::Url::parse(&self.target_url)
            .map_err(|e| ConfigError::Invalid(format!("target url: {e}")))?;
        if self.use_proxy {
            url::Url::parse(&self.test_url)
                .map_err(|e| ConfigError::Invalid(format!("test url: {e}")))?;
        }
        Ok(())
    }
}

/// Builder for `RunConfig`.
#[derive(Default)]
pub struct RunConfigBuilder {
    target_url: Option<String>,
    test_url: Option<String>,
    lanes: Option<usize>,
    requests_per_lane: Option<usize>,
    retry_count: Option<usize>,
    transport: Option<TransportConfig>,
    accept_language: Option<String>,
    content_type: Option<String>,
    token_range: Option<(u64, u64)>,
    use_proxy: Option<bool>,
    run_indefinitely: Option<bool>,
    fire_and_forget: Option<bool>,
    max_validation_attempts: Option<usize>,
    partial_pool: Option<PartialPoolPolicy>,
    lane_rate_limit: Option<f64>,
    stats_interval: Option<Duration>,
    rate_window: Option<Duration>,
    show_progress: Option<bool>,
    request_log: Option<PathBuf>,
    proxy_log: Option<PathBuf>,
}

impl RunConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL requests are sent to.
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Set the URL used to learn a proxy's public IP.
    pub fn test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = Some(url.into());
        self
    }

    /// Set the number of lanes.
    pub fn lanes(mut self, lanes: usize) -> Self {
        self.lanes = Some(lanes);
        self
    }

    /// Set the number of requests per batch.
    pub fn requests_per_lane(mut self, count: usize) -> Self {
        self.requests_per_lane = Some(count);
        self
    }

    /// Set the number of attempts made to build a proxied client.
    pub fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Set the transport tuning.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the `Accept-Language` header value.
    pub fn accept_language(mut self, value: impl Into<String>) -> Self {
        self.accept_language = Some(value.into());
        self
    }

    /// Set the `Content-Type` header value.
    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    /// Set the inclusive range of the random numeric token.
    pub fn token_range(mut self, min: u64, max: u64) -> Self {
        self.token_range = Some((min, max));
        self
    }

    /// Route lanes through validated proxies or not.
    pub fn use_proxy(mut self, enabled: bool) -> Self {
        self.use_proxy = Some(enabled);
        self
    }

    /// Run until the process is stopped instead of to a fixed budget.
    pub fn run_indefinitely(mut self, enabled: bool) -> Self {
        self.run_indefinitely = Some(enabled);
        self
    }

    /// Send without reading responses.
    pub fn fire_and_forget(mut self, enabled: bool) -> Self {
        self.fire_and_forget = Some(enabled);
        self
    }

    /// Cap the probe attempts of each validator.
    pub fn max_validation_attempts(mut self, attempts: usize) -> Self {
        self.max_validation_attempts = Some(attempts);
        self
    }

    /// Set what happens when the pool cannot be filled.
    pub fn partial_pool(mut self, policy: PartialPoolPolicy) -> Self {
        self.partial_pool = Some(policy);
        self
    }

    /// Limit each lane to `rps` requests per second.
    pub fn lane_rate_limit(mut self, rps: f64) -> Self {
        self.lane_rate_limit = Some(rps);
        self
    }

    /// Set how often the stats block is printed.
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    /// Set the window of the requests-per-minute counter.
    pub fn rate_window(mut self, window: Duration) -> Self {
        self.rate_window = Some(window);
        self
    }

    /// Enable or disable the progress bar.
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.show_progress = Some(enabled);
        self
    }

    /// Set the request log path.
    pub fn request_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.request_log = Some(path.into());
        self
    }

    /// Set the proxy-validation log path.
    pub fn proxy_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy_log = Some(path.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RunConfig {
        RunConfig {
            target_url: self.target_url.unwrap_or_else(|| {
                "https://thornode.ninerealms.com/thorchain/pool/BTC.BTC/liquidity_providers"
                    .to_string()
            }),
            test_url: self
                .test_url
                .unwrap_or_else(|| "http://api.ipify.org".to_string()),
            lanes: self.lanes.unwrap_or(500),
            requests_per_lane: self.requests_per_lane.unwrap_or(10),
            retry_count: self.retry_count.unwrap_or(3),
            transport: self.transport.unwrap_or_default(),
            accept_language: self.accept_language.unwrap_or_else(|| "EL".to_string()),
            content_type: self
                .content_type
                .unwrap_or_else(|| "application/xml".to_string()),
            token_range: self.token_range.unwrap_or((0, 1_000_000)),
            use_proxy: self.use_proxy.unwrap_or(true),
            run_indefinitely: self.run_indefinitely.unwrap_or(false),
            fire_and_forget: self.fire_and_forget.unwrap_or(false),
            max_validation_attempts: self.max_validation_attempts,
            partial_pool: self.partial_pool.unwrap_or_default(),
            lane_rate_limit: self.lane_rate_limit,
            stats_interval: self.stats_interval.unwrap_or(Duration::from_secs(1)),
            rate_window: self.rate_window.unwrap_or(Duration::from_secs(60)),
            show_progress: self.show_progress.unwrap_or(true),
            request_log: self
                .request_log
                .unwrap_or_else(|| PathBuf::from("requests.log")),
            proxy_log: self
                .proxy_log
                .unwrap_or_else(|| PathBuf::from("proxies.log")),
        }
    }
}

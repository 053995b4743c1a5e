use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use proxy_lanes::logging::FileLogger;
use proxy_lanes::sources::{load_parameters, load_proxies};
use proxy_lanes::{Engine, PartialPoolPolicy, RunConfig, TransportConfig};

const DEFAULT_TARGET: &str =
    "https://thornode.ninerealms.com/thorchain/pool/BTC.BTC/liquidity_providers";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnPartialPool {
    Wait,
    FailFast,
}

impl From<OnPartialPool> for PartialPoolPolicy {
    fn from(value: OnPartialPool) -> Self {
        match value {
            OnPartialPool::Wait => PartialPoolPolicy::Wait,
            OnPartialPool::FailFast => PartialPoolPolicy::FailFast,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "proxy-lanes", version)]
#[command(
    about = "Drive lanes of GET requests through validated SOCKS5 proxies",
    long_about = None
)]
struct Args {
    /// Target URL, without the query string
    #[arg(long, default_value = DEFAULT_TARGET)]
    target_url: String,

    /// URL that echoes the caller's public IP
    #[arg(long, default_value = "http://api.ipify.org")]
    test_url: String,

    /// File with one query parameter per line
    #[arg(long, default_value = "parameters.txt")]
    parameters: PathBuf,

    /// File with one proxy per line (host:port or user:pass@host:port)
    #[arg(long, default_value = "proxy.txt")]
    proxies: PathBuf,

    /// Number of concurrent lanes
    #[arg(short, long, default_value_t = 500)]
    lanes: usize,

    /// Requests sent through each proxy before it is released
    #[arg(short = 'n', long, default_value_t = 10)]
    requests_per_lane: usize,

    /// Attempts to build a client for a proxy
    #[arg(long, default_value_t = 3)]
    retry_count: usize,

    /// Request timeout (seconds)
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Send requests directly instead of through proxies
    #[arg(long, default_value_t = false)]
    direct: bool,

    /// Recycle proxies and keep sending until interrupted
    #[arg(long, default_value_t = false)]
    indefinite: bool,

    /// Do not read or time responses
    #[arg(long, default_value_t = false)]
    fire_and_forget: bool,

    /// Speak HTTP/2 without negotiation
    #[arg(long, default_value_t = false)]
    http2: bool,

    /// Probes each validator makes before giving up
    #[arg(long)]
    max_validation_attempts: Option<usize>,

    /// What to do when not every lane can get a unique proxy
    #[arg(long, value_enum, default_value_t = OnPartialPool::Wait)]
    on_partial_pool: OnPartialPool,

    /// Requests per second allowed on each lane
    #[arg(long)]
    lane_rate_limit: Option<f64>,

    /// Smallest random token
    #[arg(long, default_value_t = 0)]
    token_min: u64,

    /// Largest random token
    #[arg(long, default_value_t = 1_000_000)]
    token_max: u64,

    /// Request log file
    #[arg(long, default_value = "requests.log")]
    request_log: PathBuf,

    /// Proxy validation log file
    #[arg(long, default_value = "proxies.log")]
    proxy_log: PathBuf,

    /// Hide the progress bar
    #[arg(long, default_value_t = false)]
    no_progress: bool,

    /// Level written to the log files
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        let transport = TransportConfig {
            request_timeout: Duration::from_secs(self.timeout),
            force_http2: self.http2,
            ..TransportConfig::default()
        };
        let mut builder = RunConfig::builder()
            .target_url(&self.target_url)
            .test_url(&self.test_url)
            .lanes(self.lanes)
            .requests_per_lane(self.requests_per_lane)
            .retry_count(self.retry_count)
            .transport(transport)
            .token_range(self.token_min, self.token_max)
            .use_proxy(!self.direct)
            .run_indefinitely(self.indefinite)
            .fire_and_forget(self.fire_and_forget)
            .partial_pool(self.on_partial_pool.into())
            .show_progress(!self.no_progress)
            .request_log(&self.request_log)
            .proxy_log(&self.proxy_log);
        if let Some(attempts) = self.max_validation_attempts {
            builder = builder.max_validation_attempts(attempts);
        }
        if let Some(rps) = self.lane_rate_limit {
            builder = builder.lane_rate_limit(rps);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.run_config();
    config.validate()?;

    FileLogger::open(&config.request_log, &config.proxy_log, args.log_level)?.install()?;

    let parameters = load_parameters(&args.parameters)
        .with_context(|| format!("loading parameters from {}", args.parameters.display()))?;
    let candidates = if config.use_proxy {
        load_proxies(&args.proxies)
            .with_context(|| format!("loading proxies from {}", args.proxies.display()))?
    } else {
        Vec::new()
    };
    println!(
        "Loaded {} parameters and {} proxies",
        parameters.len(),
        candidates.len()
    );

    let engine = Engine::new(config, parameters, candidates);
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let report = engine.run_until(shutdown).await?;
    println!("{}", report.snapshot);
    if report.completed {
        println!("All requests completed.");
    } else {
        println!("Run stopped before the request budget was reached.");
    }
    log::logger().flush();
    Ok(())
}

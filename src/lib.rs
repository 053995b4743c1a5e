//! # proxy-lanes
//!
//! A concurrent HTTP load generator that drives many lanes of GET requests
//! through validated SOCKS5 proxies.
//!
//! Validators probe candidate proxies against an IP echo endpoint and admit
//! each egress IP at most once. Admitted proxies flow through a bounded pool
//! to the lanes, which send batches of randomized requests to the target and
//! record every outcome in shared counters.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod sources;
pub mod stats;
pub mod validator;

pub use client::{ClientHandle, ClientProvider, Connector, ReqwestConnector, Transport};
pub use config::{PartialPoolPolicy, RunConfig, RunConfigBuilder, TransportConfig};
pub use dispatcher::{Dispatcher, LaneExit, LaneMode, LaneReport};
pub use engine::{Engine, RunReport};
pub use error::{ConfigError, ProxyError, RequestError, RunError, SetupError};
pub use pool::{ProxyPool, UniqueIps};
pub use proxy::{Egress, Proxy};
pub use stats::{Snapshot, Stats};
pub use validator::{ProxyValidator, ValidatorExit};

//! Run coordinator: wires validators, lanes and the reporter together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use log::{error, info, warn};
use tokio::task::JoinSet;
use tokio::time;

use crate::client::{ClientProvider, Connector, ReqwestConnector};
use crate::config::{PartialPoolPolicy, RunConfig};
use crate::dispatcher::{Dispatcher, LaneExit, LaneMode, LaneReport};
use crate::error::{ConfigError, RunError};
use crate::pool::{ProxyPool, UniqueIps};
use crate::proxy::Proxy;
use crate::request::RequestPlan;
use crate::stats::{progress_bar, spawn_reporter, Snapshot, Stats};
use crate::validator::{feed_direct, ProxyValidator, ValidatorExit};

/// How often indefinite mode checks whether another lane can be started.
const LANE_SPAWN_POLL: Duration = Duration::from_millis(50);

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Counters at the end of the run.
    pub snapshot: Snapshot,
    /// Reports of the lanes that stopped on their own.
    pub lanes: Vec<LaneReport>,
    /// How each validator (or the direct feeder) stopped.
    pub validators: Vec<ValidatorExit>,
    /// Whether the request budget was reached.
    pub completed: bool,
}

/// A configured load run.
pub struct Engine {
    config: RunConfig,
    parameters: Arc<Vec<String>>,
    candidates: Arc<Vec<Proxy>>,
    connector: Arc<dyn Connector>,
    stats: Arc<Stats>,
    unique_ips: Arc<UniqueIps>,
}

impl Engine {
    /// Create a new run that sends through `reqwest` clients.
    pub fn new(config: RunConfig, parameters: Vec<String>, candidates: Vec<Proxy>) -> Self {
        let connector = Arc::new(ReqwestConnector::new(config.transport.clone()));
        let bar = if config.show_progress {
            progress_bar((!config.run_indefinitely).then(|| config.request_budget()))
        } else {
            ProgressBar::hidden()
        };
        Self {
            config,
            parameters: Arc::new(parameters),
            candidates: Arc::new(candidates),
            connector,
            stats: Arc::new(Stats::with_progress(bar)),
            unique_ips: Arc::new(UniqueIps::new()),
        }
    }

    /// Replace the transport used for probes and requests.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Counters of this run, readable while it is going.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Egress IPs admitted so far.
    pub fn unique_ips(&self) -> Arc<UniqueIps> {
        Arc::clone(&self.unique_ips)
    }

    /// Run until the budget is reached, or forever in indefinite mode.
    pub async fn run(self) -> Result<RunReport, RunError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until the budget is reached or `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<RunReport, RunError>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let config = &self.config;
        let lanes_wanted = config.lanes;

        let pool = ProxyPool::new(lanes_wanted);
        let provider = Arc::new(ClientProvider::new(
            Arc::clone(&self.connector),
            config.retry_count,
        ));
        let plan = RequestPlan::from_config(config, Arc::clone(&self.parameters))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mode = if config.run_indefinitely {
            LaneMode::Indefinite
        } else {
            LaneMode::Bounded {
                budget: config.request_budget(),
            }
        };
        let dispatcher = Arc::new(
            Dispatcher::new(
                pool.clone(),
                Arc::clone(&provider),
                Arc::clone(&self.stats),
                Arc::new(plan),
                config.requests_per_lane,
                mode,
            )
            .with_rate_limit(config.lane_rate_limit),
        );

        let reporter = spawn_reporter(
            Arc::clone(&self.stats),
            Arc::clone(&self.unique_ips),
            config.stats_interval,
            config.rate_window,
        );

        info!(
            "Starting run: {} lanes, {} requests per batch, {}, {}",
            lanes_wanted,
            config.requests_per_lane,
            if config.use_proxy { "through proxies" } else { "direct" },
            if config.run_indefinitely { "indefinite" } else { "bounded" },
        );

        let mut feeders = JoinSet::new();
        if config.use_proxy {
            let validator = Arc::new(
                ProxyValidator::new(
                    Arc::clone(&self.candidates),
                    Arc::clone(&self.unique_ips),
                    Arc::clone(&self.stats),
                    pool.clone(),
                    Arc::clone(&provider),
                    config.test_url.clone(),
                    config.transport.request_timeout,
                    lanes_wanted,
                )
                .with_max_attempts(config.max_validation_attempts),
            );
            for worker in 0..lanes_wanted {
                let validator = Arc::clone(&validator);
                feeders.spawn(async move { validator.run_worker(worker).await });
            }
        } else {
            let pool = pool.clone();
            feeders.spawn(async move {
                feed_direct(&pool, lanes_wanted).await;
                ValidatorExit::Filled
            });
        }

        let mut lanes = JoinSet::new();
        let mut spawned = 0usize;
        if let LaneMode::Bounded { .. } = mode {
            for lane in 0..lanes_wanted {
                let dispatcher = Arc::clone(&dispatcher);
                lanes.spawn(async move { dispatcher.run_lane(lane).await });
            }
            spawned = lanes_wanted;
        }

        let mut reports = Vec::new();
        let mut exits = Vec::new();
        let mut completed = false;
        let mut feeding = true;
        let mut spawning = matches!(mode, LaneMode::Indefinite);
        let mut spawn_tick = time::interval(LANE_SPAWN_POLL);
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(joined) = feeders.join_next(), if feeding => {
                    match joined {
                        Ok(exit) => exits.push(exit),
                        Err(err) => error!("Validator task failed: {}", err),
                    }
                    if feeders.is_empty() {
                        feeding = false;
                        if let Err(err) = self.feeding_done(&pool, mode) {
                            break Err(err);
                        }
                    }
                }
                Some(joined) = lanes.join_next(), if !lanes.is_empty() => {
                    match joined {
                        Ok(report) => {
                            if report.exit == LaneExit::BudgetReached {
                                completed = true;
                                // release lanes parked on the pool
                                pool.close();
                            }
                            reports.push(report);
                        }
                        Err(err) => error!("Lane task failed: {}", err),
                    }
                    if lanes.is_empty() && !spawning {
                        break Ok(());
                    }
                }
                _ = spawn_tick.tick(), if spawning => {
                    let ready = if config.use_proxy {
                        (self.stats.proxy_successes() as usize).min(lanes_wanted)
                    } else {
                        lanes_wanted
                    };
                    while spawned < ready {
                        let dispatcher = Arc::clone(&dispatcher);
                        let lane = spawned;
                        lanes.spawn(async move { dispatcher.run_lane(lane).await });
                        spawned += 1;
                    }
                    if spawned >= lanes_wanted || !feeding {
                        spawning = false;
                        info!("{} lanes running", spawned);
                    }
                }
            }
        };

        pool.close();
        feeders.shutdown().await;
        lanes.shutdown().await;
        reporter.abort();
        self.stats.progress_bar().finish();
        outcome?;

        let snapshot = self.stats.snapshot(self.unique_ips.len());
        info!(
            "Run finished: {} requests issued, {} succeeded, {} failed",
            snapshot.issued, snapshot.successes, snapshot.failures
        );
        Ok(RunReport {
            snapshot,
            lanes: reports,
            validators: exits,
            completed,
        })
    }

    /// Every validator has stopped; decide what an unfilled pool means.
    fn feeding_done(&self, pool: &ProxyPool, mode: LaneMode) -> Result<(), RunError> {
        let wanted = self.config.lanes;
        if !self.config.use_proxy {
            return Ok(());
        }
        let validated = self.unique_ips.len();
        if validated >= wanted {
            info!(target: "proxies", "All {} lanes have a validated proxy", wanted);
            return Ok(());
        }

        warn!(
            target: "proxies",
            "No viable proxies left: {} of {} lanes filled", validated, wanted
        );
        match self.config.partial_pool {
            PartialPoolPolicy::Wait => {
                warn!(target: "proxies", "Waiting on the pool; lanes without a proxy stay blocked");
                Ok(())
            }
            PartialPoolPolicy::FailFast if validated == 0 => {
                Err(RunError::NoViableProxies { validated, wanted })
            }
            PartialPoolPolicy::FailFast => {
                if let LaneMode::Bounded { .. } = mode {
                    // lanes drain what was validated, then stop
                    pool.close();
                }
                warn!(
                    target: "proxies",
                    "Continuing degraded with {} of {} lanes", validated, wanted
                );
                Ok(())
            }
        }
    }
}

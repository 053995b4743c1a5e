//! Lanes: take a route from the pool, send a batch through it, repeat.

use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::client::ClientProvider;
use crate::pool::ProxyPool;
use crate::proxy::Egress;
use crate::request::{RequestPlan, RequestSummary};
use crate::stats::Stats;

type LaneLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// One request every `1 / rps` seconds, without bursts.
fn lane_quota(rps: f64) -> Option<Quota> {
    Quota::with_period(Duration::try_from_secs_f64(rps.recip()).ok()?)
}

/// How a lane treats the route it finished a batch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneMode {
    /// Drop the route and stop once `budget` requests were issued in total.
    Bounded { budget: u64 },
    /// Put the route back into the pool and keep going.
    Indefinite,
}

/// Why a lane stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneExit {
    /// This lane's batch brought the issued total to the budget.
    BudgetReached,
    /// The pool was closed and drained.
    PoolClosed,
}

/// What a lane did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneReport {
    pub lane: usize,
    pub batches: u64,
    pub requests: u64,
    pub exit: LaneExit,
}

/// State every lane shares.
pub struct Dispatcher {
    pool: ProxyPool,
    provider: Arc<ClientProvider>,
    stats: Arc<Stats>,
    plan: Arc<RequestPlan>,
    requests_per_lane: usize,
    mode: LaneMode,
    rate_limit: Option<f64>,
}

impl Dispatcher {
    pub fn new(
        pool: ProxyPool,
        provider: Arc<ClientProvider>,
        stats: Arc<Stats>,
        plan: Arc<RequestPlan>,
        requests_per_lane: usize,
        mode: LaneMode,
    ) -> Self {
        Self {
            pool,
            provider,
            stats,
            plan,
            requests_per_lane,
            mode,
            rate_limit: None,
        }
    }

    /// Limit every lane to `rps` requests per second.
    pub fn with_rate_limit(mut self, rps: Option<f64>) -> Self {
        self.rate_limit = rps;
        self
    }

    /// Spawn lane number `lane`.
    pub fn spawn_lane(self: &Arc<Self>, lane: usize) -> JoinHandle<LaneReport> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.run_lane(lane).await })
    }

    fn limiter(&self) -> Option<LaneLimiter> {
        Some(RateLimiter::direct(lane_quota(self.rate_limit?)?))
    }

    /// Run one lane until its mode lets it stop.
    pub async fn run_lane(&self, lane: usize) -> LaneReport {
        let limiter = self.limiter();
        let mut report = LaneReport {
            lane,
            batches: 0,
            requests: 0,
            exit: LaneExit::PoolClosed,
        };

        loop {
            let Some(egress) = self.pool.take().await else {
                debug!("Lane {} stopping: pool closed", lane);
                return report;
            };

            let client = match self.provider.acquire(&egress) {
                Ok(client) => client,
                Err(err) => {
                    warn!(
                        target: "proxies",
                        "Failed to create client with proxy {}: {}", egress, err
                    );
                    continue;
                }
            };

            let mut summaries = Vec::with_capacity(self.requests_per_lane);
            for _ in 0..self.requests_per_lane {
                if let Some(limiter) = &limiter {
                    limiter.until_ready().await;
                }
                let (summary, _) = self.plan.send(&client, &self.stats).await;
                summaries.push(summary);
            }
            log_batch(lane, &egress, &summaries);
            self.provider.release(&egress, client);

            let batch = summaries.len() as u64;
            report.batches += 1;
            report.requests += batch;

            match self.mode {
                LaneMode::Bounded { budget } => {
                    let issued = self.stats.add_issued(batch);
                    if issued >= budget {
                        info!("Lane {} reached the request budget ({}/{})", lane, issued, budget);
                        report.exit = LaneExit::BudgetReached;
                        return report;
                    }
                }
                LaneMode::Indefinite => {
                    self.stats.add_issued(batch);
                    if !self.pool.put(egress).await {
                        debug!("Lane {} stopping: pool closed", lane);
                        return report;
                    }
                }
            }
        }
    }
}

/// Mean duration and size of a finished batch.
pub fn batch_means(summaries: &[RequestSummary]) -> Option<(Duration, usize)> {
    let measured: Vec<_> = summaries.iter().filter(|s| s.error_count == 0).collect();
    if measured.is_empty() {
        return None;
    }
    let count = measured.len();
    let total: Duration = measured.iter().map(|s| s.duration).sum();
    let bytes: usize = measured.iter().map(|s| s.bytes_in).sum();
    Some((total / count as u32, bytes / count))
}

fn log_batch(lane: usize, egress: &Egress, summaries: &[RequestSummary]) {
    let errors: usize = summaries.iter().map(|s| s.error_count).sum();
    match batch_means(summaries) {
        Some((mean, size)) => debug!(
            target: "requests",
            "Lane {} via {}: {} requests, {} errors, mean {:?}, mean size {} bytes",
            lane, egress, summaries.len(), errors, mean, size
        ),
        None => debug!(
            target: "requests",
            "Lane {} via {}: {} requests, {} errors",
            lane, egress, summaries.len(), errors
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientHandle, Connector, GetRequest, Reply, Transport};
    use crate::config::RunConfig;
    use crate::error::{ProxyError, RequestError};
    use crate::proxy::Proxy;
    use async_trait::async_trait;
    use http::StatusCode;
    use parking_lot::Mutex;

    /// Records which route every request went out on.
    #[derive(Default)]
    struct Routes {
        sent: Mutex<Vec<String>>,
    }

    struct Via {
        route: String,
        routes: Arc<Routes>,
    }

    #[async_trait]
    impl Transport for Via {
        async fn get(&self, _: &GetRequest, _: bool) -> Result<Reply, RequestError> {
            self.routes.sent.lock().push(self.route.clone());
            Ok(Reply {
                status: StatusCode::OK,
                body: Some(vec![0; 4]),
            })
        }
    }

    struct RouteConnector(Arc<Routes>);

    impl Connector for RouteConnector {
        fn connect(&self, egress: &Egress) -> Result<ClientHandle, ProxyError> {
            if egress.key().starts_with("bad") {
                return Err(ProxyError::Dial {
                    proxy: egress.key().to_string(),
                    attempts: 1,
                    reason: "refused".into(),
                });
            }
            Ok(Arc::new(Via {
                route: egress.key().to_string(),
                routes: Arc::clone(&self.0),
            }))
        }
    }

    fn dispatcher(pool: &ProxyPool, requests: usize, mode: LaneMode) -> (Dispatcher, Arc<Routes>) {
        let routes = Arc::new(Routes::default());
        let provider = Arc::new(ClientProvider::new(
            Arc::new(RouteConnector(Arc::clone(&routes))),
            1,
        ));
        let config = RunConfig::builder().target_url("http://target.test").build();
        let plan = RequestPlan::from_config(&config, Arc::new(vec!["height=1".into()])).unwrap();
        let dispatcher = Dispatcher::new(
            pool.clone(),
            provider,
            Arc::new(Stats::new()),
            Arc::new(plan),
            requests,
            mode,
        );
        (dispatcher, routes)
    }

    fn proxy(address: &str) -> Egress {
        Egress::Proxy(Proxy::new(address))
    }

    #[tokio::test]
    async fn bounded_lanes_issue_exactly_the_budget() {
        let pool = ProxyPool::new(3);
        let (d, _) = dispatcher(&pool, 2, LaneMode::Bounded { budget: 6 });
        let d = Arc::new(d);
        for p in ["a:1", "b:1", "c:1"] {
            assert!(pool.put(proxy(p)).await);
        }

        let lanes: Vec<_> = (0..3).map(|i| d.spawn_lane(i)).collect();
        // the lane that completes the budget is the only one that stops by itself
        while d.stats.issued() < 6 {
            tokio::task::yield_now().await;
        }
        pool.close();
        let reports: Vec<_> = futures::future::join_all(lanes)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(d.stats.issued(), 6);
        assert_eq!(reports.iter().map(|r| r.requests).sum::<u64>(), 6);
        assert_eq!(
            reports.iter().filter(|r| r.exit == LaneExit::BudgetReached).count(),
            1
        );
        let snap = d.stats.snapshot(0);
        assert_eq!((snap.total_requests, snap.progress, snap.successes), (6, 6, 6));
        // bounded lanes never return a route
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn indefinite_lane_recycles_its_route() {
        let pool = ProxyPool::new(1);
        let (d, routes) = dispatcher(&pool, 3, LaneMode::Indefinite);
        let d = Arc::new(d);
        assert!(pool.put(proxy("a:1")).await);

        let lane = d.spawn_lane(0);
        while d.stats.issued() < 9 {
            tokio::task::yield_now().await;
        }
        pool.close();
        let report = lane.await.unwrap();

        assert_eq!(report.exit, LaneExit::PoolClosed);
        assert!(report.batches >= 3);
        assert!(routes.sent.lock().iter().all(|r| r == "a:1"));
    }

    #[tokio::test]
    async fn broken_route_is_dropped_not_retried() {
        let pool = ProxyPool::new(2);
        let (d, routes) = dispatcher(&pool, 1, LaneMode::Bounded { budget: 1 });
        assert!(pool.put(proxy("bad:1")).await);
        assert!(pool.put(proxy("good:1")).await);

        let report = d.run_lane(0).await;
        assert_eq!(report.exit, LaneExit::BudgetReached);
        assert_eq!(report.batches, 1);
        assert_eq!(*routes.sent.lock(), vec!["good:1".to_string()]);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn bounded_lane_takes_a_fresh_proxy_per_batch() {
        let pool = ProxyPool::new(2);
        let (d, routes) = dispatcher(&pool, 2, LaneMode::Bounded { budget: 4 });
        assert!(pool.put(proxy("a:1")).await);
        assert!(pool.put(proxy("b:1")).await);

        let first = d.run_lane(0).await;
        assert_eq!(first.exit, LaneExit::BudgetReached);
        let sent = routes.sent.lock().clone();
        assert_eq!(sent, vec!["a:1", "a:1", "b:1", "b:1"]);
    }

    #[test]
    fn batch_means_skip_failed_requests() {
        let summaries = vec![
            RequestSummary {
                bytes_in: 100,
                duration: Duration::from_millis(10),
                ..Default::default()
            },
            RequestSummary {
                bytes_in: 300,
                duration: Duration::from_millis(30),
                ..Default::default()
            },
            RequestSummary {
                error_count: 1,
                ..Default::default()
            },
        ];
        assert_eq!(
            batch_means(&summaries),
            Some((Duration::from_millis(20), 200))
        );
        assert_eq!(batch_means(&summaries[2..]), None);
    }

    #[test]
    fn fractional_rates_stretch_the_period() {
        let quota = lane_quota(0.5).unwrap();
        assert_eq!(quota.replenish_interval(), Duration::from_secs(2));
        assert_eq!(quota.burst_size().get(), 1);
        assert_eq!(
            lane_quota(4.0).unwrap().replenish_interval(),
            Duration::from_millis(250)
        );
        assert!(lane_quota(0.0).is_none());
    }

    #[tokio::test]
    async fn rate_limited_lane_spaces_requests() {
        let pool = ProxyPool::new(1);
        let (d, _) = dispatcher(&pool, 4, LaneMode::Bounded { budget: 4 });
        let d = d.with_rate_limit(Some(2.0));
        assert!(pool.put(proxy("a:1")).await);

        let start = std::time::Instant::now();
        let report = d.run_lane(0).await;
        assert_eq!(report.requests, 4);
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}

//! Proxy validation: probing candidates and feeding the pool with unique egress points.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use tokio::task::JoinHandle;

use crate::client::{ClientProvider, GetRequest};
use crate::error::ProxyError;
use crate::pool::{Admission, ProxyPool, UniqueIps};
use crate::proxy::{Egress, Proxy};
use crate::stats::Stats;

/// Pause after picking a candidate that needs no probe.
const KNOWN_BACKOFF: Duration = Duration::from_millis(10);

/// Why a validator worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorExit {
    /// Every lane has a unique proxy.
    Filled,
    /// The worker used up its attempt budget without filling the pool.
    Exhausted { attempts: usize },
    /// The pool was closed under it.
    PoolClosed,
}

/// Validates candidates from a shared list and hands the good ones to the pool.
pub struct ProxyValidator {
    candidates: Arc<Vec<Proxy>>,
    unique_ips: Arc<UniqueIps>,
    stats: Arc<Stats>,
    pool: ProxyPool,
    provider: Arc<ClientProvider>,
    test_url: String,
    timeout: Duration,
    lanes: usize,
    max_attempts: Option<usize>,
}

impl ProxyValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        candidates: Arc<Vec<Proxy>>,
        unique_ips: Arc<UniqueIps>,
        stats: Arc<Stats>,
        pool: ProxyPool,
        provider: Arc<ClientProvider>,
        test_url: impl Into<String>,
        timeout: Duration,
        lanes: usize,
    ) -> Self {
        Self {
            candidates,
            unique_ips,
            stats,
            pool,
            provider,
            test_url: test_url.into(),
            timeout,
            lanes,
            max_attempts: None,
        }
    }

    /// Stop each worker after this many candidate picks.
    pub fn with_max_attempts(mut self, attempts: Option<usize>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Whether enough proxies have been admitted for every lane.
    pub fn is_filled(&self) -> bool {
        self.unique_ips.len() >= self.lanes
            || self.stats.proxy_successes() >= self.lanes as u64
    }

    /// Spawn `workers` validator tasks.
    pub fn spawn(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<ValidatorExit>> {
        (0..workers)
            .map(|worker| {
                let validator = Arc::clone(self);
                tokio::spawn(async move { validator.run_worker(worker).await })
            })
            .collect()
    }

    /// Pick random candidates and validate them until every lane has a proxy.
    pub async fn run_worker(&self, worker: usize) -> ValidatorExit {
        let mut attempts = 0usize;
        loop {
            if self.is_filled() {
                debug!(target: "proxies", "Validator {} done: pool filled", worker);
                return ValidatorExit::Filled;
            }
            if self.max_attempts.is_some_and(|max| attempts >= max) {
                warn!(
                    target: "proxies",
                    "Validator {} giving up after {} attempts", worker, attempts
                );
                return ValidatorExit::Exhausted { attempts };
            }
            let Some(candidate) = self.candidates.choose(&mut rand::rng()).cloned() else {
                return ValidatorExit::Exhausted { attempts };
            };
            attempts += 1;

            if self.unique_ips.knows_proxy(&candidate) {
                if self.unique_ips.knows_all(&self.candidates) {
                    warn!(
                        target: "proxies",
                        "Validator {} done: every candidate is in use or shares an egress",
                        worker
                    );
                    return ValidatorExit::Exhausted { attempts };
                }
                tokio::time::sleep(KNOWN_BACKOFF).await;
                continue;
            }

            let ip = match self.probe(&candidate).await {
                Ok(ip) => ip,
                Err(err) => {
                    self.stats.on_proxy_failure();
                    self.provider.forget(&Egress::Proxy(candidate));
                    warn!(target: "proxies", "{}", err);
                    continue;
                }
            };

            match self.unique_ips.admit(&candidate, &ip, self.lanes) {
                Admission::Accepted(count) => {
                    self.stats.on_proxy_success();
                    info!(
                        target: "proxies",
                        "Proxy {} validated with egress {} ({}/{})",
                        candidate, ip, count, self.lanes
                    );
                    if !self.pool.put(Egress::Proxy(candidate)).await {
                        return ValidatorExit::PoolClosed;
                    }
                }
                Admission::Duplicate => {
                    let skipped = ProxyError::DuplicateEgress {
                        proxy: candidate.address.clone(),
                        ip,
                    };
                    info!(target: "proxies", "Skipping: {}", skipped);
                    self.provider.forget(&Egress::Proxy(candidate));
                }
                Admission::Full => return ValidatorExit::Filled,
            }
        }
    }

    /// Ask the test endpoint, through `candidate`, which IP it sees.
    pub async fn probe(&self, candidate: &Proxy) -> Result<String, ProxyError> {
        let egress = Egress::Proxy(candidate.clone());
        let client = self.provider.acquire(&egress)?;
        let failed = |reason: String| ProxyError::Probe {
            proxy: candidate.address.clone(),
            reason,
        };

        let request = GetRequest::new(self.test_url.clone(), self.timeout);
        let reply = tokio::time::timeout(self.timeout, client.get(&request, true))
            .await
            .map_err(|_| failed(format!("no answer within {:?}", self.timeout)))?
            .map_err(|e| failed(e.to_string()))?;

        if !reply.status.is_success() {
            return Err(failed(format!("received non-success status {}", reply.status)));
        }
        let body = reply.body.unwrap_or_default();
        let ip = String::from_utf8_lossy(&body).trim().to_string();
        if ip.is_empty() {
            return Err(failed("empty response body".to_string()));
        }
        Ok(ip)
    }
}

/// Direct mode: fill the pool with one proxy-less route per lane.
pub async fn feed_direct(pool: &ProxyPool, lanes: usize) -> usize {
    let mut fed = 0;
    for _ in 0..lanes {
        if !pool.put(Egress::Direct).await {
            break;
        }
        fed += 1;
    }
    fed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientHandle, Connector, Reply, Transport};
    use crate::error::RequestError;
    use async_trait::async_trait;
    use http::StatusCode;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers the probe with a fixed body per proxy; unknown proxies refuse.
    struct Egresses {
        ips: HashMap<String, Result<String, StatusCode>>,
        probes: AtomicUsize,
    }

    struct Answer(Option<Result<String, StatusCode>>);

    #[async_trait]
    impl Transport for Answer {
        async fn get(&self, _: &GetRequest, _: bool) -> Result<Reply, RequestError> {
            match &self.0 {
                Some(Ok(ip)) => Ok(Reply {
                    status: StatusCode::OK,
                    body: Some(ip.clone().into_bytes()),
                }),
                Some(Err(status)) => Ok(Reply {
                    status: *status,
                    body: Some(Vec::new()),
                }),
                None => Err(RequestError::Transport("connection refused".into())),
            }
        }
    }

    impl Connector for Egresses {
        fn connect(&self, egress: &Egress) -> Result<ClientHandle, ProxyError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Answer(self.ips.get(egress.key()).cloned())))
        }
    }

    fn validator(
        entries: &[(&str, Result<&str, StatusCode>)],
        lanes: usize,
        max_attempts: Option<usize>,
    ) -> (Arc<ProxyValidator>, Arc<Egresses>) {
        let connector = Arc::new(Egresses {
            ips: entries
                .iter()
                .map(|(p, ip)| (p.to_string(), ip.map(str::to_string)))
                .collect(),
            probes: AtomicUsize::new(0),
        });
        let candidates = Arc::new(entries.iter().map(|(p, _)| Proxy::new(*p)).collect());
        let validator = ProxyValidator::new(
            candidates,
            Arc::new(UniqueIps::new()),
            Arc::new(Stats::new()),
            ProxyPool::new(lanes),
            Arc::new(ClientProvider::new(connector.clone(), 1)),
            "http://ip.test",
            Duration::from_secs(1),
            lanes,
        )
        .with_max_attempts(max_attempts);
        (Arc::new(validator), connector)
    }

    #[tokio::test]
    async fn probe_reads_ip_from_body() {
        let (v, _) = validator(&[("a:1", Ok("9.9.9.9\n"))], 1, None);
        assert_eq!(v.probe(&Proxy::new("a:1")).await.unwrap(), "9.9.9.9");
    }

    #[tokio::test]
    async fn probe_rejects_bad_status_and_dead_proxies() {
        let (v, _) = validator(&[("a:1", Err(StatusCode::BAD_GATEWAY))], 1, None);
        assert!(matches!(
            v.probe(&Proxy::new("a:1")).await,
            Err(ProxyError::Probe { .. })
        ));
        assert!(matches!(
            v.probe(&Proxy::new("dead:1")).await,
            Err(ProxyError::Probe { .. })
        ));
    }

    #[tokio::test]
    async fn fills_pool_with_unique_egress() {
        let (v, _) = validator(
            &[
                ("a:1", Ok("1.1.1.1")),
                ("b:1", Ok("2.2.2.2")),
                ("c:1", Ok("3.3.3.3")),
            ],
            3,
            None,
        );
        let exits: Vec<_> = futures::future::join_all(v.spawn(3)).await;
        assert!(exits.iter().all(|e| *e.as_ref().unwrap() == ValidatorExit::Filled));
        assert_eq!(v.unique_ips.len(), 3);
        assert_eq!(v.stats.proxy_successes(), 3);
        assert_eq!(v.pool.len(), 3);
    }

    #[tokio::test]
    async fn shared_egress_is_admitted_once() {
        let (v, connector) = validator(
            &[("a:1", Ok("7.7.7.7")), ("b:1", Ok("7.7.7.7"))],
            2,
            Some(50),
        );
        let exit = v.run_worker(0).await;
        assert!(matches!(exit, ValidatorExit::Exhausted { .. }));
        // each proxy is probed once; the second one is then remembered as a duplicate
        assert_eq!(connector.probes.load(Ordering::SeqCst), 2);
        assert_eq!(v.unique_ips.len(), 1);
        assert_eq!(v.stats.proxy_successes(), 1);
        assert_eq!(v.pool.len(), 1);
    }

    #[tokio::test]
    async fn unbounded_worker_stops_when_candidates_run_out() {
        let (v, connector) = validator(&[("a:1", Ok("1.1.1.1"))], 2, None);
        let exit = tokio::time::timeout(Duration::from_secs(5), v.run_worker(0))
            .await
            .expect("worker kept looping over known candidates");
        assert!(matches!(exit, ValidatorExit::Exhausted { attempts } if attempts >= 2));
        assert_eq!(connector.probes.load(Ordering::SeqCst), 1);
        assert_eq!(v.unique_ips.len(), 1);
        assert_eq!(v.pool.len(), 1);
    }

    #[tokio::test]
    async fn failures_are_counted_and_retried() {
        let (v, connector) = validator(
            &[("dead:1", Err(StatusCode::FORBIDDEN)), ("a:1", Ok("1.1.1.1"))],
            1,
            None,
        );
        assert_eq!(v.run_worker(0).await, ValidatorExit::Filled);
        assert_eq!(v.unique_ips.len(), 1);
        let snap = v.stats.snapshot(v.unique_ips.len());
        assert_eq!(snap.proxy_successes, 1);
        // a failed proxy's client is dropped, so every retry dials again
        assert_eq!(
            connector.probes.load(Ordering::SeqCst) as u64,
            snap.proxy_failures + 1
        );
    }

    #[tokio::test]
    async fn full_registry_stops_workers_without_probing() {
        let (v, connector) = validator(
            &[("a:1", Ok("1.1.1.1")), ("b:1", Ok("2.2.2.2"))],
            2,
            None,
        );
        v.unique_ips.admit(&Proxy::new("x:1"), "5.5.5.5", 2);
        v.unique_ips.admit(&Proxy::new("y:1"), "6.6.6.6", 2);

        let exits = futures::future::join_all(v.spawn(2)).await;
        assert!(exits.iter().all(|e| *e.as_ref().unwrap() == ValidatorExit::Filled));
        assert_eq!(v.unique_ips.len(), 2);
        assert_eq!(connector.probes.load(Ordering::SeqCst), 0);
        assert!(v.pool.is_empty());
    }

    #[tokio::test]
    async fn closed_pool_stops_worker() {
        let (v, _) = validator(&[("a:1", Ok("1.1.1.1"))], 1, None);
        v.pool.close();
        assert_eq!(v.run_worker(0).await, ValidatorExit::PoolClosed);
    }

    #[tokio::test]
    async fn direct_feed_fills_every_lane() {
        let pool = ProxyPool::new(4);
        assert_eq!(feed_direct(&pool, 4).await, 4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.take().await, Some(Egress::Direct));
    }
}

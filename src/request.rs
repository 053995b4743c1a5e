//! Building and sending the individual requests of a batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{HeaderValue, ACCEPT_LANGUAGE, CONTENT_TYPE};
use http::HeaderMap;
use log::{info, warn};
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::client::{ClientHandle, GetRequest};
use crate::config::RunConfig;
use crate::error::RequestError;
use crate::stats::Stats;

/// One query: a parameter drawn from the list plus a fresh numeric token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTask {
    pub parameter: String,
}

impl RequestTask {
    /// Draw a random parameter and append `=<token>` with the token in `range`.
    pub fn random<R: Rng + ?Sized>(
        parameters: &[String],
        range: (u64, u64),
        rng: &mut R,
    ) -> Option<Self> {
        let base = parameters.choose(rng)?;
        let token = rng.random_range(range.0..=range.1);
        Some(Self {
            parameter: format!("{base}={token}"),
        })
    }

    /// `<base_url>?<parameter>`
    pub fn url(&self, base_url: &str) -> String {
        format!("{base_url}?{}", self.parameter)
    }
}

/// What a single send produced.
#[derive(Debug)]
pub enum Outcome {
    /// Response fully read.
    Completed {
        status: http::StatusCode,
        bytes: usize,
        duration: Duration,
    },
    /// Sent without reading the response; nothing was measured.
    Dispatched,
    /// Building, sending or reading failed.
    Failed {
        error: RequestError,
        duration: Option<Duration>,
    },
}

/// Per-request record a lane keeps for its current batch.
#[derive(Debug, Clone, Default)]
pub struct RequestSummary {
    pub parameter: String,
    pub bytes_in: usize,
    pub duration: Duration,
    pub error_count: usize,
}

/// Everything a lane needs to build and send requests.
pub struct RequestPlan {
    pub base_url: String,
    pub parameters: Arc<Vec<String>>,
    pub token_range: (u64, u64),
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub fire_and_forget: bool,
}

impl RequestPlan {
    /// Derive the plan from the run configuration.
    pub fn from_config(
        config: &RunConfig,
        parameters: Arc<Vec<String>>,
    ) -> Result<Self, RequestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language)
                .map_err(|e| RequestError::Build(format!("Accept-Language: {e}")))?,
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&config.content_type)
                .map_err(|e| RequestError::Build(format!("Content-Type: {e}")))?,
        );
        Ok(Self {
            base_url: config.target_url.clone(),
            parameters,
            token_range: config.token_range,
            headers,
            timeout: config.transport.request_timeout,
            fire_and_forget: config.fire_and_forget,
        })
    }

    /// Pick the next task.
    pub fn next_task(&self) -> Option<RequestTask> {
        RequestTask::random(&self.parameters, self.token_range, &mut rand::rng())
    }

    /// Send one request on `client` and record it in `stats`.
    ///
    /// The progress counter advances exactly once, whatever the outcome.
    pub async fn send(&self, client: &ClientHandle, stats: &Stats) -> (RequestSummary, Outcome) {
        stats.on_request();
        let (mut summary, outcome) = match self.next_task() {
            Some(task) => {
                let summary = RequestSummary {
                    parameter: task.parameter.clone(),
                    ..RequestSummary::default()
                };
                (summary, self.send_task(client, &task).await)
            }
            None => (
                RequestSummary::default(),
                Outcome::Failed {
                    error: RequestError::Build("parameter list is empty".into()),
                    duration: None,
                },
            ),
        };

        match &outcome {
            Outcome::Completed {
                status,
                bytes,
                duration,
            } => {
                summary.bytes_in = *bytes;
                summary.duration = *duration;
                info!(
                    target: "requests",
                    "Successful request with parameter {}: {} {} bytes, {:?}",
                    summary.parameter, status, bytes, duration
                );
                stats.on_success();
            }
            Outcome::Dispatched => {}
            Outcome::Failed { error, duration } => {
                summary.error_count += 1;
                summary.duration = duration.unwrap_or_default();
                warn!(
                    target: "requests",
                    "Failed on request with parameter {}: {}",
                    summary.parameter, error
                );
                stats.on_failure();
            }
        }
        stats.advance_progress();
        (summary, outcome)
    }

    async fn send_task(&self, client: &ClientHandle, task: &RequestTask) -> Outcome {
        let request = GetRequest {
            url: task.url(&self.base_url),
            headers: self.headers.clone(),
            timeout: self.timeout,
        };
        let read_body = !self.fire_and_forget;
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, client.get(&request, read_body)).await;
        if self.fire_and_forget {
            return Outcome::Dispatched;
        }
        let duration = start.elapsed();
        match result {
            Err(_) => Outcome::Failed {
                error: RequestError::Timeout(format!("no response within {:?}", self.timeout)),
                duration: Some(duration),
            },
            Ok(Err(error)) => Outcome::Failed {
                duration: (!matches!(error, RequestError::Build(_))).then_some(duration),
                error,
            },
            Ok(Ok(reply)) => Outcome::Completed {
                status: reply.status,
                bytes: reply.body.map_or(0, |body| body.len()),
                duration,
            },
        }
    }
}

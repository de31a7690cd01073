//! Endpoint resolution: probe candidate hosts concurrently, pick by priority.
use crate::config::{EnvironmentType, ServiceHost};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("no endpoint available for {environment} (tried: {})", .tried.join(", "))]
    NoEndpointAvailable {
        environment: EnvironmentType,
        tried: Vec<String>,
    },
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Why a single probe did not succeed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

/// Liveness check for one candidate host.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, host: &ServiceHost) -> Result<(), ProbeError>;
}

/// Probes `GET {host}?wsdl`. Any response below 500 counts as live.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, EndpointError> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, host: &ServiceHost) -> Result<(), ProbeError> {
        let mut url =
            reqwest::Url::parse(host.as_str()).map_err(|e| ProbeError(e.to_string()))?;
        url.set_query(Some("wsdl"));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ProbeError(format!("status {status}")));
        }
        Ok(())
    }
}

/// The host chosen for an environment at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    environment: EnvironmentType,
    host: ServiceHost,
    priority: usize,
    probed_at: DateTime<Utc>,
}

impl ResolvedEndpoint {
    pub fn environment(&self) -> EnvironmentType {
        self.environment
    }

    pub fn host(&self) -> &ServiceHost {
        &self.host
    }

    /// Zero-based position of the host in the configured list.
    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn probed_at(&self) -> DateTime<Utc> {
        self.probed_at
    }
}

/// Chooses the highest-priority live host from an ordered candidate list.
pub struct EndpointResolver {
    probe: Arc<dyn Probe>,
    probe_timeout: Duration,
    probe_ceiling: Duration,
}

impl EndpointResolver {
    pub fn new(probe: Arc<dyn Probe>, probe_timeout: Duration, probe_ceiling: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
            probe_ceiling,
        }
    }

    /// Probe every candidate concurrently and return the first live host in list order.
    ///
    /// A host is selected only once every host ahead of it has failed. Probes still
    /// pending when the ceiling elapses count as failed.
    ///
    /// # Errors
    /// Returns [`EndpointError::NoEndpointAvailable`] when no candidate qualifies.
    pub async fn resolve(
        &self,
        environment: EnvironmentType,
        hosts: &[ServiceHost],
    ) -> Result<ResolvedEndpoint, EndpointError> {
        let tried = || hosts.iter().map(|h| h.as_str().to_string()).collect();
        if hosts.is_empty() {
            warn!(environment = %environment, "no service hosts configured");
            return Err(EndpointError::NoEndpointAvailable {
                environment,
                tried: Vec::new(),
            });
        }

        let mut probes = JoinSet::new();
        for (priority, host) in hosts.iter().cloned().enumerate() {
            let probe = Arc::clone(&self.probe);
            let timeout = self.probe_timeout;
            probes.spawn(async move {
                let result = match tokio::time::timeout(timeout, probe.probe(&host)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError(format!("no response within {timeout:?}"))),
                };
                (priority, host, result)
            });
        }

        let deadline = tokio::time::Instant::now() + self.probe_ceiling;
        let mut live: Vec<Option<bool>> = vec![None; hosts.len()];
        let winner = loop {
            if let Some(selection) = first_live(&live) {
                break selection;
            }
            match tokio::time::timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok((priority, host, result)))) => {
                    match &result {
                        Ok(()) => debug!(host = %host, priority, "probe succeeded"),
                        Err(reason) => debug!(host = %host, priority, %reason, "probe failed"),
                    }
                    live[priority] = Some(result.is_ok());
                }
                Ok(Some(Err(join_error))) => {
                    warn!(error = %join_error, "probe task ended abnormally");
                }
                Ok(None) => {
                    settle_pending(&mut live);
                    break first_live(&live).flatten();
                }
                Err(_) => {
                    warn!(environment = %environment, ceiling = ?self.probe_ceiling, "probe ceiling elapsed");
                    settle_pending(&mut live);
                    break first_live(&live).flatten();
                }
            }
        };
        probes.abort_all();

        match winner {
            Some(priority) => {
                let host = hosts[priority].clone();
                info!(environment = %environment, host = %host, priority, "endpoint resolved");
                Ok(ResolvedEndpoint {
                    environment,
                    host,
                    priority,
                    probed_at: Utc::now(),
                })
            }
            None => {
                warn!(environment = %environment, "no live endpoint");
                Err(EndpointError::NoEndpointAvailable {
                    environment,
                    tried: tried(),
                })
            }
        }
    }
}

/// `Some(Some(i))` when host `i` wins, `Some(None)` when every host failed,
/// `None` while a higher-priority probe is still pending.
fn first_live(live: &[Option<bool>]) -> Option<Option<usize>> {
    for (priority, state) in live.iter().enumerate() {
        match state {
            Some(true) => return Some(Some(priority)),
            Some(false) => continue,
            None => return None,
        }
    }
    Some(None)
}

fn settle_pending(live: &mut [Option<bool>]) {
    for state in live.iter_mut().filter(|state| state.is_none()) {
        *state = Some(false);
    }
}

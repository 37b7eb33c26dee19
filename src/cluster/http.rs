//! HTTP client for a node's client API
//!
//! Nodes expose `GET /kv/{key}`, `POST /kv/{key}` and `GET /client/status`.
//! A non-leader answers `503` with an optional leader hint; the client follows
//! the hint (or moves round-robin) for a bounded number of attempts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::{ClusterClient, NodeId, Role};
use crate::error::{ClientError, ClusterError};

/// Response for GET /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvGetResponse {
    pub key: String,
    pub value: Option<String>,
}

/// Request body for POST /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvSetRequest {
    pub value: String,
}

/// Response for POST /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvMutationResponse {
    pub key: String,
    pub success: bool,
}

/// Error body returned with a 503
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub leader_hint: Option<u64>,
}

/// Response for GET /client/status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: u64,
    pub state: String,
    #[serde(default)]
    pub leader_id: Option<u64>,
}

impl StatusResponse {
    pub fn role(&self) -> Role {
        Role::from_status(&self.state)
    }
}

/// Node client with failover across the configured targets.
///
/// Target `i` is assumed to be node `i + 1`, which is how leader hints are
/// mapped back to addresses.
pub struct HttpNodeClient {
    targets: Vec<String>,
    http: reqwest::Client,
    max_retries: usize,
    retry_delay: Duration,
    /// Index of the last target that answered successfully
    preferred: AtomicUsize,
}

impl HttpNodeClient {
    pub fn new(targets: Vec<String>, request_timeout: Duration) -> Result<Self, ClusterError> {
        if targets.is_empty() {
            return Err(ClusterError::Http("no node addresses configured".to_string()));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClusterError::Http(e.to_string()))?;

        Ok(HttpNodeClient {
            targets,
            http,
            max_retries: 10,
            retry_delay: Duration::from_millis(50),
            preferred: AtomicUsize::new(0),
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Query one node's status endpoint
    pub async fn status(&self, addr: &str) -> Result<StatusResponse, ClusterError> {
        let url = format!("http://{}/client/status", addr);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClusterError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ClusterError::Http(format!(
                "status from {} returned {}",
                addr,
                resp.status()
            )));
        }

        resp.json::<StatusResponse>()
            .await
            .map_err(|e| ClusterError::Http(e.to_string()))
    }

    fn target_for_hint(&self, hint: Option<u64>) -> Option<usize> {
        let idx = (hint? as usize).checked_sub(1)?;
        (idx < self.targets.len()).then_some(idx)
    }

    /// Send a request, following redirects and moving past refused connections.
    ///
    /// Only errors that prove the request was not delivered are retried, so a
    /// write never takes effect twice. A hint-less 503 may come from a leader
    /// that already appended the entry, so with `idempotent` unset it is
    /// returned instead of retried.
    async fn send<F>(&self, idempotent: bool, build: F) -> Result<reqwest::Response, ClientError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let mut idx = self.preferred.load(Ordering::Relaxed) % self.targets.len();
        let mut retries = 0;

        loop {
            let target = &self.targets[idx];

            match build(&self.http, target).send().await {
                Ok(response) if response.status().is_success() => {
                    self.preferred.store(idx, Ordering::Relaxed);
                    return Ok(response);
                }
                Ok(response) if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    let hint = response
                        .json::<ErrorResponse>()
                        .await
                        .ok()
                        .and_then(|e| e.leader_hint);

                    retries += 1;
                    if retries >= self.max_retries || (hint.is_none() && !idempotent) {
                        return Err(ClientError::NotLeader {
                            leader_hint: hint.map(NodeId),
                        });
                    }

                    debug!(target = %target, ?hint, "redirected by non-leader");
                    idx = self
                        .target_for_hint(hint)
                        .filter(|&h| h != idx)
                        .unwrap_or((idx + 1) % self.targets.len());
                    tokio::time::sleep(self.retry_delay).await;
                }
                Ok(response) => {
                    return Err(ClientError::Network(format!(
                        "unexpected status: {}",
                        response.status()
                    )));
                }
                Err(e) if e.is_timeout() => return Err(ClientError::Timeout),
                Err(e) if e.is_connect() => {
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(ClientError::Unavailable(e.to_string()));
                    }
                    idx = (idx + 1) % self.targets.len();
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(ClientError::Network(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl ClusterClient for HttpNodeClient {
    async fn read(&self, key: &str) -> Result<Option<String>, ClientError> {
        let response = self
            .send(true, |http, target| http.get(format!("http://{}/kv/{}", target, key)))
            .await?;

        let body: KvGetResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(body.value)
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), ClientError> {
        let body = KvSetRequest {
            value: value.to_string(),
        };
        let response = self
            .send(false, |http, target| http.post(format!("http://{}/kv/{}", target, key)).json(&body))
            .await?;

        let resp: KvMutationResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        if resp.success {
            Ok(())
        } else {
            Err(ClientError::Network(format!("write to {} not acknowledged", key)))
        }
    }
}

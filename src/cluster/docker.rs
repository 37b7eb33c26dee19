//! Docker-based cluster handle
//!
//! Drives a Docker Compose cluster whose containers are named
//! `{prefix}{id}` and share a single compose network. Isolation disconnects a
//! container from that network; restore reconnects it. Leadership is read from
//! each node's `/client/status` endpoint on its host-mapped API port.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cluster::http::HttpNodeClient;
use crate::cluster::{ClusterHandle, Node, NodeId, Reachability, Role};
use crate::error::ClusterError;

const DEFAULT_PROJECT: &str = "leader_chaos";
const DEFAULT_NETWORK: &str = "raft-chaos-net";
const DEFAULT_CONTAINER_PREFIX: &str = "raft-node-";
const DEFAULT_API_BASE_PORT: u16 = 9100;

/// Docker answers for a disconnect/connect that is already in effect
const ALREADY_DISCONNECTED: &str = "is not connected";
const ALREADY_CONNECTED: &str = "already exists";

/// Handle to a Docker Compose cluster
pub struct DockerCluster {
    compose_file: String,
    node_count: usize,
    /// Compose project name (network name prefix)
    project_name: String,
    network: String,
    container_prefix: String,
    api_base_port: u16,
    status_client: HttpNodeClient,
    isolated: Mutex<HashSet<NodeId>>,
}

impl DockerCluster {
    /// Attach to an already running compose cluster
    pub async fn connect(compose_file: &str, node_count: usize) -> Result<Self, ClusterError> {
        let project_name = detect_project_name(compose_file).await;
        let addrs = (1..=node_count as u64)
            .map(|id| api_addr(DEFAULT_API_BASE_PORT, NodeId(id)))
            .collect();

        Ok(DockerCluster {
            compose_file: compose_file.to_string(),
            node_count,
            project_name,
            network: DEFAULT_NETWORK.to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            api_base_port: DEFAULT_API_BASE_PORT,
            status_client: HttpNodeClient::new(addrs, Duration::from_secs(2))?,
            isolated: Mutex::new(HashSet::new()),
        })
    }

    /// Bring up a fresh cluster with `docker compose up` and attach to it.
    ///
    /// Existing containers and volumes are removed first.
    pub async fn start(compose_file: &str, node_count: usize) -> Result<Self, ClusterError> {
        let cluster = Self::connect(compose_file, node_count).await?;

        if let Err(e) = cluster.compose(&["down", "-v"]).await {
            debug!(error = %e, "compose down before start failed");
        }
        cluster.compose(&["up", "-d", "--build"]).await?;

        info!(nodes = node_count, project = %cluster.project_name, "docker cluster started");
        Ok(cluster)
    }

    /// Stop and remove all containers and volumes
    pub async fn stop(&self) -> Result<(), ClusterError> {
        self.compose(&["down", "-v"]).await?;
        info!("docker cluster stopped");
        Ok(())
    }

    pub fn with_network(mut self, network: &str) -> Self {
        self.network = network.to_string();
        self
    }

    pub fn with_container_prefix(mut self, prefix: &str) -> Self {
        self.container_prefix = prefix.to_string();
        self
    }

    /// Change the first host API port; node `i` listens on `base + i`
    pub fn with_api_base_port(mut self, port: u16) -> Result<Self, ClusterError> {
        let addrs = (1..=self.node_count as u64)
            .map(|id| api_addr(port, NodeId(id)))
            .collect();
        self.status_client = HttpNodeClient::new(addrs, Duration::from_secs(2))?;
        self.api_base_port = port;
        Ok(self)
    }

    /// Host-mapped client API address for a node
    pub fn node_api_addr(&self, id: NodeId) -> String {
        api_addr(self.api_base_port, id)
    }

    /// Client API addresses of all nodes, in id order
    pub fn api_addrs(&self) -> Vec<String> {
        self.node_ids().map(|id| self.node_api_addr(id)).collect()
    }

    fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (1..=self.node_count as u64).map(NodeId)
    }

    fn container(&self, id: NodeId) -> String {
        format!("{}{}", self.container_prefix, id)
    }

    /// Full Docker network name (compose project + network)
    fn network_name(&self) -> String {
        format!("{}_{}", self.project_name, self.network)
    }

    fn check_member(&self, id: NodeId) -> Result<(), ClusterError> {
        if id.0 == 0 || id.0 as usize > self.node_count {
            return Err(ClusterError::NodeNotFound(id));
        }
        Ok(())
    }

    async fn compose(&self, args: &[&str]) -> Result<String, ClusterError> {
        let mut full = vec!["compose", "-f", self.compose_file.as_str()];
        full.extend_from_slice(args);
        docker(&full).await
    }

    async fn role_of(&self, id: NodeId) -> Role {
        match self.status_client.status(&self.node_api_addr(id)).await {
            Ok(status) => status.role(),
            Err(e) => {
                debug!(node = %id, error = %e, "status query failed");
                Role::Unknown
            }
        }
    }

    fn reachability_of(&self, id: NodeId) -> Reachability {
        if self.isolated.lock().contains(&id) {
            Reachability::Isolated
        } else {
            Reachability::Connected
        }
    }
}

#[async_trait]
impl ClusterHandle for DockerCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let mut nodes = Vec::with_capacity(self.node_count);
        for id in self.node_ids() {
            nodes.push(Node {
                id,
                addr: self.node_api_addr(id),
                role: self.role_of(id).await,
                reachability: self.reachability_of(id),
            });
        }
        Ok(nodes)
    }

    async fn current_leader(&self) -> Result<Option<Node>, ClusterError> {
        // An isolated former leader may still believe it leads; skip it.
        for node in self.list_nodes().await? {
            if node.role == Role::Leader && node.reachability == Reachability::Connected {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    async fn isolate(&self, id: NodeId) -> Result<(), ClusterError> {
        self.check_member(id)?;
        let container = self.container(id);
        let network = self.network_name();

        let result = docker(&["network", "disconnect", &network, &container]).await;
        if network_changed(result, ALREADY_DISCONNECTED)? {
            info!(node = %id, "isolated node from network");
        } else {
            debug!(node = %id, "node already isolated");
        }

        self.isolated.lock().insert(id);
        Ok(())
    }

    async fn restore(&self, id: NodeId) -> Result<(), ClusterError> {
        self.check_member(id)?;
        let container = self.container(id);
        let network = self.network_name();

        let result = docker(&["network", "connect", &network, &container]).await;
        if network_changed(result, ALREADY_CONNECTED)? {
            info!(node = %id, "rejoined node to network");
        } else {
            debug!(node = %id, "node already connected");
        }

        self.isolated.lock().remove(&id);
        Ok(())
    }

    async fn is_healthy(&self, id: NodeId) -> bool {
        if self.check_member(id).is_err() || self.reachability_of(id) == Reachability::Isolated {
            return false;
        }
        self.status_client.status(&self.node_api_addr(id)).await.is_ok()
    }
}

fn api_addr(base_port: u16, id: NodeId) -> String {
    format!("127.0.0.1:{}", base_port as u64 + id.0)
}

/// Whether a network connect/disconnect changed anything.
///
/// A failure whose stderr carries `already` means the node was already in the
/// requested state and is reported as `Ok(false)`.
fn network_changed(result: Result<String, ClusterError>, already: &str) -> Result<bool, ClusterError> {
    match result {
        Ok(_) => Ok(true),
        Err(ClusterError::CommandFailed { stderr, .. }) if stderr.contains(already) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run a docker command, returning stdout or the failure with stderr
async fn docker(args: &[&str]) -> Result<String, ClusterError> {
    let output = Command::new("docker").args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(ClusterError::CommandFailed {
            command: format!("docker {}", args.join(" ")),
            stderr,
        })
    }
}

/// Project name that docker compose derives for the file
async fn detect_project_name(compose_file: &str) -> String {
    let config = match docker(&["compose", "-f", compose_file, "config", "--format", "json"]).await {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, "could not read compose config, using default project name");
            return DEFAULT_PROJECT.to_string();
        }
    };

    serde_json::from_str::<serde_json::Value>(&config)
        .ok()
        .and_then(|v| v["name"].as_str().map(str::to_string))
        .unwrap_or_else(|| DEFAULT_PROJECT.to_string())
}

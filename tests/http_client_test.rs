//! HttpNodeClient against in-process fake nodes.
//!
//! Each fake node serves the KV and status API with axum. Nodes share one
//! store; followers answer 503 with an optional leader hint.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use leader_chaos::cluster::http::{
    ErrorResponse, HttpNodeClient, KvGetResponse, KvMutationResponse, KvSetRequest, StatusResponse,
};
use leader_chaos::{ClientError, ClusterClient, NodeId, Role};
use parking_lot::Mutex;
use tokio::net::TcpListener;

#[derive(Clone)]
struct FakeNode {
    id: u64,
    leader: bool,
    leader_hint: Option<u64>,
    delay: Duration,
    store: Arc<Mutex<HashMap<String, String>>>,
    hits: Arc<AtomicUsize>,
    /// Writes still to be applied but answered as uncommitted
    uncommitted: Arc<AtomicUsize>,
}

type Rejection = (StatusCode, Json<ErrorResponse>);

impl FakeNode {
    fn reject(&self) -> Rejection {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "not leader".to_string(),
                leader_hint: self.leader_hint,
            }),
        )
    }
}

async fn handle_get(
    State(node): State<FakeNode>,
    Path(key): Path<String>,
) -> Result<Json<KvGetResponse>, Rejection> {
    node.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(node.delay).await;
    if !node.leader {
        return Err(node.reject());
    }
    let value = node.store.lock().get(&key).cloned();
    Ok(Json(KvGetResponse { key, value }))
}

async fn handle_set(
    State(node): State<FakeNode>,
    Path(key): Path<String>,
    Json(request): Json<KvSetRequest>,
) -> Result<Json<KvMutationResponse>, Rejection> {
    node.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(node.delay).await;
    if !node.leader {
        return Err(node.reject());
    }
    node.store.lock().insert(key.clone(), request.value);
    if node
        .uncommitted
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "Entry not committed".to_string(),
                leader_hint: None,
            }),
        ));
    }
    Ok(Json(KvMutationResponse { key, success: true }))
}

async fn handle_status(State(node): State<FakeNode>) -> Json<StatusResponse> {
    Json(StatusResponse {
        node_id: node.id,
        state: if node.leader { "Leader" } else { "Follower" }.to_string(),
        leader_id: node.leader_hint,
    })
}

async fn spawn_node(node: FakeNode) -> SocketAddr {
    let app = Router::new()
        .route("/kv/{key}", get(handle_get).post(handle_set))
        .route("/client/status", get(handle_status))
        .with_state(node);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn node(id: u64, leader: bool, leader_hint: Option<u64>, store: &Arc<Mutex<HashMap<String, String>>>) -> FakeNode {
    FakeNode {
        id,
        leader,
        leader_hint,
        delay: Duration::ZERO,
        store: store.clone(),
        hits: Arc::new(AtomicUsize::new(0)),
        uncommitted: Arc::new(AtomicUsize::new(0)),
    }
}

/// An address nothing listens on
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_write_then_read_on_leader() {
    common::init_tracing();
    let store = Arc::new(Mutex::new(HashMap::new()));
    let addr = spawn_node(node(1, true, Some(1), &store)).await;

    let client = HttpNodeClient::new(vec![addr.to_string()], Duration::from_secs(2)).unwrap();
    assert_eq!(client.read("k").await.unwrap(), None);
    client.write("k", "v1").await.unwrap();
    assert_eq!(client.read("k").await.unwrap(), Some("v1".to_string()));
    assert_eq!(store.lock().get("k").map(String::as_str), Some("v1"));
}

#[tokio::test]
async fn test_follows_leader_hint() {
    common::init_tracing();
    let store = Arc::new(Mutex::new(HashMap::new()));
    let follower = node(1, false, Some(3), &store);
    let bystander = node(2, false, Some(3), &store);
    let leader = node(3, true, Some(3), &store);
    let (follower_hits, bystander_hits, leader_hits) =
        (follower.hits.clone(), bystander.hits.clone(), leader.hits.clone());

    let targets = vec![
        spawn_node(follower).await.to_string(),
        spawn_node(bystander).await.to_string(),
        spawn_node(leader).await.to_string(),
    ];
    let client = HttpNodeClient::new(targets, Duration::from_secs(2)).unwrap();

    client.write("k", "v").await.unwrap();
    assert_eq!(follower_hits.load(Ordering::SeqCst), 1);
    assert_eq!(bystander_hits.load(Ordering::SeqCst), 0);
    assert_eq!(leader_hits.load(Ordering::SeqCst), 1);

    // The leader is now preferred
    assert_eq!(client.read("k").await.unwrap(), Some("v".to_string()));
    assert_eq!(follower_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fails_over_refused_connection() {
    common::init_tracing();
    let store = Arc::new(Mutex::new(HashMap::new()));
    let dead = dead_addr().await;
    let live = spawn_node(node(2, true, Some(2), &store)).await;

    let client = HttpNodeClient::new(vec![dead.to_string(), live.to_string()], Duration::from_secs(2)).unwrap();
    client.write("k", "v").await.unwrap();
    assert_eq!(store.lock().get("k").map(String::as_str), Some("v"));
}

#[tokio::test]
async fn test_gives_up_without_leader() {
    common::init_tracing();
    let store = Arc::new(Mutex::new(HashMap::new()));
    let targets = vec![
        spawn_node(node(1, false, None, &store)).await.to_string(),
        spawn_node(node(2, false, None, &store)).await.to_string(),
    ];
    let client = HttpNodeClient::new(targets, Duration::from_secs(2))
        .unwrap()
        .with_max_retries(3);

    let err = client.write("k", "v").await.unwrap_err();
    assert_eq!(err, ClientError::NotLeader { leader_hint: None });
    assert!(store.lock().is_empty());
}

#[tokio::test]
async fn test_uncommitted_write_is_not_resent() {
    common::init_tracing();
    let store = Arc::new(Mutex::new(HashMap::new()));
    let leader = node(1, true, Some(1), &store);
    leader.uncommitted.store(1, Ordering::SeqCst);
    let hits = leader.hits.clone();
    let addr = spawn_node(leader).await;

    let client = HttpNodeClient::new(vec![addr.to_string()], Duration::from_secs(2)).unwrap();
    let err = client.write("k1", "c0-1").await.unwrap_err();
    assert_eq!(err, ClientError::NotLeader { leader_hint: None });
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Reads carry no effect and may still be retried
    assert_eq!(client.read("k1").await.unwrap(), Some("c0-1".to_string()));
}

#[tokio::test]
async fn test_slow_node_times_out() {
    common::init_tracing();
    let store = Arc::new(Mutex::new(HashMap::new()));
    let mut slow = node(1, true, Some(1), &store);
    slow.delay = Duration::from_secs(2);
    let addr = spawn_node(slow).await;

    let client = HttpNodeClient::new(vec![addr.to_string()], Duration::from_millis(100)).unwrap();
    assert_eq!(client.read("k").await, Err(ClientError::Timeout));
}

#[tokio::test]
async fn test_status_reports_role() {
    common::init_tracing();
    let store = Arc::new(Mutex::new(HashMap::new()));
    let leader = spawn_node(node(1, true, Some(1), &store)).await;
    let follower = spawn_node(node(2, false, Some(1), &store)).await;

    let client = HttpNodeClient::new(vec![leader.to_string(), follower.to_string()], Duration::from_secs(1)).unwrap();

    let status = client.status(&leader.to_string()).await.unwrap();
    assert_eq!(status.role(), Role::Leader);
    let status = client.status(&follower.to_string()).await.unwrap();
    assert_eq!(status.role(), Role::Follower);
    assert_eq!(status.leader_id.map(NodeId), Some(NodeId(1)));

    assert!(client.status(&dead_addr().await.to_string()).await.is_err());
}

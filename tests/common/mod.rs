//! Shared test fixtures: a mock Lifecycle, mock Job backends and a replica
//! spawner running the full router on real sockets.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use racetrack_pub::config::Config;
use racetrack_pub::replicas::ReplicaDiscovery;
use racetrack_pub::server::{PubServer, Services};
use racetrack_pub::storage::TaskStorage;
use racetrack_pub::task_store::AsyncTaskStore;

pub const TEST_CLEAN_UP_TIMEOUT: Duration = Duration::from_secs(125 * 60);

/// What the mock Lifecycle answers to authorization calls.
#[derive(Clone)]
pub enum AuthBehavior {
    Allow { internal_name: String, caller: String },
    Reject401,
    Reject404,
    Reject503,
}

pub struct MockLifecycle {
    pub url: String,
}

impl MockLifecycle {
    pub async fn spawn(behavior: AuthBehavior) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock lifecycle")?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(behavior);
        let app = Router::new()
            .route(
                "/lifecycle/api/v1/auth/can-call-job/{job}/{version}/{*endpoint}",
                get(authorize_endpoint),
            )
            .route(
                "/lifecycle/api/v1/job/{job}/{version}",
                get(job_details_endpoint),
            )
            .with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        Ok(Self {
            url: format!("http://127.0.0.1:{port}/lifecycle"),
        })
    }
}

async fn authorize_endpoint(
    State(behavior): State<Arc<AuthBehavior>>,
    Path((job, _version, _endpoint)): Path<(String, String, String)>,
) -> Response {
    match &*behavior {
        AuthBehavior::Allow {
            internal_name,
            caller,
        } => Json(serde_json::json!({
            "job": {
                "name": job,
                "version": "0.0.1",
                "status": "running",
                "internal_name": internal_name,
            },
            "caller": caller,
        }))
        .into_response(),
        AuthBehavior::Reject401 => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid auth token", "status": "unauthenticated"})),
        )
            .into_response(),
        AuthBehavior::Reject404 => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no such job"})),
        )
            .into_response(),
        AuthBehavior::Reject503 => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "lifecycle unavailable"})),
        )
            .into_response(),
    }
}

async fn job_details_endpoint(
    State(behavior): State<Arc<AuthBehavior>>,
    Path((job, _version)): Path<(String, String)>,
) -> Response {
    match &*behavior {
        AuthBehavior::Allow { internal_name, .. } => Json(serde_json::json!({
            "name": job,
            "version": "0.0.1",
            "status": "running",
            "internal_name": internal_name,
        }))
        .into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no such job"})),
        )
            .into_response(),
    }
}

/// How the mock Job backend answers calls.
#[derive(Clone, Copy)]
pub enum JobBehavior {
    Respond,
    /// Suspend every call until `release()`.
    HoldUntilRelease,
    /// Suspend the first call forever, later calls until `release()`.
    /// Simulates a replica restart orphaning its first attempt.
    HoldFirstForever,
    /// Answer with a redirect to an absolute internal URL.
    RespondRedirect,
}

pub struct MockJobBackend {
    pub addr: String,
    pub calls: Arc<AtomicU64>,
    pub last_headers: Arc<Mutex<HashMap<String, String>>>,
    release_tx: watch::Sender<bool>,
}

struct JobBackendState {
    behavior: JobBehavior,
    calls: Arc<AtomicU64>,
    last_headers: Arc<Mutex<HashMap<String, String>>>,
    release_tx: watch::Sender<bool>,
}

impl MockJobBackend {
    pub async fn spawn(behavior: JobBehavior) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock job backend")?;
        let addr = format!("127.0.0.1:{}", listener.local_addr()?.port());
        let calls = Arc::new(AtomicU64::new(0));
        let last_headers = Arc::new(Mutex::new(HashMap::new()));
        let (release_tx, _) = watch::channel(false);
        let state = Arc::new(JobBackendState {
            behavior,
            calls: calls.clone(),
            last_headers: last_headers.clone(),
            release_tx: release_tx.clone(),
        });
        let app = Router::new()
            .route("/pub/job/{*rest}", any(job_backend_endpoint))
            .with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        Ok(Self {
            addr,
            calls,
            last_headers,
            release_tx,
        })
    }

    pub fn release(&self) {
        let _ = self.release_tx.send(true);
    }

    /// A detached release trigger, usable from spawned tasks.
    pub fn release_handle(&self) -> impl Fn() + Send + 'static {
        let release_tx = self.release_tx.clone();
        move || {
            let _ = release_tx.send(true);
        }
    }
}

async fn job_backend_endpoint(State(state): State<Arc<JobBackendState>>, req: Request) -> Response {
    {
        let mut captured = state.last_headers.lock().expect("lock headers");
        captured.clear();
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                captured.insert(name.as_str().to_string(), value.to_string());
            }
        }
    }
    let call_number = state.calls.fetch_add(1, Ordering::SeqCst) + 1;

    match state.behavior {
        JobBehavior::Respond => {}
        JobBehavior::HoldUntilRelease => {
            let mut release_rx = state.release_tx.subscribe();
            let _ = release_rx.wait_for(|released| *released).await;
        }
        JobBehavior::HoldFirstForever => {
            if call_number == 1 {
                std::future::pending::<()>().await;
            }
            let mut release_rx = state.release_tx.subscribe();
            let _ = release_rx.wait_for(|released| *released).await;
        }
        JobBehavior::RespondRedirect => {
            return (
                StatusCode::FOUND,
                [(axum::http::header::LOCATION, "http://internal-host/docs/?page=2")],
            )
                .into_response();
        }
    }

    Json(serde_json::json!({"result": 42})).into_response()
}

/// A backend whose first connection dies before any response is written;
/// subsequent calls answer over raw HTTP.
pub async fn spawn_crashing_backend() -> anyhow::Result<(String, Arc<AtomicU64>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind crashing backend")?;
    let addr = format!("127.0.0.1:{}", listener.local_addr()?.port());
    let calls = Arc::new(AtomicU64::new(0));
    let calls_counter = calls.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let call_number = calls_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call_number == 1 {
                drop(socket);
                continue;
            }
            tokio::spawn(async move {
                let mut buf = [0u8; 65536];
                let _ = socket.read(&mut buf).await;
                let body = br#"{"result": 42}"#;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    Ok((addr, calls))
}

pub struct Replica {
    pub server: PubServer,
    pub services: Arc<Services>,
    pub store: Arc<AsyncTaskStore>,
}

pub fn test_config(lifecycle_url: &str) -> anyhow::Result<Config> {
    let mut cfg = Config::from_env().context("load config")?;
    cfg.lifecycle_url = lifecycle_url.to_string();
    cfg.async_task_retry_interval = 0;
    Ok(cfg)
}

/// Run a full router replica on the given address, wired to shared task
/// storage and fixed replica addresses.
pub async fn spawn_replica(
    cfg: Config,
    storage: Arc<dyn TaskStorage>,
    my_addr: &str,
    other_addrs: Vec<String>,
    long_poll_timeout: Duration,
) -> anyhow::Result<Replica> {
    let discovery = ReplicaDiscovery::new_static(other_addrs, my_addr);
    let store = AsyncTaskStore::with_timeouts(
        discovery,
        storage,
        long_poll_timeout,
        TEST_CLEAN_UP_TIMEOUT,
    )?;
    let services = Services::init_with(cfg, store.clone())?;
    let bind: SocketAddr = my_addr.parse().context("parse replica address")?;
    let server = PubServer::start(services.clone(), bind).await?;
    Ok(Replica {
        server,
        services,
        store,
    })
}

/// Reserve addresses for replicas that are spawned later.
pub fn free_local_addrs(count: usize) -> anyhow::Result<Vec<String>> {
    let mut listeners = Vec::with_capacity(count);
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").context("reserve port")?;
        addrs.push(format!("127.0.0.1:{}", listener.local_addr()?.port()));
        listeners.push(listener);
    }
    drop(listeners);
    Ok(addrs)
}

/// Current value of a counter in the Prometheus exposition.
pub fn metric_value(name: &str) -> u64 {
    racetrack_pub::metrics::render()
        .lines()
        .find(|line| line.starts_with(&format!("{name} ")))
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("build test http client")
}

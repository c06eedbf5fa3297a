use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use futures_util::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::LifecycleCache;
use crate::config::Config;
use crate::lifecycle::{LifecycleClient, MasterLifecycleClient, LIFECYCLE_TIMEOUT};
use crate::metrics;
use crate::proxy;
use crate::remote::{self, RemoteLifecycleClient};
use crate::replicas::ReplicaDiscovery;
use crate::storage::LifecycleTaskStorage;
use crate::task_store::AsyncTaskStore;
use crate::tasks;
use crate::tunnel::RemoteTunnel;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything the handlers share, built once at startup and passed through
/// axum state. No globals beyond metric counters.
pub struct Services {
    pub config: Config,
    pub task_store: Arc<AsyncTaskStore>,
    pub lifecycle_cache: Arc<LifecycleCache>,
    pub tunnel: RemoteTunnel,
    pub lifecycle_http_client: reqwest::Client,
    /// Sync-proxy client: no overall timeout, redirects passed through to
    /// the caller untouched.
    pub proxy_http_client: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
}

impl Services {
    /// Production wiring: Lifecycle-backed task storage, DNS replica
    /// discovery.
    pub fn init(cfg: Config) -> anyhow::Result<Arc<Self>> {
        if !cfg.auth_required {
            tracing::warn!("authentication is not required");
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let replica_discovery = ReplicaDiscovery::new(
            &cfg.replica_discovery_hostname,
            cfg.listen_port,
            shutdown_rx.clone(),
        );
        let storage = Arc::new(LifecycleTaskStorage::new(
            &cfg.lifecycle_url,
            &cfg.lifecycle_token,
        )?);
        let task_store = AsyncTaskStore::new(replica_discovery, storage)?;
        Self::assemble(cfg, task_store, shutdown_tx, shutdown_rx)
    }

    /// Wiring with externally-built task store; used by tests to inject
    /// shared in-memory storage and static replica discovery.
    pub fn init_with(cfg: Config, task_store: Arc<AsyncTaskStore>) -> anyhow::Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self::assemble(cfg, task_store, shutdown_tx, shutdown_rx)
    }

    fn assemble(
        cfg: Config,
        task_store: Arc<AsyncTaskStore>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Self>> {
        let lifecycle_cache = LifecycleCache::new(
            Duration::from_secs(cfg.lifecycle_cache_ttl_min),
            Duration::from_secs(cfg.lifecycle_cache_ttl_max),
            shutdown_rx,
        );
        let lifecycle_http_client = reqwest::Client::builder()
            .timeout(LIFECYCLE_TIMEOUT)
            .build()
            .context("build lifecycle http client")?;
        let proxy_http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build proxy http client")?;

        Ok(Arc::new(Self {
            config: cfg,
            task_store,
            lifecycle_cache,
            tunnel: RemoteTunnel::new(),
            lifecycle_http_client,
            proxy_http_client,
            shutdown_tx,
        }))
    }

    pub fn master_lifecycle_client(
        &self,
        auth_token: &str,
        request_id: &str,
    ) -> MasterLifecycleClient {
        MasterLifecycleClient::new(
            self.lifecycle_http_client.clone(),
            &self.config.lifecycle_url,
            auth_token,
            &self.config.lifecycle_token,
            &self.config.request_tracing_header,
            request_id,
        )
    }

    /// Client used by internal operations: authenticates with the internal
    /// token, not a caller credential.
    pub fn internal_lifecycle_client(&self, request_id: &str) -> MasterLifecycleClient {
        self.master_lifecycle_client("", request_id)
    }

    /// The client that authorizes proxied calls: the local Lifecycle, or
    /// the main cluster's Lifecycle over the tunnel in remote gateway mode.
    pub fn proxy_lifecycle_client(
        &self,
        auth_token: &str,
        request_id: &str,
    ) -> Box<dyn LifecycleClient> {
        if self.config.remote_gateway_mode {
            Box::new(RemoteLifecycleClient::new(
                self.tunnel.master_connection.clone(),
                auth_token,
                request_id,
            ))
        } else {
            Box::new(self.master_lifecycle_client(auth_token, request_id))
        }
    }

    /// Release long-pollers and stop background loops. Running job calls
    /// are not interrupted.
    pub fn shutdown(&self) {
        self.task_store.cancel_ongoing_requests();
        let _ = self.shutdown_tx.send(true);
    }
}

pub struct PubServer {
    pub addr: SocketAddr,
    services: Arc<Services>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl PubServer {
    pub async fn start(services: Arc<Services>, bind: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind server to {bind}"))?;
        let addr = listener.local_addr().context("server local_addr")?;
        let app = build_router(services.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_server(listener, app, shutdown_rx));
        Ok(Self {
            addr,
            services,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.services.shutdown();
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(SHUTDOWN_GRACE, self.join).await {
            Ok(result) => result.context("join server task")??,
            Err(_) => tracing::warn!("server shutdown timeout"),
        }
        Ok(())
    }
}

async fn run_server(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("serve http")
}

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let listen_port = cfg.listen_port;
    let services = Services::init(cfg)?;
    let bind: SocketAddr = format!("0.0.0.0:{listen_port}")
        .parse()
        .context("parse listen address")?;
    let server = PubServer::start(services, bind).await?;
    tracing::info!(addr = %server.addr, "listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down server");
    server.shutdown().await
}

/// Endpoints are served at the raw path (internal access, eg "/metrics")
/// and under the service-name prefix (access through an ingress proxy).
pub fn build_router(services: Arc<Services>) -> Router {
    let mut router = Router::new().merge(endpoint_routes(services.clone()));
    let service_name = services.config.service_name.trim_matches('/').to_string();
    if !service_name.is_empty() {
        router = router.nest(&format!("/{service_name}"), endpoint_routes(services));
    }
    router.layer(middleware::from_fn(recover_panics))
}

fn endpoint_routes(services: Arc<Services>) -> Router {
    let mut router = Router::new()
        .route("/job/{job}/{version}", any(proxy::proxy_endpoint))
        .route("/job/{job}/{version}/{*path}", any(proxy::proxy_endpoint))
        .route(
            "/async/new/job/{job}/{version}",
            any(tasks::task_start_endpoint),
        )
        .route(
            "/async/new/job/{job}/{version}/{*path}",
            any(tasks::task_start_endpoint),
        )
        .route(
            "/async/task/{task_id}/status",
            get(tasks::task_status_endpoint),
        )
        .route(
            "/async/task/{task_id}/status/local",
            get(tasks::local_task_status_endpoint),
        )
        .route("/async/task/{task_id}/poll", get(tasks::task_poll_endpoint))
        .route(
            "/async/task/{task_id}/poll/local",
            get(tasks::local_task_poll_endpoint),
        )
        .route(
            "/remote/forward/{job}/{version}",
            any(remote::remote_forward_endpoint),
        )
        .route(
            "/remote/forward/{job}/{version}/{*path}",
            any(remote::remote_forward_endpoint),
        )
        .route("/remote/command", post(remote::remote_command_endpoint))
        .route("/live", get(live_endpoint))
        .route("/ready", get(ready_endpoint))
        .route("/health", get(health_endpoint))
        .route("/metrics", get(metrics_endpoint));
    if services.config.remote_gateway_mode {
        router = router.route("/remote/ws", get(remote::remote_ws_endpoint));
    }
    router.with_state(services)
}

async fn recover_panics(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    match std::panic::AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            metrics::inc_panic_errors();
            let detail = panic_message(&panic);
            tracing::error!(error = %detail, path = %path, "panic recovered in handler");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal server error" })),
            )
                .into_response()
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn live_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "live": true }))
}

async fn ready_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ready": true }))
}

async fn health_endpoint(State(services): State<Arc<Services>>) -> Json<serde_json::Value> {
    metrics::inc_health_requests();
    let cfg = &services.config;
    Json(serde_json::json!({
        "service": cfg.service_name,
        "version": cfg.git_version,
        "status": "pass",
        "auth_required": cfg.auth_required,
    }))
}

async fn metrics_endpoint() -> ([(axum::http::HeaderName, &'static str); 1], String) {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

//! Remote-gateway-mode endpoints and the master-side forwarding path.
//!
//! A remote gateway sits in a foreign cluster. It accepts exactly one
//! tunnel connection from the main instance, authorizes incoming Job calls
//! by asking the main cluster's Lifecycle back through that tunnel, and
//! exposes privileged forward/command hooks gated by the gateway token.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::Mutex;

use crate::errors::{ApiError, ApiResult};
use crate::lifecycle::{JobCallAuthData, JobDetails, LifecycleClient, LifecycleError};
use crate::proxy::{
    get_request_tracing_id, serve_reverse_proxy, AuthorizedCall, JobCallPath,
};
use crate::server::Services;
use crate::tunnel::{
    self, encode_authorize_request, decode_authorize_response, AuthorizeRequest,
    GATEWAY_TOKEN_HEADER, JOB_INTERNAL_NAME_HEADER,
};
use crate::urls::{join_url, target_url};

/// Main role: forward an authorized call to the remote cluster's gateway
/// instead of a local backend, keeping the tunnel alive for the remote's
/// authorization calls back.
pub async fn handle_master_proxy_request(
    services: &Arc<Services>,
    job_path: &str,
    authorized: &AuthorizedCall,
    request_id: &str,
    mut req: Request,
    start_time: Instant,
) -> ApiResult<Response> {
    let gateway_url = authorized
        .auth_data
        .remote_gateway_url
        .clone()
        .ok_or_else(|| ApiError::internal("remote gateway URL is absent", request_id))?;
    let parsed = reqwest::Url::parse(&gateway_url).map_err(|err| {
        ApiError::internal(format!("parsing remote gateway URL: {err}"), request_id)
    })?;
    let gateway_host = match (parsed.host_str(), parsed.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(ApiError::internal(
                "remote gateway URL has no host",
                request_id,
            ));
        }
    };

    let gateway_token = authorized.auth_data.remote_gateway_token.as_deref();
    if let Some(token) = gateway_token {
        if let Ok(value) = HeaderValue::from_str(token) {
            req.headers_mut().insert(GATEWAY_TOKEN_HEADER, value);
        }
    }

    tunnel::ensure_gateway_connection(services, &gateway_host, gateway_token).await;

    let job = &authorized.job;
    let target = join_url(&gateway_url, &["/pub/job/", &job.name, &job.version, job_path]);
    tracing::info!(
        infrastructure_target = %job.infrastructure_target,
        target_url = %target,
        job_internal_name = %job.internal_name,
        "forwarding call to remote infrastructure"
    );

    Ok(serve_reverse_proxy(
        services,
        &services.proxy_http_client,
        &target,
        req,
        job,
        request_id,
        &authorized.caller_name,
        start_time,
    )
    .await)
}

/// Remote role: accept the tunnel connection from the main instance. Only
/// one connection is kept; a newcomer replaces any previous one.
pub async fn remote_ws_endpoint(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cfg = &services.config;
    let request_id = get_request_tracing_id(&headers, &cfg.request_tracing_header);
    if let Err(err) = check_gateway_token(&services, &headers, &request_id) {
        return err.into_response();
    }

    let master_connection = services.tunnel.master_connection.clone();
    ws.on_upgrade(move |socket| async move {
        let mut guard = master_connection.lock().await;
        if guard.is_some() {
            tracing::info!("replacing previous main instance websocket connection");
        }
        *guard = Some(socket);
        tracing::debug!("main instance connected to remote websocket server");
    })
}

/// Lifecycle client of a remote gateway: authorization is delegated to the
/// main cluster over the tunnel, one request frame against one response
/// frame under the connection lock.
pub struct RemoteLifecycleClient {
    connection: Arc<Mutex<Option<WebSocket>>>,
    auth_token: String,
    request_id: String,
}

impl RemoteLifecycleClient {
    pub fn new(
        connection: Arc<Mutex<Option<WebSocket>>>,
        auth_token: &str,
        request_id: &str,
    ) -> Self {
        Self {
            connection,
            auth_token: auth_token.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

#[async_trait]
impl LifecycleClient for RemoteLifecycleClient {
    async fn authorize_caller(
        &self,
        job_name: &str,
        job_version: &str,
        endpoint: &str,
    ) -> Result<JobCallAuthData, LifecycleError> {
        let frame = encode_authorize_request(&AuthorizeRequest {
            job_name: job_name.to_string(),
            job_version: job_version.to_string(),
            endpoint: endpoint.to_string(),
            auth_token: self.auth_token.clone(),
            request_id: self.request_id.clone(),
        });

        let mut guard = self.connection.lock().await;
        let socket = guard.as_mut().ok_or_else(|| {
            LifecycleError::Other("main instance is not subscribed to remote websocket".to_string())
        })?;

        tracing::debug!("making Lifecycle call through main websocket connection");
        if let Err(err) = socket.send(Message::Binary(frame.into())).await {
            *guard = None;
            return Err(LifecycleError::Other(format!(
                "failed to send request through main websocket: {err}"
            )));
        }

        let response = loop {
            match socket.recv().await {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(Message::Close(_))) | None => {
                    *guard = None;
                    return Err(LifecycleError::Other(
                        "main websocket closed while awaiting response".to_string(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    *guard = None;
                    return Err(LifecycleError::Other(format!(
                        "failed to read response from main websocket: {err}"
                    )));
                }
            }
        };

        let response = decode_authorize_response(&response).map_err(|err| {
            LifecycleError::Other(format!("failed to decode authorize response: {err}"))
        })?;

        if response.error_code != 0 {
            let details = response.error_details;
            return Err(match response.error_code {
                401 => LifecycleError::Unauthenticated(details),
                404 => LifecycleError::NotFound(details),
                503 => LifecycleError::ServiceUnavailable(details),
                _ => LifecycleError::Other(details),
            });
        }
        response.auth_data.ok_or_else(|| {
            LifecycleError::Other("authorize response carries no auth data".to_string())
        })
    }
}

/// Remote role: proxy a call forwarded by the main instance straight to the
/// local backend named in the internal-name header.
pub async fn remote_forward_endpoint(
    State(services): State<Arc<Services>>,
    Path(params): Path<JobCallPath>,
    req: Request,
) -> Response {
    let start_time = Instant::now();
    let cfg = &services.config;
    let request_id = get_request_tracing_id(req.headers(), &cfg.request_tracing_header);
    let job_path = params.job_path();

    tracing::info!(
        method = %req.method(),
        path = %req.uri().path(),
        request_id = %request_id,
        "incoming forwarding request from main instance"
    );
    match handle_remote_forward(&services, &params, &job_path, &request_id, req, start_time).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_remote_forward(
    services: &Arc<Services>,
    params: &JobCallPath,
    job_path: &str,
    request_id: &str,
    req: Request,
    start_time: Instant,
) -> ApiResult<Response> {
    let cfg = &services.config;
    if !cfg.remote_gateway_mode {
        return Err(ApiError::unauthorized(
            "forwarding endpoint is only available in remote gateway mode",
            request_id,
        ));
    }
    if req.method() != Method::GET && req.method() != Method::POST {
        return Err(ApiError::method_not_allowed("method not allowed", request_id));
    }
    check_gateway_token(services, req.headers(), request_id)?;

    let job_internal_name = req
        .headers()
        .get(JOB_INTERNAL_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError::bad_request(
                format!("gateway expects job name in {JOB_INTERNAL_NAME_HEADER} header"),
                request_id,
            )
        })?;

    let job = JobDetails {
        name: params.job.clone(),
        version: params.version.clone(),
        status: String::new(),
        internal_name: job_internal_name.to_string(),
        infrastructure_target: String::new(),
    };
    let caller_name = req
        .headers()
        .get(cfg.caller_name_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let url_path = join_url("/pub/job/", &[&job.name, &job.version, job_path]);
    let target = target_url(cfg, &job, &url_path);
    tracing::debug!(
        job_name = %job.name,
        job_version = %job.version,
        job_internal_name = %job.internal_name,
        target_url = %target,
        "forwarding request to job"
    );

    Ok(serve_reverse_proxy(
        services,
        &services.proxy_http_client,
        &target,
        req,
        &job,
        request_id,
        &caller_name,
        start_time,
    )
    .await)
}

#[derive(Debug, serde::Deserialize)]
struct RemoteCommandRequest {
    #[serde(default)]
    command: String,
}

/// Remote role: run an operator-issued shell command in this cluster's
/// environment. Privileged hook, gated by the gateway token.
pub async fn remote_command_endpoint(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let cfg = &services.config;
    let request_id = get_request_tracing_id(&headers, &cfg.request_tracing_header);
    tracing::info!(request_id = %request_id, "incoming remote command");

    match handle_remote_command(&services, &headers, &body, &request_id).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_remote_command(
    services: &Arc<Services>,
    headers: &HeaderMap,
    body: &[u8],
    request_id: &str,
) -> ApiResult<Response> {
    check_gateway_token(services, headers, request_id)?;

    let request: RemoteCommandRequest = serde_json::from_slice(body).map_err(|err| {
        ApiError::bad_request(format!("failed to parse request data as JSON: {err}"), request_id)
    })?;
    if request.command.is_empty() {
        return Err(ApiError::bad_request("command field is empty", request_id));
    }

    tracing::debug!(command = %request.command, "executing remote command");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&request.command)
        .output()
        .await
        .map_err(|err| {
            ApiError::internal(
                format!("command failed: {}: {err}", request.command),
                request_id,
            )
        })?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let combined = String::from_utf8_lossy(&combined).into_owned();

    if !output.status.success() {
        return Err(ApiError::internal(
            format!("command failed: {}: {combined}", request.command),
            request_id,
        ));
    }

    Ok(Json(serde_json::json!({
        "output": combined,
        "exit_code": output.status.code().unwrap_or_default(),
        "requestId": request_id,
    }))
    .into_response())
}

fn check_gateway_token(
    services: &Arc<Services>,
    headers: &HeaderMap,
    request_id: &str,
) -> ApiResult<()> {
    let cfg = &services.config;
    let token = headers
        .get(GATEWAY_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if token.is_empty() {
        return Err(ApiError::unauthorized(
            format!("gateway expects token in {GATEWAY_TOKEN_HEADER} header"),
            request_id,
        ));
    }
    if token != cfg.remote_gateway_token {
        return Err(ApiError::unauthorized("gateway token is invalid", request_id));
    }
    Ok(())
}

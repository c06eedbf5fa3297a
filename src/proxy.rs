use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ApiError, ApiResult};
use crate::lifecycle::{JobCallAuthData, JobDetails, LifecycleClient as _, LifecycleError};
use crate::metrics;
use crate::remote;
use crate::server::Services;
use crate::urls::{join_url, strip_host, target_url};

/// Route parameters of a Job call: name, version and the path within the
/// Job, which is absent when the Job root is called.
#[derive(Debug, Deserialize)]
pub struct JobCallPath {
    pub job: String,
    pub version: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl JobCallPath {
    pub fn job_path(&self) -> String {
        match &self.path {
            Some(path) => format!("/{}", path.trim_start_matches('/')),
            None => String::new(),
        }
    }
}

/// Read the request's tracing id, minting a fresh one when absent.
pub fn get_request_tracing_id(headers: &HeaderMap, header_name: &str) -> String {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub async fn proxy_endpoint(
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
        "incoming proxy request"
    );
    match handle_proxy_request(&services, &params, &job_path, &request_id, req, start_time).await {
        Ok(response) => response,
        Err(err) => {
            metrics::inc_job_proxy_request_errors();
            err.into_response()
        }
    }
}

async fn handle_proxy_request(
    services: &Arc<Services>,
    params: &JobCallPath,
    job_path: &str,
    request_id: &str,
    req: Request,
    start_time: Instant,
) -> ApiResult<Response> {
    let cfg = &services.config;

    if req.method() != Method::GET && req.method() != Method::POST {
        return Err(ApiError::method_not_allowed("method not allowed", request_id));
    }
    if req.headers().get(header::ACCEPT).is_none() {
        return Err(ApiError::bad_request(
            "Missing 'Accept' header. You may want to include 'Accept: application/json, */*' request header.",
            request_id,
        ));
    }

    let authorized = get_authorized_job_details(
        services,
        req.headers(),
        &params.job,
        &params.version,
        job_path,
        request_id,
    )
    .await?;
    metrics::inc_job_proxy_requests();

    if !cfg.remote_gateway_mode && authorized.auth_data.remote_gateway_url.is_some() {
        return remote::handle_master_proxy_request(
            services, job_path, &authorized, request_id, req, start_time,
        )
        .await;
    }

    let url_path = join_url("/pub/job/", &[&authorized.job.name, &authorized.job.version, job_path]);
    let target = target_url(cfg, &authorized.job, &url_path);

    Ok(serve_reverse_proxy(
        services,
        &services.proxy_http_client,
        &target,
        req,
        &authorized.job,
        request_id,
        &authorized.caller_name,
        start_time,
    )
    .await)
}

pub struct AuthorizedCall {
    pub job: JobDetails,
    pub auth_data: JobCallAuthData,
    pub caller_name: String,
}

/// Authorize a Job call against Lifecycle, going through the response
/// cache: fresh hits short-circuit, and stale entries are served when
/// Lifecycle itself is down.
pub async fn get_authorized_job_details(
    services: &Services,
    headers: &HeaderMap,
    job_name: &str,
    job_version: &str,
    job_path: &str,
    request_id: &str,
) -> ApiResult<AuthorizedCall> {
    let cfg = &services.config;
    let auth_token = crate::auth::get_auth_token(headers);
    let cache = &services.lifecycle_cache;

    if let Some(auth_data) = cache
        .retrieve(job_name, job_version, job_path, &auth_token)
        .await
    {
        metrics::inc_lifecycle_cache_hits();
        return authorized_call(auth_data, request_id);
    }

    let client = services.proxy_lifecycle_client(&auth_token, request_id);
    match client
        .authorize_caller(job_name, job_version, job_path)
        .await
    {
        Ok(auth_data) => {
            metrics::inc_auth_successful();
            cache
                .put(job_name, job_version, job_path, &auth_token, auth_data.clone())
                .await;
            authorized_call(auth_data, request_id)
        }
        Err(LifecycleError::ServiceUnavailable(message)) => {
            if let Some(auth_data) = cache
                .recover_failed(job_name, job_version, job_path, &auth_token)
                .await
            {
                metrics::inc_lifecycle_cache_stale_hits();
                tracing::warn!(
                    request_id = %request_id,
                    "Lifecycle unavailable, serving cached authorization"
                );
                return authorized_call(auth_data, request_id);
            }
            Err(ApiError::service_unavailable(message, request_id))
        }
        Err(LifecycleError::Unauthenticated(message)) => {
            metrics::inc_auth_failed();
            if cfg.auth_debug {
                Err(ApiError::unauthorized(
                    format!("Unauthenticated: {message}"),
                    request_id,
                ))
            } else {
                // Constant message: details would make an auth oracle.
                Err(ApiError::unauthorized("Unauthenticated", request_id))
            }
        }
        Err(LifecycleError::NotFound(message)) => {
            metrics::inc_auth_failed();
            Err(ApiError::not_found(
                format!("Job was not found: {message}"),
                request_id,
            ))
        }
        Err(LifecycleError::Other(message)) => {
            metrics::inc_auth_failed();
            Err(ApiError::internal(
                format!("getting job details: {message}"),
                request_id,
            ))
        }
    }
}

fn authorized_call(auth_data: JobCallAuthData, request_id: &str) -> ApiResult<AuthorizedCall> {
    let job = auth_data
        .job
        .clone()
        .ok_or_else(|| ApiError::internal("authorization response carries no job", request_id))?;
    let caller_name = auth_data.caller.clone().unwrap_or_default();
    Ok(AuthorizedCall {
        job,
        auth_data,
        caller_name,
    })
}

/// Forward one request to the target and stream the response back, with the
/// per-request header rewrites of a proxied Job call.
#[allow(clippy::too_many_arguments)]
pub async fn serve_reverse_proxy(
    services: &Services,
    client: &reqwest::Client,
    target: &str,
    req: Request,
    job: &JobDetails,
    request_id: &str,
    caller_name: &str,
    start_time: Instant,
) -> Response {
    let cfg = &services.config;
    let (parts, body) = req.into_parts();

    let mut headers = proxied_request_headers(&parts.headers);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        if let Ok(name) = header::HeaderName::from_bytes(cfg.request_tracing_header.as_bytes()) {
            headers.insert(name, value);
        }
    }
    if !caller_name.is_empty() {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(cfg.caller_name_header.as_bytes()),
            HeaderValue::from_str(caller_name),
        ) {
            headers.insert(name, value);
        }
    }

    let result = client
        .request(parts.method.clone(), target)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let upstream = match result {
        Ok(upstream) => upstream,
        Err(err) => {
            return proxy_error_response(&err, job, request_id, caller_name, target, start_time)
                .into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    response_headers.remove(header::CONNECTION);
    response_headers.remove(header::TRANSFER_ENCODING);

    // The target doesn't know it's proxied, so absolute redirects would leak
    // its internal hostname.
    if let Some(location) = response_headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(strip_host)
    {
        if let Ok(value) = HeaderValue::from_str(&location) {
            response_headers.insert(header::LOCATION, value);
        }
    }
    if let (Ok(name), Ok(value)) = (
        header::HeaderName::from_bytes(cfg.request_tracing_header.as_bytes()),
        HeaderValue::from_str(request_id),
    ) {
        response_headers.insert(name, value);
    }

    tracing::info!(
        job_name = %job.name,
        job_version = %job.version,
        caller = %caller_name,
        status = status.as_u16(),
        duration = ?start_time.elapsed(),
        request_id = %request_id,
        "proxy request done"
    );

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    *response.headers_mut() = response_headers;
    response
}

/// Request headers forwarded to the backend. The original host moves to
/// X-Forwarded-Host; hop-by-hop headers stay behind.
fn proxied_request_headers(original: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in original {
        if name == header::HOST
            || name == header::CONNECTION
            || name == header::TRANSFER_ENCODING
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Some(host) = original.get(header::HOST) {
        headers.insert("X-Forwarded-Host", host.clone());
    }
    headers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    ConnectionBroken,
    ConnectionRefused,
    Canceled,
    DeadlineExceeded,
    Other,
}

/// Translate an upstream transport error into its outward explanation,
/// mirroring the causes a dying or redeploying Job produces.
pub fn classify_proxy_error(err: &reqwest::Error) -> (ProxyErrorKind, String) {
    if err.is_timeout() {
        return (
            ProxyErrorKind::DeadlineExceeded,
            format!("request to a job timed out: {err}"),
        );
    }
    match find_io_error_kind(err) {
        Some(std::io::ErrorKind::ConnectionRefused) => (
            ProxyErrorKind::ConnectionRefused,
            format!("connection refused to a target job (job may be dead): {err}"),
        ),
        Some(
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset,
        ) => (
            ProxyErrorKind::ConnectionBroken,
            format!("connection broken to a target job (job may have died): {err}"),
        ),
        Some(std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::Interrupted) => (
            ProxyErrorKind::Canceled,
            format!("client (or proxy timeout) canceled the request: {err}"),
        ),
        _ if err.is_connect() => (
            ProxyErrorKind::ConnectionRefused,
            format!("connection refused to a target job (job may be dead): {err}"),
        ),
        _ => (ProxyErrorKind::Other, format!("making request to a job: {err}")),
    }
}

/// Walk the error source chain down to the underlying I/O error, if any.
pub fn find_io_error_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<std::io::Error>() {
            return Some(io_err.kind());
        }
        source = current.source();
    }
    None
}

fn proxy_error_response(
    err: &reqwest::Error,
    job: &JobDetails,
    request_id: &str,
    caller_name: &str,
    target: &str,
    start_time: Instant,
) -> ApiError {
    metrics::inc_job_proxy_errors();
    let (kind, message) = classify_proxy_error(err);
    match kind {
        ProxyErrorKind::ConnectionBroken => metrics::inc_job_proxy_connection_broken(),
        ProxyErrorKind::ConnectionRefused => metrics::inc_job_proxy_connection_refused(),
        ProxyErrorKind::Canceled => metrics::inc_job_proxy_context_canceled(),
        ProxyErrorKind::DeadlineExceeded => metrics::inc_job_proxy_context_deadline(),
        ProxyErrorKind::Other => {}
    }
    tracing::error!(
        job_name = %job.name,
        job_version = %job.version,
        job_status = %job.status,
        caller = %caller_name,
        target = %target,
        error = %message,
        duration = ?start_time.elapsed(),
        request_id = %request_id,
        "reverse proxy error"
    );
    ApiError::bad_gateway(format!("Reverse proxy error: {message}"), request_id)
        .with_context("jobName", job.name.as_str())
        .with_context("jobVersion", job.version.as_str())
        .with_context("jobStatus", job.status.as_str())
        .with_context("caller", caller_name)
}

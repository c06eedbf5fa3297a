use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::{ApiError, ApiResult};
use crate::lifecycle::JobDetails;
use crate::metrics;
use crate::proxy::{get_authorized_job_details, get_request_tracing_id, JobCallPath};
use crate::server::Services;
use crate::storage::TaskStorageError;
use crate::task::{AsyncTask, TaskStatus};
use crate::urls::{join_url, strip_host, target_url};

// Grace window before deleting a served task, in case the client retries
// after a response lost mid-transfer.
const TASK_DELETION_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct TaskIdPath {
    pub task_id: String,
}

/// Start a new async Job call in the background and return its task id.
pub async fn task_start_endpoint(
    State(services): State<Arc<Services>>,
    Path(params): Path<JobCallPath>,
    req: Request,
) -> Response {
    let cfg = &services.config;
    let request_id = get_request_tracing_id(req.headers(), &cfg.request_tracing_header);
    let job_path = params.job_path();

    tracing::info!(
        method = %req.method(),
        path = %req.uri().path(),
        request_id = %request_id,
        "request: new async job call"
    );
    match handle_task_start(&services, &params, &job_path, &request_id, req).await {
        Ok(response) => response,
        Err(err) => {
            metrics::inc_async_job_calls_errors();
            err.into_response()
        }
    }
}

async fn handle_task_start(
    services: &Arc<Services>,
    params: &JobCallPath,
    job_path: &str,
    request_id: &str,
    req: Request,
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
    let job = authorized.job;
    metrics::inc_async_job_calls_started();

    let url_path = join_url("/pub/job/", &[&job.name, &job.version, job_path]);
    let target = target_url(cfg, &job, &url_path);

    let mut request_headers = capture_headers(req.headers());
    request_headers.insert(cfg.request_tracing_header.clone(), request_id.to_string());
    request_headers.insert(cfg.caller_name_header.clone(), authorized.caller_name.clone());

    let (parts, body) = req.into_parts();
    let request_body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| {
            ApiError::bad_request(format!("failed to read request body: {err}"), request_id)
        })?;

    let task = AsyncTask {
        id: Uuid::new_v4().to_string(),
        status: TaskStatus::Ongoing,
        started_at: Utc::now(),
        ended_at: None,
        error_message: None,
        retriable_error: false,
        job_name: job.name.clone(),
        job_version: job.version.clone(),
        job_path: job_path.to_string(),
        request_method: parts.method.to_string(),
        request_url: parts.uri.to_string(),
        request_headers,
        request_body: request_body.to_vec(),
        response_status_code: None,
        response_headers: HashMap::new(),
        response_body: Vec::new(),
        attempts: 1,
        pub_instance_addr: services.task_store.replica_discovery.my_addr(),
    };

    let task = services.task_store.create_task(task).await.map_err(|err| {
        ApiError::internal(format!("failed to create async task: {err}"), request_id)
    })?;

    tracing::info!(
        task_id = %task.id,
        job_name = %job.name,
        job_version = %job.version,
        job_path = %job_path,
        caller = %authorized.caller_name,
        request_id = %request_id,
        "async job call task created"
    );

    let response = (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "task_id": task.id,
            "status": task.status,
        })),
    )
        .into_response();

    spawn_background_job_call(services.clone(), job, task, target, request_id.to_string());
    Ok(response)
}

/// Headers captured into the task record; multi-values are comma-joined.
fn capture_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut captured: HashMap<String, String> = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        captured.insert(name.as_str().to_string(), joined);
    }
    captured
}

pub fn spawn_background_job_call(
    services: Arc<Services>,
    job: JobDetails,
    task: AsyncTask,
    target: String,
    request_id: String,
) {
    tokio::spawn(handle_background_job_call(
        services, job, task, target, request_id,
    ));
}

/// Execute the captured request against the Job and publish the outcome.
/// Works on an owned snapshot of the task; the registry only sees whole
/// updates.
async fn handle_background_job_call(
    services: Arc<Services>,
    job: JobDetails,
    mut task: AsyncTask,
    target: String,
    request_id: String,
) {
    let call_result = make_job_call(&services, &mut task, &target, &request_id).await;

    task.ended_at = Some(Utc::now());
    match call_result {
        Ok(()) => {
            task.status = TaskStatus::Completed;
            task.error_message = None;
            task.retriable_error = false;
            metrics::inc_async_job_calls_done();
            tracing::info!(
                task_id = %task.id,
                job_name = %job.name,
                job_version = %job.version,
                status_code = ?task.response_status_code,
                duration = ?task.duration(),
                "async job call task has ended successfully"
            );
        }
        Err(failure) => {
            task.status = TaskStatus::Failed;
            task.error_message = Some(failure.message.clone());
            task.retriable_error = failure.retriable;
            metrics::inc_async_job_calls_errors();
            tracing::error!(
                task_id = %task.id,
                job_name = %job.name,
                job_version = %job.version,
                target = %target,
                error = %failure.message,
                "async job call request error"
            );
        }
    }

    if task.can_be_retried(&services.config) {
        tracing::info!(task_id = %task.id, "async job call crashed, retrying");
        tokio::time::sleep(Duration::from_secs(services.config.async_task_retry_interval)).await;
        metrics::inc_async_retried_crashed_task();
        // Pollers stay suspended across the retry: done is not signaled.
        if let Err(err) = retry_job_call(services.clone(), task, request_id).await {
            tracing::error!(error = %err, "failed to retry async task call");
        }
        return;
    }

    if let Err(err) = services.task_store.update_task(&task).await {
        tracing::error!(task_id = %task.id, error = %err, "failed to update async task");
    }
    services.task_store.signal_task_done(&task.id).await;
}

struct JobCallFailure {
    message: String,
    retriable: bool,
}

/// Make the HTTP call to the target Job and record the response snapshot
/// into the task. Returns whether a failure may be retried.
async fn make_job_call(
    services: &Services,
    task: &mut AsyncTask,
    target: &str,
    request_id: &str,
) -> Result<(), JobCallFailure> {
    let cfg = &services.config;
    let method: Method = task.request_method.parse().map_err(|_| JobCallFailure {
        message: format!("invalid request method: {}", task.request_method),
        retriable: false,
    })?;

    let mut headers = HeaderMap::new();
    for (name, value) in &task.request_headers {
        let lowered = name.to_lowercase();
        if lowered == "host"
            || lowered == "content-length"
            || lowered == "connection"
            || lowered == "transfer-encoding"
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    if let Some(host) = task.request_headers.get("host") {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("X-Forwarded-Host", value);
        }
    }

    let response = services
        .task_store
        .job_http_client
        .request(method, target)
        .headers(headers)
        .body(task.request_body.clone())
        .send()
        .await
        .map_err(|err| {
            // A dying or redeploying Job surfaces as a transport error;
            // those are worth a second attempt.
            let (_, message) = crate::proxy::classify_proxy_error(&err);
            JobCallFailure {
                message,
                retriable: true,
            }
        })?;

    task.response_status_code = Some(response.status().as_u16());

    let mut response_headers = response.headers().clone();
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
        HeaderName::from_bytes(cfg.request_tracing_header.as_bytes()),
        HeaderValue::from_str(request_id),
    ) {
        response_headers.insert(name, value);
    }

    let status = response.status();
    let body = response.bytes().await.map_err(|err| JobCallFailure {
        message: format!("failed to read response body: {err}"),
        retriable: false,
    })?;

    task.response_body = body.to_vec();
    task.response_headers.clear();
    for name in response_headers.keys() {
        let joined = response_headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(",");
        task.response_headers.insert(name.as_str().to_string(), joined);
    }

    if status == StatusCode::NOT_FOUND {
        return Err(JobCallFailure {
            message: format!(
                "job returned 404 Not Found response: {}",
                String::from_utf8_lossy(&task.response_body)
            ),
            retriable: true,
        });
    }

    Ok(())
}

/// Re-run a task's job call: bump the attempt, claim ownership, refresh the
/// Job's details (the target might have moved) and relaunch the worker.
async fn retry_job_call(
    services: Arc<Services>,
    mut task: AsyncTask,
    request_id: String,
) -> anyhow::Result<()> {
    let cfg = &services.config;
    task.attempts += 1;
    task.pub_instance_addr = services.task_store.replica_discovery.my_addr();
    task.status = TaskStatus::Ongoing;
    task.ended_at = None;
    task.response_status_code = None;
    task.response_headers.clear();
    task.response_body.clear();
    metrics::inc_async_retried_task();

    tracing::info!(
        task_id = %task.id,
        job_name = %task.job_name,
        job_version = %task.job_version,
        job_path = %task.job_path,
        attempts = task.attempts,
        replica_addr = %task.pub_instance_addr,
        error_message = %task.error_message.clone().unwrap_or_default(),
        "retrying async job call"
    );

    let client = services.internal_lifecycle_client(&request_id);
    let job = match client.get_job_details(&task.job_name, &task.job_version).await {
        Ok(job) => job,
        Err(err) => {
            task.status = TaskStatus::Failed;
            task.ended_at = Some(Utc::now());
            task.error_message = Some(err.to_string());
            if let Err(update_err) = services.task_store.update_task(&task).await {
                tracing::error!(error = %update_err, "failed to update async task");
            }
            services.task_store.signal_task_done(&task.id).await;
            anyhow::bail!("failed to get job details: {err}");
        }
    };

    services
        .task_store
        .update_task(&task)
        .await
        .map_err(|err| anyhow::anyhow!("failed to update async task: {err}"))?;

    let url_path = join_url("/pub/job/", &[&task.job_name, &task.job_version, &task.job_path]);
    let target = target_url(cfg, &job, &url_path);
    spawn_background_job_call(services.clone(), job, task, target, request_id);
    Ok(())
}

/// A task that claims to be running but has no live registry entry anywhere
/// is adopted by this replica and retried.
async fn retry_task_if_missing(
    services: &Arc<Services>,
    task: &mut AsyncTask,
    request_id: &str,
) -> ApiResult<bool> {
    if task.status != TaskStatus::Ongoing {
        // A finished task doesn't need to be resumed.
        return Ok(false);
    }
    if !is_task_missing(services, task).await {
        return Ok(false);
    }
    tracing::info!(
        task_id = %task.id,
        pub_instance = %task.pub_instance_addr,
        "task is gone in its supposed replica, retrying missing task"
    );
    metrics::inc_async_retried_missing_task();
    retry_job_call(services.clone(), task.clone(), request_id.to_string())
        .await
        .map_err(|err| {
            ApiError::internal(format!("failed to retry a missing async task: {err}"), request_id)
                .with_context("pubInstance", task.pub_instance_addr.as_str())
        })?;
    Ok(true)
}

async fn is_task_missing(services: &Arc<Services>, task: &mut AsyncTask) -> bool {
    let my_addr = services.task_store.replica_discovery.my_addr();
    if !task.pub_instance_addr.is_empty() && task.pub_instance_addr == my_addr {
        // We're supposed to own it and it's gone from our map: the process
        // has restarted since the task started.
        return true;
    }
    if task.pub_instance_addr.is_empty() {
        // The task predates replica discovery.
        task.pub_instance_addr = format!("127.0.0.1:{}", services.config.listen_port);
    }
    match check_task_status_in_replica(services, &task.pub_instance_addr, &task.id).await {
        Err(_) => true,
        Ok(None) => true,
        Ok(Some(status)) => {
            task.status = status;
            false
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskStatusDto {
    status: TaskStatus,
}

async fn check_task_status_in_replica(
    services: &Arc<Services>,
    replica_addr: &str,
    task_id: &str,
) -> anyhow::Result<Option<TaskStatus>> {
    let url = format!(
        "http://{}/{}/async/task/{}/status/local",
        replica_addr, services.config.service_name, task_id
    );
    let response = services
        .task_store
        .replica_status_http_client
        .get(&url)
        .send()
        .await
        .map_err(|err| anyhow::anyhow!("failed to make status request to replica: {err}"))?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if response.status() == StatusCode::OK {
        let dto: TaskStatusDto = response
            .json()
            .await
            .map_err(|err| anyhow::anyhow!("failed to parse response body as JSON: {err}"))?;
        return Ok(Some(dto.status));
    }
    anyhow::bail!(
        "response error when checking task on other replica: {}",
        response.status()
    )
}

/// Status of a task in this replica only. Internal, replica-to-replica.
pub async fn local_task_status_endpoint(
    State(services): State<Arc<Services>>,
    Path(params): Path<TaskIdPath>,
    headers: HeaderMap,
) -> Response {
    let request_id = get_request_tracing_id(&headers, &services.config.request_tracing_header);
    tracing::info!(task_id = %params.task_id, request_id = %request_id, "request: local async task status");

    match services.task_store.get_local_task(&params.task_id).await {
        Some(task) => Json(serde_json::json!({
            "task_id": task.id,
            "status": task.status,
        }))
        .into_response(),
        None => ApiError::not_found(
            format!("Task with id {} not found", params.task_id),
            &request_id,
        )
        .into_response(),
    }
}

/// Status of a task wherever it lives. Unknown tasks are looked up in
/// persistent storage and adopted if their replica lost them; this endpoint
/// never forwards.
pub async fn task_status_endpoint(
    State(services): State<Arc<Services>>,
    Path(params): Path<TaskIdPath>,
    headers: HeaderMap,
) -> Response {
    let request_id = get_request_tracing_id(&headers, &services.config.request_tracing_header);
    tracing::info!(task_id = %params.task_id, request_id = %request_id, "request: async task status");

    if let Some(task) = services.task_store.get_local_task(&params.task_id).await {
        return Json(serde_json::json!({
            "task_id": task.id,
            "status": task.status,
        }))
        .into_response();
    }

    let mut task = match services.task_store.get_stored_task(&params.task_id).await {
        Ok(task) => task,
        Err(TaskStorageError::NotFound) => {
            return ApiError::not_found("Task not found in Lifecycle", &request_id).into_response();
        }
        Err(err) => {
            return ApiError::internal(
                format!("failed to check async task in task storage: {err}"),
                &request_id,
            )
            .into_response();
        }
    };

    if let Err(err) = retry_task_if_missing(&services, &mut task, &request_id).await {
        return err.into_response();
    }

    Json(serde_json::json!({
        "task_id": task.id,
        "status": task.status,
    }))
    .into_response()
}

/// Long-poll a task wherever it lives: serve locally, adopt it if lost, or
/// forward the poll to the replica that runs it.
pub async fn task_poll_endpoint(
    State(services): State<Arc<Services>>,
    Path(params): Path<TaskIdPath>,
    headers: HeaderMap,
) -> Response {
    let request_id = get_request_tracing_id(&headers, &services.config.request_tracing_header);
    tracing::info!(task_id = %params.task_id, request_id = %request_id, "request: poll async task");

    if services
        .task_store
        .get_local_task(&params.task_id)
        .await
        .is_some()
    {
        return local_task_poll(&services, &params.task_id, &request_id).await;
    }

    let mut task = match services.task_store.get_stored_task(&params.task_id).await {
        Ok(task) => task,
        Err(TaskStorageError::NotFound) => {
            return ApiError::not_found("Task not found in Lifecycle", &request_id).into_response();
        }
        Err(err) => {
            return ApiError::internal(
                format!("failed to look up the async task in Lifecycle: {err}"),
                &request_id,
            )
            .into_response();
        }
    };

    if task.status != TaskStatus::Ongoing {
        return respond_task_result(&services, &task);
    }

    match retry_task_if_missing(&services, &mut task, &request_id).await {
        Ok(true) => return local_task_poll(&services, &params.task_id, &request_id).await,
        Ok(false) => {}
        Err(err) => return err.into_response(),
    }

    forward_task_poll_to_replica(&services, &task.pub_instance_addr, &params.task_id, &request_id)
        .await
}

/// Long-poll a task in this replica only. Internal, replica-to-replica.
pub async fn local_task_poll_endpoint(
    State(services): State<Arc<Services>>,
    Path(params): Path<TaskIdPath>,
    headers: HeaderMap,
) -> Response {
    let request_id = get_request_tracing_id(&headers, &services.config.request_tracing_header);
    tracing::info!(task_id = %params.task_id, request_id = %request_id, "request: polling local async task");
    local_task_poll(&services, &params.task_id, &request_id).await
}

async fn local_task_poll(services: &Arc<Services>, task_id: &str, request_id: &str) -> Response {
    let store = &services.task_store;
    let Some((task, mut done_rx)) = store.subscribe_local_task(task_id).await else {
        return ApiError::not_found("Task not found locally", request_id).into_response();
    };
    if task.status != TaskStatus::Ongoing {
        return respond_task_result(services, &task);
    }

    let mut quit_rx = store.quit_receiver();
    tokio::select! {
        // Resolves immediately when the task finished between the snapshot
        // and this await; an Err means the entry was dropped, so re-read.
        result = done_rx.wait_for(|done| *done) => {
            let _ = result;
        }
        _ = quit_rx.wait_for(|quit| *quit) => {
            return (
                StatusCode::REQUEST_TIMEOUT,
                "Request time-out due to termination signal",
            )
                .into_response();
        }
        _ = tokio::time::sleep(store.long_poll_timeout) => {}
    }

    match store.get_local_task(task_id).await {
        None => {
            tracing::warn!(task_id = %task_id, "task not found locally after time-out");
            (StatusCode::REQUEST_TIMEOUT, "Time-out").into_response()
        }
        Some(task) if task.status == TaskStatus::Ongoing => {
            (StatusCode::REQUEST_TIMEOUT, "Time-out").into_response()
        }
        Some(task) => respond_task_result(services, &task),
    }
}

async fn forward_task_poll_to_replica(
    services: &Arc<Services>,
    replica_addr: &str,
    task_id: &str,
    request_id: &str,
) -> Response {
    tracing::info!(
        replica_addr = %replica_addr,
        task_id = %task_id,
        "forwarding async task poll to other replica"
    );
    let url = format!(
        "http://{}/{}/async/task/{}/poll/local",
        replica_addr, services.config.service_name, task_id
    );
    let response = match services
        .task_store
        .replica_poll_http_client
        .get(&url)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            return ApiError::service_unavailable(
                format!("failed to forward task poll request to replica: {err}"),
                request_id,
            )
            .with_context("url", url)
            .into_response();
        }
    };

    let status = response.status();
    let headers = response.headers().clone();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            return ApiError::service_unavailable(
                format!("failed to read response body: {err}"),
                request_id,
            )
            .into_response();
        }
    };

    let mut forwarded = Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::SERVICE_UNAVAILABLE.into_response());
    *forwarded.headers_mut() = headers;
    forwarded
}

/// Serve a task's outcome: replay the stored response for a completed task,
/// report the failure or progress otherwise. Final results schedule the
/// task's deletion after a grace window.
fn respond_task_result(services: &Arc<Services>, task: &AsyncTask) -> Response {
    let response = match task.status {
        TaskStatus::Completed => {
            let status = task
                .response_status_code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            let mut response = Response::builder()
                .status(status)
                .body(Body::from(task.response_body.clone()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            let headers = response.headers_mut();
            for (name, value) in &task.response_headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
            headers.remove(header::TRANSFER_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
            response
        }
        TaskStatus::Ongoing | TaskStatus::Failed => {
            let status = if task.status == TaskStatus::Failed {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::ACCEPTED
            };
            (
                status,
                Json(serde_json::json!({
                    "task_id": task.id,
                    "status": task.status,
                    "job_name": task.job_name,
                    "job_version": task.job_version,
                    "job_path": task.job_path,
                    "http_method": task.request_method,
                    "started_at": task.started_at.to_rfc3339(),
                    "ended_at": task.ended_at.map(|t| t.to_rfc3339()),
                    "duration": task.duration(),
                    "error": task.error_message,
                    "attempts": task.attempts,
                })),
            )
                .into_response()
        }
    };

    if task.status != TaskStatus::Ongoing {
        let services = services.clone();
        let task_id = task.id.clone();
        let status = task.status;
        tokio::spawn(async move {
            tokio::time::sleep(TASK_DELETION_GRACE).await;
            match services.task_store.delete_task(&task_id).await {
                Ok(()) => {
                    tracing::info!(task_id = %task_id, status = %status, "retrieved task has been deleted");
                }
                Err(err) => {
                    tracing::error!(task_id = %task_id, error = %err, "failed to delete async task");
                }
            }
        });
    }

    response
}

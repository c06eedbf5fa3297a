use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AUTH_HEADER;
use crate::metrics;
use crate::urls::join_url;

pub const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Authorization verdict for one Job call. A populated `remote_gateway_url`
/// means the Job lives on a remote cluster and must be reached through the
/// gateway tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCallAuthData {
    pub job: Option<JobDetails>,
    pub caller: Option<String>,
    #[serde(default)]
    pub remote_gateway_url: Option<String>,
    #[serde(default)]
    pub remote_gateway_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub status: String,
    pub internal_name: String,
    #[serde(default)]
    pub infrastructure_target: String,
}

#[derive(Debug, Deserialize, Default)]
struct LifecycleErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    status: String,
}

/// Discriminated failure kinds of the Lifecycle control plane, matched at
/// the HTTP edge to pick a response status.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Credential missing, invalid or rejected; not a technical error.
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait LifecycleClient: Send + Sync {
    /// Check whether the caller may call the given Job endpoint, returning
    /// the Job's details and the resolved caller name.
    async fn authorize_caller(
        &self,
        job_name: &str,
        job_version: &str,
        endpoint: &str,
    ) -> Result<JobCallAuthData, LifecycleError>;
}

/// Client of a locally-reachable Lifecycle instance.
#[derive(Clone)]
pub struct MasterLifecycleClient {
    lifecycle_url: String,
    auth_token: String,
    internal_token: String,
    request_tracing_header: String,
    request_id: String,
    http: reqwest::Client,
}

impl MasterLifecycleClient {
    pub fn new(
        http: reqwest::Client,
        lifecycle_url: &str,
        auth_token: &str,
        internal_token: &str,
        request_tracing_header: &str,
        request_id: &str,
    ) -> Self {
        Self {
            lifecycle_url: lifecycle_url.to_string(),
            auth_token: auth_token.to_string(),
            internal_token: internal_token.to_string(),
            request_tracing_header: request_tracing_header.to_string(),
            request_id: request_id.to_string(),
            http,
        }
    }

    /// Fetch a Job's metadata using the internal token. Used by the retry
    /// path, where the target may have moved since the task was created.
    pub async fn get_job_details(
        &self,
        job_name: &str,
        job_version: &str,
    ) -> Result<JobDetails, LifecycleError> {
        let url = join_url(&self.lifecycle_url, &["/api/v1/job/", job_name, job_version]);
        self.get_request(&url, true, "getting Job details").await
    }

    async fn get_request<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        internal_auth: bool,
        operation: &str,
    ) -> Result<T, LifecycleError> {
        metrics::inc_lifecycle_calls();

        let token = if internal_auth {
            &self.internal_token
        } else {
            &self.auth_token
        };
        let mut request = self.http.get(url).header(AUTH_HEADER, token);
        if !self.request_tracing_header.is_empty() {
            request = request.header(&self.request_tracing_header, &self.request_id);
        }

        let response = request.send().await.map_err(|err| {
            metrics::inc_lifecycle_errors();
            LifecycleError::Other(format!("{operation}: GET request to Lifecycle: {err}"))
        })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            metrics::inc_lifecycle_errors();
            let error_resp: LifecycleErrorResponse = response.json().await.unwrap_or_default();
            let mut explanation = error_resp.error;
            if !error_resp.status.is_empty() {
                explanation.push_str(": ");
                explanation.push_str(&error_resp.status);
            }
            let message = format!("{operation}: {explanation}");
            return Err(match status {
                reqwest::StatusCode::UNAUTHORIZED => LifecycleError::Unauthenticated(message),
                reqwest::StatusCode::NOT_FOUND => LifecycleError::NotFound(message),
                reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    LifecycleError::ServiceUnavailable(message)
                }
                _ => LifecycleError::Other(message),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| LifecycleError::Other(format!("{operation}: JSON decoding error: {err}")))
    }
}

#[async_trait]
impl LifecycleClient for MasterLifecycleClient {
    async fn authorize_caller(
        &self,
        job_name: &str,
        job_version: &str,
        endpoint: &str,
    ) -> Result<JobCallAuthData, LifecycleError> {
        let url = join_url(
            &self.lifecycle_url,
            &["/api/v1/auth/can-call-job/", job_name, job_version, endpoint],
        );
        self.get_request(&url, false, "authorizing Job caller").await
    }
}

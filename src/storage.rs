use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::auth::AUTH_HEADER;
use crate::task::AsyncTask;
use crate::urls::join_url;

const STORAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TaskStorageError {
    #[error("async task not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistent storage keeping all async tasks in one place, shared by every
/// replica. Authoritative for task existence.
#[async_trait]
pub trait TaskStorage: Send + Sync {
    async fn create(&self, task: &AsyncTask) -> Result<(), TaskStorageError>;
    async fn read(&self, task_id: &str) -> Result<AsyncTask, TaskStorageError>;
    async fn update(&self, task: &AsyncTask) -> Result<(), TaskStorageError>;
    async fn delete(&self, task_id: &str) -> Result<(), TaskStorageError>;
}

/// In-memory storage for tests and single-node mode.
#[derive(Default)]
pub struct MemoryTaskStorage {
    tasks: Mutex<HashMap<String, AsyncTask>>,
}

impl MemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStorage for MemoryTaskStorage {
    async fn create(&self, task: &AsyncTask) -> Result<(), TaskStorageError> {
        self.tasks
            .lock()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn read(&self, task_id: &str) -> Result<AsyncTask, TaskStorageError> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or(TaskStorageError::NotFound)
    }

    async fn update(&self, task: &AsyncTask) -> Result<(), TaskStorageError> {
        self.tasks
            .lock()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<(), TaskStorageError> {
        self.tasks.lock().await.remove(task_id);
        Ok(())
    }
}

/// Storage backed by the Lifecycle API, JSON over HTTP.
pub struct LifecycleTaskStorage {
    lifecycle_url: String,
    internal_token: String,
    http: reqwest::Client,
}

impl LifecycleTaskStorage {
    pub fn new(lifecycle_url: &str, internal_token: &str) -> anyhow::Result<Self> {
        Ok(Self {
            lifecycle_url: lifecycle_url.to_string(),
            internal_token: internal_token.to_string(),
            http: reqwest::Client::builder()
                .timeout(STORAGE_TIMEOUT)
                .build()
                .map_err(anyhow::Error::from)?,
        })
    }

    async fn check_status(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<reqwest::Response, TaskStorageError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TaskStorageError::NotFound);
        }
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(TaskStorageError::Other(anyhow::anyhow!(
                "{operation}: HTTP error {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TaskStorage for LifecycleTaskStorage {
    async fn create(&self, task: &AsyncTask) -> Result<(), TaskStorageError> {
        let url = join_url(&self.lifecycle_url, &["/api/v1/job/async/call"]);
        let response = self
            .http
            .post(url)
            .header(AUTH_HEADER, &self.internal_token)
            .json(task)
            .send()
            .await
            .map_err(|err| anyhow::anyhow!("creating async task: {err}"))?;
        Self::check_status(response, "creating async task").await?;
        Ok(())
    }

    async fn read(&self, task_id: &str) -> Result<AsyncTask, TaskStorageError> {
        let url = join_url(&self.lifecycle_url, &["/api/v1/job/async/call/", task_id]);
        let response = self
            .http
            .get(url)
            .header(AUTH_HEADER, &self.internal_token)
            .send()
            .await
            .map_err(|err| anyhow::anyhow!("getting async task: {err}"))?;
        let response = Self::check_status(response, "getting async task").await?;
        response
            .json()
            .await
            .map_err(|err| TaskStorageError::Other(anyhow::anyhow!("decoding async task: {err}")))
    }

    async fn update(&self, task: &AsyncTask) -> Result<(), TaskStorageError> {
        let url = join_url(&self.lifecycle_url, &["/api/v1/job/async/call/", &task.id]);
        let response = self
            .http
            .put(url)
            .header(AUTH_HEADER, &self.internal_token)
            .json(task)
            .send()
            .await
            .map_err(|err| anyhow::anyhow!("updating async task: {err}"))?;
        Self::check_status(response, "updating async task").await?;
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<(), TaskStorageError> {
        let url = join_url(&self.lifecycle_url, &["/api/v1/job/async/call/", task_id]);
        let response = self
            .http
            .delete(url)
            .header(AUTH_HEADER, &self.internal_token)
            .send()
            .await
            .map_err(|err| anyhow::anyhow!("deleting async task: {err}"))?;
        Self::check_status(response, "deleting async task").await?;
        Ok(())
    }
}

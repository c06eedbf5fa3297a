use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{watch, RwLock};

use crate::replicas::ReplicaDiscovery;
use crate::storage::{TaskStorage, TaskStorageError};
use crate::task::AsyncTask;

pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);
// Inference calls can be arbitrarily slow.
const JOB_CALL_TIMEOUT: Duration = Duration::from_secs(120 * 60);
const REPLICA_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
// Local tasks are cleaned up after the job client has certainly timed out.
const CLEAN_UP_TIMEOUT: Duration = Duration::from_secs(125 * 60);
const CLEAN_UP_PERIOD: Duration = Duration::from_secs(5 * 60);

/// A live task in this replica's registry: the latest snapshot plus the
/// completion signal its long-pollers wait on.
pub struct TaskEntry {
    pub task: AsyncTask,
    done_tx: watch::Sender<bool>,
}

/// Registry of tasks this replica is running. Persistent storage stays
/// authoritative for existence; this map is authoritative for liveness.
pub struct AsyncTaskStore {
    local_tasks: RwLock<HashMap<String, TaskEntry>>,
    storage: Arc<dyn TaskStorage>,
    pub replica_discovery: Arc<ReplicaDiscovery>,
    /// Forwards the captured request to a Job; hosts arbitrarily slow calls.
    pub job_http_client: reqwest::Client,
    /// Forwards long-polls to sibling replicas; as slow as the job client.
    pub replica_poll_http_client: reqwest::Client,
    /// Probes whether another replica has a task; short timeout.
    pub replica_status_http_client: reqwest::Client,
    pub long_poll_timeout: Duration,
    clean_up_timeout: Duration,
    quit_tx: watch::Sender<bool>,
}

impl AsyncTaskStore {
    pub fn new(
        replica_discovery: Arc<ReplicaDiscovery>,
        storage: Arc<dyn TaskStorage>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::with_timeouts(replica_discovery, storage, LONG_POLL_TIMEOUT, CLEAN_UP_TIMEOUT)
    }

    pub fn with_timeouts(
        replica_discovery: Arc<ReplicaDiscovery>,
        storage: Arc<dyn TaskStorage>,
        long_poll_timeout: Duration,
        clean_up_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let (quit_tx, _) = watch::channel(false);
        let store = Arc::new(Self {
            local_tasks: RwLock::new(HashMap::new()),
            storage,
            replica_discovery,
            job_http_client: reqwest::Client::builder()
                .timeout(JOB_CALL_TIMEOUT)
                .build()
                .context("build job http client")?,
            replica_poll_http_client: reqwest::Client::builder()
                .timeout(JOB_CALL_TIMEOUT)
                .build()
                .context("build replica poll http client")?,
            replica_status_http_client: reqwest::Client::builder()
                .timeout(REPLICA_STATUS_TIMEOUT)
                .build()
                .context("build replica status http client")?,
            long_poll_timeout,
            clean_up_timeout,
            quit_tx,
        });
        tokio::spawn(clean_up_loop(store.clone()));
        Ok(store)
    }

    /// Register a task locally and persist it. No local entry survives a
    /// storage failure: a 201 response guarantees the task is stored.
    pub async fn create_task(&self, task: AsyncTask) -> Result<AsyncTask, TaskStorageError> {
        let mut local_tasks = self.local_tasks.write().await;
        let (done_tx, _) = watch::channel(false);
        local_tasks.insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                done_tx,
            },
        );
        if let Err(err) = self.storage.create(&task).await {
            local_tasks.remove(&task.id);
            return Err(err);
        }
        Ok(task)
    }

    /// Overwrite the local snapshot (keeping its completion signal) and
    /// persist. Inserts a fresh entry when the task was adopted from
    /// storage and has no local entry yet.
    pub async fn update_task(&self, task: &AsyncTask) -> Result<(), TaskStorageError> {
        let mut local_tasks = self.local_tasks.write().await;
        match local_tasks.get_mut(&task.id) {
            Some(entry) => entry.task = task.clone(),
            None => {
                let (done_tx, _) = watch::channel(false);
                local_tasks.insert(
                    task.id.clone(),
                    TaskEntry {
                        task: task.clone(),
                        done_tx,
                    },
                );
            }
        }
        self.storage.update(task).await
    }

    pub async fn get_local_task(&self, task_id: &str) -> Option<AsyncTask> {
        let local_tasks = self.local_tasks.read().await;
        local_tasks.get(task_id).map(|entry| entry.task.clone())
    }

    /// Snapshot the task together with a subscription to its completion
    /// signal, atomically, for long-polling.
    pub async fn subscribe_local_task(
        &self,
        task_id: &str,
    ) -> Option<(AsyncTask, watch::Receiver<bool>)> {
        let local_tasks = self.local_tasks.read().await;
        local_tasks
            .get(task_id)
            .map(|entry| (entry.task.clone(), entry.done_tx.subscribe()))
    }

    /// Wake every poller of a task. The watch channel fans out: the value
    /// is observed by all current subscribers, and late subscribers read
    /// the final state from the registry instead.
    pub async fn signal_task_done(&self, task_id: &str) {
        let local_tasks = self.local_tasks.read().await;
        if let Some(entry) = local_tasks.get(task_id) {
            let _ = entry.done_tx.send(true);
        }
    }

    pub async fn get_stored_task(&self, task_id: &str) -> Result<AsyncTask, TaskStorageError> {
        self.storage.read(task_id).await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<(), TaskStorageError> {
        let mut local_tasks = self.local_tasks.write().await;
        local_tasks.remove(task_id);
        self.storage.delete(task_id).await
    }

    pub async fn local_task_count(&self) -> usize {
        self.local_tasks.read().await.len()
    }

    pub fn quit_receiver(&self) -> watch::Receiver<bool> {
        self.quit_tx.subscribe()
    }

    /// Release every suspended long-poll with a termination response.
    /// Called on shutdown; background job calls are not interrupted.
    pub fn cancel_ongoing_requests(&self) {
        let _ = self.quit_tx.send(true);
    }

    async fn clean_up(&self) {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.clean_up_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut local_tasks = self.local_tasks.write().await;
        local_tasks.retain(|task_id, entry| {
            let obsolete = entry.task.started_at < deadline;
            if obsolete {
                tracing::info!(
                    task_id = %task_id,
                    started_at = %entry.task.started_at,
                    "cleaning up obsolete async call task"
                );
            }
            !obsolete
        });
    }
}

async fn clean_up_loop(store: Arc<AsyncTaskStore>) {
    let mut quit_rx = store.quit_receiver();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CLEAN_UP_PERIOD) => {}
            _ = quit_rx.changed() => return,
        }
        store.clean_up().await;
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ongoing,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Ongoing => write!(f, "ongoing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One async Job call: the captured request, its execution state and, once
/// finished, the response snapshot. Persisted as a whole; the done/quit
/// signals live next to it in the local registry, not in this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub id: String,
    pub status: TaskStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "error")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retriable_error: bool,
    pub job_name: String,
    pub job_version: String,
    pub job_path: String,
    #[serde(rename = "method")]
    pub request_method: String,
    #[serde(rename = "url")]
    pub request_url: String,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_body: Vec<u8>,
    pub response_status_code: Option<u16>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_body: Vec<u8>,
    pub attempts: i32,
    #[serde(rename = "pub_instance")]
    pub pub_instance_addr: String,
}

impl AsyncTask {
    /// A failed task is retried only while attempts remain and the failure
    /// was a transport-level one (the Job may be mid-rollout).
    pub fn can_be_retried(&self, cfg: &Config) -> bool {
        self.attempts < cfg.async_max_attempts
            && self.status == TaskStatus::Failed
            && self.retriable_error
    }

    pub fn duration(&self) -> Option<String> {
        let ended_at = self.ended_at?;
        let duration = (ended_at - self.started_at)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        Some(format!("{duration:?}"))
    }
}

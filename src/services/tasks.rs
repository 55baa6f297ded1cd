// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Job queue: payloads, Cloud Tasks publisher and an in-process queue.
//!
//! This service creates Cloud Tasks for:
//! - Importing a batch of uploaded fitness files
//! - Importing (and continuing) a bulk Strava archive
//! - Post-processing a primary file (map data, publishing)
//! - Regenerating map data after privacy settings change
//!
//! Every job carries a deterministic task id derived from its payload, so a
//! duplicate publish of the same job is rejected by the queue.

use crate::error::AppError;
use crate::error::Result;
use crate::models::{PendingMediaActivity, Visibility};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Payload for importing a set of staged fitness files into posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFitnessFilesPayload {
    pub actor_id: String,
    pub batch_id: String,
    pub fitness_file_ids: Vec<String>,
    /// Files from earlier chunks that may share a post with this chunk
    #[serde(default)]
    pub overlap_fitness_file_ids: Vec<String>,
    #[serde(default)]
    pub visibility: Visibility,
}

/// Payload for one invocation of the archive importer.
///
/// The optional fields carry continuation state; a first invocation leaves
/// them unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStravaArchivePayload {
    pub import_id: String,
    pub actor_id: String,
    pub archive_id: String,
    pub archive_fitness_file_id: String,
    pub batch_id: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_activity_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_media_activities: Option<Vec<PendingMediaActivity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_attachment_retry: Option<u32>,
}

/// Payload for post-processing a primary fitness file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFitnessFilePayload {
    pub actor_id: String,
    pub status_id: String,
    pub fitness_file_id: String,
    /// Publish the post once processing finishes
    pub publish_send_note: bool,
}

/// Payload for rebuilding map data of existing files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateFitnessMapsPayload {
    pub actor_id: String,
    pub fitness_file_ids: Vec<String>,
}

/// Any job the pipeline can enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobPayload {
    ImportFitnessFiles(ImportFitnessFilesPayload),
    ImportStravaArchive(ImportStravaArchivePayload),
    ProcessFitnessFile(ProcessFitnessFilePayload),
    RegenerateFitnessMaps(RegenerateFitnessMapsPayload),
}

impl JobPayload {
    /// Callback path that handles this job.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::ImportFitnessFiles(_) => "/tasks/import-fitness-files",
            Self::ImportStravaArchive(_) => "/tasks/import-strava-archive",
            Self::ProcessFitnessFile(_) => "/tasks/process-fitness-file",
            Self::RegenerateFitnessMaps(_) => "/tasks/regenerate-fitness-maps",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ImportFitnessFiles(_) => "import-fitness-files",
            Self::ImportStravaArchive(_) => "import-strava-archive",
            Self::ProcessFitnessFile(_) => "process-fitness-file",
            Self::RegenerateFitnessMaps(_) => "regenerate-fitness-maps",
        }
    }

    /// JSON body posted to the callback endpoint.
    pub fn body(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::ImportFitnessFiles(p) => serde_json::to_vec(p),
            Self::ImportStravaArchive(p) => serde_json::to_vec(p),
            Self::ProcessFitnessFile(p) => serde_json::to_vec(p),
            Self::RegenerateFitnessMaps(p) => serde_json::to_vec(p),
        }
    }
}

/// A job ready to publish, with its dedup id.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub task_id: String,
    pub payload: JobPayload,
    /// Earliest delivery, relative to publish time
    pub delay: Option<Duration>,
}

impl Job {
    /// Job whose id is a digest of the payload.
    pub fn new(payload: JobPayload) -> Self {
        let body = payload.body().unwrap_or_default();
        let task_id = format!("{}-{}", payload.kind(), hex::encode(Sha256::digest(&body)));
        Self {
            task_id,
            payload,
            delay: None,
        }
    }

    /// Deliver no sooner than `delay` after publishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = (!delay.is_zero()).then_some(delay);
        self
    }

    /// Distinguish a deliberate re-run of an otherwise identical job.
    pub fn with_nonce(mut self, nonce: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.task_id.as_bytes());
        hasher.update(nonce.as_bytes());
        self.task_id = format!("{}-{}", self.payload.kind(), hex::encode(hasher.finalize()));
        self
    }
}

impl From<ImportFitnessFilesPayload> for Job {
    fn from(p: ImportFitnessFilesPayload) -> Self {
        Job::new(JobPayload::ImportFitnessFiles(p))
    }
}

impl From<ImportStravaArchivePayload> for Job {
    fn from(p: ImportStravaArchivePayload) -> Self {
        Job::new(JobPayload::ImportStravaArchive(p))
    }
}

impl From<ProcessFitnessFilePayload> for Job {
    fn from(p: ProcessFitnessFilePayload) -> Self {
        Job::new(JobPayload::ProcessFitnessFile(p))
    }
}

impl From<RegenerateFitnessMapsPayload> for Job {
    fn from(p: RegenerateFitnessMapsPayload) -> Self {
        Job::new(JobPayload::RegenerateFitnessMaps(p))
    }
}

/// Durable at-least-once job queue.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Enqueue a job. A job whose id was already accepted counts as published.
    async fn publish(&self, job: &Job) -> Result<()>;
}

/// Cloud Tasks client wrapper.
pub struct TasksService {
    project_id: String,
    location: String,
    queue_name: String,
    service_url: String,
    auth_token: String,
    client: tokio::sync::OnceCell<google_cloud_tasks_v2::client::CloudTasks>,
}

impl TasksService {
    pub fn new(project_id: &str, region: &str, service_url: &str, auth_token: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            location: region.to_string(),
            queue_name: crate::config::TASKS_QUEUE_NAME.to_string(),
            service_url: service_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            client: tokio::sync::OnceCell::new(),
        }
    }

    fn queue_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project_id, self.location, self.queue_name
        )
    }

    async fn client(&self) -> Result<&google_cloud_tasks_v2::client::CloudTasks> {
        self.client
            .get_or_try_init(|| async {
                google_cloud_tasks_v2::client::CloudTasks::builder()
                    .build()
                    .await
                    .map_err(|e| AppError::Queue(format!("Cloud Tasks client error: {}", e)))
            })
            .await
    }
}

#[async_trait]
impl JobPublisher for TasksService {
    async fn publish(&self, job: &Job) -> Result<()> {
        use google_cloud_gax::error::rpc::Code;
        use google_cloud_tasks_v2::model::{HttpRequest, Task};

        let client = self.client().await?;
        let queue_path = self.queue_path();

        let body = job
            .payload
            .body()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("JSON error: {}", e)))?;

        let http_request = HttpRequest::default()
            .set_url(format!("{}{}", self.service_url, job.payload.endpoint()))
            .set_http_method("POST")
            .set_body(axum::body::Bytes::from(body))
            .set_headers(std::collections::HashMap::from([
                ("Content-Type".to_string(), "application/json".to_string()),
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", self.auth_token),
                ),
            ]));

        let mut task = Task::default()
            .set_name(format!("{}/tasks/{}", queue_path, job.task_id))
            .set_http_request(http_request);
        if let Some(delay) = job.delay {
            task = task.set_schedule_time(schedule_time(Utc::now(), delay));
        }

        match client
            .create_task()
            .set_parent(queue_path)
            .set_task(task)
            .send()
            .await
        {
            Ok(_) => {
                tracing::debug!(task_id = %job.task_id, kind = job.payload.kind(), "Queued task");
                Ok(())
            }
            Err(e) if e.status().map(|s| s.code) == Some(Code::AlreadyExists) => {
                tracing::info!(task_id = %job.task_id, "Task already queued, skipping duplicate");
                Ok(())
            }
            Err(e) => Err(AppError::Queue(format!("Cloud Tasks create error: {}", e))),
        }
    }
}

/// Absolute Cloud Tasks schedule time `delay` after `now`.
fn schedule_time(now: DateTime<Utc>, delay: Duration) -> google_cloud_wkt::Timestamp {
    let at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now);
    google_cloud_wkt::Timestamp::clamp(at.timestamp(), at.timestamp_subsec_nanos() as i32)
}

/// In-process queue used in local mode and tests.
///
/// Every accepted publish is recorded; pending jobs are handed out in FIFO
/// order by [`LocalQueue::next_job`] or [`LocalQueue::take_jobs`].
#[derive(Default)]
pub struct LocalQueue {
    pending: Mutex<VecDeque<Job>>,
    published: Mutex<Vec<Job>>,
    fail_publishes: AtomicBool,
    notify: tokio::sync::Notify,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (queue outage).
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every job accepted so far, in publish order.
    pub fn published(&self) -> Vec<Job> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Remove and return all jobs not yet handed out.
    pub fn take_jobs(&self) -> Vec<Job> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Put a job back at the end of the pending list.
    pub fn requeue(&self, job: Job) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(job);
        self.notify.notify_one();
    }

    /// Wait for the next pending job.
    pub async fn next_job(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            let next = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            if let Some(job) = next {
                return job;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl JobPublisher for LocalQueue {
    async fn publish(&self, job: &Job) -> Result<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(AppError::Queue("local queue rejected publish".to_string()));
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.clone());
        self.requeue(job.clone());
        Ok(())
    }
}

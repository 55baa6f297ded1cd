// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Batch import: merge newly staged fitness files into posts.
//!
//! Files whose activity intervals overlap (transitively) share one post. The
//! earliest-starting file of a group is its primary and the only one that
//! gets post-processed. A group that already has a post reuses it, which
//! makes replays of the same job free of side effects.

use crate::error::{AppError, ImportError};
use crate::models::{FitnessFile, FitnessFileUpdate, ImportStatus, ProcessingStatus};
use crate::services::processing::parse_stored_file;
use crate::services::social::{status_content, StatusDraft};
use crate::services::tasks::{ImportFitnessFilesPayload, Job, ProcessFitnessFilePayload};
use crate::AppState;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const MAX_CONCURRENT_PARSES: usize = 8;

/// Per-batch async locks so one process never merges the same batch twice
/// at once.
#[derive(Default)]
pub struct BatchLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BatchLocks {
    pub async fn acquire(&self, key: &str) -> BatchGuard<'_> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        BatchGuard {
            guard: Some(guard),
            locks: self,
            key: key.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct BatchGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a BatchLocks,
    key: String,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Outcome of one coordinator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub statuses_created: u32,
    pub statuses_reused: u32,
    pub files_linked: u32,
    pub files_failed: u32,
}

/// A file taking part in grouping.
#[derive(Debug, Clone)]
struct Candidate {
    file: FitnessFile,
    /// Listed in this job (as opposed to an overlap file from an earlier chunk)
    is_new: bool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Candidate {
    fn new(file: FitnessFile, is_new: bool) -> Option<Self> {
        let (start, end) = file.interval()?;
        Some(Self {
            file,
            is_new,
            start,
            end,
        })
    }
}

/// Split candidates into groups of transitively overlapping intervals.
///
/// Each group is sorted by start time (then id), so its first entry is the
/// primary.
fn group_by_overlap(mut candidates: Vec<Candidate>) -> Vec<Vec<Candidate>> {
    candidates.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.file.id.cmp(&b.file.id)));

    let mut groups: Vec<Vec<Candidate>> = Vec::new();
    let mut group_end: Option<DateTime<Utc>> = None;
    for c in candidates {
        match (groups.last_mut(), group_end) {
            (Some(group), Some(end)) if c.start <= end => {
                group_end = Some(end.max(c.end));
                group.push(c);
            }
            _ => {
                group_end = Some(c.end);
                groups.push(vec![c]);
            }
        }
    }
    groups
}

enum ParseOutcome {
    Ready(Candidate),
    Failed,
    Skipped,
}

pub struct BatchImportCoordinator<'a> {
    state: &'a AppState,
}

impl<'a> BatchImportCoordinator<'a> {
    pub fn new(state: &'a AppState) -> Self {
        Self { state }
    }

    /// Turn the payload's files into posts.
    ///
    /// Every listed file ends `completed` or `failed`. Infrastructure errors
    /// are returned so the queue redelivers the job.
    pub async fn import_files(
        &self,
        payload: &ImportFitnessFilesPayload,
    ) -> Result<ImportReport, AppError> {
        let _guard = self.state.batch_locks.acquire(&payload.batch_id).await;
        let mut report = ImportReport::default();

        let new_files = self.load_files(payload, &payload.fitness_file_ids).await?;
        let overlap_ids: Vec<String> = payload
            .overlap_fitness_file_ids
            .iter()
            .filter(|id| !payload.fitness_file_ids.contains(id))
            .cloned()
            .collect();
        let overlap_files = self.load_files(payload, &overlap_ids).await?;

        let mut to_prepare = Vec::new();
        for file in new_files {
            if file.import_status == Some(ImportStatus::Failed) {
                tracing::debug!(fitness_file_id = %file.id, "Skipping failed file");
                continue;
            }
            if !file.file_type.is_activity() {
                self.fail_file(&file.id, ImportError::Parse("unsupported file type".into()))
                    .await?;
                report.files_failed += 1;
                continue;
            }
            to_prepare.push((file, true));
        }
        for file in overlap_files {
            if file.import_status != Some(ImportStatus::Failed) && file.file_type.is_activity() {
                to_prepare.push((file, false));
            }
        }

        let outcomes = stream::iter(to_prepare)
            .map(|(file, is_new)| self.prepare(file, is_new))
            .buffer_unordered(MAX_CONCURRENT_PARSES)
            .collect::<Vec<Result<ParseOutcome, AppError>>>()
            .await;

        let mut candidates = Vec::new();
        for outcome in outcomes {
            match outcome? {
                ParseOutcome::Ready(c) => candidates.push(c),
                ParseOutcome::Failed => report.files_failed += 1,
                ParseOutcome::Skipped => {}
            }
        }

        for group in group_by_overlap(candidates) {
            if !group.iter().any(|c| c.is_new) {
                continue;
            }
            let existing = group.iter().find_map(|c| c.file.status_id.clone());
            match existing {
                Some(status_id) => {
                    self.link_to_existing(payload, group, &status_id, &mut report)
                        .await?
                }
                None => self.create_and_link(payload, group, &mut report).await?,
            }
        }

        tracing::info!(
            actor_id = %payload.actor_id,
            batch_id = %payload.batch_id,
            files = payload.fitness_file_ids.len(),
            overlap = payload.overlap_fitness_file_ids.len(),
            created = report.statuses_created,
            reused = report.statuses_reused,
            linked = report.files_linked,
            failed = report.files_failed,
            "Batch import finished"
        );
        Ok(report)
    }

    async fn load_files(
        &self,
        payload: &ImportFitnessFilesPayload,
        ids: &[String],
    ) -> Result<Vec<FitnessFile>, AppError> {
        let files = self.state.store.get_fitness_files(ids).await?;
        if files.len() < ids.len() {
            tracing::warn!(
                batch_id = %payload.batch_id,
                requested = ids.len(),
                found = files.len(),
                "Some fitness files no longer exist"
            );
        }
        Ok(files
            .into_iter()
            .filter(|f| f.actor_id == payload.actor_id && !f.is_deleted())
            .collect())
    }

    /// Make sure a file has metrics, parsing it if needed.
    ///
    /// Parse failures fail only that file, and only when it belongs to this
    /// job; overlap files are left to their own job.
    async fn prepare(&self, mut file: FitnessFile, is_new: bool) -> Result<ParseOutcome, AppError> {
        if file.metrics.is_none() {
            match parse_stored_file(self.state, &file).await? {
                Ok(parsed) => {
                    let update = FitnessFileUpdate {
                        metrics: Some(parsed.metrics),
                        ..Default::default()
                    };
                    self.state
                        .store
                        .update_fitness_file(&file.id, &update)
                        .await?;
                    file.apply(&update);
                }
                Err(err) => {
                    tracing::warn!(
                        fitness_file_id = %file.id,
                        batch_id = ?file.import_batch_id,
                        error = %err,
                        "Could not parse fitness file"
                    );
                    if !is_new {
                        return Ok(ParseOutcome::Skipped);
                    }
                    self.fail_file(&file.id, err).await?;
                    return Ok(ParseOutcome::Failed);
                }
            }
        }

        Ok(Candidate::new(file, is_new).map_or(ParseOutcome::Skipped, ParseOutcome::Ready))
    }

    async fn fail_file(&self, id: &str, err: ImportError) -> Result<(), AppError> {
        self.state
            .store
            .update_fitness_file(id, &FitnessFileUpdate::failed(err.to_string()))
            .await
    }

    /// Attach a group to the post one of its members already has.
    async fn link_to_existing(
        &self,
        payload: &ImportFitnessFilesPayload,
        group: Vec<Candidate>,
        status_id: &str,
        report: &mut ImportReport,
    ) -> Result<(), AppError> {
        let (members, foreign): (Vec<Candidate>, Vec<Candidate>) =
            group.into_iter().partition(|c| {
                c.file.status_id.is_none() || c.file.status_id.as_deref() == Some(status_id)
            });
        for c in &foreign {
            tracing::warn!(
                fitness_file_id = %c.file.id,
                status_id = ?c.file.status_id,
                "Overlapping file already belongs to another status"
            );
        }

        // Members are sorted, so the first is the earliest start
        let Some(primary_id) = members.first().map(|c| c.file.id.clone()) else {
            return Ok(());
        };
        let previous_primary = members
            .iter()
            .find(|c| c.file.is_primary && c.file.status_id.as_deref() == Some(status_id))
            .map(|c| c.file.clone());
        let primary_changed = previous_primary
            .as_ref()
            .is_none_or(|p| p.id != primary_id);

        let mut newly_linked = Vec::new();
        for c in &members {
            let file = &c.file;
            let is_primary = file.id == primary_id;

            let mut update = if file.status_id.as_deref() != Some(status_id)
                || file.is_primary != is_primary
                || file.import_status != Some(ImportStatus::Completed)
            {
                FitnessFileUpdate::link(status_id, is_primary)
            } else {
                FitnessFileUpdate::default()
            };
            if is_primary && primary_changed {
                update.processing_status = Some(ProcessingStatus::Pending);
            } else if !is_primary && file.processing_status != ProcessingStatus::Completed {
                update.processing_status = Some(ProcessingStatus::Completed);
            }

            if file.status_id.is_none() {
                newly_linked.push(file.id.clone());
            }
            if !update.is_empty() {
                self.state
                    .store
                    .update_fitness_file(&file.id, &update)
                    .await?;
                report.files_linked += 1;
            }
        }
        report.statuses_reused += 1;

        if !primary_changed {
            tracing::debug!(
                batch_id = %payload.batch_id,
                status_id,
                "Group already linked, nothing to publish"
            );
            return Ok(());
        }

        tracing::info!(
            batch_id = %payload.batch_id,
            status_id,
            fitness_file_id = %primary_id,
            "Primary file of existing status changed"
        );

        // The old primary may not have finished publishing the post yet
        let publish_send_note = previous_primary
            .as_ref()
            .is_none_or(|p| p.processing_status != ProcessingStatus::Completed);
        let job = Job::from(ProcessFitnessFilePayload {
            actor_id: payload.actor_id.clone(),
            status_id: status_id.to_string(),
            fitness_file_id: primary_id,
            publish_send_note,
        });

        if let Err(e) = self.state.jobs.publish(&job).await {
            tracing::error!(
                batch_id = %payload.batch_id,
                status_id,
                error = %e,
                "Failed to queue processing for reused status"
            );
            let message = ImportError::Publish(e.to_string()).to_string();
            for id in &newly_linked {
                self.state
                    .store
                    .update_fitness_file(id, &FitnessFileUpdate::failed(message.clone()))
                    .await?;
                report.files_failed += 1;
            }
            if let Some(prev) = previous_primary {
                let restore = FitnessFileUpdate::link(status_id, true).processing(prev.processing_status);
                self.state.store.update_fitness_file(&prev.id, &restore).await?;
            }
        }
        Ok(())
    }

    /// Create a post for a group nobody has posted yet.
    async fn create_and_link(
        &self,
        payload: &ImportFitnessFilesPayload,
        group: Vec<Candidate>,
        report: &mut ImportReport,
    ) -> Result<(), AppError> {
        let Some(primary) = group.first().map(|c| c.file.clone()) else {
            return Ok(());
        };
        let content = primary
            .metrics
            .as_ref()
            .map(status_content)
            .unwrap_or_default();

        let status_id = self
            .state
            .statuses
            .create_status(&StatusDraft {
                actor_id: payload.actor_id.clone(),
                visibility: payload.visibility,
                fitness_file_id: primary.id.clone(),
                content,
            })
            .await?;
        report.statuses_created += 1;

        tracing::info!(
            actor_id = %payload.actor_id,
            batch_id = %payload.batch_id,
            status_id = %status_id,
            fitness_file_id = %primary.id,
            members = group.len(),
            "Created status for activity group"
        );

        if let Err(e) = self.link_group(&group, &status_id).await {
            tracing::error!(
                batch_id = %payload.batch_id,
                status_id = %status_id,
                error = %e,
                "Failed to link files, rolling back new status"
            );
            self.delete_new_status(payload, &status_id).await;
            for c in &group {
                let reset = FitnessFileUpdate::reset_for_retry();
                if let Err(err) = self.state.store.update_fitness_file(&c.file.id, &reset).await {
                    tracing::error!(fitness_file_id = %c.file.id, error = %err, "Failed to unlink file");
                }
            }
            return Err(e);
        }

        let job = Job::from(ProcessFitnessFilePayload {
            actor_id: payload.actor_id.clone(),
            status_id: status_id.clone(),
            fitness_file_id: primary.id.clone(),
            publish_send_note: true,
        });
        let Err(e) = self.state.jobs.publish(&job).await else {
            report.files_linked += group.len() as u32;
            return Ok(());
        };

        tracing::error!(
            batch_id = %payload.batch_id,
            status_id = %status_id,
            error = %e,
            "Failed to queue processing, rolling back new status"
        );
        self.delete_new_status(payload, &status_id).await;

        let message = ImportError::Publish(e.to_string()).to_string();
        for c in &group {
            self.state
                .store
                .update_fitness_file(&c.file.id, &FitnessFileUpdate::failed(message.clone()))
                .await?;
        }
        report.files_failed += group.len() as u32;
        Ok(())
    }

    /// Link every member to a freshly created post.
    async fn link_group(&self, group: &[Candidate], status_id: &str) -> Result<(), AppError> {
        // Primary last: a half-linked group is re-entered with its primary
        // still unlinked, which queues processing on replay.
        for c in group.iter().skip(1) {
            let update =
                FitnessFileUpdate::link(status_id, false).processing(ProcessingStatus::Completed);
            self.state
                .store
                .update_fitness_file(&c.file.id, &update)
                .await?;
        }
        if let Some(primary) = group.first() {
            let update =
                FitnessFileUpdate::link(status_id, true).processing(ProcessingStatus::Pending);
            self.state
                .store
                .update_fitness_file(&primary.file.id, &update)
                .await?;
        }
        Ok(())
    }

    async fn delete_new_status(&self, payload: &ImportFitnessFilesPayload, status_id: &str) {
        if let Err(e) = self
            .state
            .statuses
            .delete_status(&payload.actor_id, status_id)
            .await
        {
            tracing::error!(status_id, error = %e, "Failed to delete rolled back status");
        }
    }
}

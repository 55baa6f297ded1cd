// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bulk archive import with time-boxed continuation.
//!
//! One invocation stages archive activities as fitness files until its time
//! budget runs out, hands the staged chunk to the batch importer, and queues
//! a continuation of itself. Once the whole archive is staged, the importer
//! waits (by requeueing) until every staged activity has a post and then
//! attaches the archive's media to those posts.

use crate::error::{AppError, ImportError};
use crate::models::{
    ArchiveImportUpdate, ArchiveMediaUpload, BatchSummary, FitnessFile, FitnessFileUpdate,
    ImportStatus, PendingMediaActivity, StravaArchiveImport,
};
use crate::services::archive_reader::{
    is_remote_media, provider_media_id, ArchiveActivity, ArchiveReader,
};
use crate::services::storage::blob_path;
use crate::services::tasks::{ImportFitnessFilesPayload, ImportStravaArchivePayload, Job};
use crate::AppState;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Instant;

/// What one invocation ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Time budget ran out; a continuation was queued
    Continued { next_activity_index: u32 },
    /// Staging finished but some posts do not exist yet; requeued
    WaitingForMedia { retry: u32 },
    Completed,
    Failed(String),
    /// Nothing to do (unknown or already finished import)
    Skipped,
}

/// Fitness file id for an archive activity, stable across replays.
pub fn staged_file_id(import_id: &str, activity_id: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", import_id, activity_id).as_bytes());
    hex::encode(&digest[..16])
}

/// Stored file name of an archive activity: the entry's base name without `.gz`.
fn staged_file_name(archive_path: &str) -> &str {
    let base = archive_path.rsplit('/').next().unwrap_or(archive_path);
    match base.len().checked_sub(3) {
        Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".gz") => {
            &base[..cut]
        }
        _ => base,
    }
}

/// Resumable state of one import, merged from the record and the payload.
struct Progress {
    next_activity_index: u32,
    pending: Vec<PendingMediaActivity>,
    retry: u32,
}

impl Progress {
    /// Never move backwards when an older message is redelivered.
    fn merge(record: &StravaArchiveImport, payload: &ImportStravaArchivePayload) -> Self {
        let payload_index = payload.next_activity_index.unwrap_or(0);
        let use_payload =
            payload_index >= record.next_activity_index && payload.pending_media_activities.is_some();

        Self {
            next_activity_index: payload_index.max(record.next_activity_index),
            pending: match (&payload.pending_media_activities, use_payload) {
                (Some(list), true) => list.clone(),
                _ => record.pending_media_activities.clone(),
            },
            retry: payload
                .media_attachment_retry
                .unwrap_or(0)
                .max(record.media_attachment_retry),
        }
    }

    fn push_pending(&mut self, entry: PendingMediaActivity) {
        if !self
            .pending
            .iter()
            .any(|p| p.fitness_file_id == entry.fitness_file_id)
        {
            self.pending.push(entry);
        }
    }
}

pub struct ArchiveImporter<'a> {
    state: &'a AppState,
}

impl<'a> ArchiveImporter<'a> {
    pub fn new(state: &'a AppState) -> Self {
        Self { state }
    }

    /// Handle one `ImportStravaArchive` job.
    pub async fn run(
        &self,
        payload: &ImportStravaArchivePayload,
    ) -> Result<ArchiveOutcome, AppError> {
        let started = Instant::now();

        let Some(record) = self.state.store.get_archive_import(&payload.import_id).await? else {
            tracing::warn!(import_id = %payload.import_id, "Archive import record not found");
            return Ok(ArchiveOutcome::Skipped);
        };
        if record.actor_id != payload.actor_id || record.status.is_terminal() {
            tracing::info!(
                import_id = %record.id,
                status = ?record.status,
                "Archive import already finished, skipping"
            );
            return Ok(ArchiveOutcome::Skipped);
        }

        if !self.state.statuses.actor_exists(&record.actor_id).await? {
            tracing::info!(
                import_id = %record.id,
                actor_id = %record.actor_id,
                "Archive owner is gone, cleaning up"
            );
            self.delete_source(&record).await?;
            let message = ImportError::ActorMissing(record.actor_id.clone()).to_string();
            self.state
                .store
                .update_archive_import(&record.id, &ArchiveImportUpdate::failed(message.clone()))
                .await?;
            return Ok(ArchiveOutcome::Failed(message));
        }

        let mut reader = match self.open(&record).await? {
            Ok(reader) => reader,
            Err(err) => return self.fail(&record, err).await,
        };

        let activities: Vec<ArchiveActivity> = reader.activities().to_vec();
        let total = activities.len() as u32;
        let mut progress = Progress::merge(&record, payload);
        let prior_ids: Vec<String> = progress
            .pending
            .iter()
            .map(|p| p.fitness_file_id.clone())
            .collect();

        let mut chunk_ids = Vec::new();
        let mut staging_failures = 0;
        let mut index = progress.next_activity_index.min(total);
        while index < total {
            let activity = &activities[index as usize];
            match self.stage(&record, reader.as_mut(), activity).await? {
                Some(entry) => {
                    chunk_ids.push(entry.fitness_file_id.clone());
                    progress.push_pending(entry);
                }
                None => staging_failures += 1,
            }
            index += 1;

            if index < total && started.elapsed() >= self.state.config.archive_time_budget {
                return self
                    .continue_later(
                        &record,
                        payload,
                        progress,
                        chunk_ids,
                        prior_ids,
                        index,
                        total,
                        staging_failures,
                    )
                    .await;
            }
        }

        if let Err(err) = self.publish_chunk(&record, &chunk_ids, &prior_ids).await? {
            return self.fail(&record, err).await;
        }
        progress.next_activity_index = total;
        self.state
            .store
            .update_archive_import(
                &record.id,
                &ArchiveImportUpdate {
                    next_activity_index: Some(total),
                    pending_media_activities: Some(progress.pending.clone()),
                    total_activities: Some(total),
                    failed_activities: Some(record.failed_activities + staging_failures),
                    ..Default::default()
                },
            )
            .await?;

        self.attach_media(&record, payload, reader.as_mut(), progress)
            .await
    }

    async fn open(
        &self,
        record: &StravaArchiveImport,
    ) -> Result<Result<Box<dyn ArchiveReader>, ImportError>, AppError> {
        let source = self
            .state
            .store
            .get_fitness_file(&record.archive_fitness_file_id)
            .await?;
        let Some(source) = source.filter(|f| !f.is_deleted()) else {
            return Ok(Err(ImportError::ArchiveOpen(
                "archive file no longer exists".to_string(),
            )));
        };

        let bytes = match self.state.blobs.read(&source.path).await {
            Ok(bytes) => bytes,
            Err(AppError::NotFound(_)) => {
                return Ok(Err(ImportError::ArchiveOpen(
                    "archive data is missing".to_string(),
                )))
            }
            Err(e) => return Err(e),
        };
        Ok(self.state.archives.open(bytes))
    }

    /// Persist one activity as a fitness file of the archive's batch.
    ///
    /// Returns `None` when the activity could not be read; it is then stored
    /// as a failed file so the batch shows it.
    async fn stage(
        &self,
        record: &StravaArchiveImport,
        reader: &mut dyn ArchiveReader,
        activity: &ArchiveActivity,
    ) -> Result<Option<PendingMediaActivity>, AppError> {
        let file_id = staged_file_id(&record.id, &activity.activity_id);
        let entry = PendingMediaActivity {
            activity_id: activity.activity_id.clone(),
            fitness_file_id: file_id.clone(),
            media_paths: activity.media_paths.clone(),
        };

        if let Some(existing) = self.state.store.get_fitness_file(&file_id).await? {
            tracing::debug!(fitness_file_id = %file_id, "Activity already staged");
            return Ok((existing.import_status != Some(ImportStatus::Failed)).then_some(entry));
        }

        let path = blob_path(&record.actor_id, &file_id, activity.file_type.extension());
        let mut file = FitnessFile::new_import(
            file_id.clone(),
            &record.actor_id,
            path.clone(),
            staged_file_name(&activity.file_name),
            activity.file_type,
            0,
            Some(&record.batch_id),
            record.visibility,
        );

        match reader.read_activity_file(activity) {
            Ok(bytes) => {
                self.state.blobs.write(&path, &bytes).await?;
                file.bytes = bytes.len() as u64;
                self.state.store.insert_fitness_file(&file).await?;
                tracing::debug!(
                    import_id = %record.id,
                    activity_id = %activity.activity_id,
                    fitness_file_id = %file_id,
                    "Staged archive activity"
                );
                Ok(Some(entry))
            }
            Err(err) => {
                tracing::warn!(
                    import_id = %record.id,
                    activity_id = %activity.activity_id,
                    error = %err,
                    "Could not read archive activity"
                );
                file.apply(&FitnessFileUpdate::failed(err.to_string()));
                self.state.store.insert_fitness_file(&file).await?;
                Ok(None)
            }
        }
    }

    /// Queue the batch import of a staged chunk.
    ///
    /// On a queue failure the chunk's files are failed so the batch does not
    /// stay pending forever.
    async fn publish_chunk(
        &self,
        record: &StravaArchiveImport,
        chunk_ids: &[String],
        prior_ids: &[String],
    ) -> Result<Result<(), ImportError>, AppError> {
        if chunk_ids.is_empty() {
            return Ok(Ok(()));
        }

        let job = Job::from(ImportFitnessFilesPayload {
            actor_id: record.actor_id.clone(),
            batch_id: record.batch_id.clone(),
            fitness_file_ids: chunk_ids.to_vec(),
            overlap_fitness_file_ids: prior_ids.to_vec(),
            visibility: record.visibility,
        });
        let Err(e) = self.state.jobs.publish(&job).await else {
            return Ok(Ok(()));
        };

        let err = ImportError::Publish(e.to_string());
        for id in chunk_ids {
            self.state
                .store
                .update_fitness_file(id, &FitnessFileUpdate::failed(err.to_string()))
                .await?;
        }
        Ok(Err(err))
    }

    #[allow(clippy::too_many_arguments)]
    async fn continue_later(
        &self,
        record: &StravaArchiveImport,
        payload: &ImportStravaArchivePayload,
        progress: Progress,
        chunk_ids: Vec<String>,
        prior_ids: Vec<String>,
        index: u32,
        total: u32,
        staging_failures: u32,
    ) -> Result<ArchiveOutcome, AppError> {
        if let Err(err) = self.publish_chunk(record, &chunk_ids, &prior_ids).await? {
            return self.fail(record, err).await;
        }

        self.state
            .store
            .update_archive_import(
                &record.id,
                &ArchiveImportUpdate {
                    next_activity_index: Some(index),
                    pending_media_activities: Some(progress.pending.clone()),
                    total_activities: Some(total),
                    failed_activities: Some(record.failed_activities + staging_failures),
                    ..Default::default()
                },
            )
            .await?;

        let continuation = Job::from(ImportStravaArchivePayload {
            next_activity_index: Some(index),
            pending_media_activities: Some(progress.pending),
            media_attachment_retry: Some(progress.retry),
            ..payload.clone()
        });
        if let Err(e) = self.state.jobs.publish(&continuation).await {
            return self.fail(record, ImportError::Publish(e.to_string())).await;
        }

        let note = format!("Continuing from activity {}/{}", index + 1, total);
        self.state
            .store
            .update_fitness_file(
                &record.archive_fitness_file_id,
                &FitnessFileUpdate {
                    import_status: Some(ImportStatus::Pending),
                    import_note: Some(Some(note)),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            import_id = %record.id,
            batch_id = %record.batch_id,
            staged = chunk_ids.len(),
            next_activity_index = index,
            total,
            "Archive import time budget reached, continuing later"
        );
        Ok(ArchiveOutcome::Continued {
            next_activity_index: index,
        })
    }

    /// Attach archive media once every staged activity has its post.
    async fn attach_media(
        &self,
        record: &StravaArchiveImport,
        payload: &ImportStravaArchivePayload,
        reader: &mut dyn ArchiveReader,
        progress: Progress,
    ) -> Result<ArchiveOutcome, AppError> {
        let ids: Vec<String> = progress
            .pending
            .iter()
            .map(|p| p.fitness_file_id.clone())
            .collect();
        let files = self.state.store.get_fitness_files(&ids).await?;

        let mut ready = Vec::new();
        let mut still_pending = Vec::new();
        for entry in progress.pending {
            let file = files.iter().find(|f| f.id == entry.fitness_file_id);
            match file {
                Some(f) if f.import_status == Some(ImportStatus::Failed) => {
                    tracing::debug!(fitness_file_id = %f.id, "Dropping failed activity from media wait");
                }
                None => {
                    tracing::debug!(fitness_file_id = %entry.fitness_file_id, "Dropping missing activity from media wait");
                }
                Some(f) => match f.status_id.clone() {
                    Some(status_id) => ready.push((entry, status_id)),
                    None => still_pending.push(entry),
                },
            }
        }

        if !still_pending.is_empty() {
            let retry = progress.retry + 1;
            if retry > self.state.config.media_attachment_max_retries {
                return self.fail(record, ImportError::MediaRetryExhausted).await;
            }

            let mut remaining: Vec<PendingMediaActivity> =
                ready.into_iter().map(|(entry, _)| entry).collect();
            remaining.extend(still_pending);

            self.state
                .store
                .update_archive_import(
                    &record.id,
                    &ArchiveImportUpdate {
                        pending_media_activities: Some(remaining.clone()),
                        media_attachment_retry: Some(retry),
                        ..Default::default()
                    },
                )
                .await?;

            let requeue = Job::from(ImportStravaArchivePayload {
                next_activity_index: Some(progress.next_activity_index),
                pending_media_activities: Some(remaining),
                media_attachment_retry: Some(retry),
                ..payload.clone()
            })
            .with_delay(self.state.config.media_retry_delay);
            if let Err(e) = self.state.jobs.publish(&requeue).await {
                return self.fail(record, ImportError::Publish(e.to_string())).await;
            }

            tracing::info!(
                import_id = %record.id,
                retry,
                "Waiting for imported statuses before attaching media"
            );
            return Ok(ArchiveOutcome::WaitingForMedia { retry });
        }

        let mut uploads = record.media_uploads.clone();
        let mut seen = HashSet::new();
        let mut attached = 0;
        for (entry, status_id) in &ready {
            for path in &entry.media_paths {
                let provider_id = provider_media_id(path);
                if !seen.insert(provider_id.clone()) {
                    continue;
                }

                let existing = uploads
                    .iter()
                    .position(|u| u.provider_media_id == provider_id);
                let index = match existing {
                    Some(i) if uploads[i].attached => continue,
                    Some(i) => i,
                    None => {
                        let Some(bytes) = self.read_media(record, entry, reader, path).await
                        else {
                            continue;
                        };
                        let file_name = path.rsplit('/').next().unwrap_or(path);
                        let media_id = self
                            .state
                            .media
                            .save_media(&record.actor_id, file_name, bytes)
                            .await?;
                        uploads.push(ArchiveMediaUpload {
                            provider_media_id: provider_id,
                            media_id,
                            status_id: status_id.clone(),
                            attached: false,
                        });
                        self.save_uploads(record, &uploads).await?;
                        uploads.len() - 1
                    }
                };

                let upload = &mut uploads[index];
                self.state
                    .media
                    .attach_media(&record.actor_id, &upload.status_id, &upload.media_id)
                    .await?;
                upload.attached = true;
                self.save_uploads(record, &uploads).await?;
                attached += 1;
            }
        }

        let batch = self
            .state
            .store
            .get_batch_files(&record.actor_id, &record.batch_id)
            .await?;
        let summary = BatchSummary::from_files(&batch);

        let update = ArchiveImportUpdate {
            next_activity_index: Some(progress.next_activity_index),
            total_activities: Some(summary.total),
            completed_activities: Some(summary.completed),
            failed_activities: Some(summary.failed),
            ..ArchiveImportUpdate::completed()
        };
        self.state
            .store
            .update_archive_import(&record.id, &update)
            .await?;
        self.delete_source(record).await?;

        tracing::info!(
            import_id = %record.id,
            actor_id = %record.actor_id,
            batch_id = %record.batch_id,
            activities = summary.total,
            failed = summary.failed,
            media = attached,
            "Archive import completed"
        );
        Ok(ArchiveOutcome::Completed)
    }

    async fn read_media(
        &self,
        record: &StravaArchiveImport,
        entry: &PendingMediaActivity,
        reader: &mut dyn ArchiveReader,
        path: &str,
    ) -> Option<Vec<u8>> {
        let bytes = if is_remote_media(path) {
            self.state.remote_media.fetch(path).await
        } else {
            reader.read_media(path)
        };
        bytes
            .map_err(|err| {
                tracing::warn!(
                    import_id = %record.id,
                    activity_id = %entry.activity_id,
                    error = %err,
                    "Skipping archive media"
                );
            })
            .ok()
    }

    async fn save_uploads(
        &self,
        record: &StravaArchiveImport,
        uploads: &[ArchiveMediaUpload],
    ) -> Result<(), AppError> {
        self.state
            .store
            .update_archive_import(&record.id, &ArchiveImportUpdate::media_uploads(uploads))
            .await
    }

    /// Terminal failure. The archive source file is kept for a later retry.
    async fn fail(
        &self,
        record: &StravaArchiveImport,
        err: ImportError,
    ) -> Result<ArchiveOutcome, AppError> {
        let message = err.to_string();
        tracing::error!(
            import_id = %record.id,
            actor_id = %record.actor_id,
            error = %message,
            "Archive import failed"
        );

        self.state
            .store
            .update_archive_import(&record.id, &ArchiveImportUpdate::failed(message.clone()))
            .await?;

        let source_update = FitnessFileUpdate {
            import_status: Some(ImportStatus::Failed),
            import_error: Some(Some(message.clone())),
            import_note: Some(None),
            ..Default::default()
        };
        match self
            .state
            .store
            .update_fitness_file(&record.archive_fitness_file_id, &source_update)
            .await
        {
            Ok(()) | Err(AppError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(ArchiveOutcome::Failed(message))
    }

    async fn delete_source(&self, record: &StravaArchiveImport) -> Result<(), AppError> {
        let source = self
            .state
            .store
            .get_fitness_file(&record.archive_fitness_file_id)
            .await?;
        if let Some(source) = source {
            self.state.blobs.delete(&source.path).await?;
            self.state.store.delete_fitness_file(&source.id).await?;
        }
        Ok(())
    }
}

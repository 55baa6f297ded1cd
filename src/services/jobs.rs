// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Dispatch of queue jobs to their handlers.
//!
//! Shared by the `/tasks/*` callbacks and the local-mode queue worker.

use crate::error::AppError;
use crate::services::archive::ArchiveImporter;
use crate::services::coordinator::BatchImportCoordinator;
use crate::services::processing;
use crate::services::tasks::{JobPayload, LocalQueue};
use crate::AppState;
use std::sync::Arc;
use std::time::Duration;

const LOCAL_RETRY_DELAY: Duration = Duration::from_secs(5);

pub async fn run_job(state: &AppState, payload: &JobPayload) -> Result<(), AppError> {
    match payload {
        JobPayload::ImportFitnessFiles(p) => {
            BatchImportCoordinator::new(state).import_files(p).await?;
        }
        JobPayload::ImportStravaArchive(p) => {
            let outcome = ArchiveImporter::new(state).run(p).await?;
            tracing::debug!(import_id = %p.import_id, outcome = ?outcome, "Archive job finished");
        }
        JobPayload::ProcessFitnessFile(p) => {
            processing::process_fitness_file(state, p).await?;
        }
        JobPayload::RegenerateFitnessMaps(p) => {
            processing::regenerate_maps(state, p).await?;
        }
    }
    Ok(())
}

/// Run jobs from the in-process queue until the process exits.
///
/// Retryable failures are put back on the queue after a short pause, the way
/// Cloud Tasks would redeliver them.
pub async fn run_local_worker(state: Arc<AppState>, queue: Arc<LocalQueue>) {
    tracing::info!("Local job worker started");
    loop {
        let mut job = queue.next_job().await;
        if let Some(delay) = job.delay.take() {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.requeue(job);
            });
            continue;
        }
        match run_job(&state, &job.payload).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!(task_id = %job.task_id, error = %e, "Job failed, retrying later");
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    tokio::time::sleep(LOCAL_RETRY_DELAY).await;
                    queue.requeue(job);
                });
            }
            Err(e) => {
                tracing::error!(task_id = %job.task_id, error = %e, "Job failed permanently");
            }
        }
    }
}

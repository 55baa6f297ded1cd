// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Task handler routes for Cloud Tasks callbacks.
//!
//! These endpoints are called by Cloud Tasks, not directly by users, and sit
//! behind `require_tasks_auth` (see routes/mod.rs).

use crate::services::jobs::run_job;
use crate::services::tasks::{
    ImportFitnessFilesPayload, ImportStravaArchivePayload, JobPayload, ProcessFitnessFilePayload,
    RegenerateFitnessMapsPayload,
};
use crate::AppState;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::post,
    Router,
};
use std::sync::Arc;

/// Task handler routes (called by Cloud Tasks).
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks/import-fitness-files", post(import_fitness_files))
        .route("/tasks/import-strava-archive", post(import_strava_archive))
        .route("/tasks/process-fitness-file", post(process_fitness_file))
        .route("/tasks/regenerate-fitness-maps", post(regenerate_fitness_maps))
}

/// Run a job and map the result to what Cloud Tasks expects.
///
/// 500 makes the queue redeliver; anything that will not get better on retry
/// is acknowledged with 200 and left in the records.
async fn handle(state: &AppState, payload: JobPayload) -> StatusCode {
    let kind = payload.kind();
    match run_job(state, &payload).await {
        Ok(()) => StatusCode::OK,
        Err(e) if e.is_retryable() => {
            tracing::error!(job = kind, error = %e, "Job failed, requesting redelivery");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(e) => {
            tracing::warn!(job = kind, error = %e, "Job failed permanently");
            StatusCode::OK
        }
    }
}

async fn import_fitness_files(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ImportFitnessFilesPayload>,
) -> StatusCode {
    tracing::info!(
        actor_id = %payload.actor_id,
        batch_id = %payload.batch_id,
        files = payload.fitness_file_ids.len(),
        "Importing fitness files from Cloud Task"
    );
    handle(&state, JobPayload::ImportFitnessFiles(payload)).await
}

async fn import_strava_archive(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ImportStravaArchivePayload>,
) -> StatusCode {
    tracing::info!(
        actor_id = %payload.actor_id,
        import_id = %payload.import_id,
        next_activity_index = ?payload.next_activity_index,
        media_attachment_retry = ?payload.media_attachment_retry,
        "Running archive import from Cloud Task"
    );
    handle(&state, JobPayload::ImportStravaArchive(payload)).await
}

async fn process_fitness_file(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProcessFitnessFilePayload>,
) -> StatusCode {
    tracing::info!(
        actor_id = %payload.actor_id,
        status_id = %payload.status_id,
        fitness_file_id = %payload.fitness_file_id,
        "Processing fitness file from Cloud Task"
    );
    handle(&state, JobPayload::ProcessFitnessFile(payload)).await
}

async fn regenerate_fitness_maps(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegenerateFitnessMapsPayload>,
) -> StatusCode {
    tracing::info!(
        actor_id = %payload.actor_id,
        files = payload.fitness_file_ids.len(),
        "Regenerating fitness maps from Cloud Task"
    );
    handle(&state, JobPayload::RegenerateFitnessMaps(payload)).await
}

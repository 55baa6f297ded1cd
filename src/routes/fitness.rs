// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitness import API for authenticated users.

use crate::config::{MAX_ROUTE_POINTS, MIN_POINTS_PER_SEGMENT};
use crate::error::{AppError, ImportError, Result};
use crate::middleware::auth::{AuthUser, MaybeAuthUser};
use crate::models::{
    ArchiveImportStatus, ArchiveImportUpdate, BatchStatus, BatchSummary, FitnessFile,
    FitnessFileType, FitnessFileUpdate, ImportStatus, PendingMediaActivity, PrivacyLocation,
    ProcessingStatus, RoutePoint, SegmentSpan, StravaArchiveImport, Visibility,
};
use crate::services::privacy::redact_route;
use crate::services::processing::parse_stored_file;
use crate::services::storage::blob_path;
use crate::services::tasks::{
    ImportFitnessFilesPayload, ImportStravaArchivePayload, Job, ProcessFitnessFilePayload,
    RegenerateFitnessMapsPayload,
};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::{Validate, ValidationError};

const PUBLIC_ROUTE_CACHE: &str = "public, max-age=86400";
const PRIVATE_ROUTE_CACHE: &str = "private, no-store";

/// Routes that require a session. Auth is applied in routes/mod.rs.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/fitness/imports", post(upload_files))
        .route("/api/fitness/{fitness_file_id}", delete(delete_fitness_file))
        .route("/api/fitness/archives", post(upload_archive))
        .route("/api/fitness/archives/{import_id}", get(get_archive_import))
        .route("/api/fitness/batches/{batch_id}", get(get_batch))
        .route("/api/fitness/batches/{batch_id}/retry", post(retry_batch))
        .route(
            "/api/fitness/privacy-locations",
            get(get_privacy_locations).put(put_privacy_locations),
        )
}

/// Routes open to anonymous viewers. Optional auth is applied in routes/mod.rs.
pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/fitness/{fitness_file_id}/route", get(get_route))
}

fn validation_error(err: validator::ValidationErrors) -> AppError {
    AppError::BadRequest(err.to_string())
}

// ─── Uploads ─────────────────────────────────────────────────

fn validate_activity_file_name(name: &str) -> std::result::Result<(), ValidationError> {
    match FitnessFileType::from_file_name(name) {
        Some(file_type) if file_type.is_activity() => Ok(()),
        _ => Err(ValidationError::new("unsupported_file_type")),
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    #[validate(
        length(min = 1, max = 255),
        custom(function = "validate_activity_file_name")
    )]
    pub file_name: String,
    /// Base64 file contents
    pub data: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadFilesRequest {
    #[serde(default)]
    pub visibility: Visibility,
    #[validate(length(min = 1, max = 50), nested)]
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFilesResponse {
    pub batch_id: String,
    pub fitness_file_ids: Vec<String>,
}

/// Store uploaded activity files as one batch and queue their import.
async fn upload_files(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<UploadFilesRequest>,
) -> Result<(StatusCode, Json<UploadFilesResponse>)> {
    request.validate().map_err(validation_error)?;

    // Decode everything before storing anything
    let mut decoded = Vec::with_capacity(request.files.len());
    for upload in &request.files {
        let bytes = STANDARD
            .decode(upload.data.as_bytes())
            .map_err(|_| AppError::BadRequest(format!("{}: invalid base64", upload.file_name)))?;
        if bytes.is_empty() {
            return Err(AppError::BadRequest(format!("{}: empty file", upload.file_name)));
        }
        let file_type = FitnessFileType::from_file_name(&upload.file_name)
            .ok_or_else(|| AppError::BadRequest(format!("{}: unsupported type", upload.file_name)))?;
        decoded.push((upload.file_name.as_str(), file_type, bytes));
    }

    let batch_id = Uuid::new_v4().to_string();
    let mut fitness_file_ids = Vec::with_capacity(decoded.len());
    for (file_name, file_type, bytes) in decoded {
        let id = Uuid::new_v4().to_string();
        let path = blob_path(&user.actor_id, &id, file_type.extension());
        state.blobs.write(&path, &bytes).await?;
        let file = FitnessFile::new_import(
            id.clone(),
            &user.actor_id,
            path,
            file_name,
            file_type,
            bytes.len() as u64,
            Some(&batch_id),
            request.visibility,
        );
        state.store.insert_fitness_file(&file).await?;
        fitness_file_ids.push(id);
    }

    let job = Job::from(ImportFitnessFilesPayload {
        actor_id: user.actor_id.clone(),
        batch_id: batch_id.clone(),
        fitness_file_ids: fitness_file_ids.clone(),
        overlap_fitness_file_ids: Vec::new(),
        visibility: request.visibility,
    });
    if let Err(e) = state.jobs.publish(&job).await {
        tracing::error!(batch_id = %batch_id, error = %e, "Failed to queue batch import");
        let message = ImportError::Publish(e.to_string()).to_string();
        for id in &fitness_file_ids {
            state
                .store
                .update_fitness_file(id, &FitnessFileUpdate::failed(message.clone()))
                .await?;
        }
    } else {
        tracing::info!(
            actor_id = %user.actor_id,
            batch_id = %batch_id,
            files = fitness_file_ids.len(),
            "Queued batch import"
        );
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadFilesResponse {
            batch_id,
            fitness_file_ids,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveUploadQuery {
    pub file_name: String,
    #[serde(default)]
    pub visibility: Visibility,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveUploadResponse {
    pub import_id: String,
    pub batch_id: String,
    pub archive_fitness_file_id: String,
}

/// Store an uploaded archive and queue its import.
async fn upload_archive(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ArchiveUploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<ArchiveUploadResponse>)> {
    if query.file_name.is_empty() || query.file_name.len() > 255 {
        return Err(AppError::BadRequest("fileName must be 1-255 characters".into()));
    }
    if FitnessFileType::from_file_name(&query.file_name) != Some(FitnessFileType::Zip) {
        return Err(AppError::BadRequest("archive must be a .zip file".into()));
    }
    if body.is_empty() {
        return Err(AppError::BadRequest("empty archive".into()));
    }

    let file_id = Uuid::new_v4().to_string();
    let path = blob_path(&user.actor_id, &file_id, FitnessFileType::Zip.extension());
    state.blobs.write(&path, &body).await?;
    // The archive itself is not a member of the batch it feeds
    let source = FitnessFile::new_import(
        file_id.clone(),
        &user.actor_id,
        path,
        &query.file_name,
        FitnessFileType::Zip,
        body.len() as u64,
        None,
        query.visibility,
    );
    state.store.insert_fitness_file(&source).await?;

    let import_id = Uuid::new_v4().to_string();
    let batch_id = Uuid::new_v4().to_string();
    let record = StravaArchiveImport::new(
        import_id.clone(),
        &user.actor_id,
        &file_id,
        batch_id.clone(),
        query.visibility,
    );
    state.store.insert_archive_import(&record).await?;

    let job = Job::from(ImportStravaArchivePayload {
        import_id: import_id.clone(),
        actor_id: user.actor_id.clone(),
        archive_id: record.archive_id.clone(),
        archive_fitness_file_id: file_id.clone(),
        batch_id: batch_id.clone(),
        visibility: query.visibility,
        next_activity_index: None,
        pending_media_activities: None,
        media_attachment_retry: None,
    });
    if let Err(e) = state.jobs.publish(&job).await {
        tracing::error!(import_id = %import_id, error = %e, "Failed to queue archive import");
        let message = ImportError::Publish(e.to_string()).to_string();
        state
            .store
            .update_archive_import(&import_id, &ArchiveImportUpdate::failed(message.clone()))
            .await?;
        let update = FitnessFileUpdate {
            import_status: Some(ImportStatus::Failed),
            import_error: Some(Some(message)),
            ..Default::default()
        };
        state.store.update_fitness_file(&file_id, &update).await?;
    } else {
        tracing::info!(
            actor_id = %user.actor_id,
            import_id = %import_id,
            batch_id = %batch_id,
            bytes = body.len(),
            "Queued archive import"
        );
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(ArchiveUploadResponse {
            import_id,
            batch_id,
            archive_fitness_file_id: file_id,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveImportResponse {
    pub import_id: String,
    pub batch_id: String,
    pub status: ArchiveImportStatus,
    pub next_activity_index: u32,
    pub total_activities: u32,
    pub completed_activities: u32,
    pub failed_activities: u32,
    pub pending_media_activities: Vec<PendingMediaActivity>,
    pub media_attachment_retry: u32,
    pub last_error: Option<String>,
}

async fn get_archive_import(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(import_id): Path<String>,
) -> Result<Json<ArchiveImportResponse>> {
    let record = state
        .store
        .get_archive_import(&import_id)
        .await?
        .filter(|r| r.actor_id == user.actor_id)
        .ok_or_else(|| AppError::NotFound(format!("Archive import {}", import_id)))?;

    Ok(Json(ArchiveImportResponse {
        import_id: record.id,
        batch_id: record.batch_id,
        status: record.status,
        next_activity_index: record.next_activity_index,
        total_activities: record.total_activities,
        completed_activities: record.completed_activities,
        failed_activities: record.failed_activities,
        pending_media_activities: record.pending_media_activities,
        media_attachment_retry: record.media_attachment_retry,
        last_error: record.last_error,
    }))
}

// ─── Batch Status ────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFileView {
    pub id: String,
    pub file_name: String,
    pub file_type: FitnessFileType,
    pub import_status: Option<ImportStatus>,
    pub import_error: Option<String>,
    pub import_note: Option<String>,
    pub processing_status: ProcessingStatus,
    pub status_id: Option<String>,
    pub is_primary: bool,
    pub activity_start_time: Option<DateTime<Utc>>,
}

impl From<&FitnessFile> for BatchFileView {
    fn from(file: &FitnessFile) -> Self {
        Self {
            id: file.id.clone(),
            file_name: file.file_name.clone(),
            file_type: file.file_type,
            import_status: file.import_status,
            import_error: file.import_error.clone(),
            import_note: file.import_note.clone(),
            processing_status: file.processing_status,
            status_id: file.status_id.clone(),
            is_primary: file.is_primary,
            activity_start_time: file.metrics.as_ref().map(|m| m.activity_start_time),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_id: String,
    pub status: BatchStatus,
    pub summary: BatchSummary,
    pub files: Vec<BatchFileView>,
}

async fn live_batch_files(
    state: &AppState,
    actor_id: &str,
    batch_id: &str,
) -> Result<Vec<FitnessFile>> {
    let files: Vec<FitnessFile> = state
        .store
        .get_batch_files(actor_id, batch_id)
        .await?
        .into_iter()
        .filter(|f| !f.is_deleted())
        .collect();
    if files.is_empty() {
        return Err(AppError::NotFound(format!("Batch {}", batch_id)));
    }
    Ok(files)
}

/// Derived batch status; nothing about the batch is stored.
async fn get_batch(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchResponse>> {
    let files = live_batch_files(&state, &user.actor_id, &batch_id).await?;
    let summary = BatchSummary::from_files(&files);

    Ok(Json(BatchResponse {
        batch_id,
        status: summary.status(),
        summary,
        files: files.iter().map(BatchFileView::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub batch_id: String,
    pub retried: u32,
}

/// Update that puts a file back the way it was before a retry reset it.
fn restore_update(file: &FitnessFile) -> FitnessFileUpdate {
    FitnessFileUpdate {
        import_status: file.import_status,
        import_error: Some(file.import_error.clone()),
        processing_status: Some(file.processing_status),
        status_id: Some(file.status_id.clone()),
        is_primary: Some(file.is_primary),
        ..Default::default()
    }
}

/// Retry the failed files of a batch.
///
/// Files whose import failed are re-imported alongside their completed
/// siblings. Primary files whose post exists but whose processing failed get
/// their processing job queued again instead, so the post is kept.
async fn retry_batch(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(batch_id): Path<String>,
) -> Result<Json<RetryResponse>> {
    let _guard = state.batch_locks.acquire(&batch_id).await;
    let files = live_batch_files(&state, &user.actor_id, &batch_id).await?;

    let failed_imports: Vec<&FitnessFile> = files
        .iter()
        .filter(|f| f.import_status == Some(ImportStatus::Failed))
        .collect();
    let failed_processing: Vec<&FitnessFile> = files
        .iter()
        .filter(|f| {
            f.import_status == Some(ImportStatus::Completed)
                && f.processing_status == ProcessingStatus::Failed
                && f.is_primary
                && f.status_id.is_some()
        })
        .collect();
    let retried = (failed_imports.len() + failed_processing.len()) as u32;
    if retried == 0 {
        return Ok(Json(RetryResponse { batch_id, retried }));
    }

    let overlap_ids: Vec<String> = files
        .iter()
        .filter(|f| f.import_status == Some(ImportStatus::Completed) && f.status_id.is_some())
        .map(|f| f.id.clone())
        .collect();
    let nonce = Uuid::new_v4().to_string();

    let mut jobs = Vec::new();
    if let Some(first) = failed_imports.first() {
        jobs.push(
            Job::from(ImportFitnessFilesPayload {
                actor_id: user.actor_id.clone(),
                batch_id: batch_id.clone(),
                fitness_file_ids: failed_imports.iter().map(|f| f.id.clone()).collect(),
                overlap_fitness_file_ids: overlap_ids,
                visibility: first.visibility,
            })
            .with_nonce(&nonce),
        );
    }
    for file in &failed_processing {
        jobs.push(
            Job::from(ProcessFitnessFilePayload {
                actor_id: user.actor_id.clone(),
                status_id: file.status_id.clone().unwrap_or_default(),
                fitness_file_id: file.id.clone(),
                publish_send_note: true,
            })
            .with_nonce(&nonce),
        );
    }

    for file in &failed_imports {
        state
            .store
            .update_fitness_file(&file.id, &FitnessFileUpdate::reset_for_retry())
            .await?;
    }
    for file in &failed_processing {
        let update = FitnessFileUpdate {
            import_error: Some(None),
            processing_status: Some(ProcessingStatus::Pending),
            ..Default::default()
        };
        state.store.update_fitness_file(&file.id, &update).await?;
    }

    for job in &jobs {
        if let Err(e) = state.jobs.publish(job).await {
            tracing::error!(batch_id = %batch_id, error = %e, "Failed to queue batch retry");
            for file in failed_imports.iter().chain(failed_processing.iter()) {
                state
                    .store
                    .update_fitness_file(&file.id, &restore_update(file))
                    .await?;
            }
            return Err(AppError::Queue(e.to_string()));
        }
    }

    tracing::info!(
        actor_id = %user.actor_id,
        batch_id = %batch_id,
        retried,
        "Queued batch retry"
    );
    Ok(Json(RetryResponse { batch_id, retried }))
}

// ─── Privacy Locations ───────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyLocationsBody {
    #[validate(length(max = 20), nested)]
    pub locations: Vec<PrivacyLocation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyLocationsResponse {
    pub locations: Vec<PrivacyLocation>,
    /// Number of posts whose maps are being rebuilt
    pub regenerating: u32,
}

async fn get_privacy_locations(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<PrivacyLocationsBody>> {
    let locations = state.store.get_privacy_locations(&user.actor_id).await?;
    Ok(Json(PrivacyLocationsBody { locations }))
}

/// Replace the actor's privacy locations and rebuild every map.
async fn put_privacy_locations(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<PrivacyLocationsBody>,
) -> Result<Json<PrivacyLocationsResponse>> {
    body.validate().map_err(validation_error)?;

    state
        .store
        .set_privacy_locations(&user.actor_id, &body.locations)
        .await?;

    let fitness_file_ids: Vec<String> = state
        .store
        .get_primary_files(&user.actor_id)
        .await?
        .into_iter()
        .filter(|f| !f.is_deleted() && f.status_id.is_some())
        .map(|f| f.id)
        .collect();
    let regenerating = fitness_file_ids.len() as u32;

    if !fitness_file_ids.is_empty() {
        // Same files with new locations must run again
        let job = Job::from(RegenerateFitnessMapsPayload {
            actor_id: user.actor_id.clone(),
            fitness_file_ids,
        })
        .with_nonce(&Uuid::new_v4().to_string());
        state
            .jobs
            .publish(&job)
            .await
            .map_err(|e| AppError::Queue(e.to_string()))?;
    }

    tracing::info!(
        actor_id = %user.actor_id,
        locations = body.locations.len(),
        regenerating,
        "Privacy locations updated"
    );
    Ok(Json(PrivacyLocationsResponse {
        locations: body.locations,
        regenerating,
    }))
}

// ─── Route Data ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub samples: Vec<RoutePoint>,
    pub segments: Vec<SegmentSpan>,
    pub total_duration_seconds: f64,
}

/// Soft-delete one of the caller's files.
///
/// The file drops out of its batch and its route stops being served.
async fn delete_fitness_file(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(fitness_file_id): Path<String>,
) -> Result<StatusCode> {
    let file = state
        .store
        .get_fitness_file(&fitness_file_id)
        .await?
        .filter(|f| f.actor_id == user.actor_id && !f.is_deleted())
        .ok_or_else(|| AppError::NotFound(format!("Fitness file {}", fitness_file_id)))?;

    state
        .store
        .update_fitness_file(&file.id, &FitnessFileUpdate::deleted(Utc::now()))
        .await?;
    tracing::info!(
        actor_id = %user.actor_id,
        fitness_file_id = %file.id,
        batch_id = ?file.import_batch_id,
        "Fitness file deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Route of an activity, redacted unless the viewer owns it.
///
/// Missing files and files the viewer may not see both return 404.
async fn get_route(
    State(state): State<Arc<AppState>>,
    Extension(MaybeAuthUser(viewer)): Extension<MaybeAuthUser>,
    Path(fitness_file_id): Path<String>,
) -> Result<Response> {
    let not_found = || AppError::NotFound(format!("Route {}", fitness_file_id));

    let file = state
        .store
        .get_fitness_file(&fitness_file_id)
        .await?
        .filter(|f| !f.is_deleted() && f.file_type.is_activity())
        .ok_or_else(not_found)?;

    let is_owner = viewer.as_ref().is_some_and(|v| v.actor_id == file.actor_id);
    if !is_owner && (!file.visibility.is_visible_to_others() || file.status_id.is_none()) {
        return Err(not_found());
    }

    let parsed = match parse_stored_file(&state, &file).await? {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(fitness_file_id = %file.id, error = %err, "Route not readable");
            return Err(not_found());
        }
    };
    let locations = state.store.get_privacy_locations(&file.actor_id).await?;
    let route = redact_route(
        parsed.points,
        &locations,
        is_owner,
        MAX_ROUTE_POINTS,
        MIN_POINTS_PER_SEGMENT,
    );

    let cache_control = if !is_owner && file.visibility == Visibility::Public {
        PUBLIC_ROUTE_CACHE
    } else {
        PRIVATE_ROUTE_CACHE
    };

    Ok((
        [(header::CACHE_CONTROL, cache_control)],
        Json(RouteResponse {
            samples: route.samples,
            segments: route.segments,
            total_duration_seconds: parsed.metrics.total_duration_seconds,
        }),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_request_validation() {
        let valid = UploadFilesRequest {
            visibility: Visibility::Public,
            files: vec![UploadedFile {
                file_name: "morning.fit.gz".into(),
                data: "AA==".into(),
            }],
        };
        assert!(valid.validate().is_ok());

        let no_files = UploadFilesRequest {
            visibility: Visibility::Public,
            files: vec![],
        };
        assert!(no_files.validate().is_err());

        let archive = UploadFilesRequest {
            visibility: Visibility::Public,
            files: vec![UploadedFile {
                file_name: "export.zip".into(),
                data: "AA==".into(),
            }],
        };
        assert!(archive.validate().is_err());
    }

    #[test]
    fn test_privacy_location_bounds() {
        let body = PrivacyLocationsBody {
            locations: vec![PrivacyLocation {
                latitude: 91.0,
                longitude: 0.0,
                hide_radius_meters: 100.0,
            }],
        };
        assert!(body.validate().is_err());

        let body = PrivacyLocationsBody {
            locations: vec![PrivacyLocation {
                latitude: 37.0,
                longitude: -122.0,
                hide_radius_meters: 0.5,
            }],
        };
        assert!(body.validate().is_err());
    }

    #[test]
    fn test_restore_update_covers_link_fields() {
        let mut file = FitnessFile::new_import(
            "f1".into(),
            "actor",
            "p".into(),
            "a.gpx",
            FitnessFileType::Gpx,
            1,
            Some("b"),
            Visibility::Public,
        );
        file.apply(&FitnessFileUpdate::failed("boom"));
        let snapshot = file.clone();

        file.apply(&FitnessFileUpdate::reset_for_retry());
        file.apply(&restore_update(&snapshot));

        assert_eq!(file.import_status, Some(ImportStatus::Failed));
        assert_eq!(file.import_error.as_deref(), Some("boom"));
        assert_eq!(file.processing_status, ProcessingStatus::Failed);
        assert_eq!(file.status_id, None);
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Post-processing of primary fitness files.
//!
//! Builds the public map preview (privacy-redacted, encoded polylines) and
//! publishes the post once the preview is stored.

use crate::config::{MAP_PREVIEW_POINTS, MIN_POINTS_PER_SEGMENT};
use crate::error::{AppError, ImportError};
use crate::models::{FitnessFile, FitnessFileUpdate, PrivacyLocation, ProcessingStatus, RoutePoint};
use crate::services::privacy::redact_route;
use crate::services::social::ParsedActivity;
use crate::services::tasks::{ProcessFitnessFilePayload, RegenerateFitnessMapsPayload};
use crate::AppState;
use geo::Coord;

/// Read a stored file and parse it.
///
/// The outer error is infrastructure trouble worth retrying; the inner one
/// means the file itself is unusable.
pub async fn parse_stored_file(
    state: &AppState,
    file: &FitnessFile,
) -> Result<Result<ParsedActivity, ImportError>, AppError> {
    let bytes = match state.blobs.read(&file.path).await {
        Ok(bytes) => bytes,
        Err(AppError::NotFound(_)) => {
            return Ok(Err(ImportError::Parse("file data is missing".to_string())))
        }
        Err(e) => return Err(e),
    };
    Ok(state.parser.parse(file.file_type, &bytes).await)
}

/// Encode the publicly visible part of a route, one polyline per segment.
pub fn map_polylines(points: Vec<RoutePoint>, locations: &[PrivacyLocation]) -> Vec<String> {
    let route = redact_route(
        points,
        locations,
        false,
        MAP_PREVIEW_POINTS,
        MIN_POINTS_PER_SEGMENT,
    );

    route
        .segments
        .iter()
        .filter_map(|span| {
            let coords = route.samples[span.start_index..span.end_index]
                .iter()
                .map(|p| Coord { x: p.lng, y: p.lat });
            match polyline::encode_coordinates(coords, 5) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping segment that cannot be encoded");
                    None
                }
            }
        })
        .collect()
}

/// Handle a `ProcessFitnessFile` job.
pub async fn process_fitness_file(
    state: &AppState,
    payload: &ProcessFitnessFilePayload,
) -> Result<(), AppError> {
    let Some(file) = state.store.get_fitness_file(&payload.fitness_file_id).await? else {
        tracing::warn!(fitness_file_id = %payload.fitness_file_id, "Fitness file gone, skipping processing");
        return Ok(());
    };
    if file.actor_id != payload.actor_id || file.is_deleted() {
        tracing::warn!(fitness_file_id = %file.id, "Fitness file not processable, skipping");
        return Ok(());
    }
    if file.status_id.as_deref() != Some(payload.status_id.as_str()) || !file.is_primary {
        tracing::info!(
            fitness_file_id = %file.id,
            status_id = %payload.status_id,
            "File is no longer the primary of this status, skipping"
        );
        return Ok(());
    }
    if file.processing_status == ProcessingStatus::Completed {
        tracing::debug!(fitness_file_id = %file.id, "Already processed");
        return Ok(());
    }

    state
        .store
        .update_fitness_file(
            &file.id,
            &FitnessFileUpdate::default().processing(ProcessingStatus::Processing),
        )
        .await?;

    let parsed = match parse_stored_file(state, &file).await? {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(fitness_file_id = %file.id, error = %err, "Processing failed");
            state
                .store
                .update_fitness_file(
                    &file.id,
                    &FitnessFileUpdate {
                        import_error: Some(Some(err.to_string())),
                        ..Default::default()
                    }
                    .processing(ProcessingStatus::Failed),
                )
                .await?;
            return Ok(());
        }
    };

    let locations = state.store.get_privacy_locations(&file.actor_id).await?;
    let polylines = map_polylines(parsed.points, &locations);
    state
        .store
        .update_fitness_file(
            &file.id,
            &FitnessFileUpdate {
                map_polylines: Some(polylines),
                metrics: file.metrics.is_none().then_some(parsed.metrics),
                ..Default::default()
            },
        )
        .await?;

    // Publish before completing so a failed publish is redone on redelivery
    if payload.publish_send_note {
        state
            .statuses
            .publish_status(&file.actor_id, &payload.status_id)
            .await?;
    }

    state
        .store
        .update_fitness_file(
            &file.id,
            &FitnessFileUpdate::default().processing(ProcessingStatus::Completed),
        )
        .await?;

    tracing::info!(
        actor_id = %file.actor_id,
        fitness_file_id = %file.id,
        status_id = %payload.status_id,
        published = payload.publish_send_note,
        "Processed fitness file"
    );
    Ok(())
}

/// Handle a `RegenerateFitnessMaps` job. Returns how many maps were rebuilt.
pub async fn regenerate_maps(
    state: &AppState,
    payload: &RegenerateFitnessMapsPayload,
) -> Result<u32, AppError> {
    let locations = state.store.get_privacy_locations(&payload.actor_id).await?;
    let files = state
        .store
        .get_fitness_files(&payload.fitness_file_ids)
        .await?;

    let mut rebuilt = 0;
    for file in files {
        if file.actor_id != payload.actor_id || file.is_deleted() || !file.is_primary {
            continue;
        }
        match parse_stored_file(state, &file).await? {
            Ok(parsed) => {
                let update = FitnessFileUpdate {
                    map_polylines: Some(map_polylines(parsed.points, &locations)),
                    ..Default::default()
                };
                state.store.update_fitness_file(&file.id, &update).await?;
                rebuilt += 1;
            }
            Err(err) => {
                tracing::warn!(fitness_file_id = %file.id, error = %err, "Could not regenerate map");
            }
        }
    }

    tracing::info!(
        actor_id = %payload.actor_id,
        requested = payload.fitness_file_ids.len(),
        rebuilt,
        "Regenerated fitness maps"
    );
    Ok(rebuilt)
}

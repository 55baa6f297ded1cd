// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Uploaded fitness file model and its per-file import state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Kind of uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "lowercase")]
pub enum FitnessFileType {
    Fit,
    Gpx,
    Tcx,
    /// Bulk archive export; never parsed as an activity itself
    Zip,
}

impl FitnessFileType {
    /// Detect the type from a file name, ignoring a trailing `.gz`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let lower = lower.strip_suffix(".gz").unwrap_or(&lower);
        match lower.rsplit_once('.')?.1 {
            "fit" => Some(Self::Fit),
            "gpx" => Some(Self::Gpx),
            "tcx" => Some(Self::Tcx),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::Gpx => "gpx",
            Self::Tcx => "tcx",
            Self::Zip => "zip",
        }
    }

    pub fn is_activity(&self) -> bool {
        !matches!(self, Self::Zip)
    }
}

/// Post visibility requested for imported activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
    Direct,
}

impl Visibility {
    /// Whether viewers other than the owner may see the activity.
    pub fn is_visible_to_others(&self) -> bool {
        matches!(self, Self::Public | Self::Unlisted)
    }
}

/// Import outcome of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Pending,
    Completed,
    Failed,
}

/// Post-processing (map data) state of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Collapsed file state used for batch aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveState {
    Pending,
    Completed,
    Failed,
}

impl EffectiveState {
    /// Collapse the two status fields: failed wins, then pending, then completed.
    ///
    /// Plain uploads carry no import status; only processing counts for them.
    pub fn of(import: Option<ImportStatus>, processing: ProcessingStatus) -> Self {
        use ImportStatus as I;
        use ProcessingStatus as P;

        match (import, processing) {
            (Some(I::Failed), _) | (_, P::Failed) => Self::Failed,
            (Some(I::Pending), _) | (_, P::Pending) | (_, P::Processing) => Self::Pending,
            (Some(I::Completed) | None, P::Completed) => Self::Completed,
        }
    }
}

/// Summary metrics derived from a parsed activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetrics {
    pub activity_start_time: DateTime<Utc>,
    pub total_duration_seconds: f64,
    pub total_distance_meters: f64,
    pub elevation_gain_meters: Option<f64>,
    pub activity_type: Option<String>,
}

impl ActivityMetrics {
    pub fn end_time(&self) -> DateTime<Utc> {
        crate::time_utils::end_after(self.activity_start_time, self.total_duration_seconds)
    }
}

/// Stored fitness file record (document ID = `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessFile {
    pub id: String,
    /// Owning actor
    pub actor_id: String,
    /// Post this file was merged into
    #[serde(default)]
    pub status_id: Option<String>,
    /// Blob storage path
    pub path: String,
    pub file_name: String,
    pub file_type: FitnessFileType,
    pub bytes: u64,
    /// Files ingested together share a batch id
    #[serde(default)]
    pub import_batch_id: Option<String>,
    /// Absent for plain, non-import uploads
    #[serde(default)]
    pub import_status: Option<ImportStatus>,
    #[serde(default)]
    pub import_error: Option<String>,
    /// Human-readable progress note (archive continuation)
    #[serde(default)]
    pub import_note: Option<String>,
    pub processing_status: ProcessingStatus,
    #[serde(default)]
    pub is_primary: bool,
    /// Visibility requested at import time
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub metrics: Option<ActivityMetrics>,
    #[serde(default)]
    pub has_map_data: bool,
    /// Encoded polylines of the publicly visible route segments
    #[serde(default)]
    pub map_polylines: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FitnessFile {
    /// New file awaiting import as part of a batch.
    #[allow(clippy::too_many_arguments)]
    pub fn new_import(
        id: String,
        actor_id: &str,
        path: String,
        file_name: &str,
        file_type: FitnessFileType,
        bytes: u64,
        batch_id: Option<&str>,
        visibility: Visibility,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            actor_id: actor_id.to_string(),
            status_id: None,
            path,
            file_name: file_name.to_string(),
            file_type,
            bytes,
            import_batch_id: batch_id.map(str::to_string),
            import_status: Some(ImportStatus::Pending),
            import_error: None,
            import_note: None,
            processing_status: ProcessingStatus::Pending,
            is_primary: false,
            visibility,
            metrics: None,
            has_map_data: false,
            map_polylines: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn effective_state(&self) -> EffectiveState {
        EffectiveState::of(self.import_status, self.processing_status)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Activity interval `[start, start + duration]`, once parsed.
    pub fn interval(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.metrics
            .as_ref()
            .map(|m| (m.activity_start_time, m.end_time()))
    }

    /// Apply a targeted update in memory.
    pub fn apply(&mut self, update: &FitnessFileUpdate) {
        if let Some(v) = update.import_status {
            self.import_status = Some(v);
        }
        if let Some(v) = &update.import_error {
            self.import_error = v.clone();
        }
        if let Some(v) = &update.import_note {
            self.import_note = v.clone();
        }
        if let Some(v) = update.processing_status {
            self.processing_status = v;
        }
        if let Some(v) = &update.status_id {
            self.status_id = v.clone();
        }
        if let Some(v) = update.is_primary {
            self.is_primary = v;
        }
        if let Some(v) = &update.metrics {
            self.metrics = Some(v.clone());
        }
        if let Some(v) = &update.map_polylines {
            self.has_map_data = !v.is_empty();
            self.map_polylines = v.clone();
        }
        if let Some(v) = update.deleted_at {
            self.deleted_at = Some(v);
        }
        self.updated_at = Utc::now();
    }
}

/// Field-level update of a [`FitnessFile`].
///
/// Only fields that are `Some` are written. Nested `Option`s distinguish
/// "leave alone" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitnessFileUpdate {
    pub import_status: Option<ImportStatus>,
    pub import_error: Option<Option<String>>,
    pub import_note: Option<Option<String>>,
    pub processing_status: Option<ProcessingStatus>,
    pub status_id: Option<Option<String>>,
    pub is_primary: Option<bool>,
    pub metrics: Option<ActivityMetrics>,
    pub map_polylines: Option<Vec<String>>,
    /// Soft delete; never cleared
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FitnessFileUpdate {
    /// Link a file to a post. The post link and primary flag always travel together.
    pub fn link(status_id: &str, is_primary: bool) -> Self {
        Self {
            import_status: Some(ImportStatus::Completed),
            import_error: Some(None),
            status_id: Some(Some(status_id.to_string())),
            is_primary: Some(is_primary),
            ..Default::default()
        }
    }

    /// Mark a file failed in both status fields and drop any post link.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            import_status: Some(ImportStatus::Failed),
            import_error: Some(Some(message.into())),
            processing_status: Some(ProcessingStatus::Failed),
            status_id: Some(None),
            is_primary: Some(false),
            ..Default::default()
        }
    }

    /// Reset a failed file so it can be imported again.
    pub fn reset_for_retry() -> Self {
        Self {
            import_status: Some(ImportStatus::Pending),
            import_error: Some(None),
            processing_status: Some(ProcessingStatus::Pending),
            status_id: Some(None),
            is_primary: Some(false),
            ..Default::default()
        }
    }

    pub fn deleted(at: DateTime<Utc>) -> Self {
        Self {
            deleted_at: Some(at),
            ..Default::default()
        }
    }

    pub fn processing(mut self, status: ProcessingStatus) -> Self {
        self.processing_status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Stored field names touched by this update (for field-masked writes).
    pub fn field_paths(&self) -> Vec<&'static str> {
        let mut paths = Vec::new();
        if self.import_status.is_some() {
            paths.push("import_status");
        }
        if self.import_error.is_some() {
            paths.push("import_error");
        }
        if self.import_note.is_some() {
            paths.push("import_note");
        }
        if self.processing_status.is_some() {
            paths.push("processing_status");
        }
        if self.status_id.is_some() {
            paths.push("status_id");
        }
        if self.is_primary.is_some() {
            paths.push("is_primary");
        }
        if self.metrics.is_some() {
            paths.push("metrics");
        }
        if self.map_polylines.is_some() {
            paths.push("has_map_data");
            paths.push("map_polylines");
        }
        if self.deleted_at.is_some() {
            paths.push("deleted_at");
        }
        paths.push("updated_at");
        paths
    }
}

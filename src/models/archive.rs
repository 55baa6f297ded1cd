// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Progress record of one bulk archive import.

use crate::models::fitness_file::Visibility;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Lifecycle of an archive import: `importing` until a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "lowercase")]
pub enum ArchiveImportStatus {
    Importing,
    Completed,
    Failed,
}

impl ArchiveImportStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Importing => false,
            Self::Completed | Self::Failed => true,
        }
    }
}

/// Archive activity staged as a fitness file, waiting for its post so the
/// activity's media can be attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "camelCase")]
pub struct PendingMediaActivity {
    pub activity_id: String,
    pub fitness_file_id: String,
    pub media_paths: Vec<String>,
}

/// Archive media saved on the social server, keyed by its archive name so a
/// redelivered job neither saves nor attaches it twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMediaUpload {
    pub provider_media_id: String,
    pub media_id: String,
    pub status_id: String,
    #[serde(default)]
    pub attached: bool,
}

/// Stored archive import record (document ID = `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StravaArchiveImport {
    pub id: String,
    pub actor_id: String,
    pub archive_id: String,
    /// The uploaded archive's own fitness file
    pub archive_fitness_file_id: String,
    /// Batch id given to every contained activity
    pub batch_id: String,
    pub visibility: Visibility,
    pub status: ArchiveImportStatus,
    /// Resume cursor into the archive's activity list
    #[serde(default)]
    pub next_activity_index: u32,
    #[serde(default)]
    pub pending_media_activities: Vec<PendingMediaActivity>,
    #[serde(default)]
    pub media_attachment_retry: u32,
    #[serde(default)]
    pub media_uploads: Vec<ArchiveMediaUpload>,
    #[serde(default)]
    pub total_activities: u32,
    #[serde(default)]
    pub completed_activities: u32,
    #[serde(default)]
    pub failed_activities: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StravaArchiveImport {
    pub fn new(
        id: String,
        actor_id: &str,
        archive_fitness_file_id: &str,
        batch_id: String,
        visibility: Visibility,
    ) -> Self {
        let now = Utc::now();
        Self {
            archive_id: archive_fitness_file_id.to_string(),
            id,
            actor_id: actor_id.to_string(),
            archive_fitness_file_id: archive_fitness_file_id.to_string(),
            batch_id,
            visibility,
            status: ArchiveImportStatus::Importing,
            next_activity_index: 0,
            pending_media_activities: Vec::new(),
            media_attachment_retry: 0,
            media_uploads: Vec::new(),
            total_activities: 0,
            completed_activities: 0,
            failed_activities: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, update: &ArchiveImportUpdate) {
        if let Some(v) = update.status {
            self.status = v;
        }
        if let Some(v) = update.next_activity_index {
            self.next_activity_index = v;
        }
        if let Some(v) = &update.pending_media_activities {
            self.pending_media_activities = v.clone();
        }
        if let Some(v) = update.media_attachment_retry {
            self.media_attachment_retry = v;
        }
        if let Some(v) = &update.media_uploads {
            self.media_uploads = v.clone();
        }
        if let Some(v) = update.total_activities {
            self.total_activities = v;
        }
        if let Some(v) = update.completed_activities {
            self.completed_activities = v;
        }
        if let Some(v) = update.failed_activities {
            self.failed_activities = v;
        }
        if let Some(v) = &update.last_error {
            self.last_error = v.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Field-level update of a [`StravaArchiveImport`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveImportUpdate {
    pub status: Option<ArchiveImportStatus>,
    pub next_activity_index: Option<u32>,
    pub pending_media_activities: Option<Vec<PendingMediaActivity>>,
    pub media_attachment_retry: Option<u32>,
    pub media_uploads: Option<Vec<ArchiveMediaUpload>>,
    pub total_activities: Option<u32>,
    pub completed_activities: Option<u32>,
    pub failed_activities: Option<u32>,
    pub last_error: Option<Option<String>>,
}

impl ArchiveImportUpdate {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(ArchiveImportStatus::Failed),
            last_error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            status: Some(ArchiveImportStatus::Completed),
            pending_media_activities: Some(Vec::new()),
            last_error: Some(None),
            ..Default::default()
        }
    }

    /// Record of archive media uploads so far.
    pub fn media_uploads(uploads: &[ArchiveMediaUpload]) -> Self {
        Self {
            media_uploads: Some(uploads.to_vec()),
            ..Default::default()
        }
    }

    pub fn field_paths(&self) -> Vec<&'static str> {
        let mut paths = Vec::new();
        if self.status.is_some() {
            paths.push("status");
        }
        if self.next_activity_index.is_some() {
            paths.push("next_activity_index");
        }
        if self.pending_media_activities.is_some() {
            paths.push("pending_media_activities");
        }
        if self.media_attachment_retry.is_some() {
            paths.push("media_attachment_retry");
        }
        if self.media_uploads.is_some() {
            paths.push("media_uploads");
        }
        if self.total_activities.is_some() {
            paths.push("total_activities");
        }
        if self.completed_activities.is_some() {
            paths.push("completed_activities");
        }
        if self.failed_activities.is_some() {
            paths.push("failed_activities");
        }
        if self.last_error.is_some() {
            paths.push("last_error");
        }
        paths.push("updated_at");
        paths
    }
}

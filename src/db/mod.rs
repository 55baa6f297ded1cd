// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Database layer.
//!
//! All mutation goes through targeted, id-keyed field updates so that
//! concurrent writers touching unrelated fields never clobber each other.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryStore;

use crate::error::AppError;
use crate::models::{
    ArchiveImportUpdate, FitnessFile, FitnessFileUpdate, PrivacyLocation, StravaArchiveImport,
};
use async_trait::async_trait;

/// Collection names as constants.
pub mod collections {
    pub const FITNESS_FILES: &str = "fitness_files";
    pub const ARCHIVE_IMPORTS: &str = "strava_archive_imports";
    /// Per-actor settings (privacy locations), keyed by actor id
    pub const ACTOR_SETTINGS: &str = "actor_settings";
}

/// Storage of fitness files, archive imports and actor settings.
#[async_trait]
pub trait FitnessStore: Send + Sync {
    // ─── Fitness Files ───────────────────────────────────────────

    /// Store a new file. Overwrites a file with the same id.
    async fn insert_fitness_file(&self, file: &FitnessFile) -> Result<(), AppError>;

    async fn get_fitness_file(&self, id: &str) -> Result<Option<FitnessFile>, AppError>;

    /// Fetch several files; missing ids are skipped, input order is kept.
    async fn get_fitness_files(&self, ids: &[String]) -> Result<Vec<FitnessFile>, AppError>;

    /// All files of an actor's import batch, oldest first.
    async fn get_batch_files(
        &self,
        actor_id: &str,
        batch_id: &str,
    ) -> Result<Vec<FitnessFile>, AppError>;

    /// All primary (post-owning) files of an actor.
    async fn get_primary_files(&self, actor_id: &str) -> Result<Vec<FitnessFile>, AppError>;

    /// Write only the fields set in `update`.
    async fn update_fitness_file(
        &self,
        id: &str,
        update: &FitnessFileUpdate,
    ) -> Result<(), AppError>;

    /// Remove a file record permanently.
    async fn delete_fitness_file(&self, id: &str) -> Result<(), AppError>;

    // ─── Archive Imports ─────────────────────────────────────────

    async fn insert_archive_import(&self, record: &StravaArchiveImport) -> Result<(), AppError>;

    async fn get_archive_import(&self, id: &str) -> Result<Option<StravaArchiveImport>, AppError>;

    async fn update_archive_import(
        &self,
        id: &str,
        update: &ArchiveImportUpdate,
    ) -> Result<(), AppError>;

    // ─── Actor Settings ──────────────────────────────────────────

    async fn get_privacy_locations(&self, actor_id: &str)
        -> Result<Vec<PrivacyLocation>, AppError>;

    async fn set_privacy_locations(
        &self,
        actor_id: &str,
        locations: &[PrivacyLocation],
    ) -> Result<(), AppError>;
}

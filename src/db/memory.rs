// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory store for local mode and tests.

use crate::db::FitnessStore;
use crate::error::AppError;
use crate::models::{
    ArchiveImportUpdate, FitnessFile, FitnessFileUpdate, PrivacyLocation, StravaArchiveImport,
};
use async_trait::async_trait;
use dashmap::DashMap;

/// Process-local store backed by concurrent maps.
#[derive(Default)]
pub struct MemoryStore {
    files: DashMap<String, FitnessFile>,
    archive_imports: DashMap<String, StravaArchiveImport>,
    privacy_locations: DashMap<String, Vec<PrivacyLocation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored file.
    pub fn all_files(&self) -> Vec<FitnessFile> {
        let mut files: Vec<FitnessFile> = self.files.iter().map(|e| e.value().clone()).collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        files
    }
}

#[async_trait]
impl FitnessStore for MemoryStore {
    async fn insert_fitness_file(&self, file: &FitnessFile) -> Result<(), AppError> {
        self.files.insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn get_fitness_file(&self, id: &str) -> Result<Option<FitnessFile>, AppError> {
        Ok(self.files.get(id).map(|f| f.value().clone()))
    }

    async fn get_fitness_files(&self, ids: &[String]) -> Result<Vec<FitnessFile>, AppError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.files.get(id).map(|f| f.value().clone()))
            .collect())
    }

    async fn get_batch_files(
        &self,
        actor_id: &str,
        batch_id: &str,
    ) -> Result<Vec<FitnessFile>, AppError> {
        Ok(self
            .all_files()
            .into_iter()
            .filter(|f| f.actor_id == actor_id && f.import_batch_id.as_deref() == Some(batch_id))
            .collect())
    }

    async fn get_primary_files(&self, actor_id: &str) -> Result<Vec<FitnessFile>, AppError> {
        Ok(self
            .all_files()
            .into_iter()
            .filter(|f| f.actor_id == actor_id && f.is_primary)
            .collect())
    }

    async fn update_fitness_file(
        &self,
        id: &str,
        update: &FitnessFileUpdate,
    ) -> Result<(), AppError> {
        let mut file = self
            .files
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Fitness file {}", id)))?;
        file.apply(update);
        Ok(())
    }

    async fn delete_fitness_file(&self, id: &str) -> Result<(), AppError> {
        self.files.remove(id);
        Ok(())
    }

    async fn insert_archive_import(&self, record: &StravaArchiveImport) -> Result<(), AppError> {
        self.archive_imports
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_archive_import(&self, id: &str) -> Result<Option<StravaArchiveImport>, AppError> {
        Ok(self.archive_imports.get(id).map(|r| r.value().clone()))
    }

    async fn update_archive_import(
        &self,
        id: &str,
        update: &ArchiveImportUpdate,
    ) -> Result<(), AppError> {
        let mut record = self
            .archive_imports
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Archive import {}", id)))?;
        record.apply(update);
        Ok(())
    }

    async fn get_privacy_locations(
        &self,
        actor_id: &str,
    ) -> Result<Vec<PrivacyLocation>, AppError> {
        Ok(self
            .privacy_locations
            .get(actor_id)
            .map(|l| l.value().clone())
            .unwrap_or_default())
    }

    async fn set_privacy_locations(
        &self,
        actor_id: &str,
        locations: &[PrivacyLocation],
    ) -> Result<(), AppError> {
        self.privacy_locations
            .insert(actor_id.to_string(), locations.to_vec());
        Ok(())
    }
}

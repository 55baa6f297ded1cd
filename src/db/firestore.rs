// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - Fitness files (uploaded and archive-staged activity files)
//! - Strava archive imports (resumable progress records)
//! - Actor settings (privacy locations)
//!
//! Updates are written with a field mask so only the changed fields reach
//! the stored document.

use crate::db::{collections, FitnessStore};
use crate::error::AppError;
use crate::models::{
    ArchiveImportUpdate, FitnessFile, FitnessFileUpdate, PrivacyLocation, StravaArchiveImport,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

const MAX_CONCURRENT_DB_OPS: usize = 50;

/// Per-actor settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ActorSettings {
    actor_id: String,
    #[serde(default)]
    privacy_locations: Vec<PrivacyLocation>,
    updated_at: String,
}

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client; every operation returns an error.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    async fn get_actor_settings(&self, actor_id: &str) -> Result<Option<ActorSettings>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::ACTOR_SETTINGS)
            .obj()
            .one(actor_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[async_trait]
impl FitnessStore for FirestoreDb {
    // ─── Fitness File Operations ─────────────────────────────────

    async fn insert_fitness_file(&self, file: &FitnessFile) -> Result<(), AppError> {
        let _: FitnessFile = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::FITNESS_FILES)
            .document_id(&file.id)
            .object(file)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_fitness_file(&self, id: &str) -> Result<Option<FitnessFile>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::FITNESS_FILES)
            .obj()
            .one(id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn get_fitness_files(&self, ids: &[String]) -> Result<Vec<FitnessFile>, AppError> {
        let fetched = stream::iter(ids.iter().cloned())
            .map(|id| async move { self.get_fitness_file(&id).await })
            .buffered(MAX_CONCURRENT_DB_OPS)
            .collect::<Vec<Result<Option<FitnessFile>, AppError>>>()
            .await;

        let mut files = Vec::with_capacity(fetched.len());
        for result in fetched {
            if let Some(file) = result? {
                files.push(file);
            }
        }
        Ok(files)
    }

    async fn get_batch_files(
        &self,
        actor_id: &str,
        batch_id: &str,
    ) -> Result<Vec<FitnessFile>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::FITNESS_FILES)
            .filter(|q| {
                q.for_all([
                    q.field("actor_id").eq(actor_id),
                    q.field("import_batch_id").eq(batch_id),
                ])
            })
            .order_by([
                ("created_at", firestore::FirestoreQueryDirection::Ascending),
                ("id", firestore::FirestoreQueryDirection::Ascending),
            ])
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn get_primary_files(&self, actor_id: &str) -> Result<Vec<FitnessFile>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::FITNESS_FILES)
            .filter(|q| {
                q.for_all([
                    q.field("actor_id").eq(actor_id),
                    q.field("is_primary").eq(true),
                ])
            })
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn update_fitness_file(
        &self,
        id: &str,
        update: &FitnessFileUpdate,
    ) -> Result<(), AppError> {
        let mut file = self
            .get_fitness_file(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Fitness file {}", id)))?;
        file.apply(update);

        let _: FitnessFile = self
            .get_client()?
            .fluent()
            .update()
            .fields(update.field_paths())
            .in_col(collections::FITNESS_FILES)
            .document_id(id)
            .object(&file)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_fitness_file(&self, id: &str) -> Result<(), AppError> {
        self.get_client()?
            .fluent()
            .delete()
            .from(collections::FITNESS_FILES)
            .document_id(id)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    // ─── Archive Import Operations ───────────────────────────────

    async fn insert_archive_import(&self, record: &StravaArchiveImport) -> Result<(), AppError> {
        let _: StravaArchiveImport = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::ARCHIVE_IMPORTS)
            .document_id(&record.id)
            .object(record)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_archive_import(&self, id: &str) -> Result<Option<StravaArchiveImport>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::ARCHIVE_IMPORTS)
            .obj()
            .one(id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn update_archive_import(
        &self,
        id: &str,
        update: &ArchiveImportUpdate,
    ) -> Result<(), AppError> {
        let mut record = self
            .get_archive_import(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Archive import {}", id)))?;
        record.apply(update);

        let _: StravaArchiveImport = self
            .get_client()?
            .fluent()
            .update()
            .fields(update.field_paths())
            .in_col(collections::ARCHIVE_IMPORTS)
            .document_id(id)
            .object(&record)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    // ─── Actor Settings Operations ───────────────────────────────

    async fn get_privacy_locations(
        &self,
        actor_id: &str,
    ) -> Result<Vec<PrivacyLocation>, AppError> {
        Ok(self
            .get_actor_settings(actor_id)
            .await?
            .map(|s| s.privacy_locations)
            .unwrap_or_default())
    }

    async fn set_privacy_locations(
        &self,
        actor_id: &str,
        locations: &[PrivacyLocation],
    ) -> Result<(), AppError> {
        let settings = ActorSettings {
            actor_id: actor_id.to_string(),
            privacy_locations: locations.to_vec(),
            updated_at: crate::time_utils::format_utc_rfc3339(chrono::Utc::now()),
        };

        let _: ActorSettings = self
            .get_client()?
            .fluent()
            .update()
            .fields(["privacy_locations", "updated_at"])
            .in_col(collections::ACTOR_SETTINGS)
            .document_id(actor_id)
            .object(&settings)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }
}

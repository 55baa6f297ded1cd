// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Response;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fitness_import::config::Config;
use fitness_import::db::{FirestoreDb, FitnessStore, MemoryStore};
use fitness_import::error::{AppError, ImportError};
use fitness_import::middleware::auth::create_jwt;
use fitness_import::models::{
    ActivityMetrics, ArchiveImportUpdate, FitnessFile, FitnessFileType, FitnessFileUpdate,
    PrivacyLocation, RoutePoint, StravaArchiveImport, Visibility,
};
use fitness_import::routes::create_router;
use fitness_import::services::jobs::run_job;
use fitness_import::services::social::{
    FitnessParser, MediaApi, ParsedActivity, StatusApi, StatusDraft,
};
use fitness_import::services::storage::{blob_path, BlobStore};
use fitness_import::services::tasks::ImportStravaArchivePayload;
use fitness_import::services::{LocalQueue, RemoteMediaClient, ZipArchiveOpener};
use fitness_import::AppState;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const ACTOR: &str = "actor-1";
pub const OTHER_ACTOR: &str = "actor-2";

/// Check if emulator is available via environment variable.
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

// ─── Fakes ───────────────────────────────────────────────────

/// Parser for a tiny text format used only in tests:
/// `start=<rfc3339>;duration=<secs>[;type=<name>][;points=lat,lng|lat,lng]`.
/// Any file containing `invalid` fails to parse.
pub struct FakeParser;

#[async_trait]
impl FitnessParser for FakeParser {
    async fn parse(
        &self,
        _file_type: FitnessFileType,
        bytes: &[u8],
    ) -> Result<ParsedActivity, ImportError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ImportError::Parse(e.to_string()))?;
        if text.contains("invalid") {
            return Err(ImportError::Parse("corrupt track".to_string()));
        }

        let mut start = None;
        let mut duration = None;
        let mut activity_type = None;
        let mut points = Vec::new();
        for part in text.trim().split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key {
                "start" => {
                    start = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|d| d.with_timezone(&Utc))
                }
                "duration" => duration = value.parse::<f64>().ok(),
                "type" => activity_type = Some(value.to_string()),
                "points" => {
                    for (i, pair) in value.split('|').enumerate() {
                        let (lat, lng) = pair.split_once(',').unwrap();
                        points.push(RoutePoint::new(
                            lat.parse().unwrap(),
                            lng.parse().unwrap(),
                            i as f64 * 10.0,
                        ));
                    }
                }
                _ => {}
            }
        }

        let (Some(start), Some(duration)) = (start, duration) else {
            return Err(ImportError::Parse("missing start or duration".to_string()));
        };
        if points.is_empty() {
            points = (0..5)
                .map(|i| RoutePoint::new(37.5 + i as f64 * 0.001, -122.3, i as f64 * 10.0))
                .collect();
        }

        Ok(ParsedActivity {
            points,
            metrics: ActivityMetrics {
                activity_start_time: start,
                total_duration_seconds: duration,
                total_distance_meters: 5000.0,
                elevation_gain_meters: None,
                activity_type,
            },
        })
    }
}

/// Records every post operation.
#[derive(Default)]
pub struct FakeStatusApi {
    next_id: AtomicU32,
    pub created: Mutex<Vec<(String, StatusDraft)>>,
    pub deleted: Mutex<Vec<String>>,
    pub published: Mutex<Vec<String>>,
    pub missing_actors: Mutex<HashSet<String>>,
}

impl FakeStatusApi {
    pub fn created_ids(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn published_ids(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }

    pub fn remove_actor(&self, actor_id: &str) {
        self.missing_actors
            .lock()
            .unwrap()
            .insert(actor_id.to_string());
    }
}

#[async_trait]
impl StatusApi for FakeStatusApi {
    async fn create_status(&self, draft: &StatusDraft) -> Result<String, AppError> {
        let id = format!("status-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.created
            .lock()
            .unwrap()
            .push((id.clone(), draft.clone()));
        Ok(id)
    }

    async fn delete_status(&self, _actor_id: &str, status_id: &str) -> Result<(), AppError> {
        self.deleted.lock().unwrap().push(status_id.to_string());
        Ok(())
    }

    async fn publish_status(&self, _actor_id: &str, status_id: &str) -> Result<(), AppError> {
        self.published.lock().unwrap().push(status_id.to_string());
        Ok(())
    }

    async fn actor_exists(&self, actor_id: &str) -> Result<bool, AppError> {
        Ok(!self.missing_actors.lock().unwrap().contains(actor_id))
    }
}

/// Saved media and attachments.
#[derive(Default)]
pub struct FakeMediaApi {
    next_id: AtomicU32,
    pub saved: Mutex<Vec<(String, Vec<u8>)>>,
    /// (status id, media id)
    pub attached: Mutex<Vec<(String, String)>>,
    attach_calls: AtomicU32,
    fail_attach_on: Mutex<Option<u32>>,
}

impl FakeMediaApi {
    /// Fail the `nth` attach call (counting from 1) once.
    pub fn fail_attach_call(&self, nth: u32) {
        *self.fail_attach_on.lock().unwrap() = Some(nth);
    }

    pub fn saved_names(&self) -> Vec<String> {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn attachments(&self) -> Vec<(String, String)> {
        self.attached.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaApi for FakeMediaApi {
    async fn save_media(
        &self,
        _actor_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, AppError> {
        self.saved
            .lock()
            .unwrap()
            .push((file_name.to_string(), bytes));
        Ok(format!(
            "media-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ))
    }

    async fn attach_media(
        &self,
        _actor_id: &str,
        status_id: &str,
        media_id: &str,
    ) -> Result<(), AppError> {
        let call = self.attach_calls.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut fail_on = self.fail_attach_on.lock().unwrap();
            if *fail_on == Some(call) {
                *fail_on = None;
                return Err(AppError::Upstream("transient".to_string()));
            }
        }
        self.attached
            .lock()
            .unwrap()
            .push((status_id.to_string(), media_id.to_string()));
        Ok(())
    }
}

/// Blob store kept in memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn contains(&self, path: &str) -> bool {
        self.blobs.contains_key(path)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), AppError> {
        self.blobs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, AppError> {
        self.blobs
            .get(path)
            .map(|b| b.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("Blob {}", path)))
    }

    async fn delete(&self, path: &str) -> Result<(), AppError> {
        self.blobs.remove(path);
        Ok(())
    }
}

/// Store whose next `n` post-link writes fail; everything else goes to
/// the wrapped memory store.
pub struct FlakyLinkStore {
    inner: Arc<MemoryStore>,
    link_failures: AtomicU32,
}

impl FlakyLinkStore {
    pub fn new(inner: Arc<MemoryStore>, link_failures: u32) -> Self {
        Self {
            inner,
            link_failures: AtomicU32::new(link_failures),
        }
    }
}

#[async_trait]
impl FitnessStore for FlakyLinkStore {
    async fn insert_fitness_file(&self, file: &FitnessFile) -> Result<(), AppError> {
        self.inner.insert_fitness_file(file).await
    }

    async fn get_fitness_file(&self, id: &str) -> Result<Option<FitnessFile>, AppError> {
        self.inner.get_fitness_file(id).await
    }

    async fn get_fitness_files(&self, ids: &[String]) -> Result<Vec<FitnessFile>, AppError> {
        self.inner.get_fitness_files(ids).await
    }

    async fn get_batch_files(
        &self,
        actor_id: &str,
        batch_id: &str,
    ) -> Result<Vec<FitnessFile>, AppError> {
        self.inner.get_batch_files(actor_id, batch_id).await
    }

    async fn get_primary_files(&self, actor_id: &str) -> Result<Vec<FitnessFile>, AppError> {
        self.inner.get_primary_files(actor_id).await
    }

    async fn update_fitness_file(
        &self,
        id: &str,
        update: &FitnessFileUpdate,
    ) -> Result<(), AppError> {
        let is_link = matches!(update.status_id, Some(Some(_)));
        if is_link
            && self
                .link_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(AppError::Database("transient".to_string()));
        }
        self.inner.update_fitness_file(id, update).await
    }

    async fn delete_fitness_file(&self, id: &str) -> Result<(), AppError> {
        self.inner.delete_fitness_file(id).await
    }

    async fn insert_archive_import(&self, record: &StravaArchiveImport) -> Result<(), AppError> {
        self.inner.insert_archive_import(record).await
    }

    async fn get_archive_import(&self, id: &str) -> Result<Option<StravaArchiveImport>, AppError> {
        self.inner.get_archive_import(id).await
    }

    async fn update_archive_import(
        &self,
        id: &str,
        update: &ArchiveImportUpdate,
    ) -> Result<(), AppError> {
        self.inner.update_archive_import(id, update).await
    }

    async fn get_privacy_locations(
        &self,
        actor_id: &str,
    ) -> Result<Vec<PrivacyLocation>, AppError> {
        self.inner.get_privacy_locations(actor_id).await
    }

    async fn set_privacy_locations(
        &self,
        actor_id: &str,
        locations: &[PrivacyLocation],
    ) -> Result<(), AppError> {
        self.inner.set_privacy_locations(actor_id, locations).await
    }
}

// ─── Test App ────────────────────────────────────────────────

pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<LocalQueue>,
    pub statuses: Arc<FakeStatusApi>,
    pub media: Arc<FakeMediaApi>,
    pub blobs: Arc<MemoryBlobStore>,
}

/// Create a test app with offline dependencies.
pub fn create_test_app() -> TestApp {
    create_test_app_with(Config::test_default())
}

pub fn create_test_app_with(config: Config) -> TestApp {
    create_test_app_wrapping_store(config, |store| store as Arc<dyn FitnessStore>)
}

/// Test app whose handlers see `wrap(store)`; `TestApp::store` stays the
/// plain memory store underneath.
pub fn create_test_app_wrapping_store(
    config: Config,
    wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn FitnessStore>,
) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(LocalQueue::new());
    let statuses = Arc::new(FakeStatusApi::default());
    let media = Arc::new(FakeMediaApi::default());
    let blobs = Arc::new(MemoryBlobStore::default());

    let state = Arc::new(AppState {
        config,
        store: wrap(store.clone()),
        blobs: blobs.clone(),
        jobs: queue.clone(),
        statuses: statuses.clone(),
        media: media.clone(),
        parser: Arc::new(FakeParser),
        archives: Arc::new(ZipArchiveOpener),
        remote_media: RemoteMediaClient::new(),
        batch_locks: Default::default(),
    });

    TestApp {
        router: create_router(state.clone()),
        state,
        store,
        queue,
        statuses,
        media,
        blobs,
    }
}

impl TestApp {
    /// Run queued jobs (including the ones they queue) until none are left.
    pub async fn run_pending_jobs(&self) -> usize {
        let mut ran = 0;
        for _ in 0..50 {
            let jobs = self.queue.take_jobs();
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                run_job(&self.state, &job.payload)
                    .await
                    .unwrap_or_else(|e| panic!("job {} failed: {}", job.task_id, e));
                ran += 1;
            }
        }
        ran
    }

    /// Store an activity file as a pending member of `batch_id`.
    pub async fn insert_activity(&self, id: &str, batch_id: &str, contents: &str) -> FitnessFile {
        self.insert_activity_for(ACTOR, id, batch_id, contents, Visibility::Public)
            .await
    }

    pub async fn insert_activity_for(
        &self,
        actor_id: &str,
        id: &str,
        batch_id: &str,
        contents: &str,
        visibility: Visibility,
    ) -> FitnessFile {
        let path = blob_path(actor_id, id, "gpx");
        self.blobs.write(&path, contents.as_bytes()).await.unwrap();
        let file = FitnessFile::new_import(
            id.to_string(),
            actor_id,
            path,
            &format!("{}.gpx", id),
            FitnessFileType::Gpx,
            contents.len() as u64,
            Some(batch_id),
            visibility,
        );
        self.store.insert_fitness_file(&file).await.unwrap();
        file
    }

    pub async fn file(&self, id: &str) -> FitnessFile {
        self.store
            .get_fitness_file(id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("file {} missing", id))
    }

    /// Store an archive the way the upload endpoint does and return the
    /// first importer payload.
    pub async fn stage_archive(&self, zip_bytes: Vec<u8>) -> ImportStravaArchivePayload {
        let source_id = "archive-src";
        let path = blob_path(ACTOR, source_id, "zip");
        self.blobs.write(&path, &zip_bytes).await.unwrap();
        let source = FitnessFile::new_import(
            source_id.to_string(),
            ACTOR,
            path,
            "export.zip",
            FitnessFileType::Zip,
            zip_bytes.len() as u64,
            None,
            Visibility::Public,
        );
        self.store.insert_fitness_file(&source).await.unwrap();

        let record = StravaArchiveImport::new(
            "import-1".to_string(),
            ACTOR,
            source_id,
            "archive-batch".to_string(),
            Visibility::Public,
        );
        self.store.insert_archive_import(&record).await.unwrap();

        ImportStravaArchivePayload {
            import_id: record.id.clone(),
            actor_id: ACTOR.to_string(),
            archive_id: record.archive_id.clone(),
            archive_fitness_file_id: source_id.to_string(),
            batch_id: record.batch_id.clone(),
            visibility: Visibility::Public,
            next_activity_index: None,
            pending_media_activities: None,
            media_attachment_retry: None,
        }
    }
}

// ─── Builders ────────────────────────────────────────────────

/// Contents of an activity for [`FakeParser`].
pub fn activity(start: &str, duration_secs: u32) -> String {
    format!("start={};duration={};type=Run", start, duration_secs)
}

/// Activity with an explicit track.
pub fn activity_with_points(start: &str, duration_secs: u32, points: &[(f64, f64)]) -> String {
    let track: Vec<String> = points
        .iter()
        .map(|(lat, lng)| format!("{},{}", lat, lng))
        .collect();
    format!(
        "{};points={}",
        activity(start, duration_secs),
        track.join("|")
    )
}

/// Build a zip archive from `(name, bytes)` entries.
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Create a JWT for testing.
pub fn create_test_jwt(actor_id: &str, signing_key: &[u8]) -> String {
    create_jwt(actor_id, signing_key).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

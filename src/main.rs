// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitness Import API Server
//!
//! Imports uploaded activity files and Strava archive exports into posts,
//! driven by Cloud Tasks callbacks (or an in-process queue in local mode).

use fitness_import::{
    config::Config,
    db::{FirestoreDb, FitnessStore, MemoryStore},
    services::{
        self, JobPublisher, LocalBlobStore, LocalQueue, RemoteMediaClient, SocialClient,
        TasksService, ZipArchiveOpener,
    },
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        local_mode = config.local_mode,
        "Starting Fitness Import API"
    );

    let social = Arc::new(SocialClient::new(
        &config.social_api_url,
        &config.social_api_token,
    ));
    let blobs = Arc::new(LocalBlobStore::new(&config.storage_root));

    // Local mode keeps everything in process; otherwise Firestore + Cloud Tasks
    let store: Arc<dyn FitnessStore>;
    let jobs: Arc<dyn JobPublisher>;
    let mut local_queue = None;
    if config.local_mode {
        let queue = Arc::new(LocalQueue::new());
        tracing::info!("Using in-memory store and local job queue");
        store = Arc::new(MemoryStore::new());
        jobs = queue.clone();
        local_queue = Some(queue);
    } else {
        store = Arc::new(FirestoreDb::new(&config.gcp_project_id).await?);
        jobs = Arc::new(TasksService::new(
            &config.gcp_project_id,
            &config.gcp_region,
            &config.api_url,
            &config.tasks_auth_token,
        ));
        tracing::info!(
            project = %config.gcp_project_id,
            "Cloud Tasks service initialized"
        );
    }

    // Build shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        blobs,
        jobs,
        statuses: social.clone(),
        media: social.clone(),
        parser: social,
        archives: Arc::new(ZipArchiveOpener),
        remote_media: RemoteMediaClient::new(),
        batch_locks: Default::default(),
    });

    if let Some(queue) = local_queue {
        tokio::spawn(services::jobs::run_local_worker(state.clone(), queue));
    }

    // Build router
    let app = fitness_import::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fitness_import=debug,info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();
}

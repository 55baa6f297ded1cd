// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Secrets are injected as environment variables by the deployment (Cloud Run
//! secret bindings), so everything is read once at startup.

use std::env;
use std::time::Duration;

/// Cloud Tasks queue that carries every import job.
pub const TASKS_QUEUE_NAME: &str = "fitness-import";

/// Maximum number of route points returned to a client.
pub const MAX_ROUTE_POINTS: usize = 1500;

/// Every surviving route segment keeps at least this many points.
pub const MIN_POINTS_PER_SEGMENT: usize = 2;

/// Point cap for the stored map preview polyline.
pub const MAP_PREVIEW_POINTS: usize = 500;

const DEFAULT_ARCHIVE_TIME_BUDGET_SECS: u64 = 240;
const DEFAULT_MEDIA_ATTACHMENT_MAX_RETRIES: u32 = 12;
const DEFAULT_MEDIA_RETRY_DELAY_SECS: u64 = 10;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Environment Variables (non-sensitive) ---
    /// Public URL of this service (Cloud Tasks callback target)
    pub api_url: String,
    /// Frontend URL for CORS
    pub frontend_url: String,
    /// GCP project ID
    pub gcp_project_id: String,
    /// GCP region hosting the task queue
    pub gcp_region: String,
    /// Server port
    pub port: u16,
    /// Base URL of the social server's internal API
    pub social_api_url: String,
    /// Root directory for uploaded file bytes
    pub storage_root: String,
    /// Use the in-memory store and in-process queue instead of GCP
    pub local_mode: bool,

    // --- Import tuning ---
    /// Wall-clock budget for one archive importer invocation
    pub archive_time_budget: Duration,
    /// Media attachment requeues allowed before the import fails
    pub media_attachment_max_retries: u32,
    /// Delivery delay of a requeued media attachment retry
    pub media_retry_delay: Duration,
    /// Largest accepted upload body
    pub max_upload_bytes: usize,

    // --- Secrets ---
    /// JWT signing key for session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,
    /// Shared bearer token presented by queue callbacks
    pub tasks_auth_token: String,
    /// Bearer token for the social server's internal API
    pub social_api_token: String,
}

impl Config {
    /// Default config for testing only.
    pub fn test_default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            frontend_url: "http://localhost:5173".to_string(),
            gcp_project_id: "test-project".to_string(),
            gcp_region: "us-west1".to_string(),
            port: 8080,
            social_api_url: "http://localhost:3000".to_string(),
            storage_root: "/tmp/fitness-import-test".to_string(),
            local_mode: true,
            archive_time_budget: Duration::from_secs(DEFAULT_ARCHIVE_TIME_BUDGET_SECS),
            media_attachment_max_retries: DEFAULT_MEDIA_ATTACHMENT_MAX_RETRIES,
            media_retry_delay: Duration::ZERO,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            tasks_auth_token: "test_tasks_token".to_string(),
            social_api_token: "test_social_token".to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            api_url: env::var("API_URL").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            gcp_region: env::var("GCP_REGION").unwrap_or_else(|_| "us-west1".to_string()),
            port: parse_or("PORT", 8080),
            social_api_url: env::var("SOCIAL_API_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            storage_root: env::var("STORAGE_ROOT").unwrap_or_else(|_| "./data/uploads".to_string()),
            local_mode: env::var("LOCAL_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),

            archive_time_budget: Duration::from_secs(parse_or(
                "ARCHIVE_TIME_BUDGET_SECS",
                DEFAULT_ARCHIVE_TIME_BUDGET_SECS,
            )),
            media_attachment_max_retries: parse_or(
                "MEDIA_ATTACHMENT_MAX_RETRIES",
                DEFAULT_MEDIA_ATTACHMENT_MAX_RETRIES,
            ),
            media_retry_delay: Duration::from_secs(parse_or(
                "MEDIA_RETRY_DELAY_SECS",
                DEFAULT_MEDIA_RETRY_DELAY_SECS,
            )),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),

            jwt_signing_key: env::var("JWT_SIGNING_KEY")
                .map_err(|_| ConfigError::Missing("JWT_SIGNING_KEY"))?
                .into_bytes(),
            tasks_auth_token: env::var("TASKS_AUTH_TOKEN")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("TASKS_AUTH_TOKEN"))?,
            social_api_token: env::var("SOCIAL_API_TOKEN")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

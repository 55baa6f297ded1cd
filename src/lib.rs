// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Fitness import: turn uploaded activity files and bulk archive exports
//! into posts.
//!
//! This crate provides the backend API and queue workers for importing
//! fitness activities, tracking per-batch progress and serving
//! privacy-redacted routes.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::FitnessStore;
use services::{
    ArchiveOpener, BatchLocks, BlobStore, FitnessParser, JobPublisher, MediaApi,
    RemoteMediaClient, StatusApi,
};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn FitnessStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub jobs: Arc<dyn JobPublisher>,
    pub statuses: Arc<dyn StatusApi>,
    pub media: Arc<dyn MediaApi>,
    pub parser: Arc<dyn FitnessParser>,
    pub archives: Arc<dyn ArchiveOpener>,
    pub remote_media: RemoteMediaClient,
    pub batch_locks: BatchLocks,
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod archive;
pub mod archive_reader;
pub mod coordinator;
pub mod jobs;
pub mod privacy;
pub mod processing;
pub mod public_target;
pub mod social;
pub mod storage;
pub mod tasks;

pub use archive::{ArchiveImporter, ArchiveOutcome};
pub use archive_reader::{ArchiveOpener, ArchiveReader, ZipArchiveOpener};
pub use coordinator::{BatchImportCoordinator, BatchLocks, ImportReport};
pub use public_target::RemoteMediaClient;
pub use social::{FitnessParser, MediaApi, SocialClient, StatusApi};
pub use storage::{BlobStore, LocalBlobStore};
pub use tasks::{JobPublisher, LocalQueue, TasksService};

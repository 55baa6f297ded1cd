// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod archive;
pub mod batch;
pub mod fitness_file;
pub mod privacy;

pub use archive::{
    ArchiveImportStatus, ArchiveImportUpdate, ArchiveMediaUpload, PendingMediaActivity,
    StravaArchiveImport,
};
pub use batch::{BatchStatus, BatchSummary};
pub use fitness_file::{
    ActivityMetrics, EffectiveState, FitnessFile, FitnessFileType, FitnessFileUpdate,
    ImportStatus, ProcessingStatus, Visibility,
};
pub use privacy::{PrivacyLocation, RoutePoint, RouteSegment, SegmentSpan};

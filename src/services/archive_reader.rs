// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Reader for bulk Strava export archives.
//!
//! An export is a zip holding `activities.csv` plus the referenced activity
//! files (often gzipped) and media. Activities are listed in CSV order, which
//! is the order the importer walks them in.

use crate::error::ImportError;
use crate::models::FitnessFileType;
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use std::path::{Component, Path};
use zip::ZipArchive;

const ACTIVITIES_CSV: &str = "activities.csv";
const MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

/// One activity listed by the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveActivity {
    pub activity_id: String,
    /// Archive path of the activity file
    pub file_name: String,
    pub file_type: FitnessFileType,
    /// Archive paths or URLs of attached media
    pub media_paths: Vec<String>,
}

/// Random-access view of an opened archive.
pub trait ArchiveReader: Send {
    /// Activities in archive order.
    fn activities(&self) -> &[ArchiveActivity];

    /// Read an activity file, decompressing `.gz` files.
    fn read_activity_file(&mut self, activity: &ArchiveActivity) -> Result<Vec<u8>, ImportError>;

    /// Read a media entry by archive path.
    fn read_media(&mut self, path: &str) -> Result<Vec<u8>, ImportError>;
}

/// Opens stored archive bytes.
pub trait ArchiveOpener: Send + Sync {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn ArchiveReader>, ImportError>;
}

/// Opener for zip exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiveOpener;

impl ArchiveOpener for ZipArchiveOpener {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn ArchiveReader>, ImportError> {
        Ok(Box::new(ZipArchiveReader::new(bytes)?))
    }
}

pub struct ZipArchiveReader {
    zip: ZipArchive<Cursor<Vec<u8>>>,
    /// Directory holding `activities.csv`, with trailing slash (or empty)
    root: String,
    activities: Vec<ArchiveActivity>,
}

impl ZipArchiveReader {
    pub fn new(bytes: Vec<u8>) -> Result<Self, ImportError> {
        let mut zip = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ImportError::ArchiveOpen(e.to_string()))?;

        let csv_name = zip
            .file_names()
            .filter(|name| *name == ACTIVITIES_CSV || name.ends_with("/activities.csv"))
            .min_by_key(|name| name.len())
            .map(str::to_string)
            .ok_or_else(|| ImportError::ArchiveOpen("activities.csv not found".to_string()))?;
        let root = csv_name.trim_end_matches(ACTIVITIES_CSV).to_string();

        let csv_bytes = read_entry(&mut zip, &csv_name)?;
        let activities = parse_activities(&csv_bytes)?;

        Ok(Self {
            zip,
            root,
            activities,
        })
    }

    fn entry_name(&self, path: &str) -> Result<String, ImportError> {
        Ok(format!("{}{}", self.root, safe_entry_path(path)?))
    }
}

impl ArchiveReader for ZipArchiveReader {
    fn activities(&self) -> &[ArchiveActivity] {
        &self.activities
    }

    fn read_activity_file(&mut self, activity: &ArchiveActivity) -> Result<Vec<u8>, ImportError> {
        let name = self.entry_name(&activity.file_name)?;
        let raw = read_entry(&mut self.zip, &name).map_err(|e| match e {
            ImportError::ArchiveOpen(msg) => ImportError::Parse(msg),
            other => other,
        })?;

        if !name.to_ascii_lowercase().ends_with(".gz") {
            return Ok(raw);
        }

        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice())
            .take(MAX_ENTRY_BYTES)
            .read_to_end(&mut out)
            .map_err(|e| ImportError::Parse(format!("{}: {}", activity.file_name, e)))?;
        Ok(out)
    }

    fn read_media(&mut self, path: &str) -> Result<Vec<u8>, ImportError> {
        let name = self.entry_name(path)?;
        read_entry(&mut self.zip, &name)
    }
}

fn read_entry(zip: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Result<Vec<u8>, ImportError> {
    let file = zip
        .by_name(name)
        .map_err(|e| ImportError::ArchiveOpen(format!("{}: {}", name, e)))?;
    if file.size() > MAX_ENTRY_BYTES {
        return Err(ImportError::ArchiveOpen(format!("{}: entry too large", name)));
    }

    let mut out = Vec::with_capacity(file.size() as usize);
    file.take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ImportError::ArchiveOpen(format!("{}: {}", name, e)))?;
    Ok(out)
}

/// Reject absolute paths and parent-directory escapes.
pub fn safe_entry_path(path: &str) -> Result<&str, ImportError> {
    let trimmed = path.trim();
    let is_plain = !trimmed.is_empty()
        && Path::new(trimmed)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !is_plain || trimmed.contains('\\') {
        return Err(ImportError::UnsafeMediaTarget(path.to_string()));
    }
    Ok(trimmed.trim_start_matches("./"))
}

/// Whether a media reference is a remote URL rather than an archive path.
pub fn is_remote_media(path: &str) -> bool {
    let lower = path.trim().to_ascii_lowercase();
    lower.contains("://")
}

/// Media id assigned by the export: the file stem of the path or URL.
pub fn provider_media_id(path: &str) -> String {
    let without_query = path.split(['?', '#']).next().unwrap_or(path);
    let last = without_query
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(without_query);
    last.split('.').next().unwrap_or(last).to_string()
}

fn parse_activities(csv_bytes: &[u8]) -> Result<Vec<ArchiveActivity>, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_bytes);

    let headers = reader
        .headers()
        .map_err(|e| ImportError::ArchiveOpen(format!("activities.csv: {}", e)))?
        .clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);

    let id_col = column("Activity ID")
        .ok_or_else(|| ImportError::ArchiveOpen("activities.csv has no Activity ID".to_string()))?;
    let file_col = column("Filename")
        .ok_or_else(|| ImportError::ArchiveOpen("activities.csv has no Filename".to_string()))?;
    let media_col = column("Media");

    let mut activities = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| ImportError::ArchiveOpen(format!("activities.csv: {}", e)))?;

        let activity_id = record.get(id_col).unwrap_or_default().trim().to_string();
        let file_name = record.get(file_col).unwrap_or_default().trim().to_string();
        if activity_id.is_empty() || file_name.is_empty() {
            // Manual entries have no file
            continue;
        }

        let Some(file_type) = FitnessFileType::from_file_name(&file_name) else {
            tracing::debug!(activity_id = %activity_id, file = %file_name, "Skipping unsupported activity file");
            continue;
        };
        if !file_type.is_activity() {
            continue;
        }

        let media_paths = media_col
            .and_then(|c| record.get(c))
            .map(|m| {
                m.split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        activities.push(ArchiveActivity {
            activity_id,
            file_name,
            file_type,
            media_paths,
        });
    }
    Ok(activities)
}

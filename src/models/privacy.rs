// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Route points, segments and the privacy zones that hide them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// A zone around which route points are hidden (e.g. home).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "camelCase")]
pub struct PrivacyLocation {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    #[validate(range(min = 1.0, max = 10000.0))]
    pub hide_radius_meters: f64,
}

/// One track point of a parsed activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "camelCase")]
pub struct RoutePoint {
    pub lat: f64,
    pub lng: f64,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_hidden_by_privacy: bool,
}

impl RoutePoint {
    pub fn new(lat: f64, lng: f64, elapsed_seconds: f64) -> Self {
        Self {
            lat,
            lng,
            elapsed_seconds,
            timestamp: None,
            is_hidden_by_privacy: false,
        }
    }
}

/// Maximal run of consecutive points sharing the same hidden flag.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSegment {
    pub is_hidden_by_privacy: bool,
    pub points: Vec<RoutePoint>,
}

/// Position of a segment inside a flattened sample list (`end_index` exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "camelCase")]
pub struct SegmentSpan {
    pub start_index: usize,
    pub end_index: usize,
    pub is_hidden_by_privacy: bool,
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Route privacy redaction.
//!
//! Pure functions over route points: mark points near an actor's privacy
//! locations, split the route into runs of equal visibility, drop hidden runs
//! for viewers other than the owner, and cap the number of emitted points.

use crate::models::{PrivacyLocation, RoutePoint, RouteSegment, SegmentSpan};
use geo::{Distance, Haversine, Point};
use serde::Serialize;

/// Route ready to hand to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedactedRoute {
    pub samples: Vec<RoutePoint>,
    pub segments: Vec<SegmentSpan>,
}

/// Whether a coordinate lies within any location's hide radius.
pub fn is_hidden(lat: f64, lng: f64, locations: &[PrivacyLocation]) -> bool {
    let here = Point::new(lng, lat);
    locations.iter().any(|loc| {
        let center = Point::new(loc.longitude, loc.latitude);
        Haversine.distance(here, center) <= loc.hide_radius_meters
    })
}

/// Set `is_hidden_by_privacy` on every point.
pub fn annotate(points: &mut [RoutePoint], locations: &[PrivacyLocation]) {
    for point in points.iter_mut() {
        point.is_hidden_by_privacy = is_hidden(point.lat, point.lng, locations);
    }
}

/// Split annotated points into maximal runs sharing the same hidden flag.
pub fn segment(points: Vec<RoutePoint>) -> Vec<RouteSegment> {
    let mut segments: Vec<RouteSegment> = Vec::new();
    for point in points {
        match segments.last_mut() {
            Some(current) if current.is_hidden_by_privacy == point.is_hidden_by_privacy => {
                current.points.push(point);
            }
            _ => segments.push(RouteSegment {
                is_hidden_by_privacy: point.is_hidden_by_privacy,
                points: vec![point],
            }),
        }
    }
    segments
}

/// Keep hidden segments only for the owner.
pub fn visible_segments(segments: Vec<RouteSegment>, include_hidden: bool) -> Vec<RouteSegment> {
    if include_hidden {
        return segments;
    }
    segments
        .into_iter()
        .filter(|s| !s.is_hidden_by_privacy)
        .collect()
}

/// Reduce the total point count to `max_points`.
///
/// Each segment first receives `min(len, min_per_segment)` points; the rest of
/// the budget is shared in proportion to the points each segment has left.
/// Points are picked by striding across the segment, so the first and last
/// points always survive. The per-segment minimum wins over the cap when the
/// two conflict.
pub fn downsample(
    segments: Vec<RouteSegment>,
    max_points: usize,
    min_per_segment: usize,
) -> Vec<RouteSegment> {
    let total: usize = segments.iter().map(|s| s.points.len()).sum();
    if total <= max_points {
        return segments;
    }

    let lens: Vec<usize> = segments.iter().map(|s| s.points.len()).collect();
    let mut alloc: Vec<usize> = lens.iter().map(|&len| len.min(min_per_segment)).collect();

    let reserved: usize = alloc.iter().sum();
    let budget = max_points.saturating_sub(reserved);
    let spare: usize = lens.iter().zip(&alloc).map(|(len, a)| len - a).sum();

    if budget > 0 && spare > 0 {
        for (a, len) in alloc.iter_mut().zip(&lens) {
            let extra = len - *a;
            *a += budget * extra / spare;
        }

        // Hand out what flooring left over, in route order
        let mut leftover = max_points.saturating_sub(alloc.iter().sum());
        for (a, len) in alloc.iter_mut().zip(&lens) {
            if leftover == 0 {
                break;
            }
            if *a < *len {
                let add = (*len - *a).min(leftover);
                *a += add;
                leftover -= add;
            }
        }
    }

    segments
        .into_iter()
        .zip(alloc)
        .map(|(seg, keep)| RouteSegment {
            is_hidden_by_privacy: seg.is_hidden_by_privacy,
            points: stride(seg.points, keep),
        })
        .collect()
}

/// Pick `keep` evenly spaced points, including both ends.
fn stride(points: Vec<RoutePoint>, keep: usize) -> Vec<RoutePoint> {
    let len = points.len();
    if keep >= len {
        return points;
    }
    if keep <= 1 {
        return points.into_iter().take(keep).collect();
    }

    let step = (len - 1) as f64 / (keep - 1) as f64;
    let mut wanted = (0..keep).map(|j| (j as f64 * step).round() as usize).peekable();

    points
        .into_iter()
        .enumerate()
        .filter_map(|(i, p)| {
            if wanted.peek() == Some(&i) {
                wanted.next();
                Some(p)
            } else {
                None
            }
        })
        .collect()
}

/// Concatenate segments, recording where each one starts and ends.
pub fn flatten(segments: Vec<RouteSegment>) -> RedactedRoute {
    let mut samples = Vec::new();
    let mut spans = Vec::with_capacity(segments.len());
    for seg in segments {
        let start_index = samples.len();
        samples.extend(seg.points);
        spans.push(SegmentSpan {
            start_index,
            end_index: samples.len(),
            is_hidden_by_privacy: seg.is_hidden_by_privacy,
        });
    }
    RedactedRoute {
        samples,
        segments: spans,
    }
}

/// Full pipeline: annotate, segment, filter, downsample, flatten.
pub fn redact_route(
    mut points: Vec<RoutePoint>,
    locations: &[PrivacyLocation],
    include_hidden: bool,
    max_points: usize,
    min_per_segment: usize,
) -> RedactedRoute {
    annotate(&mut points, locations);
    let segments = visible_segments(segment(points), include_hidden);
    flatten(downsample(segments, max_points, min_per_segment))
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Route viewing and privacy location endpoints.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use fitness_import::db::FitnessStore;
use fitness_import::models::{FitnessFileUpdate, PrivacyLocation, ProcessingStatus, Visibility};
use fitness_import::services::tasks::JobPayload;
use serde_json::json;
use tower::ServiceExt;

mod common;
use common::{activity_with_points, body_json, TestApp, ACTOR, OTHER_ACTOR};

fn home() -> PrivacyLocation {
    PrivacyLocation {
        latitude: 37.4,
        longitude: -122.2,
        hide_radius_meters: 200.0,
    }
}

/// Ten points heading north from home, roughly 111 m apart.
fn track_from_home() -> String {
    let points: Vec<(f64, f64)> = (0..10)
        .map(|i| (37.4 + i as f64 * 0.001, -122.2))
        .collect();
    activity_with_points("2025-05-01T08:00:00Z", 3600, &points)
}

/// A posted primary file for `actor_id` with the given visibility.
async fn posted_file(app: &TestApp, actor_id: &str, id: &str, visibility: Visibility) {
    app.insert_activity_for(actor_id, id, "b1", &track_from_home(), visibility)
        .await;
    app.store
        .update_fitness_file(
            id,
            &FitnessFileUpdate::link(&format!("status-{}", id), true)
                .processing(ProcessingStatus::Completed),
        )
        .await
        .unwrap();
}

fn route_request(app: &TestApp, id: &str, viewer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(format!("/api/fitness/{}/route", id));
    if let Some(actor_id) = viewer {
        let token = common::create_test_jwt(actor_id, &app.state.config.jwt_signing_key);
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_anonymous_view_drops_hidden_points() {
    let app = common::create_test_app();
    posted_file(&app, ACTOR, "r1", Visibility::Public).await;
    app.store
        .set_privacy_locations(ACTOR, &[home()])
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(route_request(&app, "r1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=86400"
    );

    let body = body_json(response).await;
    assert_eq!(body["samples"].as_array().unwrap().len(), 8);
    assert_eq!(
        body["segments"],
        json!([{"startIndex": 0, "endIndex": 8, "isHiddenByPrivacy": false}])
    );
    assert_eq!(body["totalDurationSeconds"], 3600.0);
}

#[tokio::test]
async fn test_owner_sees_hidden_segments() {
    let app = common::create_test_app();
    posted_file(&app, ACTOR, "r1", Visibility::Public).await;
    app.store
        .set_privacy_locations(ACTOR, &[home()])
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(route_request(&app, "r1", Some(ACTOR)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "private, no-store"
    );

    let body = body_json(response).await;
    assert_eq!(body["samples"].as_array().unwrap().len(), 10);
    assert_eq!(
        body["segments"],
        json!([
            {"startIndex": 0, "endIndex": 2, "isHiddenByPrivacy": true},
            {"startIndex": 2, "endIndex": 10, "isHiddenByPrivacy": false},
        ])
    );
}

#[tokio::test]
async fn test_other_actor_gets_public_view() {
    let app = common::create_test_app();
    posted_file(&app, ACTOR, "r1", Visibility::Public).await;
    app.store
        .set_privacy_locations(ACTOR, &[home()])
        .await
        .unwrap();

    let body = body_json(
        app.router
            .clone()
            .oneshot(route_request(&app, "r1", Some(OTHER_ACTOR)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["samples"].as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn test_unlisted_route_is_not_publicly_cached() {
    let app = common::create_test_app();
    posted_file(&app, ACTOR, "r1", Visibility::Unlisted).await;

    let response = app
        .router
        .clone()
        .oneshot(route_request(&app, "r1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "private, no-store"
    );
}

#[tokio::test]
async fn test_private_route_is_hidden_from_others() {
    let app = common::create_test_app();
    posted_file(&app, ACTOR, "r1", Visibility::Private).await;

    for viewer in [None, Some(OTHER_ACTOR)] {
        let response = app
            .router
            .clone()
            .oneshot(route_request(&app, "r1", viewer))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    let response = app
        .router
        .clone()
        .oneshot(route_request(&app, "r1", Some(ACTOR)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unposted_or_missing_route_is_not_found() {
    let app = common::create_test_app();
    // Imported but never linked to a post
    app.insert_activity("pending", "b1", &track_from_home())
        .await;

    for id in ["pending", "missing"] {
        let response = app
            .router
            .clone()
            .oneshot(route_request(&app, id, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_deleted_route_is_not_found() {
    let app = common::create_test_app();
    posted_file(&app, ACTOR, "r1", Visibility::Public).await;
    let token = common::create_test_jwt(ACTOR, &app.state.config.jwt_signing_key);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/fitness/r1")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    for viewer in [None, Some(ACTOR)] {
        let response = app
            .router
            .clone()
            .oneshot(route_request(&app, "r1", viewer))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_privacy_locations_update_rebuilds_maps() {
    let app = common::create_test_app();
    posted_file(&app, ACTOR, "r1", Visibility::Public).await;
    posted_file(&app, OTHER_ACTOR, "theirs", Visibility::Public).await;
    let token = common::create_test_jwt(ACTOR, &app.state.config.jwt_signing_key);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/fitness/privacy-locations")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"locations": [
                        {"latitude": 37.4, "longitude": -122.2, "hideRadiusMeters": 200.0}
                    ]})
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["regenerating"], 1);

    let published = app.queue.published();
    assert_eq!(published.len(), 1);
    match &published[0].payload {
        JobPayload::RegenerateFitnessMaps(p) => {
            assert_eq!(p.actor_id, ACTOR);
            assert_eq!(p.fitness_file_ids, vec!["r1"]);
        }
        other => panic!("unexpected job {:?}", other),
    }

    app.run_pending_jobs().await;
    let file = app.file("r1").await;
    assert!(file.has_map_data);
    assert_eq!(file.map_polylines.len(), 1);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/fitness/privacy-locations")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await["locations"][0]["hideRadiusMeters"],
        200.0
    );
}

#[tokio::test]
async fn test_privacy_locations_rejects_out_of_range() {
    let app = common::create_test_app();
    let token = common::create_test_jwt(ACTOR, &app.state.config.jwt_signing_key);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/fitness/privacy-locations")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"locations": [
                        {"latitude": 120.0, "longitude": 0.0, "hideRadiusMeters": 200.0}
                    ]})
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app
        .store
        .get_privacy_locations(ACTOR)
        .await
        .unwrap()
        .is_empty());
    assert!(app.queue.published().is_empty());
}

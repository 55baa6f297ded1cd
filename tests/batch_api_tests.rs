// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Batch status, retry and upload endpoints.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fitness_import::db::FitnessStore;
use fitness_import::models::{FitnessFileUpdate, ImportStatus, ProcessingStatus};
use fitness_import::services::tasks::JobPayload;
use serde_json::json;
use tower::ServiceExt;

mod common;
use common::{activity, body_json, build_zip, TestApp, ACTOR, OTHER_ACTOR};

fn bearer(app: &TestApp, actor_id: &str) -> String {
    format!(
        "Bearer {}",
        common::create_test_jwt(actor_id, &app.state.config.jwt_signing_key)
    )
}

fn get(app: &TestApp, uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::AUTHORIZATION, bearer(app, ACTOR))
        .body(Body::empty())
        .unwrap()
}

fn post_json(app: &TestApp, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, bearer(app, ACTOR))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Batch `b1` with one linked, fully processed file and one failed file.
async fn partially_failed_batch(app: &TestApp) {
    app.insert_activity("f1", "b1", &activity("2025-05-01T08:00:00Z", 3600))
        .await;
    app.insert_activity("f2", "b1", &activity("2025-05-01T08:30:00Z", 600))
        .await;
    app.store
        .update_fitness_file(
            "f1",
            &FitnessFileUpdate::link("s1", true).processing(ProcessingStatus::Completed),
        )
        .await
        .unwrap();
    app.store
        .update_fitness_file("f2", &FitnessFileUpdate::failed("boom"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_batch_status_is_derived_from_files() {
    let app = common::create_test_app();
    partially_failed_batch(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(get(&app, "/api/fitness/batches/b1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "private, no-store"
    );

    let body = body_json(response).await;
    assert_eq!(body["batchId"], "b1");
    assert_eq!(body["status"], "partially_failed");
    assert_eq!(
        body["summary"],
        json!({"total": 2, "pending": 0, "completed": 1, "failed": 1})
    );
    let files = body["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    let failed = files.iter().find(|f| f["id"] == "f2").unwrap();
    assert_eq!(failed["importStatus"], "failed");
    assert_eq!(failed["importError"], "boom");
}

fn delete_file(app: &TestApp, id: &str, actor_id: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(format!("/api/fitness/{}", id))
        .header(header::AUTHORIZATION, bearer(app, actor_id))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_deleted_file_leaves_its_batch() {
    let app = common::create_test_app();
    partially_failed_batch(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(delete_file(&app, "f2", OTHER_ACTOR))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!app.file("f2").await.is_deleted());

    let response = app
        .router
        .clone()
        .oneshot(delete_file(&app, "f2", ACTOR))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(app.file("f2").await.is_deleted());

    let body = body_json(
        app.router
            .clone()
            .oneshot(get(&app, "/api/fitness/batches/b1"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "completed");
    assert_eq!(
        body["summary"],
        json!({"total": 1, "pending": 0, "completed": 1, "failed": 0})
    );

    // Deleting twice is a 404, and a deleted failed file is not retried
    let response = app
        .router
        .clone()
        .oneshot(delete_file(&app, "f2", ACTOR))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app
        .router
        .clone()
        .oneshot(post_json(&app, "/api/fitness/batches/b1/retry", json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["retried"], 0);
    assert!(app.queue.published().is_empty());
}

#[tokio::test]
async fn test_batch_requires_auth() {
    let app = common::create_test_app();
    partially_failed_batch(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/fitness/batches/b1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/fitness/batches/b1")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_cookie_is_accepted() {
    let app = common::create_test_app();
    partially_failed_batch(&app).await;
    let token = common::create_test_jwt(ACTOR, &app.state.config.jwt_signing_key);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/fitness/batches/b1")
                .header(header::COOKIE, format!("fitness_token={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_or_foreign_batch_is_not_found() {
    let app = common::create_test_app();
    partially_failed_batch(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(get(&app, "/api/fitness/batches/nope"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/fitness/batches/b1")
                .header(header::AUTHORIZATION, bearer(&app, OTHER_ACTOR))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_republishes_only_failed_files() {
    let app = common::create_test_app();
    partially_failed_batch(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(post_json(&app, "/api/fitness/batches/b1/retry", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"batchId": "b1", "retried": 1})
    );

    let published = app.queue.published();
    assert_eq!(published.len(), 1);
    match &published[0].payload {
        JobPayload::ImportFitnessFiles(p) => {
            assert_eq!(p.fitness_file_ids, vec!["f2"]);
            assert_eq!(p.overlap_fitness_file_ids, vec!["f1"]);
        }
        other => panic!("unexpected job {:?}", other),
    }
    let f2 = app.file("f2").await;
    assert_eq!(f2.import_status, Some(ImportStatus::Pending));
    assert_eq!(f2.import_error, None);

    // The retried file joins the existing post
    app.run_pending_jobs().await;
    let f2 = app.file("f2").await;
    assert_eq!(f2.status_id.as_deref(), Some("s1"));
    assert!(app.statuses.created_ids().is_empty());

    let body = body_json(
        app.router
            .clone()
            .oneshot(get(&app, "/api/fitness/batches/b1"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn test_retry_publish_failure_restores_files() {
    let app = common::create_test_app();
    partially_failed_batch(&app).await;
    app.queue.set_fail_publishes(true);

    let response = app
        .router
        .clone()
        .oneshot(post_json(&app, "/api/fitness/batches/b1/retry", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "queue_error");

    let f2 = app.file("f2").await;
    assert_eq!(f2.import_status, Some(ImportStatus::Failed));
    assert_eq!(f2.processing_status, ProcessingStatus::Failed);
    assert_eq!(f2.import_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_retry_requeues_failed_processing() {
    let app = common::create_test_app();
    app.insert_activity("f1", "b1", &activity("2025-05-01T08:00:00Z", 3600))
        .await;
    app.store
        .update_fitness_file(
            "f1",
            &FitnessFileUpdate::link("s1", true).processing(ProcessingStatus::Failed),
        )
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(post_json(&app, "/api/fitness/batches/b1/retry", json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["retried"], 1);

    let published = app.queue.published();
    assert_eq!(published.len(), 1);
    assert!(matches!(
        &published[0].payload,
        JobPayload::ProcessFitnessFile(p) if p.fitness_file_id == "f1" && p.status_id == "s1"
    ));

    app.run_pending_jobs().await;
    let f1 = app.file("f1").await;
    assert_eq!(f1.processing_status, ProcessingStatus::Completed);
    assert_eq!(f1.status_id.as_deref(), Some("s1"));
    assert_eq!(app.statuses.published_ids(), vec!["s1"]);
}

#[tokio::test]
async fn test_retry_with_nothing_failed_is_a_no_op() {
    let app = common::create_test_app();
    app.insert_activity("f1", "b1", &activity("2025-05-01T08:00:00Z", 3600))
        .await;

    let response = app
        .router
        .clone()
        .oneshot(post_json(&app, "/api/fitness/batches/b1/retry", json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["retried"], 0);
    assert!(app.queue.published().is_empty());
}

#[tokio::test]
async fn test_upload_files_end_to_end() {
    let app = common::create_test_app();
    let body = json!({
        "visibility": "unlisted",
        "files": [
            {"fileName": "ride.fit", "data": STANDARD.encode(activity("2025-05-01T08:00:00Z", 3600))},
            {"fileName": "watch.tcx", "data": STANDARD.encode(activity("2025-05-01T08:05:00Z", 3000))},
        ]
    });

    let response = app
        .router
        .clone()
        .oneshot(post_json(&app, "/api/fitness/imports", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let created = body_json(response).await;
    let batch_id = created["batchId"].as_str().unwrap().to_string();
    assert_eq!(created["fitnessFileIds"].as_array().unwrap().len(), 2);

    app.run_pending_jobs().await;

    let body = body_json(
        app.router
            .clone()
            .oneshot(get(&app, &format!("/api/fitness/batches/{}", batch_id)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "completed");
    let files = body["files"].as_array().unwrap();
    assert_eq!(files[0]["statusId"], files[1]["statusId"]);

    let created = app.statuses.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(
        created[0].1.visibility,
        fitness_import::models::Visibility::Unlisted
    );
    assert_eq!(created[0].1.content, "Run: 5.0 km in 1h00m");
}

#[tokio::test]
async fn test_upload_rejects_bad_input() {
    let app = common::create_test_app();

    let wrong_type = json!({"files": [{"fileName": "notes.txt", "data": "AAAA"}]});
    let bad_base64 = json!({"files": [{"fileName": "a.gpx", "data": "***"}]});
    let no_files = json!({"files": []});

    for body in [wrong_type, bad_base64, no_files] {
        let response = app
            .router
            .clone()
            .oneshot(post_json(&app, "/api/fitness/imports", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    assert!(app.store.all_files().is_empty());
}

#[tokio::test]
async fn test_upload_queue_outage_marks_files_failed() {
    let app = common::create_test_app();
    app.queue.set_fail_publishes(true);
    let body = json!({
        "files": [{"fileName": "ride.gpx", "data": STANDARD.encode(activity("2025-05-01T08:00:00Z", 60))}]
    });

    let response = app
        .router
        .clone()
        .oneshot(post_json(&app, "/api/fitness/imports", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let batch_id = body_json(response).await["batchId"]
        .as_str()
        .unwrap()
        .to_string();

    let body = body_json(
        app.router
            .clone()
            .oneshot(get(&app, &format!("/api/fitness/batches/{}", batch_id)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "failed");
}

#[tokio::test]
async fn test_archive_upload_and_progress() {
    let app = common::create_test_app();
    let csv = "Activity ID,Filename,Media\n7,activities/7.gpx,\n";
    let zip = build_zip(&[
        ("activities.csv", csv.as_bytes()),
        (
            "activities/7.gpx",
            activity("2025-05-01T08:00:00Z", 600).as_bytes(),
        ),
    ]);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/fitness/archives?fileName=export.zip&visibility=unlisted")
                .header(header::AUTHORIZATION, bearer(&app, ACTOR))
                .header(header::CONTENT_TYPE, "application/zip")
                .body(Body::from(zip))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let created = body_json(response).await;
    let import_id = created["importId"].as_str().unwrap().to_string();
    let source_id = created["archiveFitnessFileId"].as_str().unwrap().to_string();

    let source = app.file(&source_id).await;
    assert_eq!(source.import_batch_id, None);
    assert_eq!(source.import_status, Some(ImportStatus::Pending));

    let uri = format!("/api/fitness/archives/{}", import_id);
    let body = body_json(app.router.clone().oneshot(get(&app, &uri)).await.unwrap()).await;
    assert_eq!(body["status"], "importing");
    assert_eq!(body["nextActivityIndex"], 0);

    // Other actors cannot see it
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header(header::AUTHORIZATION, bearer(&app, OTHER_ACTOR))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.run_pending_jobs().await;

    let body = body_json(app.router.clone().oneshot(get(&app, &uri)).await.unwrap()).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["totalActivities"], 1);
    assert_eq!(body["lastError"], serde_json::Value::Null);
    assert!(app.store.get_fitness_file(&source_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_archive_upload_requires_zip_name() {
    let app = common::create_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/fitness/archives?fileName=export.tar")
                .header(header::AUTHORIZATION, bearer(&app, ACTOR))
                .body(Body::from("data"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

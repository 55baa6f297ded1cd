// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Client for the social server's internal API.
//!
//! The import pipeline does not own posts, media or file parsing. It reaches
//! them through three narrow traits, all implemented by [`SocialClient`]:
//! - [`StatusApi`]: create, delete and publish posts; resolve actors
//! - [`MediaApi`]: store media bytes and attach them to a post
//! - [`FitnessParser`]: turn FIT/GPX/TCX bytes into track points and metrics

use crate::error::{AppError, ImportError};
use crate::models::{ActivityMetrics, FitnessFileType, RoutePoint, Visibility};
use crate::time_utils::format_duration_hm;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Post to create for a group of merged activities.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDraft {
    pub actor_id: String,
    pub visibility: Visibility,
    /// Primary file of the group
    pub fitness_file_id: String,
    pub content: String,
}

/// A parsed activity file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedActivity {
    pub points: Vec<RoutePoint>,
    pub metrics: ActivityMetrics,
}

#[async_trait]
pub trait StatusApi: Send + Sync {
    /// Create an unpublished post and return its id.
    async fn create_status(&self, draft: &StatusDraft) -> Result<String, AppError>;

    async fn delete_status(&self, actor_id: &str, status_id: &str) -> Result<(), AppError>;

    /// Make a post visible to followers (sends the activity note).
    async fn publish_status(&self, actor_id: &str, status_id: &str) -> Result<(), AppError>;

    async fn actor_exists(&self, actor_id: &str) -> Result<bool, AppError>;
}

#[async_trait]
pub trait MediaApi: Send + Sync {
    /// Store media bytes for an actor and return the media id.
    async fn save_media(
        &self,
        actor_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, AppError>;

    async fn attach_media(
        &self,
        actor_id: &str,
        status_id: &str,
        media_id: &str,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait FitnessParser: Send + Sync {
    async fn parse(
        &self,
        file_type: FitnessFileType,
        bytes: &[u8],
    ) -> Result<ParsedActivity, ImportError>;
}

/// HTTP client for the social server.
#[derive(Clone)]
pub struct SocialClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

impl SocialClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/internal{}", self.base_url, path)
    }

    /// Check response status and return error if not successful.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AppError::Upstream(format!("HTTP {}: {}", status, body)))
    }

    async fn check_response_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, AppError> {
        Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("JSON parse error: {}", e)))
    }
}

#[async_trait]
impl StatusApi for SocialClient {
    async fn create_status(&self, draft: &StatusDraft) -> Result<String, AppError> {
        let response = self
            .http
            .post(self.url("/statuses"))
            .bearer_auth(&self.token)
            .json(draft)
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        let created: IdResponse = Self::check_response_json(response).await?;
        Ok(created.id)
    }

    async fn delete_status(&self, actor_id: &str, status_id: &str) -> Result<(), AppError> {
        let response = self
            .http
            .delete(self.url(&format!("/statuses/{}", status_id)))
            .bearer_auth(&self.token)
            .query(&[("actorId", actor_id)])
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        // Already gone is fine
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_response(response).await?;
        Ok(())
    }

    async fn publish_status(&self, actor_id: &str, status_id: &str) -> Result<(), AppError> {
        let response = self
            .http
            .post(self.url(&format!("/statuses/{}/publish", status_id)))
            .bearer_auth(&self.token)
            .query(&[("actorId", actor_id)])
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        Self::check_response(response).await?;
        Ok(())
    }

    async fn actor_exists(&self, actor_id: &str) -> Result<bool, AppError> {
        let response = self
            .http
            .get(self.url(&format!("/actors/{}", actor_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_response(response).await?;
        Ok(true)
    }
}

#[async_trait]
impl MediaApi for SocialClient {
    async fn save_media(
        &self,
        actor_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, AppError> {
        let response = self
            .http
            .post(self.url("/media"))
            .bearer_auth(&self.token)
            .query(&[("actorId", actor_id), ("fileName", file_name)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        let saved: IdResponse = Self::check_response_json(response).await?;
        Ok(saved.id)
    }

    async fn attach_media(
        &self,
        actor_id: &str,
        status_id: &str,
        media_id: &str,
    ) -> Result<(), AppError> {
        let response = self
            .http
            .post(self.url(&format!("/statuses/{}/media", status_id)))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "actorId": actor_id, "mediaId": media_id }))
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        Self::check_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl FitnessParser for SocialClient {
    async fn parse(
        &self,
        file_type: FitnessFileType,
        bytes: &[u8],
    ) -> Result<ParsedActivity, ImportError> {
        let response = self
            .http
            .post(self.url("/fitness/parse"))
            .bearer_auth(&self.token)
            .query(&[("type", file_type.extension())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| ImportError::Parse(format!("parser unavailable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Fitness parser rejected file");
            return Err(ImportError::Parse(format!("HTTP {}", status.as_u16())));
        }

        let parsed: ParsedActivity = response
            .json()
            .await
            .map_err(|e| ImportError::Parse(e.to_string()))?;

        if parsed.points.is_empty() {
            return Err(ImportError::Parse("no track points".to_string()));
        }
        Ok(parsed)
    }
}

/// Short post text describing a merged activity.
pub fn status_content(metrics: &ActivityMetrics) -> String {
    let activity = metrics.activity_type.as_deref().unwrap_or("Activity");
    let km = metrics.total_distance_meters / 1000.0;
    format!(
        "{}: {:.1} km in {}",
        activity,
        km,
        format_duration_hm(metrics.total_duration_seconds)
    )
}

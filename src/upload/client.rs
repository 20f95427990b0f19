use super::{UploadError, UploadMetadata, UploadProgress, UploadResult};
use crate::config::UploadSection;
use crate::recorder::Recording;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Request timeout for uploads
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Error reasons that mean the account has no channel to upload to
const CHANNEL_SIGNALS: &[&str] = &[
    "youtubeSignupRequired",
    "channelNotFound",
    "NoLinkedYoutubeAccount",
];

pub struct UploadClient {
    client: Client,
    endpoint: String,
    watch_url_base: String,
    privacy: String,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Snippet<'a> {
    title: &'a str,
    description: &'a str,
    tags: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Status<'a> {
    privacy_status: &'a str,
}

#[derive(Serialize)]
struct VideoResource<'a> {
    snippet: Snippet<'a>,
    status: Status<'a>,
}

#[derive(Deserialize)]
struct VideoResponse {
    id: String,
}

impl UploadClient {
    pub fn new(config: &UploadSection, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            watch_url_base: config.watch_url_base.clone(),
            privacy: config.privacy.clone(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}?uploadType=multipart&part={}",
            self.endpoint,
            urlencoding::encode("snippet,status")
        )
    }

    /// Upload a recording. Not retried on failure.
    pub async fn upload<F>(
        &self,
        recording: &Recording,
        metadata: &UploadMetadata,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<UploadResult, UploadError>
    where
        F: Fn(UploadProgress),
    {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| UploadError::AuthRequired("no access token".into()))?;

        progress(UploadProgress::Preparing);

        let privacy = if metadata.privacy.is_empty() {
            self.privacy.as_str()
        } else {
            metadata.privacy.as_str()
        };
        let resource = VideoResource {
            snippet: Snippet {
                title: &metadata.title,
                description: &metadata.description,
                tags: &metadata.tags,
            },
            status: Status {
                privacy_status: privacy,
            },
        };
        let json = serde_json::to_string(&resource).map_err(|e| UploadError::UploadFailed {
            status: None,
            message: format!("failed to encode metadata: {}", e),
        })?;

        let metadata_part = Part::text(json)
            .mime_str("application/json; charset=UTF-8")
            .map_err(|e| failed(None, e.to_string()))?;
        let media_part = Part::bytes(recording.data.to_vec())
            .file_name(format!("{}.{}", recording.id, recording.extension()))
            .mime_str(&recording.mime_type)
            .map_err(|e| failed(None, e.to_string()))?;
        let form = Form::new().part("metadata", metadata_part).part("media", media_part);

        tracing::info!(
            "Uploading recording {} ({} bytes) as '{}'",
            recording.id,
            recording.len(),
            metadata.title
        );
        progress(UploadProgress::Sending {
            bytes: recording.len(),
        });

        let request = self.client.post(self.url()).bearer_auth(token).multipart(form).send();
        let exchange = async {
            let response = request
                .await
                .map_err(|e| failed(None, format!("request failed: {}", e)))?;
            progress(UploadProgress::Processing);

            let status = response.status();
            let body = response.text().await.map_err(|e| {
                failed(
                    Some(status.as_u16()),
                    format!("failed to read response body: {}", e),
                )
            })?;
            Ok::<_, UploadError>((status, body))
        };

        let (status, body) = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            exchange = exchange => exchange?,
        };

        if !status.is_success() {
            let error = classify_failure(status, &body);
            tracing::error!("Upload rejected: {}", error);
            return Err(error);
        }

        let video: VideoResponse = serde_json::from_str(&body)
            .map_err(|e| failed(Some(status.as_u16()), format!("unexpected response: {}", e)))?;

        let result = UploadResult {
            remote_url: format!("{}{}", self.watch_url_base, video.id),
            remote_id: video.id,
        };

        tracing::info!("Upload complete: {}", result.remote_url);
        progress(UploadProgress::Done);
        Ok(result)
    }
}

fn failed(status: Option<u16>, message: String) -> UploadError {
    UploadError::UploadFailed { status, message }
}

/// Whether an error body carries a channel-provisioning signal
pub fn has_channel_signal(body: &str) -> bool {
    CHANNEL_SIGNALS.iter().any(|signal| body.contains(signal))
}

/// Pull `error.message` out of a JSON error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| body.chars().take(500).collect())
}

fn classify_failure(status: StatusCode, body: &str) -> UploadError {
    let message = error_message(body);
    if has_channel_signal(body) {
        UploadError::ChannelRequired(message)
    } else if status == StatusCode::UNAUTHORIZED {
        UploadError::AuthRequired(message)
    } else {
        UploadError::UploadFailed {
            status: Some(status.as_u16()),
            message,
        }
    }
}

//! RunwayML Video Generation Provider
//!
//! Drives the Runway Gen-4 task API (also fronting Veo models) through
//! the uniform submit/poll/download contract. Images travel inline as
//! base64 data URIs; the finished clip is streamed to disk with a hard
//! size cap. Retries are the engine's job, not this client's: every
//! method performs a single attempt and reports a classified error.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{GenError, GenResult};
use crate::request::{DurationSet, GenerationRequest, ProviderCapability};

use super::{validate_download_url, JobHandle, JobState, ProviderClient};

// =============================================================================
// Constants
// =============================================================================

/// Default base URL for the Runway developer API
const DEFAULT_BASE_URL: &str = "https://api.dev.runwayml.com/v1";

/// API version header required on every request
const API_VERSION: &str = "2024-11-06";

/// Default model ID
const DEFAULT_MODEL_ID: &str = "gen4_turbo";

/// Maximum allowed download size (500 MB) to prevent unbounded disk usage.
const MAX_DOWNLOAD_BYTES: u64 = 500 * 1024 * 1024;

// =============================================================================
// API Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTaskRequest {
    model: String,
    prompt_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_image: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reference_images: Vec<String>,
    ratio: String,
    duration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SubmitTaskResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PollTaskResponse {
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    output: Option<Vec<String>>,
    #[serde(default)]
    failure: Option<String>,
    #[serde(default, rename = "failureCode")]
    failure_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// =============================================================================
// RunwayProvider
// =============================================================================

/// RunwayML video generation client
pub struct RunwayProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model_id: String,
}

impl std::fmt::Debug for RunwayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunwayProvider")
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

impl RunwayProvider {
    pub fn new(api_key: impl Into<String>) -> GenResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| GenError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model_id(mut self, model: impl Into<String>) -> Self {
        self.model_id = model.into();
        self
    }

    fn submit_url(&self) -> String {
        format!("{}/image_to_video", self.base_url)
    }

    fn poll_url(&self, job_id: &str) -> String {
        format!("{}/tasks/{}", self.base_url, job_id)
    }

    /// Read an image and encode it as a base64 data URI.
    async fn encode_image_data_uri(path: &Path) -> GenResult<String> {
        let mime = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("png") => "image/png",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("webp") => "image/webp",
            other => {
                return Err(GenError::Validation(format!(
                    "Unsupported image format '{}' for {}",
                    other.unwrap_or("none"),
                    path.display()
                )))
            }
        };

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            GenError::Validation(format!("Failed to read image {}: {}", path.display(), e))
        })?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:{};base64,{}", mime, encoded))
    }

    /// Classify a non-success response body.
    fn parse_api_error(status: StatusCode, body: &str) -> GenError {
        let message = serde_json::from_str::<ApiErrorResponse>(body)
            .ok()
            .and_then(|e| e.error.or(e.message))
            .unwrap_or_else(|| body.chars().take(500).collect());
        GenError::from_http_status("runway", status.as_u16(), message)
    }

    /// Map a task response to the uniform job state.
    fn map_poll_response(response: PollTaskResponse) -> JobState {
        match response.status.as_str() {
            "PENDING" | "THROTTLED" => JobState::Pending,
            "RUNNING" => JobState::Running {
                progress: response.progress,
                message: None,
            },
            "SUCCEEDED" => JobState::Succeeded {
                download_url: response.output.and_then(|o| o.into_iter().next()),
            },
            "FAILED" | "CANCELLED" => {
                let reason = response
                    .failure
                    .unwrap_or_else(|| format!("task {}", response.status.to_lowercase()));
                let lowered = format!(
                    "{} {}",
                    reason.to_ascii_lowercase(),
                    response.failure_code.unwrap_or_default().to_ascii_lowercase()
                );
                if lowered.contains("rate")
                    || lowered.contains("throttl")
                    || lowered.contains("capacity")
                    || lowered.contains("resource")
                {
                    JobState::FailedTransient { reason }
                } else {
                    JobState::FailedFatal { reason }
                }
            }
            other => {
                debug!(status = other, "Unknown Runway task status, treating as running");
                JobState::Running {
                    progress: response.progress,
                    message: Some(format!("Unknown status: {}", other)),
                }
            }
        }
    }
}

#[async_trait]
impl ProviderClient for RunwayProvider {
    fn name(&self) -> &str {
        "runway"
    }

    fn capabilities(&self) -> ProviderCapability {
        ProviderCapability {
            max_reference_images: 3,
            durations: DurationSet::Discrete(vec![5, 10]),
            supports_source_frame: true,
            supports_multi_image: true,
        }
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn submit(&self, request: &GenerationRequest) -> GenResult<JobHandle> {
        request.validate().map_err(GenError::Validation)?;

        let prompt_image = match &request.source_frame {
            Some(frame) => Some(Self::encode_image_data_uri(frame).await?),
            None => None,
        };

        let mut reference_images = Vec::with_capacity(request.reference_images.len());
        for image in &request.reference_images {
            reference_images.push(Self::encode_image_data_uri(image).await?);
        }

        let body = SubmitTaskRequest {
            model: request.model.clone().unwrap_or_else(|| self.model_id.clone()),
            prompt_text: request.prompt.clone(),
            prompt_image,
            reference_images,
            ratio: format!("{}:{}", request.width, request.height),
            duration: request.duration_sec,
            seed: request.seed,
        };

        let resp = self
            .client
            .post(self.submit_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Runway-Version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Self::parse_api_error(status, &text));
        }

        let parsed: SubmitTaskResponse = serde_json::from_str(&text)
            .map_err(|e| GenError::Internal(format!("Failed to parse submit response: {}", e)))?;

        info!(job_id = %parsed.id, "Runway task submitted");
        Ok(JobHandle::new(self.name().to_string(), parsed.id))
    }

    async fn poll(&self, handle: &JobHandle) -> GenResult<JobState> {
        let resp = self
            .client
            .get(self.poll_url(&handle.job_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Runway-Version", API_VERSION)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Self::parse_api_error(status, &text));
        }

        let parsed: PollTaskResponse = serde_json::from_str(&text)
            .map_err(|e| GenError::Internal(format!("Failed to parse poll response: {}", e)))?;

        debug!(job_id = %handle.job_id, status = %parsed.status, "Runway poll");
        Ok(Self::map_poll_response(parsed))
    }

    async fn download(&self, handle: &JobHandle, dest: &Path) -> GenResult<PathBuf> {
        let state = self.poll(handle).await?;
        let download_url = match state {
            JobState::Succeeded {
                download_url: Some(url),
            } => url,
            JobState::Succeeded { download_url: None } => {
                return Err(GenError::Download(format!(
                    "Runway task {} succeeded without an output URL",
                    handle.job_id
                )))
            }
            other => {
                return Err(GenError::Download(format!(
                    "Runway task {} is not downloadable in state {:?}",
                    handle.job_id, other
                )))
            }
        };

        let validated_url = validate_download_url(&download_url)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut resp = self.client.get(validated_url).send().await?;
        if !resp.status().is_success() {
            return Err(GenError::Download(format!(
                "Download failed with status {}",
                resp.status()
            )));
        }

        if let Some(content_len) = resp.content_length() {
            if content_len > MAX_DOWNLOAD_BYTES {
                return Err(GenError::Download(format!(
                    "Video too large ({} bytes > {} limit)",
                    content_len, MAX_DOWNLOAD_BYTES
                )));
            }
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut total_bytes: u64 = 0;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| GenError::Download(format!("Failed to read chunk: {}", e)))?
        {
            total_bytes = total_bytes.saturating_add(chunk.len() as u64);
            if total_bytes > MAX_DOWNLOAD_BYTES {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(GenError::Download(format!(
                    "Video exceeded max size limit ({} bytes)",
                    MAX_DOWNLOAD_BYTES
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        info!(
            job_id = %handle.job_id,
            path = %dest.display(),
            bytes = total_bytes,
            "Downloaded Runway video"
        );
        Ok(dest.to_path_buf())
    }
}

//! Google Veo Video Generation Provider
//!
//! Drives Veo models through the Vertex AI long-running prediction API.
//! The source frame travels as the `image` parameter (first frame of the
//! clip, used for seamless stitching) while reference images go in a
//! separate array for style/content guidance. Images are inlined as
//! base64; finished videos arrive as a URI or inline bytes.

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

/// Veo models are only served through Vertex AI.
const DEFAULT_BASE_URL: &str = "https://aiplatform.googleapis.com/v1";

const DEFAULT_LOCATION: &str = "us-central1";

const DEFAULT_MODEL_ID: &str = "veo-3.1-fast-generate-preview";

const MAX_DOWNLOAD_BYTES: u64 = 500 * 1024 * 1024;

/// Error-message keywords that indicate capacity rather than quota abuse.
const CAPACITY_KEYWORDS: &[&str] = &["capacity", "resource", "rate", "overload", "unavailable"];

// =============================================================================
// API Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
struct SubmitRequest {
    instances: Vec<Instance>,
}

#[derive(Debug, Serialize)]
struct Instance {
    prompt: String,
    /// Source frame: the first frame of the clip
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EncodedImage>,
    /// Style/content guidance, up to three images
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reference_images: Vec<ReferenceImage>,
    video_config: VideoConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncodedImage {
    #[serde(rename = "bytesBase64Encoded")]
    bytes_base64_encoded: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
}

#[derive(Debug, Serialize)]
struct ReferenceImage {
    image: EncodedImage,
}

#[derive(Debug, Serialize)]
struct VideoConfig {
    width: u32,
    height: u32,
    fps: u32,
    duration_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    name: String,
}

#[derive(Debug, Serialize)]
struct FetchOperationRequest {
    #[serde(rename = "operationName")]
    operation_name: String,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    response: Option<PredictionResponse>,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    videos: Vec<VideoPayload>,
}

#[derive(Debug, Deserialize)]
struct VideoPayload {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default, rename = "bytesBase64Encoded")]
    bytes_base64_encoded: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

// =============================================================================
// VeoProvider
// =============================================================================

/// Google Veo client against Vertex AI
pub struct VeoProvider {
    client: reqwest::Client,
    access_token: String,
    project_id: String,
    location: String,
    base_url: String,
    model_id: String,
}

impl std::fmt::Debug for VeoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VeoProvider")
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

impl VeoProvider {
    pub fn new(access_token: impl Into<String>, project_id: impl Into<String>) -> GenResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| GenError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            access_token: access_token.into(),
            project_id: project_id.into(),
            location: DEFAULT_LOCATION.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_model_id(mut self, model: impl Into<String>) -> Self {
        self.model_id = model.into();
        self
    }

    fn model_url(&self, verb: &str) -> String {
        format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:{}",
            self.base_url, self.project_id, self.location, self.model_id, verb
        )
    }

    async fn encode_image(path: &Path) -> GenResult<EncodedImage> {
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
        Ok(EncodedImage {
            bytes_base64_encoded: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime.to_string(),
        })
    }

    fn parse_api_error(status: StatusCode, body: &str) -> GenError {
        let message = serde_json::from_str::<ApiErrorResponse>(body)
            .ok()
            .and_then(|e| e.error.and_then(|d| d.message))
            .unwrap_or_else(|| body.chars().take(500).collect());
        GenError::from_http_status("veo", status.as_u16(), message)
    }

    /// Map a finished-operation error to transient or fatal.
    fn classify_operation_error(error: OperationError) -> JobState {
        let message = error.message.unwrap_or_else(|| "operation failed".to_string());
        let lowered = message.to_ascii_lowercase();
        // gRPC code 8 is RESOURCE_EXHAUSTED
        let transient = error.code == Some(8)
            || CAPACITY_KEYWORDS.iter().any(|k| lowered.contains(k));
        if transient {
            JobState::FailedTransient { reason: message }
        } else {
            JobState::FailedFatal { reason: message }
        }
    }

    fn map_operation(response: OperationResponse) -> JobState {
        if !response.done {
            return JobState::Running {
                progress: None,
                message: None,
            };
        }
        if let Some(error) = response.error {
            return Self::classify_operation_error(error);
        }
        let video = response
            .response
            .and_then(|r| r.videos.into_iter().next());
        match video {
            Some(payload) => JobState::Succeeded {
                download_url: payload.uri,
            },
            None => JobState::FailedFatal {
                reason: "Operation completed without video output".to_string(),
            },
        }
    }

    async fn fetch_operation(&self, operation_name: &str) -> GenResult<OperationResponse> {
        let resp = self
            .client
            .post(self.model_url("fetchPredictOperation"))
            .header("Authorization", format!("Bearer {}", self.access_token))
            .json(&FetchOperationRequest {
                operation_name: operation_name.to_string(),
            })
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Self::parse_api_error(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| GenError::Internal(format!("Failed to parse operation response: {}", e)))
    }
}

#[async_trait]
impl ProviderClient for VeoProvider {
    fn name(&self) -> &str {
        "veo"
    }

    fn capabilities(&self) -> ProviderCapability {
        ProviderCapability {
            max_reference_images: 3,
            durations: DurationSet::Range { min: 4, max: 8 },
            supports_source_frame: true,
            supports_multi_image: true,
        }
    }

    fn is_configured(&self) -> bool {
        !self.access_token.is_empty() && !self.project_id.is_empty()
    }

    async fn submit(&self, request: &GenerationRequest) -> GenResult<JobHandle> {
        request.validate().map_err(GenError::Validation)?;

        let image = match &request.source_frame {
            Some(frame) => {
                info!(frame = %frame.display(), "Using source frame for seamless stitching");
                Some(Self::encode_image(frame).await?)
            }
            None => None,
        };

        let mut reference_images = Vec::with_capacity(request.reference_images.len());
        for path in &request.reference_images {
            reference_images.push(ReferenceImage {
                image: Self::encode_image(path).await?,
            });
        }

        let body = SubmitRequest {
            instances: vec![Instance {
                prompt: request.prompt.clone(),
                image,
                reference_images,
                video_config: VideoConfig {
                    width: request.width,
                    height: request.height,
                    fps: request.fps,
                    duration_seconds: request.duration_sec,
                    seed: request.seed,
                },
            }],
        };

        let resp = self
            .client
            .post(self.model_url("predictLongRunning"))
            .header("Authorization", format!("Bearer {}", self.access_token))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Self::parse_api_error(status, &text));
        }

        let parsed: SubmitResponse = serde_json::from_str(&text)
            .map_err(|e| GenError::Internal(format!("Failed to parse submit response: {}", e)))?;

        info!(operation = %parsed.name, "Veo generation submitted");
        Ok(JobHandle::new(self.name().to_string(), parsed.name))
    }

    async fn poll(&self, handle: &JobHandle) -> GenResult<JobState> {
        let operation = self.fetch_operation(&handle.job_id).await?;
        debug!(job_id = %handle.job_id, done = operation.done, "Veo poll");
        Ok(Self::map_operation(operation))
    }

    async fn download(&self, handle: &JobHandle, dest: &Path) -> GenResult<PathBuf> {
        let operation = self.fetch_operation(&handle.job_id).await?;
        if !operation.done {
            return Err(GenError::Download(format!(
                "Veo operation {} is not finished",
                handle.job_id
            )));
        }

        let payload = operation
            .response
            .and_then(|r| r.videos.into_iter().next())
            .ok_or_else(|| {
                GenError::Download(format!(
                    "Veo operation {} has no video output",
                    handle.job_id
                ))
            })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Inline bytes are written directly; URIs are streamed, first
        // anonymously since most are pre-signed, then with the token.
        if let Some(encoded) = payload.bytes_base64_encoded {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| GenError::Download(format!("Invalid video payload: {}", e)))?;
            tokio::fs::write(dest, bytes).await?;
            info!(job_id = %handle.job_id, path = %dest.display(), "Wrote inline Veo video");
            return Ok(dest.to_path_buf());
        }

        let uri = payload.uri.ok_or_else(|| {
            GenError::Download("Video payload contains neither bytes nor a URI".to_string())
        })?;
        let validated_url = validate_download_url(&uri)?;

        let mut resp = self.client.get(validated_url.clone()).send().await?;
        if matches!(
            resp.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!("Video URI requires authorization, retrying with bearer token");
            resp = self
                .client
                .get(validated_url)
                .header("Authorization", format!("Bearer {}", self.access_token))
                .send()
                .await?;
        }
        if !resp.status().is_success() {
            return Err(GenError::Download(format!(
                "Download failed with status {}",
                resp.status()
            )));
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
            "Downloaded Veo video"
        );
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_name_and_configuration() {
        let provider = VeoProvider::new("token", "my-project").unwrap();
        assert_eq!(provider.name(), "veo");
        assert!(provider.is_configured());

        let no_project = VeoProvider::new("token", "").unwrap();
        assert!(!no_project.is_configured());
    }

    #[test]
    fn model_url_includes_project_location_and_verb() {
        let provider = VeoProvider::new("token", "my-project")
            .unwrap()
            .with_location("europe-west1")
            .with_model_id("veo-3.0-generate-001");
        assert_eq!(
            provider.model_url("predictLongRunning"),
            "https://aiplatform.googleapis.com/v1/projects/my-project/locations/europe-west1/publishers/google/models/veo-3.0-generate-001:predictLongRunning"
        );
    }

    #[test]
    fn capabilities_offer_duration_range() {
        let provider = VeoProvider::new("token", "p").unwrap();
        assert_eq!(
            provider.capabilities().durations,
            DurationSet::Range { min: 4, max: 8 }
        );
    }

    #[test]
    fn submit_payload_separates_source_frame_and_references() {
        let body = SubmitRequest {
            instances: vec![Instance {
                prompt: "Pan across the room".to_string(),
                image: Some(EncodedImage {
                    bytes_base64_encoded: "QUJD".to_string(),
                    mime_type: "image/png".to_string(),
                }),
                reference_images: vec![ReferenceImage {
                    image: EncodedImage {
                        bytes_base64_encoded: "REVG".to_string(),
                        mime_type: "image/jpeg".to_string(),
                    },
                }],
                video_config: VideoConfig {
                    width: 1280,
                    height: 720,
                    fps: 24,
                    duration_seconds: 8,
                    seed: Some(7),
                },
            }],
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"image\":{\"bytesBase64Encoded\":\"QUJD\""));
        assert!(json.contains("\"reference_images\""));
        assert!(json.contains("\"duration_seconds\":8"));
        assert!(json.contains("\"seed\":7"));
    }

    #[test]
    fn unfinished_operation_maps_to_running() {
        let op: OperationResponse = serde_json::from_str(r#"{"done":false}"#).unwrap();
        assert!(matches!(
            VeoProvider::map_operation(op),
            JobState::Running { .. }
        ));
    }

    #[test]
    fn finished_operation_maps_to_succeeded_with_uri() {
        let op: OperationResponse = serde_json::from_str(
            r#"{"done":true,"response":{"videos":[{"uri":"https://storage.googleapis.com/v.mp4"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            VeoProvider::map_operation(op),
            JobState::Succeeded {
                download_url: Some("https://storage.googleapis.com/v.mp4".to_string())
            }
        );
    }

    #[test]
    fn operation_errors_are_classified() {
        let exhausted: OperationResponse = serde_json::from_str(
            r#"{"done":true,"error":{"code":8,"message":"Resource exhausted"}}"#,
        )
        .unwrap();
        assert!(matches!(
            VeoProvider::map_operation(exhausted),
            JobState::FailedTransient { .. }
        ));

        let safety: OperationResponse = serde_json::from_str(
            r#"{"done":true,"error":{"code":3,"message":"Prompt violates safety policy"}}"#,
        )
        .unwrap();
        assert!(matches!(
            VeoProvider::map_operation(safety),
            JobState::FailedFatal { .. }
        ));
    }

    #[test]
    fn finished_operation_without_video_is_fatal() {
        let op: OperationResponse =
            serde_json::from_str(r#"{"done":true,"response":{"videos":[]}}"#).unwrap();
        assert!(matches!(
            VeoProvider::map_operation(op),
            JobState::FailedFatal { .. }
        ));
    }
}

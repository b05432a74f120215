//! Provider Contract and Registry
//!
//! Every video generation vendor is driven through the same
//! submit/poll/download contract. The registry maps provider names to
//! trait objects and is constructed explicitly by the embedding
//! application; there is no ambient global.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{GenError, GenResult};
use crate::request::{GenerationRequest, ProviderCapability};

pub mod runway;
pub mod veo;

#[cfg(test)]
mod mock;
#[cfg(test)]
pub use mock::MockProvider;

// =============================================================================
// Job Types
// =============================================================================

/// Identity of a submitted generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Provider name the job was submitted to
    pub provider: String,
    /// Provider-assigned job identifier
    pub job_id: String,
    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(provider: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            job_id: job_id.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Provider-reported state of a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet started
    Pending,
    /// Generation in progress
    Running {
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Finished; output available
    Succeeded {
        #[serde(default)]
        download_url: Option<String>,
    },
    /// Failed on a capacity signal; the same job may be resubmitted
    FailedTransient { reason: String },
    /// Failed permanently
    FailedFatal { reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded { .. }
                | JobState::FailedTransient { .. }
                | JobState::FailedFatal { .. }
        )
    }
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Uniform contract every vendor client implements.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable registry name, e.g. "runway"
    fn name(&self) -> &str;

    /// Static capability descriptor used for pre-network negotiation
    fn capabilities(&self) -> ProviderCapability;

    /// Whether credentials are present
    fn is_configured(&self) -> bool;

    /// Submit a generation job and return its handle
    async fn submit(&self, request: &GenerationRequest) -> GenResult<JobHandle>;

    /// Fetch the current state of a job
    async fn poll(&self, handle: &JobHandle) -> GenResult<JobState>;

    /// Stream the finished output to `dest` and return the written path
    async fn download(&self, handle: &JobHandle, dest: &Path) -> GenResult<PathBuf>;
}

/// Sanitize a provider job id for use as a filename segment.
pub(crate) fn sanitize_job_id(job_id: &str) -> String {
    const MAX_LEN: usize = 64;
    let sanitized: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_LEN)
        .collect();

    if sanitized.is_empty() {
        "generated_video".to_string()
    } else {
        sanitized
    }
}

/// Validate that a download URL is a plain HTTP(S) URL.
pub(crate) fn validate_download_url(url: &str) -> GenResult<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| GenError::Validation(format!("Invalid download URL '{}': {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(GenError::Validation(format!(
            "Unsupported download URL scheme '{}'. Only http/https are allowed.",
            scheme
        ))),
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Explicitly constructed name -> client mapping.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its own name. Later registrations with the
    /// same name replace earlier ones.
    pub fn register(&mut self, provider: Arc<dyn ProviderClient>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Builder-style registration.
    pub fn with(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> GenResult<Arc<dyn ProviderClient>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| GenError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of providers whose credentials are present.
    pub fn configured_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .values()
            .filter(|p| p.is_configured())
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DurationSet;

    #[test]
    fn job_state_terminal_detection() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running {
            progress: Some(0.5),
            message: None
        }
        .is_terminal());
        assert!(JobState::Succeeded { download_url: None }.is_terminal());
        assert!(JobState::FailedTransient {
            reason: "capacity".to_string()
        }
        .is_terminal());
        assert!(JobState::FailedFatal {
            reason: "content policy".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn job_state_serialization_is_tagged_snake_case() {
        let state = JobState::Succeeded {
            download_url: Some("https://ex.com/v.mp4".to_string()),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"state\":\"succeeded\""));

        let parsed: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn sanitize_job_id_replaces_unsafe_chars() {
        assert_eq!(sanitize_job_id("../../job:abc?*"), "______job_abc__");
        assert_eq!(sanitize_job_id(""), "generated_video");
    }

    #[test]
    fn validate_download_url_rejects_non_http() {
        assert!(validate_download_url("https://example.com/video.mp4").is_ok());
        assert!(validate_download_url("http://example.com/video.mp4").is_ok());
        assert!(validate_download_url("file:///tmp/video.mp4").is_err());
        assert!(validate_download_url("not a url").is_err());
    }

    #[test]
    fn registry_lookup_and_listing() {
        let mock = Arc::new(
            MockProvider::new("mock").with_capability(ProviderCapability {
                max_reference_images: 3,
                durations: DurationSet::Discrete(vec![5, 10]),
                supports_source_frame: true,
                supports_multi_image: true,
            }),
        );
        let registry = ProviderRegistry::new().with(mock);

        assert!(registry.get("mock").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(GenError::UnknownProvider(_))
        ));
        assert_eq!(registry.names(), vec!["mock".to_string()]);
        assert_eq!(registry.configured_names(), vec!["mock".to_string()]);
    }
}

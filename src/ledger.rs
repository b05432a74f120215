//! Durable Artifact Ledger
//!
//! Every generation job gets a ledger entry keyed by its provider job id,
//! persisted as a JSON file that is rewritten atomically on each change.
//! Status transitions are monotonic, with a single retry edge from
//! `download_failed` back to `downloaded`, so a restart can always tell
//! what each job needs next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::{GenError, GenResult};
use crate::request::GenerationRequest;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle of a generation job as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Accepted by the provider, job id assigned
    Submitted,
    /// Being polled for completion
    Polling,
    /// Provider finished; output not yet fetched
    Completed,
    /// Generation finished but the fetch failed; retryable
    DownloadFailed,
    /// Output is on local disk
    Downloaded,
    /// Generation failed; terminal
    Failed,
}

impl ArtifactStatus {
    /// Whether a transition is allowed. Forward-only, except the
    /// `download_failed -> downloaded` retry edge. Identical statuses are
    /// accepted as no-ops.
    pub fn can_transition(self, to: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Submitted, Polling)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (Polling, Completed)
                | (Polling, Failed)
                | (Completed, DownloadFailed)
                | (Completed, Downloaded)
                | (DownloadFailed, Downloaded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ArtifactStatus::Downloaded | ArtifactStatus::Failed)
    }
}

// =============================================================================
// Artifact
// =============================================================================

/// Request summary stored alongside each artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration_sec: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub reference_image_count: usize,
    #[serde(default)]
    pub has_source_frame: bool,
}

impl From<&GenerationRequest> for RequestMeta {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            width: request.width,
            height: request.height,
            fps: request.fps,
            duration_sec: request.duration_sec,
            seed: request.seed,
            reference_image_count: request.reference_images.len(),
            has_source_frame: request.source_frame.is_some(),
        }
    }
}

/// One ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub job_id: String,
    pub provider: String,
    pub model: String,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    pub request: RequestMeta,
}

impl Artifact {
    pub fn new(
        job_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        request: &GenerationRequest,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            provider: provider.into(),
            model: model.into(),
            status: ArtifactStatus::Submitted,
            created_at: now,
            updated_at: now,
            download_url: None,
            local_path: None,
            request: RequestMeta::from(request),
        }
    }
}

/// Optional filters for `ArtifactLedger::list`.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub provider: Option<String>,
    pub status: Option<ArtifactStatus>,
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    artifacts: HashMap<String, Artifact>,
}

/// JSON-backed artifact ledger. All mutations rewrite the file atomically
/// (temp file + rename in the same directory) so a crash mid-write never
/// leaves a corrupt ledger behind.
#[derive(Debug)]
pub struct ArtifactLedger {
    path: PathBuf,
    entries: HashMap<String, Artifact>,
}

impl ArtifactLedger {
    /// Open a ledger, loading existing entries when the file exists.
    pub fn open(path: impl Into<PathBuf>) -> GenResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let file: LedgerFile = serde_json::from_str(&content)?;
            debug!(
                path = %path.display(),
                count = file.artifacts.len(),
                "Loaded artifact ledger"
            );
            file.artifacts
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries })
    }

    /// Record a new artifact. Re-recording an identical entry is a no-op;
    /// the same job id with a different identity is rejected.
    pub fn record(&mut self, artifact: Artifact) -> GenResult<()> {
        if let Some(existing) = self.entries.get(&artifact.job_id) {
            if existing.provider != artifact.provider
                || existing.model != artifact.model
                || existing.request.prompt != artifact.request.prompt
            {
                return Err(GenError::DuplicateJob(format!(
                    "{} already recorded for provider {}",
                    artifact.job_id, existing.provider
                )));
            }
            return Ok(());
        }
        debug!(job_id = %artifact.job_id, provider = %artifact.provider, "Recording artifact");
        self.entries.insert(artifact.job_id.clone(), artifact);
        self.save()
    }

    /// Move an artifact to a new status, enforcing the transition rules.
    pub fn update_status(&mut self, job_id: &str, status: ArtifactStatus) -> GenResult<()> {
        let artifact = self
            .entries
            .get_mut(job_id)
            .ok_or_else(|| GenError::ArtifactNotFound(job_id.to_string()))?;

        if !artifact.status.can_transition(status) {
            warn!(
                job_id,
                from = ?artifact.status,
                to = ?status,
                "Rejected artifact status transition"
            );
            return Err(GenError::InvalidTransition(format!(
                "{}: {:?} -> {:?}",
                job_id, artifact.status, status
            )));
        }
        if artifact.status == status {
            return Ok(());
        }
        artifact.status = status;
        artifact.updated_at = Utc::now();
        self.save()
    }

    /// Attach the provider's download URL to a job.
    pub fn set_download_url(&mut self, job_id: &str, url: impl Into<String>) -> GenResult<()> {
        let artifact = self
            .entries
            .get_mut(job_id)
            .ok_or_else(|| GenError::ArtifactNotFound(job_id.to_string()))?;
        artifact.download_url = Some(url.into());
        artifact.updated_at = Utc::now();
        self.save()
    }

    /// Record a completed download: status plus local path in one step.
    pub fn mark_downloaded(&mut self, job_id: &str, local_path: impl Into<PathBuf>) -> GenResult<()> {
        let local_path = local_path.into();
        {
            let artifact = self
                .entries
                .get_mut(job_id)
                .ok_or_else(|| GenError::ArtifactNotFound(job_id.to_string()))?;
            if !artifact.status.can_transition(ArtifactStatus::Downloaded) {
                return Err(GenError::InvalidTransition(format!(
                    "{}: {:?} -> Downloaded",
                    job_id, artifact.status
                )));
            }
            artifact.status = ArtifactStatus::Downloaded;
            artifact.local_path = Some(local_path);
            artifact.updated_at = Utc::now();
        }
        self.save()
    }

    /// Look up an artifact by job id. Returns `None` for unknown ids;
    /// callers that need an error map it to `ArtifactNotFound` themselves.
    pub fn get(&self, job_id: &str) -> Option<&Artifact> {
        self.entries.get(job_id)
    }

    /// List artifacts newest-first, optionally filtered.
    pub fn list(&self, filter: &ArtifactFilter) -> Vec<&Artifact> {
        let mut results: Vec<&Artifact> = self
            .entries
            .values()
            .filter(|a| {
                filter
                    .provider
                    .as_ref()
                    .is_none_or(|p| &a.provider == p)
            })
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the ledger file atomically.
    fn save(&self) -> GenResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = LedgerFile {
            artifacts: self.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

//! Generation Engine
//!
//! The orchestration facade. Owns the provider registry, the artifact
//! ledger, the retry controller, and the cancellation token, and drives
//! the full lifecycle of a job: capability negotiation, submit, poll,
//! download, with every state change durably recorded. Multi-clip
//! sequences run through the same path, feeding each clip the extracted
//! last frame of its predecessor.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::{GenError, GenResult};
use crate::frames::LastFrameExtractor;
use crate::ledger::{Artifact, ArtifactFilter, ArtifactLedger, ArtifactStatus};
use crate::provider::{sanitize_job_id, JobHandle, JobState, ProviderClient, ProviderRegistry};
use crate::request::GenerationRequest;
use crate::retry::{CancelToken, RetryController, RetryPolicy};
use crate::stitch::{self, SequenceOutcome, StitchPlan};

// =============================================================================
// Configuration
// =============================================================================

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where clips, frames, and downloads land
    pub output_dir: PathBuf,
    /// Backoff policy shared by submit/poll/download
    pub retry: RetryPolicy,
    /// Sleep between polls of a running job
    pub poll_interval: Duration,
    /// Wall-clock budget for a single job to finish generating
    pub poll_timeout: Duration,
    /// Pause between clips of a stitched sequence
    pub inter_clip_delay: Duration,
}

impl EngineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(30 * 60),
            inter_clip_delay: Duration::from_secs(10),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_inter_clip_delay(mut self, delay: Duration) -> Self {
        self.inter_clip_delay = delay;
        self
    }
}

/// Outcome of a single clip generation.
#[derive(Debug, Clone)]
pub struct ClipResult {
    pub job_id: String,
    pub provider: String,
    pub model: String,
    pub local_path: PathBuf,
    /// The request as actually submitted, coercions applied
    pub request: GenerationRequest,
}

// =============================================================================
// GenerationEngine
// =============================================================================

/// Orchestrates providers, retries, and the ledger.
pub struct GenerationEngine {
    registry: ProviderRegistry,
    ledger: Mutex<ArtifactLedger>,
    extractor: Arc<dyn LastFrameExtractor>,
    config: EngineConfig,
    cancel: CancelToken,
    retry: RetryController,
}

impl std::fmt::Debug for GenerationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationEngine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GenerationEngine {
    pub fn new(
        registry: ProviderRegistry,
        ledger: ArtifactLedger,
        extractor: Arc<dyn LastFrameExtractor>,
        config: EngineConfig,
    ) -> Self {
        let cancel = CancelToken::new();
        let retry = RetryController::new(config.retry.clone(), cancel.clone());
        Self {
            registry,
            ledger: Mutex::new(ledger),
            extractor,
            config,
            cancel,
            retry,
        }
    }

    /// Token that aborts in-flight work, including backoff sleeps.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn ledger(&self) -> GenResult<MutexGuard<'_, ArtifactLedger>> {
        self.ledger
            .lock()
            .map_err(|_| GenError::Internal("Artifact ledger lock poisoned".to_string()))
    }

    /// List ledger entries, newest first.
    pub fn list_artifacts(&self, filter: &ArtifactFilter) -> GenResult<Vec<Artifact>> {
        Ok(self.ledger()?.list(filter).into_iter().cloned().collect())
    }

    // =========================================================================
    // Single Clip
    // =========================================================================

    /// Generate one clip into the default `<provider>_<job_id>.mp4` path.
    pub async fn generate(
        &self,
        provider_name: &str,
        request: GenerationRequest,
    ) -> GenResult<ClipResult> {
        self.generate_to(provider_name, request, None).await
    }

    /// Generate one clip into an explicit destination.
    pub async fn generate_to(
        &self,
        provider_name: &str,
        request: GenerationRequest,
        dest: Option<PathBuf>,
    ) -> GenResult<ClipResult> {
        self.cancel.check()?;

        let provider = self.registry.get(provider_name)?;
        if !provider.is_configured() {
            return Err(GenError::Auth {
                provider: provider_name.to_string(),
                message: "No credentials configured".to_string(),
            });
        }

        // Capability negotiation happens before anything touches the
        // network; coercions are logged inside.
        let (request, _coercions) = request.apply_capability(&provider.capabilities())?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let handle = self
            .retry
            .run("submit", || provider.submit(&request))
            .await?;
        info!(
            provider = provider_name,
            job_id = %handle.job_id,
            "Job submitted"
        );

        self.ledger()?.record(Artifact::new(
            handle.job_id.clone(),
            provider_name,
            model.clone(),
            &request,
        ))?;

        let download_url = match self.poll_until_terminal(provider.as_ref(), &handle).await {
            Ok(url) => url,
            Err(GenError::Cancelled) => return Err(GenError::Cancelled),
            Err(e) => {
                self.record_failure(&handle.job_id, ArtifactStatus::Failed);
                return Err(e);
            }
        };

        {
            let mut ledger = self.ledger()?;
            ledger.update_status(&handle.job_id, ArtifactStatus::Completed)?;
            if let Some(url) = &download_url {
                ledger.set_download_url(&handle.job_id, url.clone())?;
            }
        }

        let dest = match dest {
            Some(path) => path,
            None => self.config.output_dir.join(format!(
                "{}_{}.mp4",
                provider_name,
                sanitize_job_id(&handle.job_id)
            )),
        };

        let local_path = match self
            .retry
            .run("download", || provider.download(&handle, &dest))
            .await
        {
            Ok(path) => path,
            Err(GenError::Cancelled) => return Err(GenError::Cancelled),
            Err(e) => {
                self.record_failure(&handle.job_id, ArtifactStatus::DownloadFailed);
                return Err(e);
            }
        };

        self.ledger()?.mark_downloaded(&handle.job_id, &local_path)?;
        info!(
            job_id = %handle.job_id,
            path = %local_path.display(),
            "Clip ready"
        );

        Ok(ClipResult {
            job_id: handle.job_id,
            provider: provider_name.to_string(),
            model,
            local_path,
            request,
        })
    }

    /// Poll a job until it reaches a terminal state, within the timeout.
    /// Transient failures reported by the provider re-enter the retry
    /// controller as capacity errors.
    async fn poll_until_terminal(
        &self,
        provider: &dyn ProviderClient,
        handle: &JobHandle,
    ) -> GenResult<Option<String>> {
        self.ledger()?
            .update_status(&handle.job_id, ArtifactStatus::Polling)?;

        let started = Instant::now();
        loop {
            self.cancel.check()?;
            if started.elapsed() > self.config.poll_timeout {
                warn!(job_id = %handle.job_id, "Generation timed out");
                return Err(GenError::Timeout(self.config.poll_timeout));
            }

            let state = self
                .retry
                .run("poll", || async move {
                    match provider.poll(handle).await? {
                        JobState::FailedTransient { reason } => Err(GenError::Capacity {
                            message: reason,
                            retry_after: None,
                        }),
                        state => Ok(state),
                    }
                })
                .await?;

            match state {
                JobState::Succeeded { download_url } => return Ok(download_url),
                JobState::FailedFatal { reason } => {
                    return Err(GenError::GenerationFailed {
                        provider: handle.provider.clone(),
                        reason,
                    })
                }
                JobState::FailedTransient { reason } => {
                    return Err(GenError::Capacity {
                        message: reason,
                        retry_after: None,
                    })
                }
                JobState::Pending | JobState::Running { .. } => {
                    self.cancel.sleep(self.config.poll_interval).await?;
                }
            }
        }
    }

    /// Best-effort durable failure record; the original error wins.
    fn record_failure(&self, job_id: &str, status: ArtifactStatus) {
        match self.ledger() {
            Ok(mut ledger) => {
                if let Err(e) = ledger.update_status(job_id, status) {
                    warn!(job_id, error = %e, "Failed to record failure status");
                }
            }
            Err(e) => warn!(job_id, error = %e, "Failed to record failure status"),
        }
    }

    // =========================================================================
    // Stitched Sequences
    // =========================================================================

    /// Generate a multi-clip sequence with last-frame hand-off.
    ///
    /// A failure aborts at the failing clip; earlier clips and their
    /// ledger entries are left intact, so a later run with
    /// `plan.resume` picks up where this one stopped.
    pub async fn generate_sequence(
        &self,
        provider_name: &str,
        plan: &StitchPlan,
    ) -> GenResult<SequenceOutcome> {
        plan.validate()?;
        self.cancel.check()?;
        self.registry.get(provider_name)?;

        let run_id = Ulid::new();
        let total = plan.prompts.len();
        info!(%run_id, provider = provider_name, clips = total, "Starting stitched sequence");

        // The full image distribution is resolved (and logged) before
        // the first submission.
        let groups = stitch::resolve_groups(&plan.grouping, &plan.prompts)?;

        let out_dir = &self.config.output_dir;
        tokio::fs::create_dir_all(out_dir).await?;
        let expected = stitch::clip_output_paths(provider_name, total, out_dir);

        let (start_index, mut clips, mut handoff) = if plan.resume {
            let state =
                stitch::compute_resume_state(&expected, out_dir, self.extractor.as_ref()).await?;
            (state.start_index, state.completed, state.handoff_frame)
        } else {
            (0, Vec::new(), None)
        };

        let mut handoff_frames: Vec<PathBuf> = handoff.iter().cloned().collect();

        for idx in start_index..total {
            self.cancel.check()?;

            let mut request = GenerationRequest::new(plan.prompts[idx].clone())
                .with_dimensions(plan.width, plan.height)
                .with_fps(plan.fps)
                .with_duration(plan.duration_sec)
                .with_reference_images(groups[idx].clone());
            if let Some(seed) = plan.seed {
                request = request.with_seed(seed);
            }
            if let Some(model) = &plan.model {
                request = request.with_model(model.clone());
            }
            if let Some(frame) = &handoff {
                request = request.with_source_frame(frame.clone());
            }

            info!(%run_id, clip = idx + 1, total, "Generating clip");
            let result = self
                .generate_to(provider_name, request, Some(expected[idx].clone()))
                .await?;
            clips.push(result.local_path.clone());

            let is_last = idx + 1 == total;
            if !is_last {
                let frame = self
                    .extractor
                    .extract_last_frame(&result.local_path, out_dir)
                    .await?;
                handoff_frames.push(frame.clone());
                handoff = Some(frame);

                if !self.config.inter_clip_delay.is_zero() {
                    debug!(
                        delay_sec = self.config.inter_clip_delay.as_secs(),
                        "Pausing between clips"
                    );
                    self.cancel.sleep(self.config.inter_clip_delay).await?;
                }
            }
        }

        info!(%run_id, clips = clips.len(), "Sequence complete");
        Ok(SequenceOutcome {
            clips,
            handoff_frames,
        })
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    /// Fetch (or re-fetch) the output of a recorded job.
    ///
    /// Already-downloaded artifacts whose file is still on disk return
    /// idempotently. `completed` and `download_failed` artifacts are
    /// downloaded under retry and marked `downloaded` on success.
    pub async fn download_artifact(
        &self,
        job_id: &str,
        dest: Option<PathBuf>,
    ) -> GenResult<PathBuf> {
        self.cancel.check()?;

        let artifact = self
            .ledger()?
            .get(job_id)
            .cloned()
            .ok_or_else(|| GenError::ArtifactNotFound(job_id.to_string()))?;

        match artifact.status {
            ArtifactStatus::Downloaded => {
                if let Some(path) = &artifact.local_path {
                    if path.exists() {
                        debug!(job_id, path = %path.display(), "Artifact already downloaded");
                        return Ok(path.clone());
                    }
                }
            }
            ArtifactStatus::Completed | ArtifactStatus::DownloadFailed => {}
            other => {
                return Err(GenError::Validation(format!(
                    "Artifact {} is not downloadable in status {:?}",
                    job_id, other
                )))
            }
        }

        let provider = self.registry.get(&artifact.provider)?;
        let handle = JobHandle {
            provider: artifact.provider.clone(),
            job_id: job_id.to_string(),
            submitted_at: artifact.created_at,
        };

        let dest = match dest {
            Some(path) => path,
            None => self.config.output_dir.join(format!(
                "{}_{}.mp4",
                artifact.provider,
                sanitize_job_id(job_id)
            )),
        };

        match self
            .retry
            .run("download", || provider.download(&handle, &dest))
            .await
        {
            Ok(path) => {
                self.ledger()?.mark_downloaded(job_id, &path)?;
                Ok(path)
            }
            Err(GenError::Cancelled) => Err(GenError::Cancelled),
            Err(e) => {
                self.record_failure(job_id, ArtifactStatus::DownloadFailed);
                Err(e)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

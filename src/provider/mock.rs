//! Scriptable in-memory provider for orchestration tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{GenError, GenResult};
use crate::request::{DurationSet, GenerationRequest, ProviderCapability};

use super::{JobHandle, JobState, ProviderClient};

/// A provider that never touches the network. Failure modes are scripted
/// up front; every submitted request is recorded for later assertions.
pub struct MockProvider {
    name: String,
    capability: ProviderCapability,
    configured: bool,
    /// Remaining submits that fail with a capacity error
    transient_submit_failures: AtomicU32,
    /// 0-based submission index that fails fatally, if any
    fatal_submit_at: Option<usize>,
    /// Remaining downloads that fail with a download error
    download_failures: AtomicU32,
    /// States returned by successive polls; empty means `Succeeded`
    poll_script: Mutex<VecDeque<JobState>>,
    /// Successful submissions, in order
    submitted: Mutex<Vec<GenerationRequest>>,
    /// Total submit calls, including scripted failures
    submit_attempts: AtomicUsize,
    download_attempts: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: ProviderCapability {
                max_reference_images: 3,
                durations: DurationSet::Discrete(vec![5, 10]),
                supports_source_frame: true,
                supports_multi_image: true,
            },
            configured: true,
            transient_submit_failures: AtomicU32::new(0),
            fatal_submit_at: None,
            download_failures: AtomicU32::new(0),
            poll_script: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            submit_attempts: AtomicUsize::new(0),
            download_attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_capability(mut self, capability: ProviderCapability) -> Self {
        self.capability = capability;
        self
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    /// The next `count` submits fail with a capacity error.
    pub fn with_transient_submit_failures(self, count: u32) -> Self {
        self.transient_submit_failures.store(count, Ordering::SeqCst);
        self
    }

    /// The submission with this 0-based index (counting only successful
    /// submissions so far) fails fatally.
    pub fn with_fatal_submit_at(mut self, index: usize) -> Self {
        self.fatal_submit_at = Some(index);
        self
    }

    /// The next `count` downloads fail.
    pub fn with_download_failures(self, count: u32) -> Self {
        self.download_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Script the states returned by successive polls. Once drained,
    /// every poll reports success.
    pub fn with_poll_script(self, states: Vec<JobState>) -> Self {
        *self.poll_script.lock().unwrap() = states.into();
        self
    }

    /// Requests that reached the provider, in submission order.
    pub fn submitted_requests(&self) -> Vec<GenerationRequest> {
        self.submitted.lock().unwrap().clone()
    }

    /// Total submit calls, scripted failures included.
    pub fn submit_attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    pub fn download_attempts(&self) -> usize {
        self.download_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapability {
        self.capability.clone()
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn submit(&self, request: &GenerationRequest) -> GenResult<JobHandle> {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.transient_submit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_submit_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(GenError::Capacity {
                message: format!("{} at capacity (scripted)", self.name),
                retry_after: None,
            });
        }

        let mut submitted = self.submitted.lock().unwrap();
        if self.fatal_submit_at == Some(submitted.len()) {
            return Err(GenError::Api {
                status: 400,
                message: format!("{} rejected submission (scripted)", self.name),
            });
        }

        let job_id = format!("{}-job-{}", self.name, submitted.len());
        submitted.push(request.clone());
        Ok(JobHandle::new(self.name.clone(), job_id))
    }

    async fn poll(&self, _handle: &JobHandle) -> GenResult<JobState> {
        let next = self.poll_script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(JobState::Succeeded {
            download_url: Some("https://mock.invalid/video.mp4".to_string()),
        }))
    }

    async fn download(&self, handle: &JobHandle, dest: &Path) -> GenResult<PathBuf> {
        self.download_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.download_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.download_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GenError::Download(format!(
                "{} download interrupted (scripted)",
                self.name
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, format!("mock video bytes for {}", handle.job_id)).await?;
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_submissions_and_counts_attempts() {
        let mock = MockProvider::new("mock").with_transient_submit_failures(1);
        let request = GenerationRequest::new("A test");

        assert!(mock.submit(&request).await.is_err());
        let handle = mock.submit(&request).await.unwrap();

        assert_eq!(handle.job_id, "mock-job-0");
        assert_eq!(mock.submit_attempts(), 2);
        assert_eq!(mock.submitted_requests().len(), 1);
    }

    #[tokio::test]
    async fn fatal_submit_index_is_honored() {
        let mock = MockProvider::new("mock").with_fatal_submit_at(1);
        let request = GenerationRequest::new("A test");

        mock.submit(&request).await.unwrap();
        let second = mock.submit(&request).await;
        assert!(matches!(second, Err(GenError::Api { .. })));
    }

    #[tokio::test]
    async fn poll_script_drains_then_succeeds() {
        let mock = MockProvider::new("mock").with_poll_script(vec![
            JobState::Pending,
            JobState::Running {
                progress: Some(0.5),
                message: None,
            },
        ]);
        let handle = JobHandle::new("mock", "mock-job-0");

        assert_eq!(mock.poll(&handle).await.unwrap(), JobState::Pending);
        assert!(matches!(
            mock.poll(&handle).await.unwrap(),
            JobState::Running { .. }
        ));
        assert!(matches!(
            mock.poll(&handle).await.unwrap(),
            JobState::Succeeded { .. }
        ));
    }

    #[tokio::test]
    async fn download_writes_deterministic_bytes() {
        let mock = MockProvider::new("mock");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let handle = JobHandle::new("mock", "mock-job-0");

        let path = mock.download(&handle, &dest).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("mock-job-0"));
    }
}

//! Last-Frame Extraction
//!
//! Locates an ffmpeg binary and extracts the final frame of a clip as a
//! PNG, which becomes the source frame of the next clip in a stitched
//! sequence. Extraction sits behind a trait so orchestration tests can
//! substitute a stub.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{GenError, GenResult};

/// Well-known install locations checked before PATH lookup.
#[cfg(unix)]
const COMMON_FFMPEG_PATHS: &[&str] = &[
    "/usr/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
];

#[cfg(windows)]
const COMMON_FFMPEG_PATHS: &[&str] = &[
    "C:\\ffmpeg\\bin\\ffmpeg.exe",
    "C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe",
];

// =============================================================================
// Detection
// =============================================================================

/// A resolved ffmpeg installation.
#[derive(Debug, Clone)]
pub struct FfmpegInfo {
    pub ffmpeg_path: PathBuf,
    pub version: String,
}

/// Locate ffmpeg: well-known paths first, then PATH via `which`/`where`.
pub async fn detect_ffmpeg() -> GenResult<FfmpegInfo> {
    for candidate in COMMON_FFMPEG_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            let version = query_version(&path).await?;
            debug!(path = %path.display(), version, "Found ffmpeg at well-known path");
            return Ok(FfmpegInfo {
                ffmpeg_path: path,
                version,
            });
        }
    }

    let lookup = if cfg!(windows) { "where" } else { "which" };
    let output = Command::new(lookup)
        .arg("ffmpeg")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| GenError::FrameExtraction(format!("PATH lookup failed: {}", e)))?;

    if !output.status.success() {
        return Err(GenError::FrameExtraction(
            "ffmpeg not found. Install ffmpeg and ensure it is on PATH.".to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return Err(GenError::FrameExtraction(
            "ffmpeg not found. Install ffmpeg and ensure it is on PATH.".to_string(),
        ));
    }

    let path = PathBuf::from(first_line);
    let version = query_version(&path).await?;
    debug!(path = %path.display(), version, "Found ffmpeg on PATH");
    Ok(FfmpegInfo {
        ffmpeg_path: path,
        version,
    })
}

/// Read the version banner from `ffmpeg -version`.
async fn query_version(ffmpeg_path: &Path) -> GenResult<String> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            GenError::FrameExtraction(format!(
                "Failed to run {}: {}",
                ffmpeg_path.display(),
                e
            ))
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    // Banner looks like: "ffmpeg version 6.1.1 Copyright ..."
    let version = stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(2))
        .unwrap_or("unknown")
        .to_string();
    Ok(version)
}

// =============================================================================
// Extraction
// =============================================================================

/// Seam for last-frame extraction so orchestration can be tested without
/// a real ffmpeg binary or real video files.
#[async_trait]
pub trait LastFrameExtractor: Send + Sync {
    /// Extract the final frame of `video` as a PNG under `out_dir` and
    /// return the written path.
    async fn extract_last_frame(&self, video: &Path, out_dir: &Path) -> GenResult<PathBuf>;
}

/// ffmpeg-backed extractor.
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    info: Arc<FfmpegInfo>,
}

impl FfmpegExtractor {
    pub fn new(info: FfmpegInfo) -> Self {
        Self {
            info: Arc::new(info),
        }
    }

    /// Detect ffmpeg and build an extractor in one step.
    pub async fn detect() -> GenResult<Self> {
        Ok(Self::new(detect_ffmpeg().await?))
    }

    fn output_path(video: &Path, out_dir: &Path) -> PathBuf {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "clip".to_string());
        out_dir.join(format!("{}_last.png", stem))
    }
}

#[async_trait]
impl LastFrameExtractor for FfmpegExtractor {
    async fn extract_last_frame(&self, video: &Path, out_dir: &Path) -> GenResult<PathBuf> {
        if !video.exists() {
            return Err(GenError::FrameExtraction(format!(
                "Video not found: {}",
                video.display()
            )));
        }
        tokio::fs::create_dir_all(out_dir).await?;

        let output_path = Self::output_path(video, out_dir);

        // Seek one second before the end and keep overwriting a single
        // image, leaving the true last frame on disk.
        let output = Command::new(&self.info.ffmpeg_path)
            .arg("-y")
            .arg("-sseof")
            .arg("-1")
            .arg("-i")
            .arg(video)
            .arg("-update")
            .arg("1")
            .arg("-q:v")
            .arg("1")
            .arg(&output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| GenError::FrameExtraction(format!("Failed to run ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let truncated: String = stderr.chars().take(500).collect();
            return Err(GenError::FrameExtraction(format!(
                "ffmpeg exited with {}: {}",
                output.status, truncated
            )));
        }

        let metadata = tokio::fs::metadata(&output_path).await.map_err(|_| {
            GenError::FrameExtraction(format!(
                "ffmpeg produced no output at {}",
                output_path.display()
            ))
        })?;
        if metadata.len() == 0 {
            return Err(GenError::FrameExtraction(format!(
                "ffmpeg produced an empty frame at {}",
                output_path.display()
            )));
        }

        info!(
            video = %video.display(),
            frame = %output_path.display(),
            "Extracted last frame"
        );
        Ok(output_path)
    }
}

/// Test extractor that fabricates a frame file instead of running ffmpeg.
/// Records every extraction so orchestration tests can assert hand-offs.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct StubExtractor {
    calls: std::sync::Mutex<Vec<PathBuf>>,
}

#[cfg(test)]
impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Videos this stub was asked to extract from, in order.
    pub fn extracted_from(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl LastFrameExtractor for StubExtractor {
    async fn extract_last_frame(&self, video: &Path, out_dir: &Path) -> GenResult<PathBuf> {
        self.calls.lock().unwrap().push(video.to_path_buf());
        tokio::fs::create_dir_all(out_dir).await?;
        let out = FfmpegExtractor::output_path(video, out_dir);
        tokio::fs::write(&out, b"stub frame").await?;
        Ok(out)
    }
}

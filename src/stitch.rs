//! Stitched Sequence Planning
//!
//! A stitched sequence is a list of prompts rendered as consecutive
//! clips, where each clip after the first starts from the extracted last
//! frame of its predecessor. This module owns the deterministic parts
//! of that process: which images accompany which clip, what the output
//! files are called, and how much of an interrupted run can be reused.
//! The engine drives the actual generation loop.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{GenError, GenResult};
use crate::frames::LastFrameExtractor;

// =============================================================================
// Plan
// =============================================================================

/// How reference images are distributed across clips.
#[derive(Debug, Clone)]
pub enum ImageGrouping {
    /// No reference images
    None,
    /// Every clip gets the same list
    Shared(Vec<PathBuf>),
    /// Explicit list per clip; length must match the prompt count
    PerClip(Vec<Vec<PathBuf>>),
    /// Automatic: match image filename keywords against prompt text
    Keyword(Vec<PathBuf>),
}

/// A multi-clip generation request.
#[derive(Debug, Clone)]
pub struct StitchPlan {
    pub prompts: Vec<String>,
    pub grouping: ImageGrouping,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration_sec: u32,
    pub seed: Option<u64>,
    pub model: Option<String>,
    /// Reuse clips already present in the output directory
    pub resume: bool,
}

impl StitchPlan {
    pub fn new(prompts: Vec<String>) -> Self {
        Self {
            prompts,
            grouping: ImageGrouping::None,
            width: 1280,
            height: 720,
            fps: 24,
            duration_sec: 8,
            seed: None,
            model: None,
            resume: false,
        }
    }

    pub fn with_grouping(mut self, grouping: ImageGrouping) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_duration(mut self, duration_sec: u32) -> Self {
        self.duration_sec = duration_sec;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn validate(&self) -> GenResult<()> {
        if self.prompts.is_empty() {
            return Err(GenError::Validation(
                "Stitch plan needs at least one prompt".to_string(),
            ));
        }
        if self.prompts.iter().any(|p| p.trim().is_empty()) {
            return Err(GenError::Validation(
                "Stitch plan contains an empty prompt".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output of a completed sequence.
#[derive(Debug, Clone)]
pub struct SequenceOutcome {
    /// Clip files in order
    pub clips: Vec<PathBuf>,
    /// Extracted hand-off frames; one fewer than the clips
    pub handoff_frames: Vec<PathBuf>,
}

// =============================================================================
// Grouping Resolution
// =============================================================================

/// Resolve the image distribution up front, before any generation.
///
/// The result always has one entry per prompt. Keyword grouping is
/// deterministic: ties are broken lexicographically and unmatched
/// prompts fall back to the full image list, never an empty group.
pub fn resolve_groups(
    grouping: &ImageGrouping,
    prompts: &[String],
) -> GenResult<Vec<Vec<PathBuf>>> {
    let groups = match grouping {
        ImageGrouping::None => vec![Vec::new(); prompts.len()],
        ImageGrouping::Shared(images) => vec![images.clone(); prompts.len()],
        ImageGrouping::PerClip(groups) => {
            if groups.len() != prompts.len() {
                return Err(GenError::Validation(format!(
                    "Per-clip grouping has {} entries for {} prompts",
                    groups.len(),
                    prompts.len()
                )));
            }
            groups.clone()
        }
        ImageGrouping::Keyword(images) => resolve_keyword_groups(images, prompts)?,
    };

    for (idx, group) in groups.iter().enumerate() {
        info!(
            clip = idx + 1,
            images = group.len(),
            "Image distribution: {:?}",
            group.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()
        );
    }
    Ok(groups)
}

/// Keyword for an image: lowercased file stem with trailing digits
/// stripped, so `kitchen2.png` groups under "kitchen".
fn image_keyword(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    stem.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

fn resolve_keyword_groups(
    images: &[PathBuf],
    prompts: &[String],
) -> GenResult<Vec<Vec<PathBuf>>> {
    // BTreeMap keeps keyword iteration stable.
    let mut by_keyword: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for image in images {
        let keyword = image_keyword(image);
        if !keyword.is_empty() {
            by_keyword.entry(keyword).or_default().push(image.clone());
        }
    }

    // Longest keyword first so "living_room" wins over "room".
    let mut keywords: Vec<&String> = by_keyword.keys().collect();
    keywords.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut groups = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let lowered = prompt.to_ascii_lowercase();
        let mut matched: Vec<PathBuf> = Vec::new();
        for keyword in &keywords {
            let pattern = format!(r"\b{}\b", regex::escape(keyword));
            let re = Regex::new(&pattern)
                .map_err(|e| GenError::Internal(format!("Keyword regex failed: {}", e)))?;
            if re.is_match(&lowered) {
                for image in &by_keyword[keyword.as_str()] {
                    if !matched.contains(image) {
                        matched.push(image.clone());
                    }
                }
            }
        }
        if matched.is_empty() {
            // No keyword hit: give the clip everything rather than nothing
            matched = images.to_vec();
        }
        groups.push(matched);
    }
    Ok(groups)
}

// =============================================================================
// Clip Naming & Resume
// =============================================================================

/// Deterministic clip output paths: `<provider>_clip_<n>.mp4`, 1-based.
pub fn clip_output_paths(provider: &str, count: usize, out_dir: &Path) -> Vec<PathBuf> {
    (0..count)
        .map(|i| out_dir.join(format!("{}_clip_{}.mp4", provider, i + 1)))
        .collect()
}

/// Where an interrupted sequence can pick up again.
#[derive(Debug)]
pub struct ResumeState {
    /// Index of the first clip still to generate
    pub start_index: usize,
    /// Clips already on disk, in order
    pub completed: Vec<PathBuf>,
    /// Hand-off frame re-extracted from the last completed clip
    pub handoff_frame: Option<PathBuf>,
}

/// Count the longest prefix of expected clip files that exist and are
/// non-empty, and re-extract the hand-off frame when generation has to
/// continue from the middle.
pub async fn compute_resume_state(
    expected: &[PathBuf],
    frames_dir: &Path,
    extractor: &dyn LastFrameExtractor,
) -> GenResult<ResumeState> {
    let mut completed = Vec::new();
    for path in expected {
        let usable = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !usable {
            break;
        }
        completed.push(path.clone());
    }

    let start_index = completed.len();
    let handoff_frame = if start_index > 0 && start_index < expected.len() {
        let last_done = &completed[start_index - 1];
        info!(
            clip = start_index,
            video = %last_done.display(),
            "Resuming sequence, re-extracting hand-off frame"
        );
        Some(extractor.extract_last_frame(last_done, frames_dir).await?)
    } else {
        None
    };

    if start_index > 0 {
        info!(
            completed = start_index,
            total = expected.len(),
            "Reusing existing clips"
        );
    }

    Ok(ResumeState {
        start_index,
        completed,
        handoff_frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::StubExtractor;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn plan_validation() {
        assert!(StitchPlan::new(vec![]).validate().is_err());
        assert!(StitchPlan::new(vec!["A".to_string(), "  ".to_string()])
            .validate()
            .is_err());
        assert!(StitchPlan::new(vec!["A scene".to_string()]).validate().is_ok());
    }

    #[test]
    fn shared_grouping_repeats_images() {
        let prompts = vec!["one".to_string(), "two".to_string()];
        let images = paths(&["/img/a.png", "/img/b.png"]);
        let groups = resolve_groups(&ImageGrouping::Shared(images.clone()), &prompts).unwrap();
        assert_eq!(groups, vec![images.clone(), images]);
    }

    #[test]
    fn per_clip_grouping_must_match_prompt_count() {
        let prompts = vec!["one".to_string(), "two".to_string()];
        let groups = vec![paths(&["/img/a.png"])];
        assert!(matches!(
            resolve_groups(&ImageGrouping::PerClip(groups), &prompts),
            Err(GenError::Validation(_))
        ));
    }

    #[test]
    fn image_keyword_strips_trailing_digits() {
        assert_eq!(image_keyword(Path::new("/img/Kitchen2.png")), "kitchen");
        assert_eq!(image_keyword(Path::new("/img/garden.jpg")), "garden");
        assert_eq!(image_keyword(Path::new("/img/room_01.png")), "room_");
    }

    #[test]
    fn keyword_grouping_matches_prompts() {
        let images = paths(&[
            "/img/kitchen1.png",
            "/img/kitchen2.png",
            "/img/garden.png",
        ]);
        let prompts = vec![
            "A bright kitchen with morning light".to_string(),
            "The garden in autumn".to_string(),
        ];
        let groups = resolve_groups(&ImageGrouping::Keyword(images), &prompts).unwrap();
        assert_eq!(
            groups[0],
            paths(&["/img/kitchen1.png", "/img/kitchen2.png"])
        );
        assert_eq!(groups[1], paths(&["/img/garden.png"]));
    }

    #[test]
    fn keyword_grouping_falls_back_to_all_images() {
        let images = paths(&["/img/kitchen1.png", "/img/garden.png"]);
        let prompts = vec!["A spaceship drifting through nebulae".to_string()];
        let groups = resolve_groups(&ImageGrouping::Keyword(images.clone()), &prompts).unwrap();
        assert_eq!(groups[0], images);
    }

    #[test]
    fn keyword_grouping_is_deterministic() {
        let images = paths(&["/img/garden.png", "/img/kitchen1.png"]);
        let prompts = vec!["The kitchen opens onto the garden".to_string()];
        let a = resolve_groups(&ImageGrouping::Keyword(images.clone()), &prompts).unwrap();
        let b = resolve_groups(&ImageGrouping::Keyword(images), &prompts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 2);
    }

    #[test]
    fn clip_paths_are_one_based() {
        let out = clip_output_paths("runway", 3, Path::new("/videos"));
        assert_eq!(
            out,
            paths(&[
                "/videos/runway_clip_1.mp4",
                "/videos/runway_clip_2.mp4",
                "/videos/runway_clip_3.mp4",
            ])
        );
    }

    #[tokio::test]
    async fn resume_counts_non_empty_prefix_and_extracts_frame() {
        let dir = tempfile::tempdir().unwrap();
        let expected = clip_output_paths("mock", 3, dir.path());

        std::fs::write(&expected[0], b"clip one").unwrap();
        std::fs::write(&expected[1], b"clip two").unwrap();
        // expected[2] missing

        let extractor = StubExtractor::new();
        let state = compute_resume_state(&expected, dir.path(), &extractor)
            .await
            .unwrap();

        assert_eq!(state.start_index, 2);
        assert_eq!(state.completed.len(), 2);
        let frame = state.handoff_frame.unwrap();
        assert!(frame.to_string_lossy().ends_with("mock_clip_2_last.png"));
        assert_eq!(extractor.extracted_from(), vec![expected[1].clone()]);
    }

    #[tokio::test]
    async fn resume_ignores_empty_files_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let expected = clip_output_paths("mock", 3, dir.path());

        std::fs::write(&expected[0], b"").unwrap(); // empty, unusable
        std::fs::write(&expected[2], b"clip three").unwrap(); // after a gap

        let extractor = StubExtractor::new();
        let state = compute_resume_state(&expected, dir.path(), &extractor)
            .await
            .unwrap();

        assert_eq!(state.start_index, 0);
        assert!(state.handoff_frame.is_none());
        assert!(extractor.extracted_from().is_empty());
    }

    #[tokio::test]
    async fn resume_with_everything_done_needs_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let expected = clip_output_paths("mock", 2, dir.path());
        std::fs::write(&expected[0], b"one").unwrap();
        std::fs::write(&expected[1], b"two").unwrap();

        let extractor = StubExtractor::new();
        let state = compute_resume_state(&expected, dir.path(), &extractor)
            .await
            .unwrap();

        assert_eq!(state.start_index, 2);
        assert!(state.handoff_frame.is_none());
    }
}

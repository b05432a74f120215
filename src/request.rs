//! Uniform Generation Request Model
//!
//! A single request shape shared by every provider, plus the capability
//! descriptor each provider publishes and the negotiation step that fits
//! a request to a provider before anything touches the network.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::error::{GenError, GenResult};

/// Maximum prompt length accepted by any provider we target.
const MAX_PROMPT_LENGTH: usize = 4096;

// =============================================================================
// GenerationRequest
// =============================================================================

/// Parameters for a single clip generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    /// Text prompt describing the clip
    pub prompt: String,
    /// Style/content guidance images, shared across a stitched sequence
    #[serde(default)]
    pub reference_images: Vec<PathBuf>,
    /// First frame of the clip. In a stitched sequence this is the
    /// extracted last frame of the previous clip.
    #[serde(default)]
    pub source_frame: Option<PathBuf>,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Requested duration in seconds (coerced per provider capability)
    pub duration_sec: u32,
    /// Seed for reproducibility
    #[serde(default)]
    pub seed: Option<u64>,
    /// Provider model override; each client has a default
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerationRequest {
    /// Create a request with defaults (1280x720, 24 fps, 8 s).
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_images: Vec::new(),
            source_frame: None,
            width: 1280,
            height: 720,
            fps: 24,
            duration_sec: 8,
            seed: None,
            model: None,
        }
    }

    /// Set output dimensions
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set frame rate
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set duration in seconds
    pub fn with_duration(mut self, duration_sec: u32) -> Self {
        self.duration_sec = duration_sec;
        self
    }

    /// Set reference images
    pub fn with_reference_images(mut self, images: Vec<PathBuf>) -> Self {
        self.reference_images = images;
        self
    }

    /// Set the source frame (first frame of the clip)
    pub fn with_source_frame(mut self, frame: impl Into<PathBuf>) -> Self {
        self.source_frame = Some(frame.into());
        self
    }

    /// Set the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Validate provider-independent constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("Prompt cannot be empty".to_string());
        }
        if self.prompt.len() > MAX_PROMPT_LENGTH {
            return Err(format!(
                "Prompt too long: {} chars (max {})",
                self.prompt.len(),
                MAX_PROMPT_LENGTH
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err("Video dimensions must be positive".to_string());
        }
        if self.fps == 0 {
            return Err("FPS must be positive".to_string());
        }
        if self.duration_sec == 0 {
            return Err("Duration must be positive".to_string());
        }
        if let Some(frame) = &self.source_frame {
            if self.reference_images.contains(frame) {
                return Err(format!(
                    "Source frame {} must not also appear in reference images",
                    frame.display()
                ));
            }
        }
        Ok(())
    }

    /// Fit this request to a provider's capability before submission.
    ///
    /// Hard limits (reference image cap, unsupported source frame or
    /// multi-image input) fail validation outright. Duration is coerced
    /// to the provider's allowed set and the adjustment is returned so
    /// callers can surface it before any network call happens.
    pub fn apply_capability(
        &self,
        capability: &ProviderCapability,
    ) -> GenResult<(GenerationRequest, Vec<Coercion>)> {
        self.validate().map_err(GenError::Validation)?;

        if self.reference_images.len() > capability.max_reference_images {
            return Err(GenError::Validation(format!(
                "Too many reference images: {} (provider allows {})",
                self.reference_images.len(),
                capability.max_reference_images
            )));
        }
        if self.reference_images.len() > 1 && !capability.supports_multi_image {
            return Err(GenError::Validation(
                "Provider does not support multiple reference images".to_string(),
            ));
        }
        if self.source_frame.is_some() && !capability.supports_source_frame {
            return Err(GenError::Validation(
                "Provider does not support a source frame".to_string(),
            ));
        }

        let mut coercions = Vec::new();
        let mut fitted = self.clone();

        let coerced = capability.durations.coerce(self.duration_sec);
        if coerced != self.duration_sec {
            info!(
                requested = self.duration_sec,
                coerced, "Coercing duration to provider capability"
            );
            coercions.push(Coercion::Duration {
                from: self.duration_sec,
                to: coerced,
            });
            fitted.duration_sec = coerced;
        }

        Ok((fitted, coercions))
    }
}

/// An adjustment made while fitting a request to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coercion {
    /// Requested duration was not offered; nearest-lower value chosen
    Duration { from: u32, to: u32 },
}

// =============================================================================
// ProviderCapability
// =============================================================================

/// What a provider can accept, published statically per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCapability {
    /// Hard cap on reference images per request
    pub max_reference_images: usize,
    /// Durations the provider will accept
    pub durations: DurationSet,
    /// Whether the provider accepts a first-frame image
    pub supports_source_frame: bool,
    /// Whether more than one reference image is accepted
    pub supports_multi_image: bool,
}

/// The durations a provider offers, either a discrete menu or a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurationSet {
    Discrete(Vec<u32>),
    Range { min: u32, max: u32 },
}

impl DurationSet {
    /// Nearest-lower coercion: the largest allowed duration not above the
    /// request. A request below every allowed value gets the smallest one.
    pub fn coerce(&self, requested: u32) -> u32 {
        match self {
            DurationSet::Discrete(values) => {
                let mut best_lower: Option<u32> = None;
                let mut smallest: Option<u32> = None;
                for &v in values {
                    if v <= requested && best_lower.is_none_or(|b| v > b) {
                        best_lower = Some(v);
                    }
                    if smallest.is_none_or(|s| v < s) {
                        smallest = Some(v);
                    }
                }
                best_lower.or(smallest).unwrap_or(requested)
            }
            DurationSet::Range { min, max } => requested.clamp(*min, *max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability() -> ProviderCapability {
        ProviderCapability {
            max_reference_images: 3,
            durations: DurationSet::Discrete(vec![5, 10]),
            supports_source_frame: true,
            supports_multi_image: true,
        }
    }

    #[test]
    fn builder_sets_fields() {
        let req = GenerationRequest::new("A sunset over the ocean")
            .with_dimensions(1920, 1080)
            .with_fps(30)
            .with_duration(10)
            .with_seed(42)
            .with_model("gen4_turbo");
        assert_eq!(req.width, 1920);
        assert_eq!(req.fps, 30);
        assert_eq!(req.duration_sec, 10);
        assert_eq!(req.seed, Some(42));
        assert_eq!(req.model.as_deref(), Some("gen4_turbo"));
    }

    #[test]
    fn validate_rejects_empty_prompt() {
        assert!(GenerationRequest::new("").validate().is_err());
        assert!(GenerationRequest::new("   ").validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_prompt() {
        let req = GenerationRequest::new("x".repeat(MAX_PROMPT_LENGTH + 1));
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_source_frame_in_reference_list() {
        let frame = PathBuf::from("/tmp/frame.png");
        let req = GenerationRequest::new("A test")
            .with_reference_images(vec![frame.clone()])
            .with_source_frame(frame);
        assert!(req.validate().is_err());
    }

    #[test]
    fn coerce_discrete_picks_nearest_lower() {
        let set = DurationSet::Discrete(vec![5, 10]);
        assert_eq!(set.coerce(7), 5);
        assert_eq!(set.coerce(10), 10);
        assert_eq!(set.coerce(12), 10);
        // Below every allowed value: smallest wins
        assert_eq!(set.coerce(3), 5);
    }

    #[test]
    fn coerce_range_clamps() {
        let set = DurationSet::Range { min: 4, max: 8 };
        assert_eq!(set.coerce(2), 4);
        assert_eq!(set.coerce(6), 6);
        assert_eq!(set.coerce(12), 8);
    }

    #[test]
    fn apply_capability_coerces_duration_observably() {
        let req = GenerationRequest::new("A test").with_duration(7);
        let (fitted, coercions) = req.apply_capability(&capability()).unwrap();
        assert_eq!(fitted.duration_sec, 5);
        assert_eq!(coercions, vec![Coercion::Duration { from: 7, to: 5 }]);
    }

    #[test]
    fn apply_capability_no_coercion_for_exact_duration() {
        let req = GenerationRequest::new("A test").with_duration(10);
        let (fitted, coercions) = req.apply_capability(&capability()).unwrap();
        assert_eq!(fitted.duration_sec, 10);
        assert!(coercions.is_empty());
    }

    #[test]
    fn apply_capability_rejects_excess_reference_images() {
        let images = (0..4).map(|i| PathBuf::from(format!("/img/{i}.png"))).collect();
        let req = GenerationRequest::new("A test").with_reference_images(images);
        assert!(matches!(
            req.apply_capability(&capability()),
            Err(GenError::Validation(_))
        ));
    }

    #[test]
    fn apply_capability_rejects_unsupported_source_frame() {
        let mut cap = capability();
        cap.supports_source_frame = false;
        let req = GenerationRequest::new("A test").with_source_frame("/tmp/frame.png");
        assert!(matches!(
            req.apply_capability(&cap),
            Err(GenError::Validation(_))
        ));
    }

    #[test]
    fn apply_capability_rejects_multi_image_when_unsupported() {
        let mut cap = capability();
        cap.supports_multi_image = false;
        let req = GenerationRequest::new("A test").with_reference_images(vec![
            PathBuf::from("/img/a.png"),
            PathBuf::from("/img/b.png"),
        ]);
        assert!(matches!(
            req.apply_capability(&cap),
            Err(GenError::Validation(_))
        ));
    }
}

//! Framechain
//!
//! Multi-provider AI video generation orchestrator. Text prompts and
//! reference images go in; finished video files come out, produced by
//! third-party generation APIs behind a uniform submit/poll/download
//! contract. Multi-clip sequences are stitched by feeding each clip the
//! extracted last frame of its predecessor, every job is durably
//! recorded in a JSON artifact ledger, and transient capacity failures
//! are absorbed by a classification-driven retry controller.
//!
//! The [`engine::GenerationEngine`] facade ties the pieces together:
//!
//! ```no_run
//! use std::sync::Arc;
//! use framechain::engine::{EngineConfig, GenerationEngine};
//! use framechain::frames::FfmpegExtractor;
//! use framechain::ledger::ArtifactLedger;
//! use framechain::provider::{runway::RunwayProvider, ProviderRegistry};
//! use framechain::request::GenerationRequest;
//!
//! # async fn run() -> framechain::error::GenResult<()> {
//! let registry = ProviderRegistry::new()
//!     .with(Arc::new(RunwayProvider::new(std::env::var("RUNWAY_API_KEY").unwrap_or_default())?));
//! let ledger = ArtifactLedger::open("artifacts.json")?;
//! let extractor = Arc::new(FfmpegExtractor::detect().await?);
//! let engine = GenerationEngine::new(registry, ledger, extractor, EngineConfig::new("out"));
//!
//! let clip = engine
//!     .generate("runway", GenerationRequest::new("A sunset over the ocean"))
//!     .await?;
//! println!("wrote {}", clip.local_path.display());
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod frames;
pub mod ledger;
pub mod provider;
pub mod request;
pub mod retry;
pub mod stitch;

pub use engine::{ClipResult, EngineConfig, GenerationEngine};
pub use error::{ErrorClass, GenError, GenResult};
pub use ledger::{Artifact, ArtifactFilter, ArtifactLedger, ArtifactStatus};
pub use provider::{JobHandle, JobState, ProviderClient, ProviderRegistry};
pub use request::{DurationSet, GenerationRequest, ProviderCapability};
pub use retry::{CancelToken, RetryController, RetryPolicy};
pub use stitch::{ImageGrouping, SequenceOutcome, StitchPlan};

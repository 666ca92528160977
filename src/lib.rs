//! # AV-Composer
//!
//! Enhance separately-authored audio and video assets and compose them into
//! one synchronized media file.
//!
//! Every request is planned before anything is decoded: stage chains,
//! media kinds, stage ordering and composition compatibility are checked
//! against probed metadata, so a rejected request allocates nothing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use av_composer::{
//!     composition::LengthPolicy,
//!     config::Config,
//!     engine::ExecutionEngine,
//!     media::MediaSource,
//!     planner::{CompositionRequest, Destination, Operation, SourceSpec, StageInvocation},
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let mut config = Config::default();
//! config.composition.length_policy = Some(LengthPolicy::PadSilence);
//! let engine = ExecutionEngine::new(&config)?;
//!
//! let request = CompositionRequest::new(Operation::AttachAudio { offset: Duration::ZERO })
//!     .with_input(SourceSpec::new(MediaSource::file("clips/intro.mp4")))
//!     .with_input(
//!         SourceSpec::new(MediaSource::file("narration.wav"))
//!             .with_stage(StageInvocation::named("denoise"))
//!             .with_stage(StageInvocation::named("normalize")),
//!     )
//!     .with_destination(Destination::file("output/final/intro.mp4"))
//!     .with_options(config.request_options());
//!
//! let output = engine.execute(request).await?;
//! println!("{:?}", output.destination);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`media`] - Segment model, loading and temporary storage
//! - [`stages`] - Enhancement stages and their registry
//! - [`planner`] - Requests and immutable execution plans
//! - [`composition`] - Concatenation and audio attachment
//! - [`engine`] - Execution, cancellation, retries and persistence
//! - [`config`] - Configuration management
//!
//! ## Custom Stages
//!
//! Implement [`Stage`](stages::Stage) and register it with a
//! [`StageRegistry`](stages::StageRegistry). `describe_output` must predict
//! `apply` exactly; the engine rejects any output that differs.
//!
//! ```rust,no_run
//! use av_composer::media::{MediaKind, MediaSegment, SegmentInfo};
//! use av_composer::stages::{Stage, StageCapabilities, StageParams};
//! use av_composer::Result;
//!
//! struct Passthrough;
//!
//! impl Stage for Passthrough {
//!     fn name(&self) -> &str {
//!         "passthrough"
//!     }
//!
//!     fn description(&self) -> &str {
//!         "Returns its input unchanged"
//!     }
//!
//!     fn capabilities(&self) -> StageCapabilities {
//!         StageCapabilities::transform(MediaKind::Audio, Vec::new())
//!     }
//!
//!     fn describe_output(&self, input: &SegmentInfo, _params: &StageParams) -> Result<SegmentInfo> {
//!         Ok(*input)
//!     }
//!
//!     fn apply(&self, input: MediaSegment, _params: &StageParams) -> Result<MediaSegment> {
//!         Ok(input)
//!     }
//! }
//! ```

pub mod composition;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod planner;
pub mod stages;

// Re-export commonly used types for convenience
pub use crate::{
    config::Config,
    engine::{CancellationToken, CommittedOutput, ExecutionEngine},
    error::{ComposerError, PlanningError, Result, StageError},
    media::{MediaSegment, MediaSource},
    planner::{CompositionRequest, Destination, Operation, SourceSpec, StageInvocation},
    stages::{Stage, StageRegistry},
};

//! # Execution Engine
//!
//! Runs an [`ExecutionPlan`](crate::planner::ExecutionPlan) from source
//! loading to commit.
//!
//! Each input chain is a task in a `JoinSet`; stage transforms run on the
//! blocking pool behind a semaphore sized by `max_parallel_stages`.
//! Composition starts only after every chain finished, and any failure
//! aborts the whole request with a single error.
//!
//! ```rust,no_run
//! use av_composer::config::Config;
//! use av_composer::engine::ExecutionEngine;
//! use av_composer::media::MediaSource;
//! use av_composer::planner::{CompositionRequest, Destination, Operation, SourceSpec, StageInvocation};
//!
//! # async fn run() -> av_composer::Result<()> {
//! let engine = ExecutionEngine::new(&Config::default())?;
//! let request = CompositionRequest::new(Operation::Enhance)
//!     .with_input(
//!         SourceSpec::new(MediaSource::file("voice.wav"))
//!             .with_stage(StageInvocation::named("normalize")),
//!     )
//!     .with_destination(Destination::file("output/voice.wav"));
//!
//! let output = engine.execute(request).await?;
//! println!("wrote {:?}", output.destination);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod executor;
pub mod persist;
pub mod retry;

pub use cancel::{CancellationToken, Checkpoint};
pub use executor::{CommittedOutput, ExecutionEngine, ExecutionReport, RequestState};
pub use persist::{ArtifactWriter, FsWriter, Persister};
pub use retry::RetryPolicy;

//! # Media Segment Model
//!
//! In-memory and on-disk representation of audio and video assets.
//!
//! - [`MediaSegment`] - one immutable unit of content plus metadata
//! - [`SegmentLoader`] - probes and decodes [`MediaSource`]s
//! - [`SpillArea`] - bounded temporary storage for spilled payloads
//!
//! ## Usage
//!
//! ```rust,no_run
//! use av_composer::media::{MediaSource, SegmentLoader};
//!
//! # fn main() -> av_composer::Result<()> {
//! let source = MediaSource::file("voice.wav");
//! let info = SegmentLoader::probe(&source)?;
//! println!("{:?} lasting {:?}", info.kind(), info.duration());
//!
//! let segment = SegmentLoader::load(source)?;
//! assert_eq!(segment.info(), &info);
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod loader;
pub mod manifest;
pub(crate) mod process;
pub mod spill;
pub mod types;

pub use loader::{MediaSource, SegmentLoader};
pub use manifest::SegmentManifest;
pub use spill::{SpillArea, SpillFile};
pub use types::{
    samples_for_frames, AudioData, AudioTrackInfo, Frame, FrameRate, Layout, MediaData,
    MediaKind, MediaSegment, Payload, SegmentInfo, StoragePolicy, VideoData,
};

//! # Video Stages
//!
//! Picture stages run per frame across the rayon pool. Stages that change
//! timing carry the bound audio track along and keep it exactly as long as
//! the picture.

mod color;
mod extract;
mod fade;
mod resize;
mod timing;

pub use color::ColorStage;
pub use extract::ExtractAudioStage;
pub use fade::VideoFadeStage;
pub use resize::ResizeStage;
pub use timing::{ConformRateStage, TrimStage, VideoReverseStage, VideoSpeedStage};

use crate::{
    error::{Result, StageError},
    media::{FrameRate, MediaData, MediaSegment, SegmentInfo, VideoData},
};

pub use super::audio::{END, FACTOR, FADE_IN, FADE_OUT, START};

// Video parameter names
pub const BRIGHTNESS: &str = "brightness";
pub const CONTRAST: &str = "contrast";
pub const SATURATION: &str = "saturation";
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
pub const FPS: &str = "fps";

/// Unwrap the video payload of `segment`, keeping its label
pub(crate) fn take_video(stage: &str, segment: MediaSegment) -> Result<(String, VideoData)> {
    let label = segment.label().to_string();
    match segment.into_data()? {
        MediaData::Video(video) => Ok((label, video)),
        MediaData::Audio(_) => Err(StageError::new(stage, "expected video input, got audio").into()),
    }
}

/// Metadata of `input` re-timed to `frames` at `rate`, with any track kept aligned
pub(crate) fn retimed(input: &SegmentInfo, rate: FrameRate, frames: u64) -> SegmentInfo {
    let (width, height) = input.resolution().unwrap_or((0, 0));
    let info = SegmentInfo::video(rate, width, height, frames);
    match input.audio_track {
        Some(track) => info.with_aligned_track(track.sample_rate, track.channels),
        None => info,
    }
}

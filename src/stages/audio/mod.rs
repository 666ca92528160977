//! # Audio Stages
//!
//! Sample-level stages (`volume`, `normalize`, `limit`, `dither`) keep the
//! input length and tolerate a trailing partial frame. Timing stages
//! (`fade`, `speed`, `reverse`, `cut`, `resample`, `denoise`) operate on whole
//! sample frames and refuse unaligned input.

mod denoise;
mod dither;
mod fade;
mod level;
mod timing;

pub use denoise::DenoiseStage;
pub use dither::DitherStage;
pub use fade::FadeStage;
pub use level::{LimitStage, NormalizeStage, VolumeStage};
pub use timing::{CutStage, ResampleStage, ReverseStage, SpeedStage};

pub(crate) use fade::{envelope, ramp_units};
pub(crate) use timing::{cut_range, reverse_frames, speed_frames, stretch};

use crate::{
    error::{Result, StageError},
    media::{AudioData, MediaData, MediaSegment},
};

// Audio parameter names
pub const DB: &str = "db";
pub const TARGET_DB: &str = "target_db";
pub const CEILING: &str = "ceiling";
pub const FADE_IN: &str = "fade_in";
pub const FADE_OUT: &str = "fade_out";
pub const FACTOR: &str = "factor";
pub const START: &str = "start";
pub const END: &str = "end";
pub const SAMPLE_RATE: &str = "sample_rate";
pub const THRESHOLD_DB: &str = "threshold_db";
pub const WINDOW: &str = "window";
pub const AMOUNT: &str = "amount";
pub const SEED: &str = "seed";

/// Unwrap the audio payload of `segment`, keeping its label
pub(crate) fn take_audio(stage: &str, segment: MediaSegment) -> Result<(String, AudioData)> {
    let label = segment.label().to_string();
    match segment.into_data()? {
        MediaData::Audio(audio) => Ok((label, audio)),
        MediaData::Video(_) => Err(StageError::new(stage, "expected audio input, got video").into()),
    }
}

pub(crate) fn db_to_gain(db: f64) -> f32 {
    10f64.powf(db / 20.0) as f32
}

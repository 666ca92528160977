use crate::{
    error::Result,
    media::{FrameRate, MediaKind, MediaSegment, SegmentInfo},
    stages::traits::{require_aligned, require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{take_audio, FADE_IN, FADE_OUT};

/// Linear fade in and fade out
pub struct FadeStage;

impl FadeStage {
    pub fn new() -> Self {
        Self
    }
}

/// Gain envelope for frame `index` of `total` with ramps of `fade_in` and `fade_out` frames
pub(crate) fn envelope(index: u64, total: u64, fade_in: u64, fade_out: u64) -> f32 {
    let mut gain = 1.0f32;
    if index < fade_in {
        gain *= index as f32 / fade_in as f32;
    }
    let remaining = total - index - 1;
    if remaining < fade_out {
        gain *= remaining as f32 / fade_out as f32;
    }
    gain
}

impl Stage for FadeStage {
    fn name(&self) -> &str {
        "fade"
    }

    fn description(&self) -> &str {
        "Ramp the level up from silence at the start and down to silence at the end"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![
                ParamSpec::float(FADE_IN, 0.0, 600.0, 2.0, "Fade-in length in seconds"),
                ParamSpec::float(FADE_OUT, 0.0, 600.0, 2.0, "Fade-out length in seconds"),
            ],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        require_aligned(self.name(), input)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, mut audio) = take_audio(self.name(), input)?;

        let rate = FrameRate::per_second(audio.sample_rate);
        let total = audio.frames();
        let fade_in = ramp_units(rate, params.get_f64_or(FADE_IN, 0.0)).min(total);
        let fade_out = ramp_units(rate, params.get_f64_or(FADE_OUT, 0.0)).min(total);

        let channels = audio.channels as usize;
        for (index, frame) in audio.samples.chunks_exact_mut(channels).enumerate() {
            let gain = envelope(index as u64, total, fade_in, fade_out);
            for sample in frame {
                *sample *= gain;
            }
        }
        Ok(MediaSegment::from_audio(label, audio))
    }
}

/// Whole units covered by `seconds` at `rate`
pub(crate) fn ramp_units(rate: FrameRate, seconds: f64) -> u64 {
    rate.units_round(std::time::Duration::from_secs_f64(seconds.max(0.0)))
}

use crate::{
    error::{Result, StageError},
    media::{MediaKind, MediaSegment, SegmentInfo},
    stages::traits::{require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{db_to_gain, take_audio, CEILING, DB, TARGET_DB};

/// Fixed gain change in decibels
pub struct VolumeStage;

impl VolumeStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for VolumeStage {
    fn name(&self) -> &str {
        "volume"
    }

    fn description(&self) -> &str {
        "Raise or lower the level by a fixed number of decibels"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![ParamSpec::float(DB, -60.0, 24.0, 3.0, "Gain in dB")],
        )
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        let gain = db_to_gain(params.get_f64_or(DB, 0.0));
        let (label, mut audio) = take_audio(self.name(), input)?;

        for sample in audio.samples.iter_mut() {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
        Ok(MediaSegment::from_audio(label, audio))
    }
}

/// RMS loudness normalization to a target level
pub struct NormalizeStage;

impl NormalizeStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for NormalizeStage {
    fn name(&self) -> &str {
        "normalize"
    }

    fn description(&self) -> &str {
        "Scale the whole segment so its RMS level matches a target"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![ParamSpec::float(TARGET_DB, -60.0, 0.0, -20.0, "Target RMS level in dBFS")],
        )
        .preceding(&["limit"])
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        let target_db = params.get_f64_or(TARGET_DB, -20.0);
        let (label, mut audio) = take_audio(self.name(), input)?;

        if audio.samples.is_empty() {
            return Err(StageError::new(self.name(), "empty input").into());
        }

        let power: f64 = audio.samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>()
            / audio.samples.len() as f64;
        let rms = power.sqrt();
        if rms > 0.0 {
            let current_db = 20.0 * rms.log10();
            let gain = db_to_gain(target_db - current_db);
            for sample in audio.samples.iter_mut() {
                *sample = (*sample * gain).clamp(-1.0, 1.0);
            }
        }
        Ok(MediaSegment::from_audio(label, audio))
    }
}

/// Hard ceiling on sample magnitude
pub struct LimitStage;

impl LimitStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for LimitStage {
    fn name(&self) -> &str {
        "limit"
    }

    fn description(&self) -> &str {
        "Clamp every sample to a peak ceiling"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![ParamSpec::float(CEILING, 0.01, 1.0, 0.95, "Peak ceiling as a linear amplitude")],
        )
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        let ceiling = params.get_f64_or(CEILING, 1.0) as f32;
        let (label, mut audio) = take_audio(self.name(), input)?;

        for sample in audio.samples.iter_mut() {
            *sample = sample.clamp(-ceiling, ceiling);
        }
        Ok(MediaSegment::from_audio(label, audio))
    }
}

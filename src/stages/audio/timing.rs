use std::time::Duration;

use crate::{
    error::{Result, StageError},
    media::{AudioData, FrameRate, MediaKind, MediaSegment, SegmentInfo},
    stages::traits::{require_aligned, require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{take_audio, END, FACTOR, SAMPLE_RATE, START};

/// Output length of a `frames`-long segment played `factor` times faster
pub(crate) fn speed_frames(frames: u64, factor: f64) -> u64 {
    (frames as f64 / factor).round() as u64
}

/// `frames` at rate `from` re-expressed at rate `to`, rounded to nearest
pub(crate) fn rescale_frames(frames: u64, from: u32, to: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    ((frames as u128 * to as u128 + from as u128 / 2) / from as u128) as u64
}

/// Linearly interpolate `audio` onto exactly `out_frames` sample frames
pub(crate) fn stretch(audio: &AudioData, out_frames: u64) -> AudioData {
    let in_frames = audio.frames();
    if in_frames == 0 {
        return AudioData::silence(audio.sample_rate, audio.channels, out_frames);
    }

    let channels = audio.channels as usize;
    let last = in_frames as usize - 1;
    let step = in_frames as f64 / out_frames.max(1) as f64;
    let mut samples = Vec::with_capacity(out_frames as usize * channels);

    for i in 0..out_frames as usize {
        let position = i as f64 * step;
        let i0 = (position.floor() as usize).min(last);
        let i1 = (i0 + 1).min(last);
        let t = (position - i0 as f64).clamp(0.0, 1.0) as f32;
        let (a, b) = (audio.frame(i0), audio.frame(i1));
        samples.extend((0..channels).map(|c| a[c] + (b[c] - a[c]) * t));
    }
    AudioData::new(samples, audio.sample_rate, audio.channels)
}

/// Reverse whole sample frames, keeping channel order within each frame
pub(crate) fn reverse_frames(audio: &mut AudioData) {
    let channels = audio.channels as usize;
    let reversed: Vec<f32> = audio
        .samples
        .chunks_exact(channels)
        .rev()
        .flatten()
        .copied()
        .collect();
    audio.samples = reversed;
}

/// Frame range `[start, end)` selected by `start`/`end` seconds at `rate`
pub(crate) fn cut_range(
    stage: &str,
    rate: FrameRate,
    units: u64,
    params: &StageParams,
) -> Result<(u64, u64)> {
    let start = rate.units_floor(Duration::from_secs_f64(params.get_f64_or(START, 0.0)));
    let end = params
        .get_f64(END)
        .map(|end| rate.units_floor(Duration::from_secs_f64(end)))
        .unwrap_or(units)
        .min(units);
    if start >= end {
        return Err(StageError::new(stage, format!("empty range: frames {}..{} of {}", start, end, units)).into());
    }
    Ok((start, end))
}

/// Playback speed change by resampling, which also shifts pitch
pub struct SpeedStage;

impl SpeedStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for SpeedStage {
    fn name(&self) -> &str {
        "speed"
    }

    fn description(&self) -> &str {
        "Play faster or slower; factor 2.0 halves the duration"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![ParamSpec::float(FACTOR, 0.25, 4.0, 1.25, "Speed multiplier")],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        require_aligned(self.name(), input)?;
        let mut output = *input;
        output.units = speed_frames(input.units, params.get_f64_or(FACTOR, 1.0));
        Ok(output)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, audio) = take_audio(self.name(), input)?;

        let out_frames = speed_frames(audio.frames(), params.get_f64_or(FACTOR, 1.0));
        Ok(MediaSegment::from_audio(label, stretch(&audio, out_frames)))
    }
}

/// Play the segment backwards
pub struct ReverseStage;

impl ReverseStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for ReverseStage {
    fn name(&self) -> &str {
        "reverse"
    }

    fn description(&self) -> &str {
        "Reverse the order of sample frames"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(MediaKind::Audio, Vec::new()).aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        require_aligned(self.name(), input)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, mut audio) = take_audio(self.name(), input)?;
        reverse_frames(&mut audio);
        Ok(MediaSegment::from_audio(label, audio))
    }
}

/// Keep only the part between two timestamps
pub struct CutStage;

impl CutStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for CutStage {
    fn name(&self) -> &str {
        "cut"
    }

    fn description(&self) -> &str {
        "Keep the section between start and end seconds"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![
                ParamSpec::float(START, 0.0, 86_400.0, 0.0, "Start time in seconds"),
                ParamSpec::optional_float(END, 0.0, 86_400.0, "End time in seconds; defaults to the end"),
            ],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        require_aligned(self.name(), input)?;
        let (start, end) = cut_range(self.name(), input.rate, input.units, &params)?;
        let mut output = *input;
        output.units = end - start;
        Ok(output)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, audio) = take_audio(self.name(), input)?;

        let rate = FrameRate::per_second(audio.sample_rate);
        let (start, end) = cut_range(self.name(), rate, audio.frames(), &params)?;
        Ok(MediaSegment::from_audio(label, audio.slice_frames(start, end - start)))
    }
}

/// Sample-rate conversion by linear interpolation
pub struct ResampleStage;

impl ResampleStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for ResampleStage {
    fn name(&self) -> &str {
        "resample"
    }

    fn description(&self) -> &str {
        "Convert to another sample rate without changing duration or pitch"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![ParamSpec::integer(SAMPLE_RATE, 8_000, 192_000, 48_000, "Target sample rate in Hz")],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        require_aligned(self.name(), input)?;
        let target = params.get_i64_or(SAMPLE_RATE, 48_000) as u32;
        let mut output = *input;
        output.units = rescale_frames(input.units, input.rate.num, target);
        output.rate = FrameRate::per_second(target);
        Ok(output)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, audio) = take_audio(self.name(), input)?;

        let target = params.get_i64_or(SAMPLE_RATE, 48_000) as u32;
        if target == audio.sample_rate {
            return Ok(MediaSegment::from_audio(label, audio));
        }
        let out_frames = rescale_frames(audio.frames(), audio.sample_rate, target);
        let mut output = stretch(&audio, out_frames);
        output.sample_rate = target;
        Ok(MediaSegment::from_audio(label, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaData;

    fn ramp(frames: usize, sample_rate: u32) -> AudioData {
        AudioData::new((0..frames).map(|i| i as f32 / frames as f32).collect(), sample_rate, 1)
    }

    fn audio_of(segment: MediaSegment) -> AudioData {
        match segment.into_data().unwrap() {
            MediaData::Audio(audio) => audio,
            _ => panic!("expected audio"),
        }
    }

    #[test]
    fn test_speed_prediction_matches_output() {
        let stage = SpeedStage::new();
        let params = StageParams::new().set(FACTOR, 2.0);
        let input = MediaSegment::from_audio("a", ramp(1_001, 8_000));
        let predicted = stage.describe_output(input.info(), &params).unwrap();

        let out = stage.apply(input, &params).unwrap();
        assert_eq!(out.info(), &predicted);
        assert_eq!(predicted.units, 501);
    }

    #[test]
    fn test_reverse_keeps_channel_order() {
        let input = MediaSegment::from_audio("a", AudioData::new(vec![1.0, 2.0, 3.0, 4.0], 8_000, 2));
        let out = audio_of(ReverseStage::new().apply(input, &StageParams::new()).unwrap());
        assert_eq!(out.samples, vec![3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_cut_selects_whole_frames() {
        let stage = CutStage::new();
        let params = StageParams::new().set(START, 0.5).set(END, 1.5);
        let input = MediaSegment::from_audio("a", ramp(20, 10));
        let predicted = stage.describe_output(input.info(), &params).unwrap();
        let out = stage.apply(input, &params).unwrap();

        assert_eq!(predicted.units, 10);
        assert_eq!(out.info(), &predicted);
        assert_eq!(audio_of(out).samples[0], 5.0 / 20.0);
    }

    #[test]
    fn test_cut_rejects_empty_range() {
        let params = StageParams::new().set(START, 3.0);
        let info = SegmentInfo::audio(10, 1, 20);
        assert!(CutStage::new().describe_output(&info, &params).is_err());
    }

    #[test]
    fn test_resample_preserves_duration() {
        let stage = ResampleStage::new();
        let params = StageParams::new().set(SAMPLE_RATE, 48_000i64);
        let input = MediaSegment::from_audio("a", ramp(44_100, 44_100));
        let predicted = stage.describe_output(input.info(), &params).unwrap();
        let out = stage.apply(input, &params).unwrap();

        assert_eq!(out.info(), &predicted);
        assert_eq!(out.info().units, 48_000);
        assert_eq!(out.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_stretch_of_silence_is_silence() {
        let out = stretch(&AudioData::new(Vec::new(), 8_000, 2), 4);
        assert_eq!(out.samples, vec![0.0; 8]);
    }
}

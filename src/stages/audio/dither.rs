use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    error::Result,
    media::{MediaKind, MediaSegment, SegmentInfo},
    stages::traits::{require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{take_audio, AMOUNT, SEED};

/// Triangular (TPDF) dither from a seeded generator
///
/// The generator is seeded from the parameters, so repeated runs with the
/// same input produce identical output.
pub struct DitherStage;

impl DitherStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for DitherStage {
    fn name(&self) -> &str {
        "dither"
    }

    fn description(&self) -> &str {
        "Add low-level triangular noise before reducing bit depth"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![
                ParamSpec::float(AMOUNT, 0.0, 0.01, 1.0 / 32_768.0, "Peak noise amplitude"),
                ParamSpec::integer(SEED, 0, i64::MAX, 0, "Noise generator seed"),
            ],
        )
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        let amount = params.get_f64_or(AMOUNT, 0.0) as f32;
        let mut rng = SmallRng::seed_from_u64(params.get_i64_or(SEED, 0) as u64);
        let (label, mut audio) = take_audio(self.name(), input)?;

        for sample in audio.samples.iter_mut() {
            let noise = rng.gen::<f32>() - rng.gen::<f32>();
            *sample = (*sample + noise * amount).clamp(-1.0, 1.0);
        }
        Ok(MediaSegment::from_audio(label, audio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioData, MediaData};

    fn dither(seed: i64) -> Vec<f32> {
        let input = MediaSegment::from_audio("a", AudioData::silence(8_000, 2, 256));
        let params = StageParams::new().set(AMOUNT, 0.001).set(SEED, seed);
        match DitherStage::new().apply(input, &params).unwrap().into_data().unwrap() {
            MediaData::Audio(audio) => audio.samples,
            _ => panic!("expected audio"),
        }
    }

    #[test]
    fn test_dither_is_deterministic() {
        assert_eq!(dither(7), dither(7));
        assert_ne!(dither(7), dither(8));
    }

    #[test]
    fn test_dither_stays_within_amount() {
        assert!(dither(1).iter().all(|s| s.abs() <= 0.001));
    }
}

use std::f32::consts::PI;
use std::sync::Arc;

use rayon::prelude::*;
use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::{
    error::{Result, StageError},
    media::{AudioData, MediaKind, MediaSegment, SegmentInfo},
    stages::traits::{require_aligned, require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{db_to_gain, take_audio, THRESHOLD_DB, WINDOW};

/// Spectral gate: STFT bins below a threshold are silenced
///
/// Uses a periodic Hann window at 50% overlap, which sums to unity, so
/// bins above the threshold are reconstructed unchanged.
pub struct DenoiseStage;

impl DenoiseStage {
    pub fn new() -> Self {
        Self
    }

    fn window_size(&self, params: &StageParams) -> Result<usize> {
        let window = params.get_i64_or(WINDOW, 1024) as usize;
        if !window.is_power_of_two() {
            return Err(StageError::new(self.name(), format!("window {} is not a power of two", window)).into());
        }
        Ok(window)
    }
}

struct Gate {
    window: usize,
    threshold: f32,
    hann: Vec<f32>,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
}

impl Gate {
    fn new(window: usize, threshold: f32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let hann = (0..window)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / window as f32).cos())
            .collect();
        Self {
            window,
            threshold,
            hann,
            forward: planner.plan_fft_forward(window),
            inverse: planner.plan_fft_inverse(window),
        }
    }

    fn process(&self, signal: &[f32]) -> std::result::Result<Vec<f32>, String> {
        let hop = self.window / 2;
        let padded_len = hop + signal.len() + self.window;
        let mut padded = vec![0.0f32; padded_len];
        padded[hop..hop + signal.len()].copy_from_slice(signal);
        let mut output = vec![0.0f32; padded_len];

        let mut input = self.forward.make_input_vec();
        let mut spectrum = self.forward.make_output_vec();
        let mut frame = self.inverse.make_output_vec();
        let magnitude_scale = 2.0 / self.window as f32;
        let last = spectrum.len() - 1;

        let mut start = 0;
        while start + self.window <= padded_len {
            for (i, slot) in input.iter_mut().enumerate() {
                *slot = padded[start + i] * self.hann[i];
            }
            self.forward
                .process(&mut input, &mut spectrum)
                .map_err(|e| e.to_string())?;

            for bin in spectrum.iter_mut() {
                if bin.norm() * magnitude_scale < self.threshold {
                    *bin = Complex::new(0.0, 0.0);
                }
            }
            spectrum[0].im = 0.0;
            spectrum[last].im = 0.0;

            self.inverse
                .process(&mut spectrum, &mut frame)
                .map_err(|e| e.to_string())?;
            for (i, &value) in frame.iter().enumerate() {
                output[start + i] += value / self.window as f32;
            }
            start += hop;
        }

        Ok(output[hop..hop + signal.len()].to_vec())
    }
}

impl Stage for DenoiseStage {
    fn name(&self) -> &str {
        "denoise"
    }

    fn description(&self) -> &str {
        "Spectral noise gate that silences quiet frequency bins"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Audio,
            vec![
                ParamSpec::float(THRESHOLD_DB, -120.0, 0.0, -50.0, "Bins quieter than this are removed"),
                ParamSpec::integer(WINDOW, 64, 16_384, 1024, "FFT size, a power of two"),
            ],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        self.window_size(&params)?;
        require_kind(self.name(), input, MediaKind::Audio)?;
        require_aligned(self.name(), input)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        let window = self.window_size(&params)?;
        require_aligned(self.name(), input.info())?;
        let (label, audio) = take_audio(self.name(), input)?;

        let gate = Gate::new(window, db_to_gain(params.get_f64_or(THRESHOLD_DB, -50.0)));
        let channels = audio.channels as usize;
        let gated = (0..channels)
            .into_par_iter()
            .map(|c| gate.process(&audio.channel_samples(c)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|cause| StageError::new(self.name(), cause))?;

        let mut samples = vec![0.0f32; audio.samples.len()];
        for (c, channel) in gated.iter().enumerate() {
            for (i, &value) in channel.iter().enumerate() {
                samples[i * channels + c] = value;
            }
        }
        Ok(MediaSegment::from_audio(
            label,
            AudioData::new(samples, audio.sample_rate, audio.channels),
        ))
    }
}

use rayon::prelude::*;

use crate::{
    error::Result,
    media::{Frame, MediaKind, MediaSegment, SegmentInfo},
    stages::traits::{require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{take_video, BRIGHTNESS, CONTRAST, SATURATION};

/// Brightness, contrast and saturation adjustment
///
/// Each factor blends away from a reference image: black for brightness,
/// the mean grey level for contrast and the per-pixel luma for saturation.
/// A factor of 1.0 leaves the picture unchanged.
pub struct ColorStage;

impl ColorStage {
    pub fn new() -> Self {
        Self
    }

    fn adjust(frame: &mut Frame, brightness: f32, contrast: f32, saturation: f32) {
        let bytes = frame.as_rgb_bytes_mut();

        if brightness != 1.0 {
            for value in bytes.iter_mut() {
                *value = to_u8(*value as f32 * brightness);
            }
        }

        if contrast != 1.0 {
            let pixels = (bytes.len() / 3).max(1) as f32;
            let mean = bytes.chunks_exact(3).map(luma).sum::<f32>() / pixels;
            for value in bytes.iter_mut() {
                *value = to_u8(mean + (*value as f32 - mean) * contrast);
            }
        }

        if saturation != 1.0 {
            for pixel in bytes.chunks_exact_mut(3) {
                let grey = luma(pixel);
                for value in pixel.iter_mut() {
                    *value = to_u8(grey + (*value as f32 - grey) * saturation);
                }
            }
        }
    }
}

fn luma(pixel: &[u8]) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

impl Stage for ColorStage {
    fn name(&self) -> &str {
        "color"
    }

    fn description(&self) -> &str {
        "Adjust brightness, contrast and saturation"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Video,
            vec![
                ParamSpec::float(BRIGHTNESS, 0.0, 4.0, 1.0, "Brightness factor"),
                ParamSpec::float(CONTRAST, 0.0, 4.0, 1.0, "Contrast factor"),
                ParamSpec::float(SATURATION, 0.0, 4.0, 1.0, "Saturation factor"),
            ],
        )
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Video)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        let brightness = params.get_f64_or(BRIGHTNESS, 1.0) as f32;
        let contrast = params.get_f64_or(CONTRAST, 1.0) as f32;
        let saturation = params.get_f64_or(SATURATION, 1.0) as f32;
        let (label, mut video) = take_video(self.name(), input)?;

        video
            .frames
            .par_iter_mut()
            .for_each(|frame| Self::adjust(frame, brightness, contrast, saturation));

        Ok(MediaSegment::from_video(label, video))
    }
}

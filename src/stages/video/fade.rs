use rayon::prelude::*;

use crate::{
    error::Result,
    media::{MediaKind, MediaSegment, SegmentInfo},
    stages::audio::{envelope, ramp_units},
    stages::traits::{require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{take_video, FADE_IN, FADE_OUT};

/// Fade the picture from and to black; the bound track is left as is
pub struct VideoFadeStage;

impl VideoFadeStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for VideoFadeStage {
    fn name(&self) -> &str {
        "video_fade"
    }

    fn description(&self) -> &str {
        "Fade the picture in from black and out to black"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Video,
            vec![
                ParamSpec::float(FADE_IN, 0.0, 600.0, 1.0, "Fade-in length in seconds"),
                ParamSpec::float(FADE_OUT, 0.0, 600.0, 1.0, "Fade-out length in seconds"),
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
        let (label, mut video) = take_video(self.name(), input)?;

        let total = video.frame_count();
        let fade_in = ramp_units(video.rate, params.get_f64_or(FADE_IN, 0.0)).min(total);
        let fade_out = ramp_units(video.rate, params.get_f64_or(FADE_OUT, 0.0)).min(total);

        video
            .frames
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, frame)| {
                let gain = envelope(index as u64, total, fade_in, fade_out);
                if gain < 1.0 {
                    for value in frame.as_rgb_bytes_mut() {
                        *value = (*value as f32 * gain).round() as u8;
                    }
                }
            });

        Ok(MediaSegment::from_video(label, video))
    }
}

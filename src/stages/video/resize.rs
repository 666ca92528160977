use image::imageops::{self, FilterType};
use rayon::prelude::*;

use crate::{
    error::Result,
    media::{Frame, Layout, MediaKind, MediaSegment, SegmentInfo, VideoData},
    stages::traits::{require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{take_video, HEIGHT, WIDTH};

/// Scale every frame to a fixed resolution with a Lanczos filter
pub struct ResizeStage;

impl ResizeStage {
    pub fn new() -> Self {
        Self
    }

    fn target(params: &StageParams) -> (u32, u32) {
        (
            params.get_i64_or(WIDTH, 1280) as u32,
            params.get_i64_or(HEIGHT, 720) as u32,
        )
    }
}

impl Stage for ResizeStage {
    fn name(&self) -> &str {
        "resize"
    }

    fn description(&self) -> &str {
        "Scale frames to a target resolution"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Video,
            vec![
                ParamSpec::integer(WIDTH, 2, 7_680, 1_280, "Output width in pixels"),
                ParamSpec::integer(HEIGHT, 2, 4_320, 720, "Output height in pixels"),
            ],
        )
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Video)?;
        let (width, height) = Self::target(&params);
        let mut output = *input;
        output.layout = Layout::Video { width, height };
        Ok(output)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        let (width, height) = Self::target(&params);
        let (label, video) = take_video(self.name(), input)?;

        if (video.width, video.height) == (width, height) {
            return Ok(MediaSegment::from_video(label, video));
        }

        let frames: Vec<Frame> = video
            .frames
            .par_iter()
            .map(|frame| Frame::new(imageops::resize(frame.as_image(), width, height, FilterType::Lanczos3)))
            .collect();
        let resized = VideoData::new(frames, video.rate, width, height, video.audio)?;
        Ok(MediaSegment::from_video(label, resized))
    }
}

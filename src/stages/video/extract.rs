use crate::{
    error::{Result, StageError},
    media::{MediaKind, MediaSegment, SegmentInfo},
    stages::traits::{require_aligned, require_kind, Stage, StageCapabilities, StageParams},
};

use super::take_video;

/// Turn the bound track of a video segment into an audio segment
pub struct ExtractAudioStage;

impl ExtractAudioStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for ExtractAudioStage {
    fn name(&self) -> &str {
        "extract_audio"
    }

    fn description(&self) -> &str {
        "Drop the picture and keep the audio track"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities {
            input_kinds: vec![MediaKind::Video],
            output_kind: MediaKind::Audio,
            params: Vec::new(),
            must_precede: Vec::new(),
            requires_aligned: true,
        }
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Video)?;
        require_aligned(self.name(), input)?;
        let track = input
            .audio_track
            .ok_or_else(|| StageError::new(self.name(), "video has no audio track"))?;
        Ok(SegmentInfo::audio(track.sample_rate, track.channels, track.frames))
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, video) = take_video(self.name(), input)?;
        let track = video
            .audio
            .ok_or_else(|| StageError::new(self.name(), "video has no audio track"))?;
        Ok(MediaSegment::from_audio(label, track))
    }
}

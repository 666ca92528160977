use crate::{
    error::{Result, StageError},
    media::{samples_for_frames, FrameRate, MediaKind, MediaSegment, SegmentInfo, VideoData},
    stages::audio::{cut_range, reverse_frames, speed_frames, stretch},
    stages::traits::{require_aligned, require_kind, ParamSpec, Stage, StageCapabilities, StageParams},
};

use super::{retimed, take_video, END, FACTOR, FPS, START};

fn rebuild(video: VideoData, frames: Vec<crate::media::Frame>, rate: FrameRate) -> Result<VideoData> {
    VideoData::new(frames, rate, video.width, video.height, video.audio)
}

/// Change playback speed by dropping or repeating frames
pub struct VideoSpeedStage;

impl VideoSpeedStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for VideoSpeedStage {
    fn name(&self) -> &str {
        "video_speed"
    }

    fn description(&self) -> &str {
        "Play faster or slower by dropping or repeating frames; the track is stretched to match"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Video,
            vec![ParamSpec::float(FACTOR, 0.25, 4.0, 1.25, "Speed multiplier")],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Video)?;
        require_aligned(self.name(), input)?;
        let frames = speed_frames(input.units, params.get_f64_or(FACTOR, 1.0));
        Ok(retimed(input, input.rate, frames))
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let factor = params.get_f64_or(FACTOR, 1.0);
        let (label, mut video) = take_video(self.name(), input)?;

        let total = video.frames.len();
        let out_frames = speed_frames(total as u64, factor);
        let frames = (0..out_frames as usize)
            .map(|i| video.frames[((i as f64 * factor) as usize).min(total - 1)].clone())
            .collect();

        video.audio = video.audio.take().map(|track| {
            let samples = samples_for_frames(out_frames, video.rate, track.sample_rate);
            stretch(&track, samples)
        });
        let rate = video.rate;
        Ok(MediaSegment::from_video(label, rebuild(video, frames, rate)?))
    }
}

/// Keep only the frames between two timestamps
pub struct TrimStage;

impl TrimStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for TrimStage {
    fn name(&self) -> &str {
        "trim"
    }

    fn description(&self) -> &str {
        "Keep the frames between start and end seconds, with the matching audio"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Video,
            vec![
                ParamSpec::float(START, 0.0, 86_400.0, 0.0, "Start time in seconds"),
                ParamSpec::optional_float(END, 0.0, 86_400.0, "End time in seconds; defaults to the end"),
            ],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Video)?;
        require_aligned(self.name(), input)?;
        let (start, end) = cut_range(self.name(), input.rate, input.units, &params)?;
        Ok(retimed(input, input.rate, end - start))
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, mut video) = take_video(self.name(), input)?;

        let (start, end) = cut_range(self.name(), video.rate, video.frame_count(), &params)?;
        let frames = video.frames[start as usize..end as usize].to_vec();
        let rate = video.rate;
        video.audio = video.audio.take().map(|track| {
            let from = samples_for_frames(start, rate, track.sample_rate);
            let count = samples_for_frames(end - start, rate, track.sample_rate);
            track.slice_frames(from, count)
        });
        Ok(MediaSegment::from_video(label, rebuild(video, frames, rate)?))
    }
}

/// Play the picture and its track backwards
pub struct VideoReverseStage;

impl VideoReverseStage {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for VideoReverseStage {
    fn name(&self) -> &str {
        "video_reverse"
    }

    fn description(&self) -> &str {
        "Reverse frame order and the bound audio track"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(MediaKind::Video, Vec::new()).aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Video)?;
        require_aligned(self.name(), input)?;
        Ok(*input)
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let (label, mut video) = take_video(self.name(), input)?;
        video.frames.reverse();
        if let Some(track) = video.audio.as_mut() {
            reverse_frames(track);
        }
        Ok(MediaSegment::from_video(label, video))
    }
}

/// Convert to another frame rate, keeping duration
pub struct ConformRateStage;

impl ConformRateStage {
    pub fn new() -> Self {
        Self
    }

    fn target(&self, params: &StageParams) -> Result<FrameRate> {
        let fps = params.get_f64_or(FPS, 30.0);
        FrameRate::from_fps(fps)
            .ok_or_else(|| StageError::new(self.name(), format!("invalid frame rate {}", fps)).into())
    }
}

/// Frames at `to` spanning `frames` at `from`, rounded to nearest
fn conformed_frames(frames: u64, from: FrameRate, to: FrameRate) -> u64 {
    let num = frames as u128 * to.num as u128 * from.den as u128;
    let den = to.den as u128 * from.num as u128;
    ((num + den / 2) / den) as u64
}

impl Stage for ConformRateStage {
    fn name(&self) -> &str {
        "conform_rate"
    }

    fn description(&self) -> &str {
        "Change the frame rate by dropping or repeating frames"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities::transform(
            MediaKind::Video,
            vec![ParamSpec::float(FPS, 1.0, 240.0, 30.0, "Target frames per second")],
        )
        .aligned()
    }

    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo> {
        let params = self.resolve(params)?;
        require_kind(self.name(), input, MediaKind::Video)?;
        require_aligned(self.name(), input)?;
        let target = self.target(&params)?;
        Ok(retimed(input, target, conformed_frames(input.units, input.rate, target)))
    }

    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment> {
        let params = self.resolve(params)?;
        require_aligned(self.name(), input.info())?;
        let target = self.target(&params)?;
        let (label, mut video) = take_video(self.name(), input)?;

        let source = video.rate;
        let total = video.frames.len();
        let out_frames = conformed_frames(total as u64, source, target);
        // Output frame i shows the source frame on screen at time i / target
        let frames = (0..out_frames as u128)
            .map(|i| {
                let index = i * source.num as u128 * target.den as u128
                    / (source.den as u128 * target.num as u128);
                video.frames[(index as usize).min(total - 1)].clone()
            })
            .collect();

        video.audio = video.audio.take().map(|track| {
            let samples = samples_for_frames(out_frames, target, track.sample_rate);
            track.slice_frames(0, samples)
        });
        Ok(MediaSegment::from_video(label, rebuild(video, frames, target)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioData, Frame, MediaData};
    use std::time::Duration;

    fn numbered(count: usize, rate: FrameRate, track: bool) -> MediaSegment {
        let frames = (0..count)
            .map(|i| Frame::new_filled(2, 2, [i as u8, 0, 0]))
            .collect();
        let audio = track.then(|| {
            let samples = samples_for_frames(count as u64, rate, 8_000);
            AudioData::new((0..samples).map(|i| i as f32).collect(), 8_000, 1)
        });
        MediaSegment::from_video("v", VideoData::new(frames, rate, 2, 2, audio).unwrap())
    }

    fn video_of(segment: MediaSegment) -> VideoData {
        match segment.into_data().unwrap() {
            MediaData::Video(video) => video,
            _ => panic!("expected video"),
        }
    }

    #[test]
    fn test_trim_cuts_picture_and_track() {
        let stage = TrimStage::new();
        let params = StageParams::new().set(START, 1.0).set(END, 2.0);
        let input = numbered(75, FrameRate::per_second(25), true);
        let predicted = stage.describe_output(input.info(), &params).unwrap();
        let out = stage.apply(input, &params).unwrap();

        assert_eq!(out.info(), &predicted);
        assert_eq!(out.duration(), Duration::from_secs(1));
        let video = video_of(out);
        assert_eq!(video.frames[0].get_pixel(0, 0)[0], 25);
        assert_eq!(video.audio.unwrap().samples[0], 8_000.0);
    }

    #[test]
    fn test_speed_keeps_track_aligned() {
        let stage = VideoSpeedStage::new();
        let params = StageParams::new().set(FACTOR, 2.0);
        let input = numbered(50, FrameRate::per_second(25), true);
        let predicted = stage.describe_output(input.info(), &params).unwrap();
        let out = stage.apply(input, &params).unwrap();

        assert_eq!(out.info(), &predicted);
        assert!(predicted.aligned);
        let video = video_of(out);
        assert_eq!(video.frame_count(), 25);
        assert_eq!(video.frames[3].get_pixel(0, 0)[0], 6);
    }

    #[test]
    fn test_reverse_flips_frames() {
        let out = VideoReverseStage::new()
            .apply(numbered(4, FrameRate::per_second(25), false), &StageParams::new())
            .unwrap();
        let video = video_of(out);
        assert_eq!(video.frames[0].get_pixel(0, 0)[0], 3);
    }

    #[test]
    fn test_conform_rate_keeps_duration() {
        let stage = ConformRateStage::new();
        let params = StageParams::new().set(FPS, 30.0);
        let input = numbered(50, FrameRate::per_second(25), true);
        let predicted = stage.describe_output(input.info(), &params).unwrap();
        let out = stage.apply(input, &params).unwrap();

        assert_eq!(out.info(), &predicted);
        assert_eq!(predicted.units, 60);
        assert_eq!(out.duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_conform_rate_to_ntsc() {
        let params = StageParams::new().set(FPS, 29.97);
        let info = SegmentInfo::video(FrameRate::per_second(25), 2, 2, 250);
        let out = ConformRateStage::new().describe_output(&info, &params).unwrap();
        assert_eq!(out.rate, FrameRate::new(30_000, 1_001));
        assert_eq!(out.units, 300);
    }
}

use std::cmp::Ordering;

use tracing::{debug, info};

use crate::{
    composition::policy::{AttachOptions, BoundaryPolicy, LengthPolicy},
    error::{ComposerError, PlanningError, Result},
    media::{
        samples_for_frames, AudioData, AudioTrackInfo, Frame, FrameRate, Layout, MediaData,
        MediaKind, MediaSegment, SegmentInfo, VideoData,
    },
};

const CONCAT: &str = "concat";
const ATTACH: &str = "attach_audio";

/// Terminal merge step of a plan
///
/// Each operation has a `plan_*` form that works on metadata alone and is
/// used by the planner, and a data form that produces exactly the planned
/// metadata.
pub struct Compositor;

impl Compositor {
    /// Predict the output of concatenating segments described by `inputs`
    pub fn plan_concat(inputs: &[SegmentInfo], boundary: Option<BoundaryPolicy>) -> Result<SegmentInfo> {
        let first = inputs.first().ok_or_else(|| PlanningError::InputCount {
            operation: CONCAT.to_string(),
            expected: "at least 1".to_string(),
            actual: 0,
        })?;

        let mut total = 0u64;
        for (index, info) in inputs.iter().enumerate() {
            check_compatible(index, first, info)?;
            total += match (info.aligned, boundary) {
                (true, _) => info.units,
                (false, Some(policy)) => conformed_units(info, policy),
                (false, None) => return Err(PlanningError::BoundaryPolicyRequired { input: index }.into()),
            };
        }

        Ok(match first.layout {
            Layout::Audio { channels } => SegmentInfo::audio(first.rate.num, channels, total),
            Layout::Video { width, height } => {
                let info = SegmentInfo::video(first.rate, width, height, total);
                match first.audio_track {
                    Some(track) => info.with_aligned_track(track.sample_rate, track.channels),
                    None => info,
                }
            }
        })
    }

    /// Sequence `segments` in order with zero overlap
    pub fn concat(segments: Vec<MediaSegment>, boundary: Option<BoundaryPolicy>) -> Result<MediaSegment> {
        let infos: Vec<SegmentInfo> = segments.iter().map(|s| *s.info()).collect();
        let expected = Self::plan_concat(&infos, boundary)?;
        let label = segments
            .iter()
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join("+");

        info!("Concatenating {} segment(s) into {:?}", segments.len(), expected.duration());

        let mut parts = Vec::with_capacity(segments.len());
        for (segment, info) in segments.into_iter().zip(infos.iter()) {
            let data = segment.into_data()?;
            parts.push(match (info.aligned, boundary) {
                (false, Some(policy)) => conform(data, info, policy),
                _ => data,
            });
        }

        let data = match expected.layout {
            Layout::Audio { channels } => MediaData::Audio(concat_audio(parts, expected.rate.num, channels)),
            Layout::Video { width, height } => {
                MediaData::Video(concat_video(parts, &expected, width, height)?)
            }
        };
        Ok(MediaSegment::new(label, data))
    }

    /// Predict the output of binding `audio` to `video`
    pub fn plan_attach(video: &SegmentInfo, audio: &SegmentInfo, options: &AttachOptions) -> Result<SegmentInfo> {
        expect_kind(ATTACH, 0, video, MediaKind::Video)?;
        expect_kind(ATTACH, 1, audio, MediaKind::Audio)?;

        let video_duration = video.duration();
        if options.offset >= video_duration {
            return Err(PlanningError::OffsetBeyondVideo {
                offset: options.offset,
                video: video_duration,
            }
            .into());
        }

        let audio_end = options.offset + audio.duration();
        let mismatch = if audio_end > video_duration {
            audio_end - video_duration
        } else {
            video_duration - audio_end
        };
        let incompatible = || ComposerError::IncompatibleLengths {
            video: video_duration,
            audio_end,
            tolerance: options.tolerance,
        };
        if options.policy.is_none() && mismatch > options.tolerance {
            return Err(incompatible());
        }

        let frames = match options.policy {
            Some(LengthPolicy::Trim) if audio_end < video_duration => {
                let covered = video.rate.units_floor(audio_end);
                if covered == 0 {
                    return Err(incompatible());
                }
                covered
            }
            _ => video.units,
        };

        let (width, height) = video.resolution().unwrap_or((0, 0));
        let channels = audio.channels().unwrap_or(1);
        Ok(SegmentInfo::video(video.rate, width, height, frames).with_aligned_track(audio.rate.num, channels))
    }

    /// Bind `audio` as the track of `video`, starting at `options.offset`
    ///
    /// Any existing track on the video is replaced.
    pub fn attach_audio(video: MediaSegment, audio: MediaSegment, options: &AttachOptions) -> Result<MediaSegment> {
        let expected = Self::plan_attach(video.info(), audio.info(), options)?;
        let label = video.label().to_string();
        info!(
            "Attaching '{}' to '{}' at {:?} (policy: {})",
            audio.label(),
            label,
            options.offset,
            options
                .policy
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        let mut picture = match video.into_data()? {
            MediaData::Video(video) => video,
            MediaData::Audio(_) => return Err(kind_mismatch(ATTACH, 0, MediaKind::Video, MediaKind::Audio)),
        };
        let audio = match audio.into_data()? {
            MediaData::Audio(audio) => audio,
            MediaData::Video(_) => return Err(kind_mismatch(ATTACH, 1, MediaKind::Audio, MediaKind::Video)),
        };

        picture.frames.truncate(expected.units as usize);
        let track_frames = expected.audio_track.map(|t| t.frames).unwrap_or(0);
        let lead = FrameRate::per_second(audio.sample_rate).units_round(options.offset);
        let looped = options.policy == Some(LengthPolicy::Loop);
        debug!("Track: {} frames, {} frames of leading silence", track_frames, lead);

        picture.audio = Some(build_track(&audio, track_frames, lead, looped));
        Ok(MediaSegment::from_video(label, picture))
    }
}

fn kind_mismatch(operation: &str, input: usize, expected: MediaKind, actual: MediaKind) -> ComposerError {
    PlanningError::KindMismatch {
        operation: operation.to_string(),
        input,
        expected,
        actual,
    }
    .into()
}

fn expect_kind(operation: &str, input: usize, info: &SegmentInfo, expected: MediaKind) -> Result<()> {
    if info.kind() == expected {
        Ok(())
    } else {
        Err(kind_mismatch(operation, input, expected, info.kind()))
    }
}

fn check_compatible(index: usize, first: &SegmentInfo, info: &SegmentInfo) -> Result<()> {
    expect_kind(CONCAT, index, info, first.kind())?;
    let incompatible = |reason: String| -> ComposerError {
        PlanningError::IncompatibleSegments { input: index, reason }.into()
    };

    if info.rate != first.rate {
        return Err(incompatible(format!("rate {} differs from {}", info.rate, first.rate)));
    }
    if info.layout != first.layout {
        return Err(incompatible(format!("layout {:?} differs from {:?}", info.layout, first.layout)));
    }
    match (first.audio_track, info.audio_track) {
        (None, None) => Ok(()),
        (Some(a), Some(b)) if a.sample_rate == b.sample_rate && a.channels == b.channels => Ok(()),
        (a, b) => Err(incompatible(format!(
            "audio track {} differs from {}",
            describe_track(b),
            describe_track(a)
        ))),
    }
}

fn describe_track(track: Option<AudioTrackInfo>) -> String {
    match track {
        Some(t) => format!("{} Hz x{}", t.sample_rate, t.channels),
        None => "absent".to_string(),
    }
}

/// Whole frames at `rate` spanned by `track`
fn frames_covering(track: &AudioTrackInfo, rate: FrameRate, round_up: bool) -> u64 {
    let num = track.frames as u128 * rate.num as u128;
    let den = track.sample_rate as u128 * rate.den as u128;
    if den == 0 {
        return 0;
    }
    let frames = if round_up { (num + den - 1) / den } else { num / den };
    frames as u64
}

/// Unit count of an unaligned segment after applying `policy`
fn conformed_units(info: &SegmentInfo, policy: BoundaryPolicy) -> u64 {
    match info.audio_track {
        None => match (info.kind(), policy) {
            (MediaKind::Audio, BoundaryPolicy::Pad) => info.units + 1,
            _ => info.units,
        },
        Some(track) => {
            let expected = info.expected_track_frames(track.sample_rate);
            match (track.frames.cmp(&expected), policy) {
                (Ordering::Greater, BoundaryPolicy::Pad) => frames_covering(&track, info.rate, true),
                (Ordering::Less, BoundaryPolicy::Truncate) => frames_covering(&track, info.rate, false),
                _ => info.units,
            }
        }
    }
}

fn conform(data: MediaData, info: &SegmentInfo, policy: BoundaryPolicy) -> MediaData {
    match data {
        MediaData::Audio(mut audio) => {
            let channels = audio.channels as usize;
            let frames = conformed_units(info, policy) as usize;
            audio.samples.resize(frames * channels, 0.0);
            MediaData::Audio(audio)
        }
        MediaData::Video(video) => MediaData::Video(conform_video(video, conformed_units(info, policy))),
    }
}

/// Square off picture and track to exactly `frames` frames
fn conform_video(mut video: VideoData, frames: u64) -> VideoData {
    let target = frames as usize;
    if video.frames.len() > target {
        video.frames.truncate(target);
    }
    while video.frames.len() < target {
        let filler = video
            .frames
            .last()
            .cloned()
            .unwrap_or_else(|| Frame::new_filled(video.width, video.height, [0, 0, 0]));
        video.frames.push(filler);
    }
    if let Some(track) = video.audio.take() {
        let samples = samples_for_frames(frames, video.rate, track.sample_rate);
        video.audio = Some(track.slice_frames(0, samples));
    }
    video
}

fn concat_audio(parts: Vec<MediaData>, sample_rate: u32, channels: u16) -> AudioData {
    let mut samples = Vec::new();
    for part in parts {
        if let MediaData::Audio(audio) = part {
            samples.extend_from_slice(&audio.samples);
        }
    }
    AudioData::new(samples, sample_rate, channels)
}

fn concat_video(parts: Vec<MediaData>, expected: &SegmentInfo, width: u32, height: u32) -> Result<VideoData> {
    let rate = expected.rate;
    let mut frames = Vec::with_capacity(expected.units as usize);
    let mut track = expected
        .audio_track
        .map(|t| AudioData::silence(t.sample_rate, t.channels, t.frames));

    for part in parts {
        let MediaData::Video(video) = part else {
            continue;
        };
        let start = frames.len() as u64;
        let end = start + video.frame_count();
        frames.extend(video.frames);

        // Each track lands on the sample where its first frame starts
        if let (Some(out), Some(audio)) = (track.as_mut(), video.audio) {
            let channels = out.channels as usize;
            let from = samples_for_frames(start, rate, out.sample_rate) as usize;
            let to = samples_for_frames(end, rate, out.sample_rate) as usize;
            let count = (to - from).min(audio.frames() as usize);
            out.samples[from * channels..(from + count) * channels]
                .copy_from_slice(&audio.samples[..count * channels]);
        }
    }
    VideoData::new(frames, rate, width, height, track)
}

/// `total` frames of track: `lead` frames of silence, then `audio`, repeated if `looped`
fn build_track(audio: &AudioData, total: u64, lead: u64, looped: bool) -> AudioData {
    let channels = audio.channels as usize;
    let total = total as usize;
    let mut samples = vec![0.0f32; total * channels];
    let source = audio.frames() as usize;

    let mut position = (lead as usize).min(total);
    while source > 0 && position < total {
        let count = (total - position).min(source);
        samples[position * channels..(position + count) * channels]
            .copy_from_slice(&audio.samples[..count * channels]);
        position += count;
        if !looped {
            break;
        }
    }
    AudioData::new(samples, audio.sample_rate, audio.channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn video(frames: usize, shade: u8, track: Option<AudioData>) -> MediaSegment {
        let pictures = vec![Frame::new_filled(4, 4, [shade, 0, 0]); frames];
        let data = VideoData::new(pictures, FrameRate::per_second(25), 4, 4, track).unwrap();
        MediaSegment::from_video(format!("clip{}", shade), data)
    }

    fn tone(seconds: f32, sample_rate: u32) -> MediaSegment {
        let frames = (seconds * sample_rate as f32) as usize;
        MediaSegment::from_audio("tone", AudioData::new(vec![0.5; frames], sample_rate, 1))
    }

    fn video_data(segment: MediaSegment) -> VideoData {
        match segment.into_data().unwrap() {
            MediaData::Video(video) => video,
            _ => panic!("expected video"),
        }
    }

    #[test]
    fn test_concat_video_in_order() {
        let out = Compositor::concat(vec![video(125, 1, None), video(125, 2, None)], None).unwrap();
        assert_eq!(out.duration(), Duration::from_secs(10));
        assert_eq!(out.label(), "clip1+clip2");

        let data = video_data(out);
        assert_eq!(data.frame_count(), 250);
        assert_eq!(data.frames[124].get_pixel(0, 0)[0], 1);
        assert_eq!(data.frames[125].get_pixel(0, 0)[0], 2);
    }

    #[test]
    fn test_concat_rejects_mixed_resolution() {
        let small = VideoData::new(vec![Frame::new_filled(2, 2, [0; 3])], FrameRate::per_second(25), 2, 2, None)
            .unwrap();
        let infos = [*video(5, 1, None).info(), small.info()];
        let err = Compositor::plan_concat(&infos, None).unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Planning(PlanningError::IncompatibleSegments { input: 1, .. })
        ));
    }

    #[test]
    fn test_concat_partial_frame_needs_policy() {
        let partial = MediaSegment::from_audio("p", AudioData::new(vec![0.1, 0.2, 0.3], 8_000, 2));
        let whole = MediaSegment::from_audio("w", AudioData::new(vec![0.4, 0.5], 8_000, 2));
        let infos = [*whole.info(), *partial.info()];

        let err = Compositor::plan_concat(&infos, None).unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Planning(PlanningError::BoundaryPolicyRequired { input: 1 })
        ));

        let planned = Compositor::plan_concat(&infos, Some(BoundaryPolicy::Pad)).unwrap();
        let out = Compositor::concat(vec![whole, partial], Some(BoundaryPolicy::Pad)).unwrap();
        assert_eq!(out.info(), &planned);
        assert_eq!(planned.units, 3);
        match out.into_data().unwrap() {
            MediaData::Audio(audio) => assert_eq!(audio.samples, vec![0.4, 0.5, 0.1, 0.2, 0.3, 0.0]),
            _ => panic!("expected audio"),
        }
    }

    #[test]
    fn test_concat_truncates_short_track() {
        // 10 frames at 25 fps need 3200 samples at 8 kHz; this track covers 7.5 frames
        let clip = video(10, 1, Some(AudioData::silence(8_000, 1, 2_400)));
        assert!(!clip.info().aligned);

        let planned = Compositor::plan_concat(&[*clip.info()], Some(BoundaryPolicy::Truncate)).unwrap();
        assert_eq!(planned.units, 7);
        let out = Compositor::concat(vec![clip], Some(BoundaryPolicy::Truncate)).unwrap();
        assert_eq!(out.info(), &planned);
        assert!(out.info().aligned);
    }

    #[test]
    fn test_concat_pads_picture_for_long_track() {
        let clip = video(10, 1, Some(AudioData::silence(8_000, 1, 3_300)));
        let out = Compositor::concat(vec![clip], Some(BoundaryPolicy::Pad)).unwrap();
        assert_eq!(out.info().units, 11);
        assert_eq!(out.info().audio_track.unwrap().frames, 3_520);
    }

    #[test]
    fn test_concat_places_tracks_on_frame_boundaries() {
        let rate = FrameRate::new(30_000, 1_001);
        let clip = |value: f32| {
            let samples = samples_for_frames(1, rate, 48_000) as usize;
            let track = AudioData::new(vec![value; samples], 48_000, 1);
            let data = VideoData::new(vec![Frame::new_filled(2, 2, [0; 3])], rate, 2, 2, Some(track)).unwrap();
            MediaSegment::from_video("f", data)
        };
        let out = Compositor::concat(vec![clip(0.1), clip(0.2), clip(0.3)], None).unwrap();
        let planned = out.info().audio_track.unwrap();
        assert_eq!(planned.frames, samples_for_frames(3, rate, 48_000));
        assert!(out.info().aligned);
    }

    #[test]
    fn test_attach_pad_silence() {
        let options = AttachOptions::new(Duration::ZERO).with_policy(LengthPolicy::PadSilence);
        let out = Compositor::attach_audio(video(175, 1, None), tone(3.0, 8_000), &options).unwrap();
        assert_eq!(out.duration(), Duration::from_secs(7));

        let track = video_data(out).audio.unwrap();
        assert_eq!(track.duration(), Duration::from_secs(7));
        assert_eq!(track.samples[23_999], 0.5);
        assert!(track.samples[24_000..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_attach_loop_repeats_audio() {
        let audio = MediaSegment::from_audio("a", AudioData::new(vec![0.1, 0.2, 0.3], 75, 1));
        let options = AttachOptions::new(Duration::ZERO).with_policy(LengthPolicy::Loop);
        let out = Compositor::attach_audio(video(2, 1, None), audio, &options).unwrap();
        let track = video_data(out).audio.unwrap();
        assert_eq!(track.samples, vec![0.1, 0.2, 0.3, 0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_attach_trim_cuts_video_to_audio() {
        let options = AttachOptions::new(Duration::ZERO).with_policy(LengthPolicy::Trim);
        let out = Compositor::attach_audio(video(100, 1, None), tone(2.5, 8_000), &options).unwrap();
        assert_eq!(out.info().units, 62);
        assert!(out.info().aligned);
    }

    #[test]
    fn test_attach_trims_longer_audio() {
        let options = AttachOptions::new(Duration::ZERO).with_policy(LengthPolicy::Trim);
        let out = Compositor::attach_audio(video(50, 1, None), tone(5.0, 8_000), &options).unwrap();
        assert_eq!(out.duration(), Duration::from_secs(2));
        assert_eq!(out.info().audio_track.unwrap().duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_attach_offset_adds_leading_silence() {
        let options = AttachOptions::new(Duration::from_secs(1)).with_policy(LengthPolicy::PadSilence);
        let out = Compositor::attach_audio(video(75, 1, None), tone(1.0, 8_000), &options).unwrap();
        let track = video_data(out).audio.unwrap();
        assert!(track.samples[..8_000].iter().all(|&s| s == 0.0));
        assert_eq!(track.samples[8_000], 0.5);
        assert_eq!(track.samples[16_000], 0.0);
    }

    #[test]
    fn test_attach_without_policy() {
        let video_info = *video(175, 1, None).info();
        let audio_info = *tone(3.0, 8_000).info();
        let err = Compositor::plan_attach(&video_info, &audio_info, &AttachOptions::new(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, ComposerError::IncompatibleLengths { .. }));

        let lenient = AttachOptions::new(Duration::from_secs(4)).with_tolerance(Duration::from_millis(40));
        assert!(Compositor::plan_attach(&video_info, &audio_info, &lenient).is_ok());
    }

    #[test]
    fn test_attach_offset_past_video_end() {
        let video_info = *video(25, 1, None).info();
        let audio_info = *tone(1.0, 8_000).info();
        let options = AttachOptions::new(Duration::from_secs(1)).with_policy(LengthPolicy::PadSilence);
        let err = Compositor::plan_attach(&video_info, &audio_info, &options).unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Planning(PlanningError::OffsetBeyondVideo { .. })
        ));
    }
}

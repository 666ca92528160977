use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use image::{ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{ComposerError, Result};
use crate::media::spill::{SpillArea, SpillFile};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// The two kinds of media a segment can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Exact rational unit rate: samples per second for audio, frames per second for video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// A whole-number rate such as 25 fps or 44100 Hz
    pub const fn per_second(units: u32) -> Self {
        Self { num: units, den: 1 }
    }

    /// Convert a decimal rate (29.97, 25.0) into a reduced fraction
    pub fn from_fps(fps: f64) -> Option<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return None;
        }
        if fps.fract() == 0.0 && fps <= u32::MAX as f64 {
            return Some(Self::per_second(fps as u32));
        }
        // NTSC family rates are exact multiples of 1000/1001
        let ntsc = fps * 1001.0 / 1000.0;
        if (ntsc - ntsc.round()).abs() < 1e-3 {
            return Some(Self::new(ntsc.round() as u32 * 1000, 1001));
        }
        let num = (fps * 1000.0).round() as u32;
        let divisor = gcd(num, 1000);
        Some(Self::new(num / divisor, 1000 / divisor))
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Exact duration of `units` at this rate, in whole nanoseconds
    pub fn duration_of(&self, units: u64) -> Duration {
        if self.num == 0 {
            return Duration::ZERO;
        }
        let nanos = units as u128 * NANOS_PER_SECOND * self.den as u128 / self.num as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Number of whole units that fit in `duration`
    pub fn units_floor(&self, duration: Duration) -> u64 {
        let denom = self.den as u128 * NANOS_PER_SECOND;
        (duration.as_nanos() * self.num as u128 / denom) as u64
    }

    /// Number of units nearest to `duration`
    pub fn units_round(&self, duration: Duration) -> u64 {
        let denom = self.den as u128 * NANOS_PER_SECOND;
        ((duration.as_nanos() * self.num as u128 + denom / 2) / denom) as u64
    }

    /// Number of units needed to cover `duration` completely
    pub fn units_ceil(&self, duration: Duration) -> u64 {
        let denom = self.den as u128 * NANOS_PER_SECOND;
        ((duration.as_nanos() * self.num as u128 + denom - 1) / denom) as u64
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}

/// Number of audio sample frames spanning `frames` video frames, rounded to nearest
pub fn samples_for_frames(frames: u64, rate: FrameRate, sample_rate: u32) -> u64 {
    if rate.num == 0 {
        return 0;
    }
    let num = frames as u128 * sample_rate as u128 * rate.den as u128;
    ((num + rate.num as u128 / 2) / rate.num as u128) as u64
}

/// Channel or picture layout of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    Audio { channels: u16 },
    Video { width: u32, height: u32 },
}

/// Metadata of an audio track bound to a video segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrackInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u64,
}

impl AudioTrackInfo {
    pub fn duration(&self) -> Duration {
        FrameRate::per_second(self.sample_rate).duration_of(self.frames)
    }
}

/// Probed or predicted metadata of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Sample rate (audio) or frame rate (video)
    pub rate: FrameRate,

    /// Sample frames (audio) or video frames
    pub units: u64,

    pub layout: Layout,

    /// Audio bound to a video segment, if any
    pub audio_track: Option<AudioTrackInfo>,

    /// False when the payload ends on a partial unit
    pub aligned: bool,
}

impl SegmentInfo {
    pub fn audio(sample_rate: u32, channels: u16, frames: u64) -> Self {
        Self {
            rate: FrameRate::per_second(sample_rate),
            units: frames,
            layout: Layout::Audio { channels },
            audio_track: None,
            aligned: true,
        }
    }

    pub fn video(rate: FrameRate, width: u32, height: u32, frames: u64) -> Self {
        Self {
            rate,
            units: frames,
            layout: Layout::Video { width, height },
            audio_track: None,
            aligned: true,
        }
    }

    /// Attach a track that is exactly as long as the video
    pub fn with_aligned_track(mut self, sample_rate: u32, channels: u16) -> Self {
        self.audio_track = Some(AudioTrackInfo {
            sample_rate,
            channels,
            frames: samples_for_frames(self.units, self.rate, sample_rate),
        });
        self.aligned = true;
        self
    }

    pub fn kind(&self) -> MediaKind {
        match self.layout {
            Layout::Audio { .. } => MediaKind::Audio,
            Layout::Video { .. } => MediaKind::Video,
        }
    }

    pub fn duration(&self) -> Duration {
        self.rate.duration_of(self.units)
    }

    pub fn channels(&self) -> Option<u16> {
        match self.layout {
            Layout::Audio { channels } => Some(channels),
            Layout::Video { .. } => None,
        }
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        match self.layout {
            Layout::Video { width, height } => Some((width, height)),
            Layout::Audio { .. } => None,
        }
    }

    /// Audio sample frames the attached track must hold to end on the last video frame
    pub fn expected_track_frames(&self, sample_rate: u32) -> u64 {
        samples_for_frames(self.units, self.rate, sample_rate)
    }
}

/// Interleaved floating point audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    /// Audio samples (interleaved for stereo, mono for single channel)
    pub samples: Vec<f32>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,
}

impl AudioData {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// `frames` sample frames of digital silence
    pub fn silence(sample_rate: u32, channels: u16, frames: u64) -> Self {
        Self::new(
            vec![0.0; frames as usize * channels as usize],
            sample_rate,
            channels,
        )
    }

    /// Whole sample frames held by this buffer
    pub fn frames(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        (self.samples.len() / self.channels as usize) as u64
    }

    /// True when the buffer holds only whole sample frames
    pub fn is_aligned(&self) -> bool {
        self.channels != 0 && self.samples.len() % self.channels as usize == 0
    }

    pub fn duration(&self) -> Duration {
        FrameRate::per_second(self.sample_rate).duration_of(self.frames())
    }

    pub fn info(&self) -> SegmentInfo {
        let mut info = SegmentInfo::audio(self.sample_rate, self.channels, self.frames());
        info.aligned = self.is_aligned();
        info
    }

    pub fn track_info(&self) -> AudioTrackInfo {
        AudioTrackInfo {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frames: self.frames(),
        }
    }

    /// Samples of one sample frame
    pub fn frame(&self, index: usize) -> &[f32] {
        let channels = self.channels as usize;
        &self.samples[index * channels..(index + 1) * channels]
    }

    /// Get samples for a specific channel (0-based)
    pub fn channel_samples(&self, channel: usize) -> Vec<f32> {
        if self.channels == 1 || channel >= self.channels as usize {
            return self.samples.clone();
        }

        self.samples
            .iter()
            .skip(channel)
            .step_by(self.channels as usize)
            .copied()
            .collect()
    }

    /// Copy of `count` whole frames starting at `start`, zero-filled past the end
    pub fn slice_frames(&self, start: u64, count: u64) -> AudioData {
        let channels = self.channels as usize;
        let mut samples = vec![0.0; count as usize * channels];
        let available = self.frames().saturating_sub(start).min(count) as usize;
        let from = start as usize * channels;
        samples[..available * channels]
            .copy_from_slice(&self.samples[from..from + available * channels]);
        AudioData::new(samples, self.sample_rate, self.channels)
    }
}

/// Represents a single video frame
///
/// This is a simple wrapper around an RGB image buffer that provides
/// convenient methods for pixel manipulation used by stages.
#[derive(Clone, PartialEq)]
pub struct Frame {
    buffer: RgbImage,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl Frame {
    /// Create a new frame from an RGB image buffer
    pub fn new(buffer: RgbImage) -> Self {
        Self { buffer }
    }

    /// Create a new frame with the given dimensions filled with the specified color
    pub fn new_filled(width: u32, height: u32, color: [u8; 3]) -> Self {
        let buffer = ImageBuffer::from_fn(width, height, |_, _| Rgb(color));
        Self { buffer }
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Get a pixel at the given coordinates (returns RGB array)
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let pixel = self.buffer.get_pixel(x, y);
        [pixel[0], pixel[1], pixel[2]]
    }

    /// Get the underlying image buffer
    pub fn as_image(&self) -> &RgbImage {
        &self.buffer
    }

    /// Raw interleaved RGB bytes
    pub fn as_rgb_bytes(&self) -> &[u8] {
        self.buffer.as_raw()
    }

    /// Mutable raw interleaved RGB bytes
    pub fn as_rgb_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Create a frame from raw RGB bytes
    pub fn from_rgb_bytes(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        ImageBuffer::from_raw(width, height, data).map(|buffer| Self { buffer })
    }

    /// Save the frame as a PNG file
    pub fn save_png<P: AsRef<std::path::Path>>(&self, path: P) -> std::result::Result<(), image::ImageError> {
        self.buffer.save_with_format(path, image::ImageFormat::Png)
    }
}

/// A sequence of equally sized frames with an optional bound audio track
#[derive(Debug, Clone, PartialEq)]
pub struct VideoData {
    pub frames: Vec<Frame>,
    pub rate: FrameRate,
    pub width: u32,
    pub height: u32,
    pub audio: Option<AudioData>,
}

impl VideoData {
    /// Build from frames, checking that every frame has the declared size
    pub fn new(
        frames: Vec<Frame>,
        rate: FrameRate,
        width: u32,
        height: u32,
        audio: Option<AudioData>,
    ) -> Result<Self> {
        if !rate.is_valid() {
            return Err(ComposerError::corrupt("video", format!("invalid frame rate {}", rate)));
        }
        if let Some(bad) = frames
            .iter()
            .position(|f| f.width() != width || f.height() != height)
        {
            return Err(ComposerError::corrupt(
                "video",
                format!(
                    "frame {} is {}x{}, expected {}x{}",
                    bad,
                    frames[bad].width(),
                    frames[bad].height(),
                    width,
                    height
                ),
            ));
        }
        Ok(Self {
            frames,
            rate,
            width,
            height,
            audio,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    pub fn duration(&self) -> Duration {
        self.rate.duration_of(self.frame_count())
    }

    pub fn info(&self) -> SegmentInfo {
        let mut info = SegmentInfo::video(self.rate, self.width, self.height, self.frame_count());
        if let Some(track) = &self.audio {
            info.audio_track = Some(track.track_info());
            info.aligned = track.is_aligned()
                && track.frames() == info.expected_track_frames(track.sample_rate);
        }
        info
    }
}

/// Decoded payload of a segment
#[derive(Debug, Clone, PartialEq)]
pub enum MediaData {
    Audio(AudioData),
    Video(VideoData),
}

impl MediaData {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaData::Audio(_) => MediaKind::Audio,
            MediaData::Video(_) => MediaKind::Video,
        }
    }

    pub fn info(&self) -> SegmentInfo {
        match self {
            MediaData::Audio(audio) => audio.info(),
            MediaData::Video(video) => video.info(),
        }
    }

    /// Bytes needed to hold the raw payload
    pub fn byte_len(&self) -> u64 {
        match self {
            MediaData::Audio(audio) => audio.samples.len() as u64 * 4,
            MediaData::Video(video) => {
                let pictures = video.frame_count() * video.width as u64 * video.height as u64 * 3;
                let track = video
                    .audio
                    .as_ref()
                    .map(|a| a.samples.len() as u64 * 4)
                    .unwrap_or(0);
                pictures + track
            }
        }
    }
}

/// Where an intermediate payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoragePolicy {
    InMemory,
    OnDisk,
}

/// Handle to a payload, either resident or spilled to temporary storage
#[derive(Clone)]
pub enum Payload {
    InMemory(Arc<MediaData>),
    OnDisk(Arc<SpillFile>),
}

impl Payload {
    pub fn storage(&self) -> StoragePolicy {
        match self {
            Payload::InMemory(_) => StoragePolicy::InMemory,
            Payload::OnDisk(_) => StoragePolicy::OnDisk,
        }
    }
}

/// One immutable unit of audio or video content plus its metadata
///
/// Segments are moved, never shared: every stage consumes its input and
/// returns a new segment.
pub struct MediaSegment {
    label: String,
    info: SegmentInfo,
    payload: Payload,
}

impl fmt::Debug for MediaSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSegment")
            .field("label", &self.label)
            .field("info", &self.info)
            .field("storage", &self.storage())
            .finish()
    }
}

impl MediaSegment {
    pub fn new<S: Into<String>>(label: S, data: MediaData) -> Self {
        Self {
            label: label.into(),
            info: data.info(),
            payload: Payload::InMemory(Arc::new(data)),
        }
    }

    pub fn from_audio<S: Into<String>>(label: S, audio: AudioData) -> Self {
        Self::new(label, MediaData::Audio(audio))
    }

    pub fn from_video<S: Into<String>>(label: S, video: VideoData) -> Self {
        Self::new(label, MediaData::Video(video))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn kind(&self) -> MediaKind {
        self.info.kind()
    }

    pub fn duration(&self) -> Duration {
        self.info.duration()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn storage(&self) -> StoragePolicy {
        self.payload.storage()
    }

    /// Read-only access to the decoded payload
    pub fn read(&self) -> Result<Arc<MediaData>> {
        match &self.payload {
            Payload::InMemory(data) => Ok(Arc::clone(data)),
            Payload::OnDisk(file) => Ok(Arc::new(file.read()?)),
        }
    }

    /// Take the payload, copying only if another handle still references it
    pub fn into_data(self) -> Result<MediaData> {
        match self.payload {
            Payload::InMemory(data) => {
                Ok(Arc::try_unwrap(data).unwrap_or_else(|shared| (*shared).clone()))
            }
            Payload::OnDisk(file) => file.read(),
        }
    }

    /// Convert the payload representation, bounding peak memory with `OnDisk`
    pub fn materialize(self, policy: StoragePolicy, spill: &Arc<SpillArea>) -> Result<Self> {
        if self.storage() == policy {
            return Ok(self);
        }
        let label = self.label.clone();
        let info = self.info;
        let payload = match policy {
            StoragePolicy::OnDisk => {
                let data = self.read()?;
                Payload::OnDisk(Arc::new(spill.store(&data)?))
            }
            StoragePolicy::InMemory => Payload::InMemory(Arc::new(self.into_data()?)),
        };
        Ok(Self {
            label,
            info,
            payload,
        })
    }
}

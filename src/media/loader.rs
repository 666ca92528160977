use std::fs::File;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ComposerError, Result};
use crate::media::container;
use crate::media::manifest::{frame_file_name, SegmentManifest};
use crate::media::types::{
    AudioData, Frame, FrameRate, MediaSegment, SegmentInfo, VideoData,
};

const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg", "m4a", "aac"];
const CONTAINER_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Largest decoded picture payload a still source may expand to
pub const MAX_STILL_BYTES: u64 = 4 << 30;

/// Where a segment comes from
///
/// Paths are expected to be resolved and validated by the caller.
#[derive(Debug)]
pub enum MediaSource {
    /// Audio file, container video, or a directory written by this crate
    File(PathBuf),

    /// Directory of numbered still images played at `rate`
    ImageSequence { dir: PathBuf, rate: FrameRate },

    /// One image held for `frames` frames
    Still {
        path: PathBuf,
        rate: FrameRate,
        frames: u64,
    },

    /// A segment that is already in memory
    Segment(MediaSegment),
}

impl MediaSource {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        MediaSource::File(path.into())
    }

    /// Short name used in logs and as the segment label
    pub fn label(&self) -> String {
        let stem = |path: &Path| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("segment")
                .to_string()
        };
        match self {
            MediaSource::File(path) => stem(path),
            MediaSource::ImageSequence { dir, .. } => stem(dir),
            MediaSource::Still { path, .. } => stem(path),
            MediaSource::Segment(segment) => segment.label().to_string(),
        }
    }
}

/// Probes and decodes sources into segments
pub struct SegmentLoader;

impl SegmentLoader {
    /// Read metadata without decoding the picture payload
    pub fn probe(source: &MediaSource) -> Result<SegmentInfo> {
        Self::probe_cancellable(source, &CancellationToken::new())
    }

    /// [`probe`](Self::probe), killing any external tool once `abandon` fires
    ///
    /// Container sources drive ffprobe/ffmpeg through tokio, so call this
    /// from blocking code (e.g. `spawn_blocking`), never from an async task.
    pub fn probe_cancellable(source: &MediaSource, abandon: &CancellationToken) -> Result<SegmentInfo> {
        match source {
            MediaSource::File(path) if path.is_dir() => Self::probe_manifest_dir(path),
            MediaSource::File(path) => match Self::detect_format(path).as_deref() {
                Some("wav") => Self::probe_wav(path),
                Some(ext) if AUDIO_EXTENSIONS.contains(&ext) => {
                    // Compressed streams only report exact length after decoding
                    Ok(Self::load_with_symphonia(path)?.info())
                }
                Some(ext) if CONTAINER_EXTENSIONS.contains(&ext) => container::probe(path, abandon),
                other => Err(Self::unsupported(path, other)),
            },
            MediaSource::ImageSequence { dir, rate } => {
                let frames = Self::list_images(dir)?;
                let first = frames.first().ok_or_else(|| {
                    ComposerError::corrupt(dir.display().to_string(), "no image frames found")
                })?;
                let (width, height) = Self::image_dimensions(first)?;
                Self::check_rate(dir, *rate)?;
                Ok(SegmentInfo::video(*rate, width, height, frames.len() as u64))
            }
            MediaSource::Still { path, rate, frames } => {
                let (width, height) = Self::image_dimensions(path)?;
                Self::check_rate(path, *rate)?;
                Self::check_still_size(width, height, *frames)?;
                Ok(SegmentInfo::video(*rate, width, height, *frames))
            }
            MediaSource::Segment(segment) => Ok(*segment.info()),
        }
    }

    /// Decode a source into an in-memory segment
    pub fn load(source: MediaSource) -> Result<MediaSegment> {
        Self::load_cancellable(source, &CancellationToken::new())
    }

    /// [`load`](Self::load), killing any external tool once `abandon` fires
    pub fn load_cancellable(source: MediaSource, abandon: &CancellationToken) -> Result<MediaSegment> {
        let label = source.label();
        match source {
            MediaSource::File(path) if path.is_dir() => Self::load_manifest_dir(&path, label),
            MediaSource::File(path) => match Self::detect_format(&path).as_deref() {
                Some("wav") => Ok(MediaSegment::from_audio(label, Self::load_wav(&path)?)),
                Some(ext) if AUDIO_EXTENSIONS.contains(&ext) => {
                    Ok(MediaSegment::from_audio(label, Self::load_with_symphonia(&path)?))
                }
                Some(ext) if CONTAINER_EXTENSIONS.contains(&ext) => {
                    Ok(MediaSegment::from_video(label, container::load(&path, abandon)?))
                }
                other => Err(Self::unsupported(&path, other)),
            },
            MediaSource::ImageSequence { dir, rate } => {
                Self::check_rate(&dir, rate)?;
                let paths = Self::list_images(&dir)?;
                let frames = Self::load_frames(&paths)?;
                Ok(MediaSegment::from_video(label, Self::assemble(&dir, frames, rate, None)?))
            }
            MediaSource::Still { path, rate, frames } => {
                Self::check_rate(&path, rate)?;
                let (width, height) = Self::image_dimensions(&path)?;
                Self::check_still_size(width, height, frames)?;
                let frame = Self::load_frame(&path)?;
                let frames = vec![frame; frames as usize];
                let video = VideoData::new(frames, rate, width, height, None)?;
                Ok(MediaSegment::from_video(label, video))
            }
            MediaSource::Segment(segment) => Ok(segment),
        }
    }

    /// Detect format from file extension
    pub fn detect_format<P: AsRef<Path>>(path: P) -> Option<String> {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
    }

    /// Check if a file extension can be loaded as a file source
    pub fn is_format_supported(extension: &str) -> bool {
        let ext = extension.to_lowercase();
        AUDIO_EXTENSIONS.contains(&ext.as_str()) || CONTAINER_EXTENSIONS.contains(&ext.as_str())
    }

    fn unsupported(path: &Path, extension: Option<&str>) -> ComposerError {
        match extension {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => ComposerError::unsupported(format!(
                "{} (still images need a frame rate; load them as a still source)",
                ext
            )),
            Some(ext) => ComposerError::unsupported(ext),
            None => ComposerError::unsupported(path.display().to_string()),
        }
    }

    fn check_rate(path: &Path, rate: FrameRate) -> Result<()> {
        if rate.is_valid() {
            Ok(())
        } else {
            Err(ComposerError::corrupt(
                path.display().to_string(),
                format!("invalid frame rate {}", rate),
            ))
        }
    }

    /// Refuse stills whose held frames would not fit in [`MAX_STILL_BYTES`]
    fn check_still_size(width: u32, height: u32, frames: u64) -> Result<()> {
        let requested = (width as u64)
            .checked_mul(height as u64)
            .and_then(|pixels| pixels.checked_mul(3))
            .and_then(|frame_bytes| frame_bytes.checked_mul(frames))
            .unwrap_or(u64::MAX);
        if requested > MAX_STILL_BYTES {
            return Err(ComposerError::ResourceExhausted {
                requested,
                available: MAX_STILL_BYTES,
            });
        }
        Ok(())
    }

    fn probe_wav(path: &Path) -> Result<SegmentInfo> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| ComposerError::corrupt(path.display().to_string(), e.to_string()))?;
        let spec = reader.spec();
        let samples = reader.len() as u64;
        let channels = spec.channels as u64;

        let mut info = SegmentInfo::audio(spec.sample_rate, spec.channels, samples / channels);
        info.aligned = samples % channels == 0;
        Ok(info)
    }

    /// Load WAV files using the hound crate (most reliable for WAV)
    pub(crate) fn load_wav(path: &Path) -> Result<AudioData> {
        let corrupt = |e: hound::Error| ComposerError::corrupt(path.display().to_string(), e.to_string());
        let reader = hound::WavReader::open(path).map_err(corrupt)?;

        let spec = reader.spec();
        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(corrupt)?,
            hound::SampleFormat::Int => {
                let bit_depth = spec.bits_per_sample;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|sample| Self::int_to_float(sample, bit_depth)))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(corrupt)?
            }
        };

        debug!(
            "Loaded WAV {:?}: {} Hz, {} channels, {} samples",
            path,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );
        Ok(AudioData::new(samples, spec.sample_rate, spec.channels))
    }

    /// Load various compressed formats using Symphonia
    fn load_with_symphonia(path: &Path) -> Result<AudioData> {
        let path_str = path.display().to_string();
        let file = File::open(path).map_err(|e| ComposerError::corrupt(&path_str, e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create a probe hint using the file extension
        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| ComposerError::corrupt(&path_str, e.to_string()))?;

        let mut format = probed.format;

        // Find the first audio track with a known (decodable) codec
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| ComposerError::corrupt(&path_str, "no decodable audio track"))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| ComposerError::corrupt(&path_str, "no sample rate found"))?;
        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| ComposerError::corrupt(&path_str, "no channel information found"))?
            .count() as u16;

        let dec_opts: DecoderOptions = Default::default();
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &dec_opts)
            .map_err(|e| ComposerError::corrupt(&path_str, e.to_string()))?;

        let mut samples = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                // End of stream
                Err(SymphoniaError::IoError(_)) => break,
                Err(e) => return Err(ComposerError::corrupt(&path_str, e.to_string())),
            };

            // Consume any new metadata
            while !format.metadata().is_latest() {
                format.metadata().pop();
            }

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let mut buf =
                        SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
                Err(SymphoniaError::DecodeError(reason)) => {
                    warn!("Skipping undecodable packet in {:?}: {}", path, reason);
                }
                Err(SymphoniaError::IoError(_)) => break,
                Err(e) => return Err(ComposerError::corrupt(&path_str, e.to_string())),
            }
        }

        Ok(AudioData::new(samples, sample_rate, channels))
    }

    /// Convert integer sample to float (-1.0 to 1.0)
    fn int_to_float(sample: i32, bit_depth: u16) -> f32 {
        let bits = bit_depth.clamp(8, 32) as i32;
        sample as f32 / (1u64 << (bits - 1)) as f32
    }

    fn probe_manifest_dir(dir: &Path) -> Result<SegmentInfo> {
        let manifest = SegmentManifest::read(dir)?;
        let mut info = SegmentInfo::video(manifest.rate, manifest.width, manifest.height, manifest.frames);
        if let Some(track) = &manifest.audio {
            let track_info = Self::probe_wav(&dir.join(track))?;
            let channels = track_info.channels().unwrap_or(1);
            info.audio_track = Some(crate::media::types::AudioTrackInfo {
                sample_rate: track_info.rate.num,
                channels,
                frames: track_info.units,
            });
            info.aligned = track_info.aligned
                && track_info.units == info.expected_track_frames(track_info.rate.num);
        }
        Ok(info)
    }

    fn load_manifest_dir(dir: &Path, fallback_label: String) -> Result<MediaSegment> {
        let manifest = SegmentManifest::read(dir)?;
        let paths: Vec<PathBuf> = (0..manifest.frames as usize)
            .map(|i| dir.join(frame_file_name(i)))
            .collect();
        let frames = Self::load_frames(&paths)?;
        let audio = match &manifest.audio {
            Some(track) => Some(Self::load_wav(&dir.join(track))?),
            None => None,
        };
        let video = Self::assemble(dir, frames, manifest.rate, audio)?;
        let label = if manifest.label.is_empty() {
            fallback_label
        } else {
            manifest.label
        };
        Ok(MediaSegment::from_video(label, video))
    }

    /// Sorted image files of a frame directory
    pub(crate) fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| ComposerError::corrupt(dir.display().to_string(), e.to_string()))?;
        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                Self::detect_format(path)
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
                    .unwrap_or(false)
            })
            .collect();
        frames.sort();
        Ok(frames)
    }

    fn image_dimensions(path: &Path) -> Result<(u32, u32)> {
        image::image_dimensions(path)
            .map_err(|e| ComposerError::corrupt(path.display().to_string(), e.to_string()))
    }

    fn load_frame(path: &Path) -> Result<Frame> {
        let image = image::open(path)
            .map_err(|e| ComposerError::corrupt(path.display().to_string(), e.to_string()))?;
        Ok(Frame::new(image.to_rgb8()))
    }

    pub(crate) fn load_frames(paths: &[PathBuf]) -> Result<Vec<Frame>> {
        paths.par_iter().map(|p| Self::load_frame(p)).collect()
    }

    /// Build video data, reporting the offending directory on size mismatches
    pub(crate) fn assemble(
        dir: &Path,
        frames: Vec<Frame>,
        rate: FrameRate,
        audio: Option<AudioData>,
    ) -> Result<VideoData> {
        let (width, height) = frames
            .first()
            .map(|f| (f.width(), f.height()))
            .ok_or_else(|| ComposerError::corrupt(dir.display().to_string(), "no image frames found"))?;
        VideoData::new(frames, rate, width, height, audio).map_err(|e| match e {
            ComposerError::CorruptSource { reason, .. } => {
                ComposerError::corrupt(dir.display().to_string(), reason)
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::MediaKind;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as usize {
            writer.write_sample(((i % 100) as i16) * 100).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(SegmentLoader::detect_format("test.wav"), Some("wav".to_string()));
        assert_eq!(SegmentLoader::detect_format("test.MP3"), Some("mp3".to_string()));
        assert_eq!(SegmentLoader::detect_format("test"), None);
    }

    #[test]
    fn test_format_support() {
        assert!(SegmentLoader::is_format_supported("wav"));
        assert!(SegmentLoader::is_format_supported("FLAC"));
        assert!(SegmentLoader::is_format_supported("mkv"));
        assert!(!SegmentLoader::is_format_supported("xyz"));
    }

    #[test]
    fn test_int_to_float_conversion() {
        assert_eq!(SegmentLoader::int_to_float(0, 16), 0.0);
        assert_eq!(SegmentLoader::int_to_float(-32768, 16), -1.0);
        assert_eq!(SegmentLoader::int_to_float(16384, 16), 0.5);
        assert_eq!(SegmentLoader::int_to_float(-128, 8), -1.0);
    }

    #[test]
    fn test_probe_and_load_wav_agree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("voice.wav");
        write_wav(&path, 22_050, 2, 2_205);

        let source = MediaSource::file(&path);
        let info = SegmentLoader::probe(&source).unwrap();
        assert_eq!(info.kind(), MediaKind::Audio);
        assert_eq!(info.units, 2_205);
        assert_eq!(info.channels(), Some(2));

        let segment = SegmentLoader::load(source).unwrap();
        assert_eq!(segment.info(), &info);
        assert_eq!(segment.label(), "voice");
    }

    #[test]
    fn test_unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.xyz");
        File::create(&path).unwrap().write_all(b"dummy content").unwrap();

        match SegmentLoader::probe(&MediaSource::file(&path)) {
            Err(ComposerError::UnsupportedFormat { format }) => assert_eq!(format, "xyz"),
            other => panic!("Expected UnsupportedFormat error, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        File::create(&path).unwrap().write_all(b"RIFFnope").unwrap();

        assert!(matches!(
            SegmentLoader::probe(&MediaSource::file(&path)),
            Err(ComposerError::CorruptSource { .. })
        ));
    }

    #[test]
    fn test_image_sequence() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            Frame::new_filled(8, 6, [i as u8 * 50, 0, 0])
                .save_png(dir.path().join(frame_file_name(i)))
                .unwrap();
        }
        let rate = FrameRate::per_second(25);
        let source = MediaSource::ImageSequence {
            dir: dir.path().to_path_buf(),
            rate,
        };
        let info = SegmentLoader::probe(&source).unwrap();
        assert_eq!(info, SegmentInfo::video(rate, 8, 6, 3));

        let segment = SegmentLoader::load(source).unwrap();
        match segment.into_data().unwrap() {
            crate::media::types::MediaData::Video(video) => {
                assert_eq!(video.frames[2].get_pixel(0, 0), [100, 0, 0]);
            }
            other => panic!("expected video, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_still_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("title.png");
        Frame::new_filled(4, 4, [9, 9, 9]).save_png(&path).unwrap();

        let source = MediaSource::Still {
            path,
            rate: FrameRate::per_second(10),
            frames: 20,
        };
        let info = SegmentLoader::probe(&source).unwrap();
        assert_eq!(info.duration(), std::time::Duration::from_secs(2));
        assert_eq!(SegmentLoader::load(source).unwrap().info(), &info);
    }

    #[test]
    fn test_oversized_still_is_refused_before_decoding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("title.png");
        Frame::new_filled(64, 64, [1, 2, 3]).save_png(&path).unwrap();

        let source = MediaSource::Still {
            path,
            rate: FrameRate::per_second(25),
            frames: u64::MAX / 2,
        };
        assert!(matches!(
            SegmentLoader::probe(&source),
            Err(ComposerError::ResourceExhausted { available: MAX_STILL_BYTES, .. })
        ));
        assert!(matches!(
            SegmentLoader::load(source),
            Err(ComposerError::ResourceExhausted { .. })
        ));
    }
}

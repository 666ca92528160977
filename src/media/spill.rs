//! Size-bounded temporary storage for spilled intermediates.
//!
//! One [`SpillArea`] is shared by every request an engine runs. Its
//! admission counter is the only process-level state in the pipeline: a
//! spill that would push usage past capacity is refused with
//! `ResourceExhausted` instead of growing the directory.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::SpillConfig;
use crate::error::{ComposerError, Result};
use crate::media::types::{AudioData, Frame, FrameRate, MediaData, VideoData};

#[derive(Debug)]
pub struct SpillArea {
    root: TempDir,
    capacity: u64,
    in_use: AtomicU64,
    allocations: AtomicU64,
    next_id: AtomicU64,
}

impl SpillArea {
    pub fn new(config: &SpillConfig) -> Result<Arc<Self>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("av-composer-spill-");
        let root = match &config.dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };
        debug!("Spill area at {:?} ({} bytes)", root.path(), config.max_bytes);
        Ok(Arc::new(Self {
            root,
            capacity: config.max_bytes,
            in_use: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
        }))
    }

    /// Spill area in the system temp directory
    pub fn with_capacity(max_bytes: u64) -> Result<Arc<Self>> {
        Self::new(&SpillConfig {
            dir: None,
            max_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.bytes_in_use())
    }

    /// Total spill files ever admitted
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }

    /// Spill files currently present on disk
    pub fn live_files(&self) -> usize {
        fs::read_dir(self.root.path())
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }

    fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Reservation> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.capacity {
                return Err(ComposerError::ResourceExhausted {
                    requested: bytes,
                    available: self.capacity.saturating_sub(current),
                });
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(Reservation {
            area: Arc::clone(self),
            bytes,
        })
    }

    /// Write `data` to a new spill file, admitted against the capacity
    pub fn store(self: &Arc<Self>, data: &MediaData) -> Result<SpillFile> {
        let bytes = data.byte_len();
        let reservation = self.reserve(bytes)?;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let path = self.root.path().join(format!("segment-{:06}.raw", id));

        let layout = SpillLayout::of(data);
        if let Err(e) = write_payload(&path, data) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        debug!("Spilled {} bytes to {:?}", bytes, path);

        Ok(SpillFile {
            path,
            layout,
            _reservation: reservation,
        })
    }
}

/// Bytes admitted against the area; returned when dropped
#[derive(Debug)]
struct Reservation {
    area: Arc<SpillArea>,
    bytes: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.area.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Shape of a spilled payload, enough to decode the raw bytes
#[derive(Debug, Clone, Copy)]
enum SpillLayout {
    Audio {
        sample_rate: u32,
        channels: u16,
        samples: usize,
    },
    Video {
        rate: FrameRate,
        width: u32,
        height: u32,
        frames: usize,
        track: Option<(u32, u16, usize)>,
    },
}

impl SpillLayout {
    fn of(data: &MediaData) -> Self {
        match data {
            MediaData::Audio(audio) => SpillLayout::Audio {
                sample_rate: audio.sample_rate,
                channels: audio.channels,
                samples: audio.samples.len(),
            },
            MediaData::Video(video) => SpillLayout::Video {
                rate: video.rate,
                width: video.width,
                height: video.height,
                frames: video.frames.len(),
                track: video
                    .audio
                    .as_ref()
                    .map(|a| (a.sample_rate, a.channels, a.samples.len())),
            },
        }
    }
}

/// A payload spilled to disk; the file is deleted when the last handle drops
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    layout: SpillLayout,
    _reservation: Reservation,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> u64 {
        self._reservation.bytes
    }

    /// Decode the spilled payload back into memory
    pub fn read(&self) -> Result<MediaData> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let corrupt = |reason: &str| ComposerError::corrupt(self.path.display().to_string(), reason);

        match self.layout {
            SpillLayout::Audio {
                sample_rate,
                channels,
                samples,
            } => {
                let samples = read_samples(&mut reader, samples)
                    .map_err(|e| corrupt(&e.to_string()))?;
                Ok(MediaData::Audio(AudioData::new(samples, sample_rate, channels)))
            }
            SpillLayout::Video {
                rate,
                width,
                height,
                frames,
                track,
            } => {
                let frame_bytes = width as usize * height as usize * 3;
                let mut decoded = Vec::with_capacity(frames);
                for _ in 0..frames {
                    let mut raw = vec![0u8; frame_bytes];
                    reader
                        .read_exact(&mut raw)
                        .map_err(|e| corrupt(&e.to_string()))?;
                    let frame = Frame::from_rgb_bytes(width, height, raw)
                        .ok_or_else(|| corrupt("frame buffer size mismatch"))?;
                    decoded.push(frame);
                }
                let audio = match track {
                    Some((sample_rate, channels, samples)) => {
                        let samples = read_samples(&mut reader, samples)
                            .map_err(|e| corrupt(&e.to_string()))?;
                        Some(AudioData::new(samples, sample_rate, channels))
                    }
                    None => None,
                };
                Ok(MediaData::Video(VideoData::new(decoded, rate, width, height, audio)?))
            }
        }
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove spill file {:?}: {}", self.path, e);
        }
    }
}

fn write_payload(path: &Path, data: &MediaData) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    match data {
        MediaData::Audio(audio) => write_samples(&mut writer, &audio.samples)?,
        MediaData::Video(video) => {
            for frame in &video.frames {
                writer.write_all(frame.as_rgb_bytes())?;
            }
            if let Some(track) = &video.audio {
                write_samples(&mut writer, &track.samples)?;
            }
        }
    }
    writer.flush()
}

fn write_samples<W: Write>(writer: &mut W, samples: &[f32]) -> std::io::Result<()> {
    for sample in samples {
        writer.write_all(&sample.to_le_bytes())?;
    }
    Ok(())
}

fn read_samples<R: Read>(reader: &mut R, count: usize) -> std::io::Result<Vec<f32>> {
    let mut raw = vec![0u8; count * 4];
    reader.read_exact(&mut raw)?;
    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::{MediaSegment, StoragePolicy};

    fn stereo(frames: usize) -> AudioData {
        let samples = (0..frames * 2).map(|i| i as f32 / 1000.0).collect();
        AudioData::new(samples, 8_000, 2)
    }

    #[test]
    fn test_spill_roundtrip_and_release() {
        let area = SpillArea::with_capacity(1 << 20).unwrap();
        let segment = MediaSegment::from_audio("a", stereo(100));

        let spilled = segment.materialize(StoragePolicy::OnDisk, &area).unwrap();
        assert_eq!(spilled.storage(), StoragePolicy::OnDisk);
        assert_eq!(area.bytes_in_use(), 800);
        assert_eq!(area.live_files(), 1);

        let back = spilled.materialize(StoragePolicy::InMemory, &area).unwrap();
        assert_eq!(area.bytes_in_use(), 0);
        assert_eq!(area.live_files(), 0);
        match back.into_data().unwrap() {
            MediaData::Audio(audio) => assert_eq!(audio, stereo(100)),
            other => panic!("expected audio, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_video_spill_keeps_track() {
        let area = SpillArea::with_capacity(1 << 20).unwrap();
        let frames = vec![Frame::new_filled(3, 2, [1, 2, 3]); 4];
        let video = VideoData::new(
            frames,
            FrameRate::per_second(4),
            3,
            2,
            Some(AudioData::silence(8_000, 1, 8_000)),
        )
        .unwrap();
        let original = video.clone();

        let file = area.store(&MediaData::Video(video)).unwrap();
        assert_eq!(file.read().unwrap(), MediaData::Video(original));
    }

    #[test]
    fn test_admission_counter_rejects_overflow() {
        let area = SpillArea::with_capacity(1_000).unwrap();
        let first = area.store(&MediaData::Audio(stereo(100))).unwrap();

        let err = area.store(&MediaData::Audio(stereo(100))).unwrap_err();
        match err {
            ComposerError::ResourceExhausted { requested, available } => {
                assert_eq!(requested, 800);
                assert_eq!(available, 200);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(area.allocation_count(), 1);

        drop(first);
        assert!(area.store(&MediaData::Audio(stereo(100))).is_ok());
    }
}

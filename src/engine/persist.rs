//! Writing committed segments to their destination.
//!
//! Every artifact is written to a hidden staging path next to the
//! destination and renamed into place only after the write completes, so
//! a failed, timed out or cancelled request never leaves a partial file
//! where the caller expects output. An existing directory at the
//! destination is only replaced when it is a frame sequence written here.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rayon::prelude::*;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    engine::retry::RetryPolicy,
    error::{ComposerError, Result},
    media::{
        manifest::{frame_file_name, MANIFEST_FILE, TRACK_FILE},
        process::run_tool,
        AudioData, MediaData, MediaKind, MediaSegment, SegmentManifest, VideoData,
    },
    planner::OutputFormat,
};

/// Writes one artifact to a staging path
///
/// Implementations only need to produce a complete artifact at `staging`;
/// the persister handles retries, promotion and cleanup. `abandon` fires
/// when the persister gave up on this attempt; long writes should stop.
pub trait ArtifactWriter: Send + Sync {
    fn write(
        &self,
        label: &str,
        data: &MediaData,
        format: OutputFormat,
        staging: &Path,
        abandon: &CancellationToken,
    ) -> io::Result<()>;
}

/// Filesystem writer for every [`OutputFormat`]
#[derive(Debug, Default, Clone, Copy)]
pub struct FsWriter;

impl ArtifactWriter for FsWriter {
    fn write(
        &self,
        label: &str,
        data: &MediaData,
        format: OutputFormat,
        staging: &Path,
        abandon: &CancellationToken,
    ) -> io::Result<()> {
        match (format, data) {
            (OutputFormat::Wav, MediaData::Audio(audio)) => write_wav(audio, staging),
            (OutputFormat::FrameSequence, MediaData::Video(video)) => {
                write_frame_sequence(label, video, staging)
            }
            (OutputFormat::Mp4, MediaData::Video(video)) => write_mp4(video, staging, abandon),
            (format, data) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot write {:?} media as {:?}", data.kind(), format),
            )),
        }
    }
}

/// Check that `format` can hold media of `kind`
pub fn check_format(format: OutputFormat, kind: MediaKind) -> Result<()> {
    let compatible = match format {
        OutputFormat::Wav => kind == MediaKind::Audio,
        OutputFormat::FrameSequence | OutputFormat::Mp4 => kind == MediaKind::Video,
    };
    if compatible {
        Ok(())
    } else {
        Err(ComposerError::unsupported(format!(
            "{:?} output for {:?} media",
            format, kind
        )))
    }
}

/// Resolve the output format for `path`, preferring an explicit choice
pub fn resolve_format(path: &Path, explicit: Option<OutputFormat>) -> Result<OutputFormat> {
    explicit
        .or_else(|| OutputFormat::from_path(path))
        .ok_or_else(|| {
            ComposerError::unsupported(
                path.extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("unknown")
                    .to_string(),
            )
        })
}

/// Hidden sibling path an artifact is written to before promotion
pub fn staging_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output");
    destination.with_file_name(format!(".{}.partial", name))
}

/// Errors a later attempt may not hit again
pub fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Outcome of the race between a finished attempt and the timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GateState {
    #[default]
    Open,
    Promoted,
    Closed,
}

/// Lets either the promoting attempt or the expiring timeout win, never both
#[derive(Debug, Default)]
struct PromotionGate {
    state: Mutex<GateState>,
}

impl PromotionGate {
    /// Run `promote` unless the gate was closed; the gate stays locked meanwhile
    fn promote(&self, promote: impl FnOnce() -> io::Result<()>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == GateState::Closed {
            return Err(io::Error::new(io::ErrorKind::Other, "persist abandoned"));
        }
        promote()?;
        *state = GateState::Promoted;
        Ok(())
    }

    /// Forbid any later promotion; true when an attempt already promoted
    fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == GateState::Promoted {
            return true;
        }
        *state = GateState::Closed;
        false
    }
}

/// Commits segments through an [`ArtifactWriter`] with retry and timeout
pub struct Persister {
    writer: Arc<dyn ArtifactWriter>,
    retry: RetryPolicy,
}

impl Persister {
    pub fn new(writer: Arc<dyn ArtifactWriter>, retry: RetryPolicy) -> Self {
        Self { writer, retry }
    }

    /// Persist `segment` at `destination`, bounded by `timeout` across all attempts
    ///
    /// On any failure nothing remains at the staging path, and the
    /// destination is left as it was. Returns only after every attempt it
    /// started has finished.
    pub async fn persist(
        &self,
        segment: &MediaSegment,
        destination: &Path,
        format: OutputFormat,
        timeout: Duration,
    ) -> Result<PathBuf> {
        check_format(format, segment.kind())?;
        let data = segment.read()?;
        let label = segment.label().to_string();
        let staging = staging_path(destination);
        let abandon = CancellationToken::new();
        let gate = Arc::new(PromotionGate::default());
        let in_flight = TaskTracker::new();

        let attempts = self.retry.run("persist", |attempt| {
            let writer = Arc::clone(&self.writer);
            let data = Arc::clone(&data);
            let label = label.clone();
            let staging = staging.clone();
            let destination = destination.to_path_buf();
            let path = destination.display().to_string();
            let gate = Arc::clone(&gate);
            let abandon = abandon.clone();
            let handle = in_flight.spawn_blocking(move || {
                let target = Target {
                    staging: &staging,
                    destination: &destination,
                    gate: &gate,
                    abandon: &abandon,
                };
                write_and_promote(writer.as_ref(), &label, &data, format, &target)
            });
            async move {
                let outcome = handle.await;

                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ComposerError::Persistence {
                        path,
                        attempts: attempt,
                        transient: is_transient(e.kind()),
                        reason: e.to_string(),
                    }),
                    Err(join) => Err(ComposerError::Persistence {
                        path,
                        attempts: attempt,
                        transient: false,
                        reason: join.to_string(),
                    }),
                }
            }
        });

        let outcome = tokio::time::timeout(timeout, attempts).await;
        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => {
                abandon.cancel();
                if gate.close() {
                    warn!("{} was promoted as the timeout expired", destination.display());
                    Ok(())
                } else {
                    Err(ComposerError::TimeoutExceeded {
                        operation: format!("persisting {}", destination.display()),
                        timeout,
                    })
                }
            }
        };

        in_flight.close();
        in_flight.wait().await;

        match outcome {
            Ok(()) => {
                info!("💾 Wrote {} as {:?}", destination.display(), format);
                Ok(destination.to_path_buf())
            }
            Err(e) => {
                remove_path(&staging);
                Err(e)
            }
        }
    }
}

/// Where one attempt writes and what decides its promotion
#[derive(Clone, Copy)]
struct Target<'a> {
    staging: &'a Path,
    destination: &'a Path,
    gate: &'a PromotionGate,
    abandon: &'a CancellationToken,
}

fn write_and_promote(
    writer: &dyn ArtifactWriter,
    label: &str,
    data: &MediaData,
    format: OutputFormat,
    target: &Target<'_>,
) -> io::Result<()> {
    let Target {
        staging,
        destination,
        gate,
        abandon,
    } = *target;

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    check_replaceable(destination)?;
    remove_path(staging);

    if let Err(e) = writer.write(label, data, format, staging, abandon) {
        remove_path(staging);
        return Err(e);
    }

    let promoted = gate.promote(|| {
        check_replaceable(destination)?;
        if destination.is_dir() {
            std::fs::remove_dir_all(destination)?;
        }
        std::fs::rename(staging, destination)
    });
    if promoted.is_err() {
        remove_path(staging);
    }
    promoted?;
    debug!("Promoted {:?} to {:?}", staging, destination);
    Ok(())
}

/// A directory may only be replaced when it is a frame sequence written here
fn check_replaceable(destination: &Path) -> io::Result<()> {
    if destination.is_dir() && !destination.join(MANIFEST_FILE).is_file() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "{} is an existing directory without {}; refusing to replace it",
                destination.display(),
                MANIFEST_FILE
            ),
        ));
    }
    Ok(())
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        Ok(())
    };
    if let Err(e) = result {
        warn!("Failed to remove {:?}: {}", path, e);
    }
}

fn hound_error(e: hound::Error) -> io::Error {
    match e {
        hound::Error::IoError(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// 32-bit float WAV; a trailing partial sample frame is dropped
pub(crate) fn write_wav(audio: &AudioData, path: &Path) -> io::Result<()> {
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(hound_error)?;
    let whole = audio.frames() as usize * audio.channels as usize;
    for &sample in &audio.samples[..whole] {
        writer.write_sample(sample).map_err(hound_error)?;
    }
    writer.finalize().map_err(hound_error)
}

fn write_frames(video: &VideoData, dir: &Path) -> io::Result<()> {
    video
        .frames
        .par_iter()
        .enumerate()
        .try_for_each(|(index, frame)| {
            frame
                .save_png(dir.join(frame_file_name(index)))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
        })
}

fn write_frame_sequence(label: &str, video: &VideoData, dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    write_frames(video, dir)?;

    if let Some(track) = &video.audio {
        write_wav(track, &dir.join(TRACK_FILE))?;
    }

    let manifest = SegmentManifest {
        label: label.to_string(),
        rate: video.rate,
        width: video.width,
        height: video.height,
        frames: video.frame_count(),
        audio: video.audio.as_ref().map(|_| TRACK_FILE.to_string()),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    manifest.write(dir)
}

/// H.264 (and AAC when a track is bound) through the ffmpeg binary
fn write_mp4(video: &VideoData, path: &Path, abandon: &CancellationToken) -> io::Result<()> {
    let scratch = tempfile::Builder::new().prefix("av-composer-mux-").tempdir()?;
    write_frames(video, scratch.path())?;

    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-v", "error", "-nostdin", "-y"])
        .arg("-framerate")
        .arg(format!("{}/{}", video.rate.num, video.rate.den))
        .arg("-i")
        .arg(scratch.path().join("frame_%06d.png"));

    if let Some(track) = &video.audio {
        let track_path = scratch.path().join(TRACK_FILE);
        write_wav(track, &track_path)?;
        cmd.arg("-i").arg(&track_path).args(["-c:a", "aac"]);
    }

    cmd.args([
        "-c:v",
        "libx264",
        "-pix_fmt",
        "yuv420p",
        "-vf",
        "pad=ceil(iw/2)*2:ceil(ih/2)*2",
        "-f",
        "mp4",
    ])
    .arg(path);

    let output = run_tool(cmd, abandon)?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("ffmpeg failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Frame, FrameRate, SegmentLoader, MediaSource};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn tone() -> MediaSegment {
        let samples = (0..800).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        MediaSegment::from_audio("tone", AudioData::new(samples, 8_000, 2))
    }

    /// Fails with `kind` for the first `failures` calls, then writes normally
    struct FlakyWriter {
        failures: AtomicU32,
        kind: io::ErrorKind,
    }

    impl ArtifactWriter for FlakyWriter {
        fn write(
            &self,
            label: &str,
            data: &MediaData,
            format: OutputFormat,
            staging: &Path,
            abandon: &CancellationToken,
        ) -> io::Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                std::fs::write(staging, b"partial")?;
                return Err(io::Error::new(self.kind, "flaky"));
            }
            FsWriter.write(label, data, format, staging, abandon)
        }
    }

    struct SlowWriter;

    impl ArtifactWriter for SlowWriter {
        fn write(
            &self,
            label: &str,
            data: &MediaData,
            format: OutputFormat,
            staging: &Path,
            abandon: &CancellationToken,
        ) -> io::Result<()> {
            std::thread::sleep(Duration::from_millis(200));
            FsWriter.write(label, data, format, staging, abandon)
        }
    }

    #[tokio::test]
    async fn test_wav_roundtrip() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("nested/tone.wav");
        let persister = Persister::new(Arc::new(FsWriter), RetryPolicy::no_retry());

        let written = persister
            .persist(&tone(), &dest, OutputFormat::Wav, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(written, dest);
        assert!(!staging_path(&dest).exists());

        let loaded = SegmentLoader::load(MediaSource::file(&dest)).unwrap();
        assert_eq!(loaded.info(), tone().info());
    }

    #[tokio::test]
    async fn test_frame_sequence_roundtrip() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("clip");
        let frames = vec![Frame::new_filled(4, 2, [10, 20, 30]); 5];
        let video = VideoData::new(
            frames,
            FrameRate::per_second(5),
            4,
            2,
            Some(AudioData::silence(8_000, 1, 8_000)),
        )
        .unwrap();
        let segment = MediaSegment::from_video("clip", video);
        let persister = Persister::new(Arc::new(FsWriter), RetryPolicy::no_retry());

        persister
            .persist(&segment, &dest, OutputFormat::FrameSequence, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(dest.join("segment.toml").exists());
        assert!(dest.join(TRACK_FILE).exists());

        let loaded = SegmentLoader::load(MediaSource::file(&dest)).unwrap();
        assert_eq!(loaded.info(), segment.info());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("tone.wav");
        let writer = FlakyWriter {
            failures: AtomicU32::new(2),
            kind: io::ErrorKind::Interrupted,
        };
        let persister = Persister::new(Arc::new(writer), quick_retry(3));

        persister
            .persist(&tone(), &dest, OutputFormat::Wav, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(dest.exists());
        assert!(!staging_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_permanent_failure_leaves_nothing() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("tone.wav");
        let writer = FlakyWriter {
            failures: AtomicU32::new(5),
            kind: io::ErrorKind::PermissionDenied,
        };
        let persister = Persister::new(Arc::new(writer), quick_retry(3));

        let err = persister
            .persist(&tone(), &dest, OutputFormat::Wav, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Persistence { attempts: 1, transient: false, .. }
        ));
        assert!(!dest.exists());
        assert!(!staging_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_timeout_never_promotes() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("tone.wav");
        let persister = Persister::new(Arc::new(SlowWriter), RetryPolicy::no_retry());

        let err = persister
            .persist(&tone(), &dest, OutputFormat::Wav, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ComposerError::TimeoutExceeded { .. }));

        // The abandoned attempt has already finished and cleaned up
        assert!(!dest.exists());
        assert!(!staging_path(&dest).exists());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_foreign_directory_is_never_replaced() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("music");
        std::fs::create_dir(&dest).unwrap();
        std::fs::write(dest.join("precious.txt"), b"keep me").unwrap();
        let persister = Persister::new(Arc::new(FsWriter), quick_retry(3));

        let err = persister
            .persist(&tone(), &dest, OutputFormat::Wav, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Persistence { attempts: 1, transient: false, .. }
        ));
        assert!(dest.join("precious.txt").is_file());
        assert!(!staging_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_earlier_frame_sequence_is_replaced() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("clip");
        let persister = Persister::new(Arc::new(FsWriter), RetryPolicy::no_retry());
        let clip = |color| {
            let frames = vec![Frame::new_filled(2, 2, color); 3];
            MediaSegment::from_video("clip", VideoData::new(frames, FrameRate::per_second(3), 2, 2, None).unwrap())
        };

        for color in [[1, 1, 1], [200, 0, 0]] {
            persister
                .persist(&clip(color), &dest, OutputFormat::FrameSequence, Duration::from_secs(10))
                .await
                .unwrap();
        }
        let loaded = SegmentLoader::load(MediaSource::file(&dest)).unwrap();
        match loaded.into_data().unwrap() {
            MediaData::Video(video) => assert_eq!(video.frames[0].get_pixel(0, 0), [200, 0, 0]),
            other => panic!("expected video, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_closed_gate_refuses_promotion() {
        let gate = PromotionGate::default();
        assert!(!gate.close());

        let mut ran = false;
        let result = gate.promote(|| {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);
    }

    #[test]
    fn test_promotion_wins_over_a_later_close() {
        let gate = PromotionGate::default();
        gate.promote(|| Ok(())).unwrap();
        assert!(gate.close());
    }

    #[test]
    fn test_format_checks() {
        assert!(check_format(OutputFormat::Wav, MediaKind::Audio).is_ok());
        assert!(matches!(
            check_format(OutputFormat::Wav, MediaKind::Video),
            Err(ComposerError::UnsupportedFormat { .. })
        ));
        assert!(check_format(OutputFormat::Mp4, MediaKind::Audio).is_err());

        assert_eq!(
            resolve_format(Path::new("a.txt"), Some(OutputFormat::Wav)).unwrap(),
            OutputFormat::Wav
        );
        assert!(resolve_format(Path::new("a.txt"), None).is_err());
    }

    #[test]
    fn test_staging_path_is_hidden_sibling() {
        assert_eq!(
            staging_path(Path::new("/out/final.wav")),
            PathBuf::from("/out/.final.wav.partial")
        );
    }
}

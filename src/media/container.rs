//! Container video through the external `ffprobe`/`ffmpeg` processes.
//!
//! Pictures are decoded to PNG files in a scratch directory and read back
//! with `image`; the first audio stream is decoded to raw `f32le` on stdout.
//! Every child process is killed once the caller's `abandon` token fires.

use std::io;
use std::path::Path;

use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ComposerError, Result};
use crate::media::loader::SegmentLoader;
use crate::media::process::run_tool;
use crate::media::types::{AudioData, AudioTrackInfo, FrameRate, SegmentInfo, VideoData};

/// Stream parameters reported by ffprobe
#[derive(Debug, Clone, PartialEq)]
struct StreamLayout {
    rate: FrameRate,
    width: u32,
    height: u32,
    frames: u64,
    audio: Option<(u32, u16)>,
}

pub fn probe(path: &Path, abandon: &CancellationToken) -> Result<SegmentInfo> {
    let layout = probe_streams(path, abandon)?;
    let mut info = SegmentInfo::video(layout.rate, layout.width, layout.height, layout.frames);
    if let Some((sample_rate, channels)) = layout.audio {
        let track = decode_audio(path, sample_rate, channels, abandon)?;
        info.audio_track = Some(AudioTrackInfo {
            sample_rate,
            channels,
            frames: track.frames(),
        });
        info.aligned = track.is_aligned() && track.frames() == info.expected_track_frames(sample_rate);
    }
    Ok(info)
}

pub fn load(path: &Path, abandon: &CancellationToken) -> Result<VideoData> {
    let layout = probe_streams(path, abandon)?;
    let scratch = tempfile::Builder::new().prefix("av-composer-decode-").tempdir()?;
    let pattern = scratch.path().join("frame_%06d.png");

    info!("Decoding {} frames from {:?}", layout.frames, path);
    let mut decode = Command::new("ffmpeg");
    decode
        .args(["-v", "error", "-nostdin", "-i"])
        .arg(path)
        .args(["-map", "0:v:0", "-vsync", "0", "-start_number", "0"])
        .arg(&pattern);
    tool_output(decode, "ffmpeg", path, abandon)?;

    let paths = SegmentLoader::list_images(scratch.path())?;
    if paths.len() as u64 != layout.frames {
        return Err(ComposerError::corrupt(
            path.display().to_string(),
            format!("expected {} frames, decoded {}", layout.frames, paths.len()),
        ));
    }
    let frames = SegmentLoader::load_frames(&paths)?;
    let audio = match layout.audio {
        Some((sample_rate, channels)) => Some(decode_audio(path, sample_rate, channels, abandon)?),
        None => None,
    };
    SegmentLoader::assemble(path, frames, layout.rate, audio)
}

fn probe_streams(path: &Path, abandon: &CancellationToken) -> Result<StreamLayout> {
    let mut ffprobe = Command::new("ffprobe");
    ffprobe
        .args([
            "-v", "error", "-count_frames", "-print_format", "json", "-show_streams",
        ])
        .arg(path);
    let stdout = tool_output(ffprobe, "ffprobe", path, abandon)?;

    let json: Value = serde_json::from_slice(&stdout)
        .map_err(|e| ComposerError::corrupt(path.display().to_string(), e.to_string()))?;
    parse_streams(&json).ok_or_else(|| {
        ComposerError::corrupt(path.display().to_string(), "no usable video stream")
    })
}

fn parse_streams(json: &Value) -> Option<StreamLayout> {
    let streams = json.get("streams")?.as_array()?;
    let video = streams
        .iter()
        .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))?;

    let width = video.get("width")?.as_u64()? as u32;
    let height = video.get("height")?.as_u64()? as u32;
    let rate = parse_rate(video.get("r_frame_rate")?.as_str()?)?;
    let frames = number_field(video, "nb_read_frames").or_else(|| number_field(video, "nb_frames"))?;

    let audio = streams
        .iter()
        .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("audio"))
        .and_then(|a| {
            let sample_rate = number_field(a, "sample_rate")? as u32;
            let channels = a.get("channels")?.as_u64()? as u16;
            Some((sample_rate, channels))
        });

    Some(StreamLayout {
        rate,
        width,
        height,
        frames,
        audio,
    })
}

/// ffprobe reports most counters as strings
fn number_field(stream: &Value, key: &str) -> Option<u64> {
    let value = stream.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn parse_rate(text: &str) -> Option<FrameRate> {
    let (num, den) = text.split_once('/').unwrap_or((text, "1"));
    let rate = FrameRate::new(num.parse().ok()?, den.parse().ok()?);
    rate.is_valid().then_some(rate)
}

fn decode_audio(
    path: &Path,
    sample_rate: u32,
    channels: u16,
    abandon: &CancellationToken,
) -> Result<AudioData> {
    let mut decode = Command::new("ffmpeg");
    decode
        .args(["-v", "error", "-nostdin", "-i"])
        .arg(path)
        .args(["-map", "0:a:0", "-f", "f32le", "-acodec", "pcm_f32le"])
        .args(["-ar", &sample_rate.to_string(), "-ac", &channels.to_string()])
        .arg("pipe:1");
    let stdout = tool_output(decode, "ffmpeg", path, abandon)?;

    let samples: Vec<f32> = stdout
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    debug!("Decoded {} audio samples from {:?}", samples.len(), path);
    Ok(AudioData::new(samples, sample_rate, channels))
}

/// Stdout of a successful run; a failed run is reported against `path`
fn tool_output(command: Command, tool: &str, path: &Path, abandon: &CancellationToken) -> Result<Vec<u8>> {
    let output = run_tool(command, abandon).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            ComposerError::unsupported(format!("{} ({} not found)", path.display(), tool))
        }
        _ => ComposerError::Io(e),
    })?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(ComposerError::corrupt(
            path.display().to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_streams_reads_string_counters() {
        let probe = json!({
            "streams": [
                {"codec_type": "video", "width": 1280, "height": 720,
                 "r_frame_rate": "30000/1001", "nb_read_frames": "300"},
                {"codec_type": "audio", "sample_rate": "48000", "channels": 2}
            ]
        });
        let layout = parse_streams(&probe).unwrap();
        assert_eq!(layout.rate, FrameRate::new(30_000, 1_001));
        assert_eq!((layout.width, layout.height, layout.frames), (1280, 720, 300));
        assert_eq!(layout.audio, Some((48_000, 2)));
    }

    #[test]
    fn test_parse_streams_without_video() {
        let probe = json!({"streams": [{"codec_type": "audio", "sample_rate": "44100", "channels": 1}]});
        assert!(parse_streams(&probe).is_none());
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("25/1"), Some(FrameRate::per_second(25)));
        assert_eq!(parse_rate("24"), Some(FrameRate::per_second(24)));
        assert_eq!(parse_rate("0/0"), None);
    }
}

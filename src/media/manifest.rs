use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ComposerError, Result};
use crate::media::types::FrameRate;

/// File name of the manifest inside a persisted frame-sequence directory
pub const MANIFEST_FILE: &str = "segment.toml";

/// File name of the audio track inside a persisted frame-sequence directory
pub const TRACK_FILE: &str = "audio.wav";

/// Frame file name for a zero-based frame index
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{:06}.png", index)
}

/// Describes a video segment written as a directory of PNG frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub label: String,
    pub rate: FrameRate,
    pub width: u32,
    pub height: u32,
    pub frames: u64,

    /// Relative path of the audio track, if the segment has one
    pub audio: Option<String>,

    /// RFC 3339 creation timestamp
    pub created_at: String,
}

impl SegmentManifest {
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ComposerError::corrupt(path.display().to_string(), e.to_string()))?;
        let manifest: SegmentManifest = toml::from_str(&content)
            .map_err(|e| ComposerError::corrupt(path.display().to_string(), e.to_string()))?;
        if !manifest.rate.is_valid() {
            return Err(ComposerError::corrupt(
                path.display().to_string(),
                format!("invalid frame rate {}", manifest.rate),
            ));
        }
        Ok(manifest)
    }

    pub fn write(&self, dir: &Path) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(dir.join(MANIFEST_FILE), content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempdir().unwrap();
        let manifest = SegmentManifest {
            label: "intro".to_string(),
            rate: FrameRate::new(30_000, 1_001),
            width: 640,
            height: 360,
            frames: 120,
            audio: Some(TRACK_FILE.to_string()),
            created_at: "2024-01-01T00:00:00+00:00".to_string(),
        };
        manifest.write(dir.path()).unwrap();
        assert_eq!(SegmentManifest::read(dir.path()).unwrap(), manifest);
    }

    #[test]
    fn test_frame_names_sort_lexically() {
        assert_eq!(frame_file_name(7), "frame_000007.png");
        assert!(frame_file_name(9) < frame_file_name(10));
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::media::MediaKind;

/// Main error type for the av-composer library
///
/// Every public entry point resolves to exactly one of these per request.
#[derive(Error, Debug)]
pub enum ComposerError {
    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Corrupt or unreadable source {path}: {reason}")]
    CorruptSource { path: String, reason: String },

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(
        "Incompatible lengths: audio ends at {audio_end:?} but video lasts {video:?} \
         (tolerance {tolerance:?}) and no length policy is set"
    )]
    IncompatibleLengths {
        video: Duration,
        audio_end: Duration,
        tolerance: Duration,
    },

    #[error("Timed out after {timeout:?} while {operation}")]
    TimeoutExceeded { operation: String, timeout: Duration },

    #[error("Temporary storage exhausted: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: u64, available: u64 },

    #[error("Failed to persist {path} after {attempts} attempt(s): {reason}")]
    Persistence {
        path: String,
        attempts: u32,
        reason: String,
        transient: bool,
    },

    #[error("Request cancelled after {completed_steps} completed step(s)")]
    Cancelled { completed_steps: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections raised while building an execution plan, before anything runs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanningError {
    #[error("{operation} needs {expected} input(s), got {actual}")]
    InputCount {
        operation: String,
        expected: String,
        actual: usize,
    },

    #[error("Input {input} must produce {expected:?} media for {operation}, but produces {actual:?}")]
    KindMismatch {
        operation: String,
        input: usize,
        expected: MediaKind,
        actual: MediaKind,
    },

    #[error("Unknown stage: {name}")]
    UnknownStage { name: String },

    #[error("Stage '{stage}' does not accept {kind:?} input (input {input})")]
    StageKindMismatch {
        stage: String,
        input: usize,
        kind: MediaKind,
    },

    #[error("Stage '{earlier}' must run before '{later}' (input {input})")]
    OrderViolation {
        earlier: String,
        later: String,
        input: usize,
    },

    #[error("Input {input} is incompatible with input 0: {reason}")]
    IncompatibleSegments { input: usize, reason: String },

    #[error("Input {input} ends on a partial unit and no boundary policy is configured")]
    BoundaryPolicyRequired { input: usize },

    #[error("Audio offset {offset:?} is not inside the video ({video:?})")]
    OffsetBeyondVideo { offset: Duration, video: Duration },
}

/// A named stage rejected its input or parameters
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Stage '{stage_name}' failed: {cause}")]
pub struct StageError {
    pub stage_name: String,
    pub cause: String,
}

impl StageError {
    pub fn new<N: Into<String>, C: Into<String>>(stage_name: N, cause: C) -> Self {
        Self {
            stage_name: stage_name.into(),
            cause: cause.into(),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration file {path}: {reason}")]
    ParseFailed { path: String, reason: String },

    #[error("Invalid configuration value: {key} = {value}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },
}

/// Convenience type alias for Results using ComposerError
pub type Result<T> = std::result::Result<T, ComposerError>;

impl ComposerError {
    pub fn corrupt<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::CorruptSource {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(format: S) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    /// Check if this error is transient and the failed operation may be retried
    ///
    /// Only persistence failures qualify; stage logic is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedFormat { format } => {
                format!(
                    "'{}' is not a supported format. Audio: wav, mp3, flac, ogg, m4a, aac. \
                     Video: mp4, mov, avi, mkv or a PNG frame directory.",
                    format
                )
            }
            Self::CorruptSource { path, .. } => {
                format!(
                    "Could not read '{}'. Please check the file exists and is not damaged.",
                    path
                )
            }
            Self::IncompatibleLengths { .. } => {
                "Audio and video lengths differ. Choose a length policy (trim, loop or pad-silence)."
                    .to_string()
            }
            Self::Cancelled { .. } => "Operation cancelled. No output was written.".to_string(),
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!("Configuration file '{}' not found.", path)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_persistence_is_retryable() {
        let transient = ComposerError::Persistence {
            path: "out.wav".to_string(),
            attempts: 1,
            reason: "interrupted".to_string(),
            transient: true,
        };
        assert!(transient.is_retryable());

        let stage = ComposerError::from(StageError::new("volume", "bad gain"));
        assert!(!stage.is_retryable());
        assert!(!ComposerError::Cancelled { completed_steps: 2 }.is_retryable());
    }

    #[test]
    fn test_stage_error_display_names_the_stage() {
        let err = ComposerError::from(StageError::new("normalize", "empty input"));
        assert_eq!(err.to_string(), "Stage 'normalize' failed: empty input");
    }
}

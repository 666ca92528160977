use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How an attached audio track that ends before the video is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LengthPolicy {
    /// Cut the video at the last whole frame covered by audio
    Trim,
    /// Repeat the audio from its start until the video ends
    Loop,
    /// Fill the remainder with digital silence
    PadSilence,
}

/// How a segment ending on a partial unit is squared off before concatenation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundaryPolicy {
    /// Round up to the next whole unit
    Pad,
    /// Round down to the last whole unit
    Truncate,
}

impl FromStr for LengthPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trim" => Ok(LengthPolicy::Trim),
            "loop" => Ok(LengthPolicy::Loop),
            "pad-silence" | "pad_silence" | "pad" => Ok(LengthPolicy::PadSilence),
            other => Err(format!("unknown length policy '{}' (trim, loop, pad-silence)", other)),
        }
    }
}

impl FromStr for BoundaryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pad" => Ok(BoundaryPolicy::Pad),
            "truncate" => Ok(BoundaryPolicy::Truncate),
            other => Err(format!("unknown boundary policy '{}' (pad, truncate)", other)),
        }
    }
}

impl fmt::Display for LengthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthPolicy::Trim => write!(f, "trim"),
            LengthPolicy::Loop => write!(f, "loop"),
            LengthPolicy::PadSilence => write!(f, "pad-silence"),
        }
    }
}

impl fmt::Display for BoundaryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryPolicy::Pad => write!(f, "pad"),
            BoundaryPolicy::Truncate => write!(f, "truncate"),
        }
    }
}

/// Parameters of an attach-audio composition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOptions {
    /// Position in the video where the audio starts
    pub offset: Duration,

    /// Applied when the audio ends before the video; `None` only tolerates small gaps
    pub policy: Option<LengthPolicy>,

    /// Largest mismatch accepted without a policy
    pub tolerance: Duration,
}

impl AttachOptions {
    pub fn new(offset: Duration) -> Self {
        Self {
            offset,
            policy: None,
            tolerance: Duration::ZERO,
        }
    }

    pub fn with_policy(mut self, policy: LengthPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("pad-silence".parse::<LengthPolicy>(), Ok(LengthPolicy::PadSilence));
        assert_eq!("LOOP".parse::<LengthPolicy>(), Ok(LengthPolicy::Loop));
        assert_eq!("truncate".parse::<BoundaryPolicy>(), Ok(BoundaryPolicy::Truncate));
        assert!("stretch".parse::<LengthPolicy>().is_err());
    }

    #[test]
    fn test_policy_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: LengthPolicy,
        }
        let parsed: Wrapper = toml::from_str("policy = \"pad-silence\"").unwrap();
        assert_eq!(parsed.policy, LengthPolicy::PadSilence);
    }
}

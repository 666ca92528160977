use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    composition::{BoundaryPolicy, LengthPolicy},
    engine::RetryPolicy,
    error::{ConfigError, Result},
    media::StoragePolicy,
    planner::RequestOptions,
    stages::{StageParams, StageRegistry},
};

/// Main configuration for av-composer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default parameters per stage name, layered under request parameters
    pub enhancements: BTreeMap<String, StageParams>,

    /// Composition policies
    pub composition: CompositionConfig,

    /// Execution settings
    pub pipeline: PipelineConfig,

    /// Temporary storage for spilled intermediates
    pub spill: SpillConfig,

    /// Retry behaviour when writing outputs
    pub persistence: PersistenceConfig,

    /// Output directory roots
    pub output: OutputDirs,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            key: "config".to_string(),
            value: e.to_string(),
        })?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.spill.validate()?;
        self.persistence.validate()?;
        self.validate_enhancements(&StageRegistry::new())?;
        Ok(())
    }

    fn validate_enhancements(&self, registry: &StageRegistry) -> Result<()> {
        for (name, params) in &self.enhancements {
            let key = format!("enhancements.{}", name);
            let stage = registry.get(name).ok_or_else(|| ConfigError::InvalidValue {
                key: key.clone(),
                value: "unknown stage".to_string(),
            })?;
            stage.validate_params(params).map_err(|e| ConfigError::InvalidValue {
                key,
                value: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Configured default parameters for `stage`
    pub fn stage_defaults(&self, stage: &str) -> Option<&StageParams> {
        self.enhancements.get(stage)
    }

    /// Request options seeded from this configuration
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: Duration::from_millis(self.pipeline.timeout_ms),
            storage_policy: self.pipeline.storage_policy,
            max_parallel_stages: self.pipeline.max_parallel_stages,
            length_policy: self.composition.length_policy,
            boundary_policy: self.composition.boundary_policy,
            tolerance: Duration::from_millis(self.composition.length_tolerance_ms),
        }
    }
}

/// Composition policies
///
/// Neither policy has a default: an unset policy makes mismatches an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    /// How attached audio shorter than the video is covered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_policy: Option<LengthPolicy>,

    /// How segments ending on a partial unit are squared off for concat
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary_policy: Option<BoundaryPolicy>,

    /// Audio/video length mismatch accepted without a policy (milliseconds)
    pub length_tolerance_ms: u64,
}

/// Execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where intermediates live between stages
    pub storage_policy: StoragePolicy,

    /// Upper bound for each probe, decode, spill and persist operation (milliseconds)
    pub timeout_ms: u64,

    /// Number of stage transforms allowed to run at once
    pub max_parallel_stages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_policy: StoragePolicy::InMemory,
            timeout_ms: 120_000,
            max_parallel_stages: num_cpus::get(),
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.timeout_ms".to_string(),
                value: self.timeout_ms.to_string(),
            }
            .into());
        }

        if self.max_parallel_stages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.max_parallel_stages".to_string(),
                value: self.max_parallel_stages.to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Temporary storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Parent directory for the spill area; the system temp dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Total bytes the spill area may hold at once
    pub max_bytes: u64,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl SpillConfig {
    fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "spill.max_bytes".to_string(),
                value: self.max_bytes.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Retry behaviour for transient write failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl PersistenceConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "persistence.max_attempts".to_string(),
                value: self.max_attempts.to_string(),
            }
            .into());
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "persistence.delay_range".to_string(),
                value: format!("{}-{}", self.initial_delay_ms, self.max_delay_ms),
            }
            .into());
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: 2.0,
        }
    }
}

/// Logical output category, each with its own root directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Final,
    Merged,
    Enhanced,
}

/// Output directory roots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputDirs {
    pub final_dir: PathBuf,
    pub merged_dir: PathBuf,
    pub enhanced_dir: PathBuf,
}

impl Default for OutputDirs {
    fn default() -> Self {
        Self {
            final_dir: PathBuf::from("output/final"),
            merged_dir: PathBuf::from("output/merged"),
            enhanced_dir: PathBuf::from("output/enhanced"),
        }
    }
}

impl OutputDirs {
    pub fn root(&self, category: OutputCategory) -> &Path {
        match category {
            OutputCategory::Final => &self.final_dir,
            OutputCategory::Merged => &self.merged_dir,
            OutputCategory::Enhanced => &self.enhanced_dir,
        }
    }

    /// Fully qualified destination for `file_name`; absolute names are kept as given
    pub fn resolve<P: AsRef<Path>>(&self, category: OutputCategory, file_name: P) -> PathBuf {
        let file_name = file_name.as_ref();
        if file_name.is_absolute() {
            file_name.to_path_buf()
        } else {
            self.root(category).join(file_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.composition.length_policy.is_none());
        assert!(config.composition.boundary_policy.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_config.toml");

        let mut original = Config::default();
        original.composition.length_policy = Some(LengthPolicy::PadSilence);
        original
            .enhancements
            .insert("volume".to_string(), StageParams::new().set("db", -3.0));

        original.save_to_file(&file_path).unwrap();
        let loaded = Config::from_file(&file_path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [composition]
            length_policy = "loop"

            [enhancements.normalize]
            target_db = -14.0
            "#,
        )
        .unwrap();
        assert_eq!(config.composition.length_policy, Some(LengthPolicy::Loop));
        assert_eq!(config.pipeline.timeout_ms, 120_000);
        assert_eq!(
            config.stage_defaults("normalize").and_then(|p| p.get_f64("target_db")),
            Some(-14.0)
        );
    }

    #[test]
    fn test_invalid_pipeline_config() {
        let mut config = Config::default();
        config.pipeline.max_parallel_stages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_enhancement_defaults() {
        let mut config = Config::default();
        config
            .enhancements
            .insert("volume".to_string(), StageParams::new().set("db", 90.0));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .enhancements
            .insert("sparkle".to_string(), StageParams::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/av-composer.toml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_output_dirs_resolve() {
        let dirs = OutputDirs::default();
        assert_eq!(
            dirs.resolve(OutputCategory::Merged, "clip.mp4"),
            PathBuf::from("output/merged/clip.mp4")
        );
        assert_eq!(
            dirs.resolve(OutputCategory::Final, "/tmp/out.wav"),
            PathBuf::from("/tmp/out.wav")
        );
    }
}

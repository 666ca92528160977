use std::collections::HashMap;
use std::sync::Arc;

use crate::stages::{
    audio::{
        CutStage, DenoiseStage, DitherStage, FadeStage, LimitStage, NormalizeStage, ResampleStage,
        ReverseStage, SpeedStage, VolumeStage,
    },
    video::{
        ColorStage, ConformRateStage, ExtractAudioStage, ResizeStage, TrimStage, VideoFadeStage,
        VideoReverseStage, VideoSpeedStage,
    },
    Stage,
};

/// Registry of enhancement stages, looked up by name
///
/// The built-in set is registered statically when the registry is created.
/// Stages are stateless, so one shared instance serves every request.
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    /// Create a new registry with all built-in stages
    pub fn new() -> Self {
        let mut registry = Self {
            stages: HashMap::new(),
        };
        registry.register_builtin_stages();
        registry
    }

    fn register_builtin_stages(&mut self) {
        // Audio
        self.register(Arc::new(VolumeStage::new()));
        self.register(Arc::new(NormalizeStage::new()));
        self.register(Arc::new(LimitStage::new()));
        self.register(Arc::new(FadeStage::new()));
        self.register(Arc::new(SpeedStage::new()));
        self.register(Arc::new(ReverseStage::new()));
        self.register(Arc::new(CutStage::new()));
        self.register(Arc::new(ResampleStage::new()));
        self.register(Arc::new(DenoiseStage::new()));
        self.register(Arc::new(DitherStage::new()));

        // Video
        self.register(Arc::new(ColorStage::new()));
        self.register(Arc::new(VideoFadeStage::new()));
        self.register(Arc::new(VideoSpeedStage::new()));
        self.register(Arc::new(TrimStage::new()));
        self.register(Arc::new(VideoReverseStage::new()));
        self.register(Arc::new(ResizeStage::new()));
        self.register(Arc::new(ConformRateStage::new()));
        self.register(Arc::new(ExtractAudioStage::new()));
    }

    /// Register a stage under its own name, replacing any previous entry
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }

    /// Get a stage by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    /// All registered stage names, sorted
    pub fn available_stages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

use std::fmt;
use std::sync::Arc;

use crate::{
    composition::{AttachOptions, BoundaryPolicy},
    media::SegmentInfo,
    stages::{Stage, StageParams},
};

/// One resolved stage invocation with its predicted output
pub struct PlannedStep {
    pub stage: Arc<dyn Stage>,

    /// Caller parameters over configured defaults over declared defaults
    pub params: StageParams,

    /// Metadata the stage must produce
    pub expected: SegmentInfo,
}

impl fmt::Debug for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannedStep")
            .field("stage", &self.stage.name())
            .field("params", &self.params)
            .field("expected", &self.expected)
            .finish()
    }
}

/// Ordered steps for one input
#[derive(Debug)]
pub struct StageChain {
    /// Position of the input in the request
    pub input: usize,

    /// Probed metadata of the source
    pub source: SegmentInfo,

    pub steps: Vec<PlannedStep>,
}

impl StageChain {
    /// Metadata the chain hands to composition
    pub fn output(&self) -> SegmentInfo {
        self.steps.last().map(|s| s.expected).unwrap_or(self.source)
    }
}

/// Terminal step of a plan
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompositionOp {
    /// Hand the single chain output through unchanged
    Passthrough,
    Concat { boundary: Option<BoundaryPolicy> },
    AttachAudio(AttachOptions),
}

/// Immutable plan for one request
///
/// Built once by the planner and never patched; a failed request is
/// re-planned from scratch.
#[derive(Debug)]
pub struct ExecutionPlan {
    chains: Vec<StageChain>,
    composition: CompositionOp,
    output: SegmentInfo,
}

impl ExecutionPlan {
    pub(crate) fn new(chains: Vec<StageChain>, composition: CompositionOp, output: SegmentInfo) -> Self {
        Self {
            chains,
            composition,
            output,
        }
    }

    pub fn chains(&self) -> &[StageChain] {
        &self.chains
    }

    pub fn composition(&self) -> CompositionOp {
        self.composition
    }

    /// Predicted metadata of the final segment
    pub fn output(&self) -> &SegmentInfo {
        &self.output
    }

    /// Total enhancement steps across all chains
    pub fn step_count(&self) -> usize {
        self.chains.iter().map(|c| c.steps.len()).sum()
    }

    pub(crate) fn into_chains(self) -> Vec<StageChain> {
        self.chains
    }
}

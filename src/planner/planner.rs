use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    composition::{AttachOptions, Compositor},
    error::{PlanningError, Result},
    media::SegmentInfo,
    planner::{
        plan::{CompositionOp, ExecutionPlan, PlannedStep, StageChain},
        request::{Operation, RequestOptions, StageInvocation},
    },
    stages::{traits::require_aligned, StageParams, StageRegistry},
};

/// Turns an operation and probed inputs into an [`ExecutionPlan`]
///
/// Everything that can be known from metadata is checked here, so a
/// rejected request never decodes, transforms or spills anything.
pub struct Planner {
    registry: Arc<StageRegistry>,
    defaults: BTreeMap<String, StageParams>,
}

impl Planner {
    pub fn new(registry: Arc<StageRegistry>, defaults: BTreeMap<String, StageParams>) -> Self {
        Self { registry, defaults }
    }

    /// Plan `operation` over `inputs`, each a probed source plus its stage chain
    pub fn plan(
        &self,
        operation: &Operation,
        inputs: &[(SegmentInfo, &[StageInvocation])],
        options: &RequestOptions,
    ) -> Result<ExecutionPlan> {
        check_input_count(operation, inputs.len())?;

        let chains = inputs
            .iter()
            .enumerate()
            .map(|(index, (info, invocations))| self.plan_chain(index, *info, invocations))
            .collect::<Result<Vec<_>>>()?;
        let outputs: Vec<SegmentInfo> = chains.iter().map(StageChain::output).collect();

        let (composition, output) = match operation {
            Operation::Enhance => (CompositionOp::Passthrough, outputs[0]),
            Operation::Concat => {
                let boundary = options.boundary_policy;
                let output = Compositor::plan_concat(&outputs, boundary)?;
                (CompositionOp::Concat { boundary }, output)
            }
            Operation::AttachAudio { offset } => {
                let attach = AttachOptions {
                    offset: *offset,
                    policy: options.length_policy,
                    tolerance: options.tolerance,
                };
                let output = Compositor::plan_attach(&outputs[0], &outputs[1], &attach)?;
                (CompositionOp::AttachAudio(attach), output)
            }
        };

        let plan = ExecutionPlan::new(chains, composition, output);
        info!(
            "Planned {} over {} input(s): {} step(s), output {:?} lasting {:?}",
            operation.name(),
            inputs.len(),
            plan.step_count(),
            output.kind(),
            output.duration()
        );
        Ok(plan)
    }

    fn plan_chain(&self, index: usize, source: SegmentInfo, invocations: &[StageInvocation]) -> Result<StageChain> {
        let mut steps: Vec<PlannedStep> = Vec::with_capacity(invocations.len());
        let mut current = source;

        for invocation in invocations {
            let stage = self
                .registry
                .get(&invocation.stage)
                .ok_or_else(|| PlanningError::UnknownStage {
                    name: invocation.stage.clone(),
                })?;
            let capabilities = stage.capabilities();

            if !capabilities.accepts(current.kind()) {
                return Err(PlanningError::StageKindMismatch {
                    stage: stage.name().to_string(),
                    input: index,
                    kind: current.kind(),
                }
                .into());
            }

            if let Some(later) = steps
                .iter()
                .map(|step| step.stage.name())
                .find(|name| capabilities.must_precede.iter().any(|p| p == name))
            {
                return Err(PlanningError::OrderViolation {
                    earlier: stage.name().to_string(),
                    later: later.to_string(),
                    input: index,
                }
                .into());
            }

            if capabilities.requires_aligned {
                require_aligned(stage.name(), &current)?;
            }

            let params = match self.defaults.get(stage.name()) {
                Some(defaults) => invocation.params.over(defaults),
                None => invocation.params.clone(),
            };
            stage.validate_params(&params)?;
            let expected = stage.describe_output(&current, &params)?;
            let params = stage.resolve(&params)?;

            debug!(
                "Input {}: {} [{}] -> {} units",
                index,
                stage.name(),
                params,
                expected.units
            );
            steps.push(PlannedStep {
                stage,
                params,
                expected,
            });
            current = expected;
        }

        Ok(StageChain {
            input: index,
            source,
            steps,
        })
    }
}

fn check_input_count(operation: &Operation, actual: usize) -> Result<()> {
    let (valid, expected) = match operation {
        Operation::Enhance => (actual == 1, "exactly 1"),
        Operation::Concat => (actual >= 1, "at least 1"),
        Operation::AttachAudio { .. } => (actual == 2, "exactly 2 (video, audio)"),
    };
    if valid {
        Ok(())
    } else {
        Err(PlanningError::InputCount {
            operation: operation.name().to_string(),
            expected: expected.to_string(),
            actual,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::{BoundaryPolicy, LengthPolicy};
    use crate::error::ComposerError;
    use crate::media::{FrameRate, MediaKind};
    use std::time::Duration;

    fn planner() -> Planner {
        Planner::new(Arc::new(StageRegistry::new()), BTreeMap::new())
    }

    fn audio_info(seconds: u64) -> SegmentInfo {
        SegmentInfo::audio(8_000, 1, seconds * 8_000)
    }

    fn video_info(frames: u64) -> SegmentInfo {
        SegmentInfo::video(FrameRate::per_second(25), 4, 4, frames)
    }

    fn planning_error(err: ComposerError) -> PlanningError {
        match err {
            ComposerError::Planning(e) => e,
            other => panic!("expected a planning error, got {:?}", other),
        }
    }

    #[test]
    fn test_enhance_chain_predicts_output() {
        let stages = [
            StageInvocation::new("cut", StageParams::new().set("start", 1.0)),
            StageInvocation::named("normalize"),
            StageInvocation::named("limit"),
        ];
        let plan = planner()
            .plan(&Operation::Enhance, &[(audio_info(4), &stages[..])], &RequestOptions::default())
            .unwrap();

        assert_eq!(plan.step_count(), 3);
        assert_eq!(plan.composition(), CompositionOp::Passthrough);
        assert_eq!(plan.output().duration(), Duration::from_secs(3));
    }

    #[test]
    fn test_input_counts() {
        let none: [(SegmentInfo, &[StageInvocation]); 0] = [];
        let err = planner()
            .plan(&Operation::Concat, &none, &RequestOptions::default())
            .unwrap_err();
        assert!(matches!(planning_error(err), PlanningError::InputCount { actual: 0, .. }));

        let one = [(video_info(25), &[][..])];
        let attach = Operation::AttachAudio { offset: Duration::ZERO };
        let err = planner().plan(&attach, &one, &RequestOptions::default()).unwrap_err();
        assert!(matches!(planning_error(err), PlanningError::InputCount { actual: 1, .. }));
    }

    #[test]
    fn test_unknown_stage() {
        let stages = [StageInvocation::named("sparkle")];
        let err = planner()
            .plan(&Operation::Enhance, &[(audio_info(1), &stages[..])], &RequestOptions::default())
            .unwrap_err();
        assert_eq!(
            planning_error(err),
            PlanningError::UnknownStage {
                name: "sparkle".to_string()
            }
        );
    }

    #[test]
    fn test_stage_kind_checked_against_predicted_kind() {
        // extract_audio turns the video into audio, so a video stage after it is rejected
        let stages = [StageInvocation::named("extract_audio"), StageInvocation::named("color")];
        let info = video_info(25).with_aligned_track(8_000, 1);
        let err = planner()
            .plan(&Operation::Enhance, &[(info, &stages[..])], &RequestOptions::default())
            .unwrap_err();
        assert_eq!(
            planning_error(err),
            PlanningError::StageKindMismatch {
                stage: "color".to_string(),
                input: 0,
                kind: MediaKind::Audio,
            }
        );
    }

    #[test]
    fn test_limit_before_normalize_is_rejected() {
        let stages = [StageInvocation::named("limit"), StageInvocation::named("normalize")];
        let err = planner()
            .plan(&Operation::Enhance, &[(audio_info(1), &stages[..])], &RequestOptions::default())
            .unwrap_err();
        assert!(matches!(
            planning_error(err),
            PlanningError::OrderViolation { ref earlier, ref later, .. }
                if earlier == "normalize" && later == "limit"
        ));
    }

    /// Declares aligned input but never checks it itself
    struct Framewise;

    impl crate::stages::Stage for Framewise {
        fn name(&self) -> &str {
            "framewise"
        }

        fn description(&self) -> &str {
            "Works on whole sample frames only"
        }

        fn capabilities(&self) -> crate::stages::StageCapabilities {
            crate::stages::StageCapabilities::transform(MediaKind::Audio, Vec::new()).aligned()
        }

        fn describe_output(&self, input: &SegmentInfo, _params: &StageParams) -> Result<SegmentInfo> {
            Ok(*input)
        }

        fn apply(&self, input: crate::media::MediaSegment, _params: &StageParams) -> Result<crate::media::MediaSegment> {
            Ok(input)
        }
    }

    #[test]
    fn test_aligned_capability_is_enforced_for_custom_stages() {
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(Framewise));
        let planner = Planner::new(Arc::new(registry), BTreeMap::new());
        let stages = [StageInvocation::named("framewise")];

        let mut ragged = audio_info(1);
        ragged.aligned = false;
        match planner
            .plan(&Operation::Enhance, &[(ragged, &stages[..])], &RequestOptions::default())
            .unwrap_err()
        {
            ComposerError::Stage(e) => assert_eq!(e.stage_name, "framewise"),
            other => panic!("expected stage error, got {:?}", other),
        }

        assert!(planner
            .plan(&Operation::Enhance, &[(audio_info(1), &stages[..])], &RequestOptions::default())
            .is_ok());
    }

    #[test]
    fn test_bad_params_surface_as_stage_error() {
        let stages = [StageInvocation::new("volume", StageParams::new().set("db", -100.0))];
        let err = planner()
            .plan(&Operation::Enhance, &[(audio_info(1), &stages[..])], &RequestOptions::default())
            .unwrap_err();
        match err {
            ComposerError::Stage(e) => assert_eq!(e.stage_name, "volume"),
            other => panic!("expected stage error, got {:?}", other),
        }
    }

    #[test]
    fn test_configured_defaults_sit_under_request_params() {
        let mut defaults = BTreeMap::new();
        defaults.insert("speed".to_string(), StageParams::new().set("factor", 2.0));
        let planner = Planner::new(Arc::new(StageRegistry::new()), defaults);

        let stages = [StageInvocation::named("speed")];
        let plan = planner
            .plan(&Operation::Enhance, &[(audio_info(4), &stages[..])], &RequestOptions::default())
            .unwrap();
        assert_eq!(plan.output().duration(), Duration::from_secs(2));

        let stages = [StageInvocation::new("speed", StageParams::new().set("factor", 4.0))];
        let plan = planner
            .plan(&Operation::Enhance, &[(audio_info(4), &stages[..])], &RequestOptions::default())
            .unwrap();
        assert_eq!(plan.output().duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_attach_requires_video_then_audio() {
        let attach = Operation::AttachAudio { offset: Duration::ZERO };
        let options = RequestOptions {
            length_policy: Some(LengthPolicy::PadSilence),
            ..RequestOptions::default()
        };
        let swapped = [(audio_info(1), &[][..]), (video_info(25), &[][..])];
        let err = planner().plan(&attach, &swapped, &options).unwrap_err();
        assert!(matches!(
            planning_error(err),
            PlanningError::KindMismatch { input: 0, expected: MediaKind::Video, .. }
        ));

        let ordered = [(video_info(50), &[][..]), (audio_info(1), &[][..])];
        let plan = planner().plan(&attach, &ordered, &options).unwrap();
        assert_eq!(plan.output().duration(), Duration::from_secs(2));
        assert!(plan.output().audio_track.is_some());
    }

    #[test]
    fn test_attach_mismatch_without_policy() {
        let attach = Operation::AttachAudio { offset: Duration::ZERO };
        let inputs = [(video_info(175), &[][..]), (audio_info(3), &[][..])];
        let err = planner().plan(&attach, &inputs, &RequestOptions::default()).unwrap_err();
        assert!(matches!(err, ComposerError::IncompatibleLengths { .. }));
    }

    #[test]
    fn test_concat_checks_chain_outputs() {
        // Resizing the second input makes the two chains compatible
        let resize = [StageInvocation::new(
            "resize",
            StageParams::new().set("width", 4i64).set("height", 4i64),
        )];
        let other = SegmentInfo::video(FrameRate::per_second(25), 8, 8, 10);
        let inputs = [(video_info(10), &[][..]), (other, &resize[..])];
        let options = RequestOptions {
            boundary_policy: Some(BoundaryPolicy::Pad),
            ..RequestOptions::default()
        };
        let plan = planner().plan(&Operation::Concat, &inputs, &options).unwrap();
        assert_eq!(plan.output().units, 20);

        let inputs = [(video_info(10), &[][..]), (other, &[][..])];
        let err = planner().plan(&Operation::Concat, &inputs, &options).unwrap_err();
        assert!(matches!(
            planning_error(err),
            PlanningError::IncompatibleSegments { input: 1, .. }
        ));
    }
}

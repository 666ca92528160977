use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::{
    composition::Compositor,
    config::Config,
    engine::{
        cancel::{CancellationToken, Checkpoint},
        persist::{check_format, resolve_format, ArtifactWriter, FsWriter, Persister},
        retry::RetryPolicy,
    },
    error::{ComposerError, Result, StageError},
    media::{MediaSegment, MediaSource, SegmentInfo, SegmentLoader, SpillArea, StoragePolicy},
    planner::{
        CompositionOp, CompositionRequest, Destination, ExecutionPlan, OutputFormat, Planner,
        RequestOptions, StageChain, StageInvocation,
    },
    stages::{StageParams, StageRegistry},
};

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Planned,
    Running,
    Committed,
    Failed,
}

/// What happened while a request executed
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Final state; always `Committed` for a returned report
    pub state: RequestState,

    /// Every state the request passed through, in order
    pub transitions: Vec<RequestState>,

    pub steps_completed: usize,
    pub elapsed: Duration,
}

/// Result of a successful request
#[derive(Debug)]
pub struct CommittedOutput {
    pub segment: MediaSegment,

    /// Path actually written, for file destinations
    pub destination: Option<PathBuf>,

    pub report: ExecutionReport,
}

/// Runs [`CompositionRequest`]s from probe to commit
///
/// The engine holds no per-request state. Its spill area is shared by
/// every request it runs and bounds the temporary storage they use
/// together.
pub struct ExecutionEngine {
    registry: Arc<StageRegistry>,
    defaults: BTreeMap<String, StageParams>,
    spill: Arc<SpillArea>,
    writer: Arc<dyn ArtifactWriter>,
    retry: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(StageRegistry::new()),
            defaults: config.enhancements.clone(),
            spill: SpillArea::new(&config.spill)?,
            writer: Arc::new(FsWriter),
            retry: config.persistence.retry_policy(),
        })
    }

    /// Replace the stage registry, e.g. to add custom stages
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn ArtifactWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn spill(&self) -> &Arc<SpillArea> {
        &self.spill
    }

    /// Plan and run `request`, returning the committed segment or one terminal error
    ///
    /// Returns only after every blocking job the request started has
    /// finished, so a failed request holds no spill files or reservations.
    pub async fn execute(&self, request: CompositionRequest) -> Result<CommittedOutput> {
        let started = Instant::now();
        let operation = request.operation.name();
        let run = RunContext::new(Arc::clone(&self.spill), &request.options, request.cancel.clone());

        let result = self.run(request, &run, started).await;
        run.settle(result.is_err()).await;
        match &result {
            Ok(output) => info!(
                "✅ {} committed after {} step(s) in {:.2?}",
                operation, output.report.steps_completed, output.report.elapsed
            ),
            Err(e) => error!(
                "❌ {} failed after {:.2?} (state {:?}): {}",
                operation,
                started.elapsed(),
                RequestState::Failed,
                e
            ),
        }
        result
    }

    async fn run(&self, request: CompositionRequest, run: &RunContext, started: Instant) -> Result<CommittedOutput> {
        let CompositionRequest {
            operation,
            inputs,
            destination,
            options,
            cancel,
        } = request;
        let timeout = options.timeout;

        info!("🎬 Planning {} over {} input(s)", operation.name(), inputs.len());
        let mut probed = Vec::with_capacity(inputs.len());
        for spec in &inputs {
            probed.push(probe(run, &spec.source).await?);
        }

        let chains: Vec<(SegmentInfo, &[StageInvocation])> = probed
            .iter()
            .zip(&inputs)
            .map(|(info, spec)| (*info, spec.stages.as_slice()))
            .collect();
        let planner = Planner::new(Arc::clone(&self.registry), self.defaults.clone());
        let plan = planner.plan(&operation, &chains, &options)?;

        let target = match &destination {
            Destination::InMemory => None,
            Destination::File { path, format } => {
                let format = resolve_format(path, *format)?;
                check_format(format, plan.output().kind())?;
                Some((path.clone(), format))
            }
        };

        let mut transitions = vec![RequestState::Planned, RequestState::Running];
        debug!("Request state {:?}", RequestState::Running);

        let sources: Vec<MediaSource> = inputs.into_iter().map(|spec| spec.source).collect();
        let expected_output = *plan.output();
        let composition = plan.composition();
        let segments = run_chains(run, plan, sources).await?;
        let steps_completed = run.completed.load(Ordering::SeqCst);

        cancel.checkpoint(steps_completed)?;
        info!("🔗 Composing {} segment(s)", segments.len());
        let segment = compose(run, composition, segments, expected_output).await?;

        cancel.checkpoint(steps_completed)?;
        let destination = match target {
            None => None,
            Some((path, format)) => Some(self.commit(&segment, path, format, timeout).await?),
        };

        transitions.push(RequestState::Committed);
        Ok(CommittedOutput {
            segment,
            destination,
            report: ExecutionReport {
                state: RequestState::Committed,
                transitions,
                steps_completed,
                elapsed: started.elapsed(),
            },
        })
    }

    async fn commit(
        &self,
        segment: &MediaSegment,
        path: PathBuf,
        format: OutputFormat,
        timeout: Duration,
    ) -> Result<PathBuf> {
        let persister = Persister::new(Arc::clone(&self.writer), self.retry.clone());
        persister.persist(segment, &path, format, timeout).await
    }
}

/// Shared handles for everything one request runs
#[derive(Clone)]
struct RunContext {
    spill: Arc<SpillArea>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Fired when the request fails; kills external tools it launched
    abandon: CancellationToken,
    /// Every blocking job started for the request
    work: TaskTracker,
    timeout: Duration,
    storage: StoragePolicy,
    completed: Arc<AtomicUsize>,
}

impl RunContext {
    fn new(spill: Arc<SpillArea>, options: &RequestOptions, cancel: CancellationToken) -> Self {
        Self {
            spill,
            permits: Arc::new(Semaphore::new(options.max_parallel_stages.max(1))),
            cancel,
            abandon: CancellationToken::new(),
            work: TaskTracker::new(),
            timeout: options.timeout,
            storage: options.storage_policy,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `f` on the blocking pool, bounded by the request timeout
    ///
    /// On timeout the job keeps running until [`settle`](Self::settle).
    async fn blocking<T, F>(&self, operation: String, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.work.spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ComposerError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{} did not complete: {}", operation, join),
            ))),
            Err(_) => Err(ComposerError::TimeoutExceeded { operation, timeout }),
        }
    }

    /// Wait for every blocking job, killing external tools first if the request failed
    async fn settle(&self, failed: bool) {
        if failed {
            self.abandon.cancel();
        }
        self.work.close();
        if !self.work.is_empty() {
            debug!("Waiting for {} abandoned job(s)", self.work.len());
        }
        self.work.wait().await;
    }
}

async fn probe(run: &RunContext, source: &MediaSource) -> Result<SegmentInfo> {
    let detached = match source {
        MediaSource::Segment(segment) => return Ok(*segment.info()),
        MediaSource::File(path) => MediaSource::File(path.clone()),
        MediaSource::ImageSequence { dir, rate } => MediaSource::ImageSequence {
            dir: dir.clone(),
            rate: *rate,
        },
        MediaSource::Still { path, rate, frames } => MediaSource::Still {
            path: path.clone(),
            rate: *rate,
            frames: *frames,
        },
    };
    let operation = format!("probing {}", detached.label());
    let abandon = run.abandon.clone();
    run.blocking(operation, move || SegmentLoader::probe_cancellable(&detached, &abandon))
        .await
}

async fn materialize(run: &RunContext, segment: MediaSegment) -> Result<MediaSegment> {
    if segment.storage() == run.storage {
        return Ok(segment);
    }
    let spill = Arc::clone(&run.spill);
    let policy = run.storage;
    let operation = format!("storing {}", segment.label());
    run.blocking(operation, move || segment.materialize(policy, &spill)).await
}

/// Run every chain concurrently; the first failure aborts the rest
async fn run_chains(
    run: &RunContext,
    plan: ExecutionPlan,
    sources: Vec<MediaSource>,
) -> Result<Vec<MediaSegment>> {
    let mut tasks = JoinSet::new();
    for (chain, source) in plan.into_chains().into_iter().zip(sources) {
        tasks.spawn(run_chain(run.clone(), chain, source));
    }

    let mut outputs: Vec<Option<MediaSegment>> = Vec::new();
    outputs.resize_with(tasks.len(), || None);

    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok(Ok((index, segment))) => {
                outputs[index] = Some(segment);
                continue;
            }
            Ok(Err(e)) => e,
            Err(join) => ComposerError::Io(io::Error::new(io::ErrorKind::Other, join.to_string())),
        };

        tasks.abort_all();
        // Aborted chains drop their segments here; jobs still on the blocking pool finish in `settle`
        while tasks.join_next().await.is_some() {}
        drop(outputs);
        return Err(failure);
    }

    Ok(outputs.into_iter().flatten().collect())
}

async fn run_chain(run: RunContext, chain: StageChain, source: MediaSource) -> Result<(usize, MediaSegment)> {
    let label = source.label();
    debug!("Input {}: loading {}", chain.input, label);

    let abandon = run.abandon.clone();
    let segment = run
        .blocking(format!("loading {}", label), move || {
            SegmentLoader::load_cancellable(source, &abandon)
        })
        .await?;
    if *segment.info() != chain.source {
        return Err(ComposerError::corrupt(
            label,
            format!(
                "decoded metadata {:?} differs from probed {:?}",
                segment.info(),
                chain.source
            ),
        ));
    }
    let mut segment = materialize(&run, segment).await?;

    for step in chain.steps {
        run.cancel.checkpoint(run.completed.load(Ordering::SeqCst))?;

        let permit = Arc::clone(&run.permits)
            .acquire_owned()
            .await
            .map_err(|e| ComposerError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        let name = step.stage.name().to_string();
        let stage = Arc::clone(&step.stage);
        let params = step.params.clone();

        debug!("Input {}: running {} [{}]", chain.input, name, params);
        let output = run
            .work
            .spawn_blocking(move || {
                let _permit = permit;
                stage.apply(segment, &params)
            })
            .await
            .map_err(|e| StageError::new(&name, format!("stage did not complete: {}", e)))??;

        if *output.info() != step.expected {
            return Err(StageError::new(
                &name,
                format!(
                    "output {:?} does not match declared contract {:?}",
                    output.info(),
                    step.expected
                ),
            )
            .into());
        }

        segment = materialize(&run, output).await?;
        run.completed.fetch_add(1, Ordering::SeqCst);
    }

    Ok((chain.input, segment))
}

async fn compose(
    run: &RunContext,
    composition: CompositionOp,
    mut segments: Vec<MediaSegment>,
    expected: SegmentInfo,
) -> Result<MediaSegment> {
    let name = match composition {
        CompositionOp::Passthrough => "passthrough",
        CompositionOp::Concat { .. } => "concat",
        CompositionOp::AttachAudio(_) => "attach_audio",
    };

    let composed = run.work.spawn_blocking(move || match composition {
        CompositionOp::Passthrough => segments
            .pop()
            .ok_or_else(|| StageError::new(name, "no segment to pass through").into()),
        CompositionOp::Concat { boundary } => Compositor::concat(segments, boundary),
        CompositionOp::AttachAudio(options) => {
            let audio = segments.pop();
            let video = segments.pop();
            match (video, audio) {
                (Some(video), Some(audio)) => Compositor::attach_audio(video, audio, &options),
                _ => Err(StageError::new(name, "needs a video and an audio segment").into()),
            }
        }
    })
    .await
    .map_err(|e| StageError::new(name, format!("composition did not complete: {}", e)))??;

    if *composed.info() != expected {
        return Err(StageError::new(
            name,
            format!(
                "output {:?} does not match declared contract {:?}",
                composed.info(),
                expected
            ),
        )
        .into());
    }
    Ok(composed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AudioData;
    use crate::planner::{Operation, SourceSpec};
    use crate::stages::{Stage, StageCapabilities};
    use crate::media::MediaKind;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(&Config::default()).unwrap()
    }

    fn tone(label: &str, frames: usize) -> MediaSource {
        let samples = (0..frames).map(|i| ((i as f32) * 0.01).sin() * 0.25).collect();
        MediaSource::Segment(MediaSegment::from_audio(label, AudioData::new(samples, 8_000, 1)))
    }

    /// Declares one length and produces another
    struct LyingStage;

    impl Stage for LyingStage {
        fn name(&self) -> &str {
            "lying"
        }

        fn description(&self) -> &str {
            "Claims to keep the length but halves it"
        }

        fn capabilities(&self) -> StageCapabilities {
            StageCapabilities::transform(MediaKind::Audio, Vec::new())
        }

        fn describe_output(&self, input: &SegmentInfo, _params: &StageParams) -> Result<SegmentInfo> {
            Ok(*input)
        }

        fn apply(&self, segment: MediaSegment, _params: &StageParams) -> Result<MediaSegment> {
            let label = segment.label().to_string();
            let audio = match segment.into_data()? {
                crate::media::MediaData::Audio(audio) => audio,
                _ => unreachable!(),
            };
            let half = audio.slice_frames(0, audio.frames() / 2);
            Ok(MediaSegment::from_audio(label, half))
        }
    }

    #[tokio::test]
    async fn test_enhance_in_memory() {
        let request = CompositionRequest::new(Operation::Enhance).with_input(
            SourceSpec::new(tone("voice", 8_000))
                .with_stage(StageInvocation::named("normalize"))
                .with_stage(StageInvocation::named("limit")),
        );
        let output = engine().execute(request).await.unwrap();

        assert_eq!(output.report.steps_completed, 2);
        assert_eq!(
            output.report.transitions,
            vec![RequestState::Planned, RequestState::Running, RequestState::Committed]
        );
        assert!(output.destination.is_none());
        assert_eq!(output.segment.duration(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_contract_violation_is_a_stage_error() {
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(LyingStage));
        let engine = engine().with_registry(registry);

        let request = CompositionRequest::new(Operation::Enhance)
            .with_input(SourceSpec::new(tone("voice", 800)).with_stage(StageInvocation::named("lying")));
        match engine.execute(request).await.unwrap_err() {
            ComposerError::Stage(e) => {
                assert_eq!(e.stage_name, "lying");
                assert!(e.cause.contains("does not match declared contract"));
            }
            other => panic!("expected a stage error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_on_disk_policy_releases_intermediates() {
        let engine = engine();
        let mut options = crate::planner::RequestOptions::default();
        options.storage_policy = StoragePolicy::OnDisk;

        let request = CompositionRequest::new(Operation::Enhance)
            .with_options(options)
            .with_input(SourceSpec::new(tone("voice", 800)).with_stage(StageInvocation::named("reverse")));
        let output = engine.execute(request).await.unwrap();

        assert_eq!(output.segment.storage(), StoragePolicy::OnDisk);
        assert_eq!(engine.spill().live_files(), 1);
        drop(output);
        assert_eq!(engine.spill().live_files(), 0);
        assert_eq!(engine.spill().bytes_in_use(), 0);
    }

    #[tokio::test]
    async fn test_wrong_output_format_fails_before_loading() {
        let engine = engine();
        let request = CompositionRequest::new(Operation::Enhance)
            .with_input(SourceSpec::new(tone("voice", 800)))
            .with_destination(Destination::file("/tmp/never-written.mp4"));
        let err = engine.execute(request).await.unwrap_err();
        assert!(matches!(err, ComposerError::UnsupportedFormat { .. }));
        assert_eq!(engine.spill().allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_corrupt_source() {
        let request = CompositionRequest::new(Operation::Enhance)
            .with_input(SourceSpec::new(MediaSource::file("/nonexistent/voice.wav")));
        let err = engine().execute(request).await.unwrap_err();
        assert!(matches!(err, ComposerError::CorruptSource { .. }));
    }
}

//! Wires stages into a running pipeline: one decode stage, an optional filter
//! stage, and one or more output branches (encode or raw frames), each on its
//! own thread and connected by [`HandoffQueue`]s.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

use crate::bitstream::{BitstreamBuffer, BitstreamSlot, BitstreamStore};
use crate::contract::{
    BitstreamSource, CompletionToken, Dimensions, FrameGeometry, FrameSink, PipelineError,
    PixelFormat, SessionBackend, StageKind,
};
use crate::io::DEFAULT_CHUNK_SIZE;
use crate::params::{
    EncodeCtrlExt, FrameType, InitParams, InitParamsExt, VideoParamsExt, keyframe_ctrl,
};
use crate::pipeline::{EntryMeta, HandoffEntry, HandoffQueue, QueueRecvError};
use crate::pool::{FrameResource, ResourcePool};
use crate::stage::{BusyPolicy, BusyStats, ResyncTracker, StageDriver, StageOutcome};

const DEFAULT_WIDTH: NonZeroU32 = match NonZeroU32::new(1920) {
    Some(width) => width,
    None => NonZeroU32::MIN,
};
const DEFAULT_HEIGHT: NonZeroU32 = match NonZeroU32::new(1080) {
    Some(height) => height,
    None => NonZeroU32::MIN,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pool_size: usize,
    pub geometry: FrameGeometry,
    /// Encoded outputs allowed in flight per encoder.
    pub async_depth: usize,
    pub busy_policy: BusyPolicy,
    pub sync_timeout: Duration,
    /// How long a stage waits for a free frame before failing.
    pub surface_wait: Duration,
    /// How long a stage waits on an empty input queue before failing.
    pub upstream_timeout: Duration,
    /// `None` means unbounded hand-off queues.
    pub queue_capacity: Option<usize>,
    pub soft_hang_recovery: bool,
    /// Force a keyframe every N frames per encoder.
    pub reset_interval: Option<NonZeroU32>,
    /// Stop decoding after this many frames.
    pub max_frames: Option<u64>,
    pub output_buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            geometry: FrameGeometry::new(
                Dimensions {
                    width: DEFAULT_WIDTH,
                    height: DEFAULT_HEIGHT,
                },
                PixelFormat::Nv12,
            ),
            async_depth: 4,
            busy_policy: BusyPolicy::default(),
            sync_timeout: Duration::from_secs(60),
            surface_wait: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(60),
            queue_capacity: None,
            soft_hang_recovery: false,
            reset_interval: None,
            max_frames: None,
            output_buffer_size: 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));
        if self.pool_size == 0 {
            return invalid("pool_size must be at least 1");
        }
        if self.async_depth == 0 {
            return invalid("async_depth must be at least 1");
        }
        if self.sync_timeout.is_zero() || self.upstream_timeout.is_zero() {
            return invalid("timeouts must be non-zero");
        }
        if self.busy_policy.busy_timeout.is_zero() {
            return invalid("busy_timeout must be non-zero");
        }
        if self.queue_capacity == Some(0) {
            return invalid("queue_capacity must be at least 1 when set");
        }
        if self.max_frames == Some(0) {
            return invalid("max_frames must be at least 1 when set");
        }
        if self.output_buffer_size == 0 {
            return invalid("output_buffer_size must be non-zero");
        }
        Ok(())
    }
}

/// Requests a cooperative stop of a running pipeline.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
    queues: Vec<Arc<HandoffQueue>>,
    pool: Arc<ResourcePool>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            info!("pipeline stop requested");
        }
        self.token.cancel();
        for queue in &self.queues {
            queue.cancel();
        }
        self.pool.interrupt();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Decode,
    Filter,
    Encode { target_id: u32 },
    RawOutput { target_id: u32 },
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => f.write_str("decode"),
            Self::Filter => f.write_str("filter"),
            Self::Encode { target_id } => write!(f, "encode:{target_id}"),
            Self::RawOutput { target_id } => write!(f, "raw:{target_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub role: StageRole,
    pub frames: u64,
    /// Encoded packets the encoder flagged as keyframes.
    pub keyframes: u64,
    pub discarded: u64,
    pub recovered_hangs: u64,
    pub forced_resyncs: u64,
    pub busy: BusyStats,
}

impl StageReport {
    fn new(role: StageRole) -> Self {
        Self {
            role,
            frames: 0,
            keyframes: 0,
            discarded: 0,
            recovered_hangs: 0,
            forced_resyncs: 0,
            busy: BusyStats::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
    pub stopped: bool,
}

impl PipelineReport {
    pub fn stage(&self, role: StageRole) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.role == role)
    }

    pub fn output(&self, target_id: u32) -> Option<&StageReport> {
        self.stages.iter().find(|stage| {
            matches!(
                stage.role,
                StageRole::Encode { target_id: id } | StageRole::RawOutput { target_id: id }
                    if id == target_id
            )
        })
    }

    pub fn recovered_hangs(&self) -> u64 {
        self.stages.iter().map(|stage| stage.recovered_hangs).sum()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "elapsed={:?}", self.elapsed)?;
        for stage in &self.stages {
            write!(
                f,
                " {}[frames={} keyframes={} discarded={} hangs={} resyncs={} busy_retries={}]",
                stage.role,
                stage.frames,
                stage.keyframes,
                stage.discarded,
                stage.recovered_hangs,
                stage.forced_resyncs,
                stage.busy.retries
            )?;
        }
        if self.stopped {
            f.write_str(" stopped")?;
        }
        Ok(())
    }
}

enum OutputKind {
    Encode(VideoParamsExt),
    Raw,
}

struct OutputSpec {
    target_id: u32,
    kind: OutputKind,
    sink: Box<dyn FrameSink>,
}

pub struct PipelineBuilder {
    backend: Arc<dyn SessionBackend>,
    config: PipelineConfig,
    source: Option<Box<dyn BitstreamSource>>,
    init: Option<InitParamsExt>,
    filter: bool,
    outputs: Vec<OutputSpec>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(backend: Arc<dyn SessionBackend>, config: PipelineConfig) -> Self {
        Self {
            backend,
            config,
            source: None,
            init: None,
            filter: false,
            outputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn source(mut self, source: impl BitstreamSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Session parameters passed to the backend before anything is
    /// allocated. Without them the session is initialized with the
    /// configured async depth and default settings.
    pub fn init_params(mut self, params: &InitParamsExt) -> Result<Self, PipelineError> {
        self.init = Some(params.try_clone()?);
        Ok(self)
    }

    /// Inserts a filter stage between decode and the outputs.
    #[must_use]
    pub fn with_filter(mut self) -> Self {
        self.filter = true;
        self
    }

    /// Adds an encode branch. `params` is deep-copied, so one template can
    /// configure several branches.
    pub fn encode_output(
        mut self,
        target_id: u32,
        params: &VideoParamsExt,
        sink: impl FrameSink + 'static,
    ) -> Result<Self, PipelineError> {
        let params = params.try_clone()?;
        self.outputs.push(OutputSpec {
            target_id,
            kind: OutputKind::Encode(params),
            sink: Box::new(sink),
        });
        Ok(self)
    }

    /// Adds a branch that writes uncompressed frames.
    #[must_use]
    pub fn raw_output(mut self, target_id: u32, sink: impl FrameSink + 'static) -> Self {
        self.outputs.push(OutputSpec {
            target_id,
            kind: OutputKind::Raw,
            sink: Box::new(sink),
        });
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        let source = self.source.ok_or_else(|| {
            PipelineError::InvalidConfig("a bitstream source is required".to_string())
        })?;
        if self.outputs.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one output is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.target_id) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate output target {}",
                    output.target_id
                )));
            }
        }

        let init = match self.init {
            Some(init) => init,
            None => InitParamsExt::from_base(InitParams {
                async_depth: u16::try_from(self.config.async_depth).unwrap_or(u16::MAX),
                ..InitParams::default()
            }),
        };
        init.validate()?;
        self.backend.init_session(&init)?;

        let caps = self.backend.query_capabilities();
        debug!(%caps, "backend capabilities");
        if self.filter && !caps.filter_supported {
            return Err(PipelineError::UnsupportedOperation(
                "backend cannot filter".to_string(),
            ));
        }
        for output in &self.outputs {
            if let OutputKind::Encode(params) = &output.kind {
                if !caps.supports_encode(params.codec) {
                    return Err(PipelineError::UnsupportedOperation(format!(
                        "backend cannot encode {}",
                        params.codec
                    )));
                }
            }
        }

        let token = CancellationToken::new();
        let pool = Arc::new(
            ResourcePool::allocate(
                self.backend.as_ref(),
                self.config.pool_size,
                self.config.geometry,
            )?
            .with_stop(token.clone()),
        );

        let capacity = self.config.queue_capacity;
        let filter_queue = self
            .filter
            .then(|| Arc::new(HandoffQueue::new("decode->filter", capacity)));
        let upstream = if self.filter { "filter" } else { "decode" };
        let mut branches = Vec::with_capacity(self.outputs.len());
        for output in self.outputs {
            let role = match &output.kind {
                OutputKind::Encode(params) => {
                    self.backend.configure_encoder(output.target_id, params)?;
                    StageRole::Encode {
                        target_id: output.target_id,
                    }
                }
                OutputKind::Raw => StageRole::RawOutput {
                    target_id: output.target_id,
                },
            };
            branches.push(Branch {
                role,
                target_id: output.target_id,
                queue: Arc::new(HandoffQueue::new(
                    format!("{upstream}->{role}"),
                    capacity,
                )),
                sink: output.sink,
            });
        }

        let queues = filter_queue
            .iter()
            .cloned()
            .chain(branches.iter().map(|branch| Arc::clone(&branch.queue)))
            .collect();
        let stop = StopHandle {
            token,
            queues,
            pool: Arc::clone(&pool),
        };
        Ok(Pipeline {
            backend: self.backend,
            config: self.config,
            pool,
            source,
            filter_queue,
            branches,
            stop,
        })
    }
}

struct Branch {
    role: StageRole,
    target_id: u32,
    queue: Arc<HandoffQueue>,
    sink: Box<dyn FrameSink>,
}

pub struct Pipeline {
    backend: Arc<dyn SessionBackend>,
    config: PipelineConfig,
    pool: Arc<ResourcePool>,
    source: Box<dyn BitstreamSource>,
    filter_queue: Option<Arc<HandoffQueue>>,
    branches: Vec<Branch>,
    stop: StopHandle,
}

impl Pipeline {
    #[must_use]
    pub fn builder(backend: Arc<dyn SessionBackend>, config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(backend, config)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn pool(&self) -> Arc<ResourcePool> {
        Arc::clone(&self.pool)
    }

    /// Runs every stage to completion (or until stopped or failed).
    ///
    /// The first fatal stage error is returned; a requested stop is not an
    /// error and is reported through [`PipelineReport::stopped`].
    pub fn run(self) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let Pipeline {
            backend,
            config,
            pool,
            source,
            filter_queue,
            branches,
            stop,
        } = self;
        info!(
            pool_size = pool.len(),
            filter = filter_queue.is_some(),
            outputs = branches.len(),
            "starting pipeline"
        );

        let ctx = Ctx {
            backend: &backend,
            pool: &pool,
            config: &config,
            stop: &stop,
        };
        let branch_targets: Vec<(u32, Arc<HandoffQueue>)> = branches
            .iter()
            .map(|branch| (branch.target_id, Arc::clone(&branch.queue)))
            .collect();
        let decode_targets: Vec<(u32, Arc<HandoffQueue>)> = match &filter_queue {
            Some(queue) => vec![(0, Arc::clone(queue))],
            None => branch_targets.clone(),
        };
        let branch_upstream = if filter_queue.is_some() {
            StageKind::Filter
        } else {
            StageKind::Decode
        };

        let (results, spawn_error) = thread::scope(|scope| {
            let mut handles = Vec::new();
            let mut spawn_error = None;

            let decode_fanout = Fanout::new(ctx, &decode_targets);
            let spawned = spawn_stage(scope, ctx, StageRole::Decode, &mut handles, move || {
                let mut stage = DecodeStage::new(ctx, decode_fanout);
                let result = stage.run(source);
                (stage.report, result)
            });
            if let Err(err) = spawned {
                spawn_error.get_or_insert(err);
            }

            if let Some(queue) = &filter_queue {
                let fanout = Fanout::new(ctx, &branch_targets);
                let spawned = spawn_stage(scope, ctx, StageRole::Filter, &mut handles, move || {
                    let mut stage = FilterStage::new(ctx, fanout);
                    let result = stage.run(queue);
                    (stage.report, result)
                });
                if let Err(err) = spawned {
                    spawn_error.get_or_insert(err);
                }
            }

            for branch in branches {
                let role = branch.role;
                let spawned = spawn_stage(scope, ctx, role, &mut handles, move || {
                    let Branch {
                        role,
                        target_id,
                        queue,
                        sink,
                    } = branch;
                    match role {
                        StageRole::RawOutput { .. } => {
                            let mut stage = RawStage::new(ctx, role, branch_upstream, sink);
                            let result = stage.run(&queue);
                            (stage.report, result)
                        }
                        _ => {
                            let mut stage = EncodeStage::new(ctx, target_id, branch_upstream, sink);
                            let result = stage.run(&queue);
                            stage.report.forced_resyncs = stage.resync.forced_count();
                            (stage.report, result)
                        }
                    }
                });
                if let Err(err) = spawned {
                    spawn_error.get_or_insert(err);
                }
            }

            let results: Vec<(StageReport, Result<(), PipelineError>)> = handles
                .into_iter()
                .map(|(role, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        stop.stop();
                        (
                            StageReport::new(role),
                            Err(PipelineError::Backend(format!("{role} stage thread panicked"))),
                        )
                    })
                })
                .collect();
            (results, spawn_error)
        });

        let mut discarded = 0;
        let mut reset_error = None;
        for queue in &stop.queues {
            match queue.reset() {
                Ok(count) => discarded += count,
                Err(err) => {
                    reset_error.get_or_insert(err);
                }
            }
        }
        if discarded > 0 {
            debug!(discarded, "released frames left in hand-off queues");
        }

        let mut failure = spawn_error;
        let mut stages = Vec::with_capacity(results.len());
        for (report, result) in results {
            if let Err(err) = result {
                if !matches!(err, PipelineError::Stopped) && failure.is_none() {
                    failure = Some(err);
                }
            }
            stages.push(report);
        }
        if let Some(err) = failure.or(reset_error) {
            error!(%err, "pipeline failed");
            return Err(err);
        }

        let report = PipelineReport {
            stages,
            elapsed: started.elapsed(),
            stopped: stop.is_stopped(),
        };
        info!(%report, free_frames = pool.free_count(), "pipeline finished");
        Ok(report)
    }
}

type StageResult = (StageReport, Result<(), PipelineError>);

fn spawn_stage<'scope, F>(
    scope: &'scope thread::Scope<'scope, '_>,
    ctx: Ctx<'scope>,
    role: StageRole,
    handles: &mut Vec<(StageRole, thread::ScopedJoinHandle<'scope, StageResult>)>,
    body: F,
) -> Result<(), PipelineError>
where
    F: FnOnce() -> StageResult + Send + 'scope,
{
    let spawned = thread::Builder::new()
        .name(role.to_string())
        .spawn_scoped(scope, move || {
            let _span = info_span!("stage", %role).entered();
            let _guard = StopOnPanic(ctx.stop);
            debug!("stage started");
            let (report, result) = body();
            match &result {
                Ok(()) => info!(frames = report.frames, "stage finished"),
                Err(PipelineError::Stopped) => info!(frames = report.frames, "stage stopped"),
                Err(err) => {
                    error!(%err, "stage failed");
                    ctx.stop.stop();
                }
            }
            (report, result)
        });
    match spawned {
        Ok(handle) => {
            handles.push((role, handle));
            Ok(())
        }
        Err(err) => {
            ctx.stop.stop();
            Err(PipelineError::Io {
                context: format!("failed to spawn {role} thread"),
                source: err,
            })
        }
    }
}

struct StopOnPanic<'a>(&'a StopHandle);

impl Drop for StopOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.stop();
        }
    }
}

#[derive(Clone, Copy)]
struct Ctx<'a> {
    backend: &'a Arc<dyn SessionBackend>,
    pool: &'a ResourcePool,
    config: &'a PipelineConfig,
    stop: &'a StopHandle,
}

impl Ctx<'_> {
    fn driver(&self, kind: StageKind) -> StageDriver {
        StageDriver::new(kind, Arc::clone(self.backend), self.config.busy_policy)
    }

    fn check_stop(&self) -> Result<(), PipelineError> {
        if self.stop.is_stopped() {
            Err(PipelineError::Stopped)
        } else {
            Ok(())
        }
    }

    fn acquire(&self, stage: StageKind, frame_index: u64) -> Result<FrameResource, PipelineError> {
        self.pool
            .acquire_or_exhausted(self.config.surface_wait)
            .map_err(|err| err.at_stage(stage, frame_index))
    }

    fn pop(&self, queue: &HandoffQueue, upstream: StageKind) -> Result<HandoffEntry, PipelineError> {
        match queue.pop(self.config.upstream_timeout) {
            Ok(entry) => Ok(entry),
            Err(QueueRecvError::Closed) => Ok(HandoffEntry::end_of_stream()),
            Err(QueueRecvError::Cancelled) => Err(PipelineError::Stopped),
            Err(QueueRecvError::Timeout | QueueRecvError::Empty) => {
                Err(PipelineError::UpstreamTimeout {
                    stage: upstream,
                    waited: self.config.upstream_timeout,
                })
            }
        }
    }

    /// Swallows a device hang when soft recovery is on; anything else is
    /// returned as a stage failure.
    fn recover(
        &self,
        err: PipelineError,
        stage: StageKind,
        frame_index: u64,
        report: &mut StageReport,
    ) -> Result<(), PipelineError> {
        if err.is_device_hang() && self.config.soft_hang_recovery {
            warn!(%stage, frame_index, "recovering from device hang");
            report.recovered_hangs += 1;
            return Ok(());
        }
        Err(err.at_stage(stage, frame_index))
    }
}

/// Delivers one producer's output to every downstream queue.
struct Fanout<'a> {
    ctx: Ctx<'a>,
    targets: &'a [(u32, Arc<HandoffQueue>)],
}

impl<'a> Fanout<'a> {
    fn new(ctx: Ctx<'a>, targets: &'a [(u32, Arc<HandoffQueue>)]) -> Self {
        Self { ctx, targets }
    }

    /// Consumes the producer's reference on `output`. With more than one
    /// consumer the token is synchronized here, since it can only be
    /// synchronized once.
    fn deliver(
        &self,
        driver: &mut StageDriver,
        output: FrameResource,
        token: CompletionToken,
        frame_index: u64,
        resync: bool,
    ) -> Result<(), PipelineError> {
        let result = self.push_all(driver, &output, token, frame_index, resync);
        let released = output.release();
        result.and(released)
    }

    fn push_all(
        &self,
        driver: &mut StageDriver,
        output: &FrameResource,
        token: CompletionToken,
        frame_index: u64,
        resync: bool,
    ) -> Result<(), PipelineError> {
        let mut token = if self.targets.len() > 1 {
            driver.synchronize(token, self.ctx.config.sync_timeout)?;
            None
        } else {
            Some(token)
        };
        let ctrl = resync.then(keyframe_ctrl);
        for (target_id, queue) in self.targets {
            let encode_ctrl = ctrl.as_ref().map(EncodeCtrlExt::try_clone).transpose()?;
            let entry = HandoffEntry::frame(
                output.clone(),
                token.take(),
                EntryMeta {
                    target_id: *target_id,
                    frame_index,
                    encode_ctrl,
                },
            );
            self.push(queue, entry)?;
        }
        Ok(())
    }

    fn push(&self, queue: &HandoffQueue, entry: HandoffEntry) -> Result<(), PipelineError> {
        match queue.push_timeout(entry, self.ctx.config.upstream_timeout) {
            Ok(()) => Ok(()),
            Err(_) if self.ctx.stop.is_stopped() => Err(PipelineError::Stopped),
            Err(err) => Err(err.into()),
        }
    }

    fn finish(&self) -> Result<(), PipelineError> {
        for (_, queue) in self.targets {
            self.push(queue, HandoffEntry::end_of_stream())?;
        }
        Ok(())
    }
}

struct DecodeStage<'a> {
    ctx: Ctx<'a>,
    driver: StageDriver,
    fanout: Fanout<'a>,
    report: StageReport,
    resync_next: bool,
}

impl<'a> DecodeStage<'a> {
    fn new(ctx: Ctx<'a>, fanout: Fanout<'a>) -> Self {
        Self {
            ctx,
            driver: ctx.driver(StageKind::Decode),
            fanout,
            report: StageReport::new(StageRole::Decode),
            resync_next: false,
        }
    }

    fn run(&mut self, mut source: Box<dyn BitstreamSource>) -> Result<(), PipelineError> {
        let mut bitstream = BitstreamBuffer::with_capacity(DEFAULT_CHUNK_SIZE);
        let mut input_done = false;
        let mut draining = false;
        loop {
            self.ctx.check_stop()?;
            let emitted = self.report.frames;
            let limit_hit = self
                .ctx
                .config
                .max_frames
                .is_some_and(|limit| emitted >= limit);
            if limit_hit && !draining {
                debug!(emitted, "frame limit reached, draining decoder");
                draining = true;
            }

            let work = self.ctx.acquire(StageKind::Decode, emitted)?;
            let before = bitstream.len();
            let outcome = if draining {
                self.driver.submit_decode(None, &work)
            } else {
                self.driver.submit_decode(Some(&mut bitstream), &work)
            };
            work.release()?;
            self.report.busy = self.driver.stats();

            match outcome.map_err(|err| err.at_stage(StageKind::Decode, emitted))? {
                StageOutcome::Complete { token, output }
                | StageOutcome::MoreOutputPending { token, output } => {
                    if limit_hit {
                        self.discard(output, token)?;
                    } else {
                        self.deliver(output, token, emitted)?;
                    }
                }
                StageOutcome::MoreDataNeeded if draining => break,
                StageOutcome::MoreDataNeeded if input_done => {
                    if bitstream.len() == before {
                        if !bitstream.is_empty() {
                            warn!(bytes = bitstream.len(), "dropping trailing partial frame");
                        }
                        draining = true;
                    }
                }
                StageOutcome::MoreDataNeeded => {
                    match source
                        .read_chunk()
                        .map_err(|err| err.at_stage(StageKind::Decode, emitted))?
                    {
                        Some(chunk) => bitstream.append(&chunk),
                        None => {
                            debug!("end of input");
                            input_done = true;
                        }
                    }
                }
                StageOutcome::DeviceHang => {
                    self.ctx.recover(
                        PipelineError::DeviceHang {
                            stage: StageKind::Decode,
                        },
                        StageKind::Decode,
                        emitted,
                        &mut self.report,
                    )?;
                    self.resync_next = true;
                }
            }
        }
        self.fanout.finish()
    }

    fn deliver(
        &mut self,
        output: FrameResource,
        token: CompletionToken,
        frame_index: u64,
    ) -> Result<(), PipelineError> {
        match self
            .fanout
            .deliver(&mut self.driver, output, token, frame_index, self.resync_next)
        {
            Ok(()) => {
                self.resync_next = false;
                self.report.frames += 1;
                Ok(())
            }
            Err(err) => {
                self.ctx
                    .recover(err, StageKind::Decode, frame_index, &mut self.report)?;
                self.resync_next = true;
                Ok(())
            }
        }
    }

    fn discard(&mut self, output: FrameResource, token: CompletionToken) -> Result<(), PipelineError> {
        if let Err(err) = self.driver.synchronize(token, self.ctx.config.sync_timeout) {
            debug!(%err, "frame past the limit failed to synchronize");
        }
        self.report.discarded += 1;
        output.release()
    }
}

struct FilterStage<'a> {
    ctx: Ctx<'a>,
    driver: StageDriver,
    fanout: Fanout<'a>,
    report: StageReport,
    resync_next: bool,
}

impl<'a> FilterStage<'a> {
    fn new(ctx: Ctx<'a>, fanout: Fanout<'a>) -> Self {
        Self {
            ctx,
            driver: ctx.driver(StageKind::Filter),
            fanout,
            report: StageReport::new(StageRole::Filter),
            resync_next: false,
        }
    }

    fn run(&mut self, input: &HandoffQueue) -> Result<(), PipelineError> {
        loop {
            self.ctx.check_stop()?;
            let HandoffEntry {
                resource: Some(frame),
                token,
                meta,
            } = self.ctx.pop(input, StageKind::Decode)?
            else {
                break;
            };
            if meta
                .encode_ctrl
                .as_ref()
                .is_some_and(|ctrl| ctrl.forces_keyframe())
            {
                self.resync_next = true;
            }
            let result = self.filter_frame(&frame, token);
            input.release(&frame)?;
            self.report.busy = self.driver.stats();
            if let Err(err) = result {
                self.ctx
                    .recover(err, StageKind::Filter, meta.frame_index, &mut self.report)?;
                self.resync_next = true;
            }
        }

        loop {
            self.ctx.check_stop()?;
            let index = self.report.frames;
            let work = self.ctx.acquire(StageKind::Filter, index)?;
            let outcome = self.driver.submit_filter(None, &work);
            work.release()?;
            match outcome.map_err(|err| err.at_stage(StageKind::Filter, index))? {
                StageOutcome::Complete { token, output }
                | StageOutcome::MoreOutputPending { token, output } => {
                    if let Err(err) = self.deliver(output, token) {
                        self.ctx
                            .recover(err, StageKind::Filter, index, &mut self.report)?;
                    }
                }
                StageOutcome::MoreDataNeeded => break,
                StageOutcome::DeviceHang => {
                    self.ctx.recover(
                        PipelineError::DeviceHang {
                            stage: StageKind::Filter,
                        },
                        StageKind::Filter,
                        index,
                        &mut self.report,
                    )?;
                    break;
                }
            }
        }
        self.fanout.finish()
    }

    /// Runs one input through the filter, resubmitting it while the filter
    /// has more output for it.
    fn filter_frame(
        &mut self,
        frame: &FrameResource,
        token: Option<CompletionToken>,
    ) -> Result<(), PipelineError> {
        if let Some(token) = token {
            self.driver.synchronize(token, self.ctx.config.sync_timeout)?;
        }
        loop {
            let work = self.ctx.acquire(StageKind::Filter, self.report.frames)?;
            let outcome = self.driver.submit_filter(Some(frame), &work);
            work.release()?;
            match outcome? {
                StageOutcome::Complete { token, output } => return self.deliver(output, token),
                StageOutcome::MoreOutputPending { token, output } => self.deliver(output, token)?,
                StageOutcome::MoreDataNeeded => return Ok(()),
                StageOutcome::DeviceHang => {
                    return Err(PipelineError::DeviceHang {
                        stage: StageKind::Filter,
                    });
                }
            }
        }
    }

    fn deliver(&mut self, output: FrameResource, token: CompletionToken) -> Result<(), PipelineError> {
        let index = self.report.frames;
        self.fanout
            .deliver(&mut self.driver, output, token, index, self.resync_next)?;
        self.resync_next = false;
        self.report.frames += 1;
        Ok(())
    }
}

struct PendingOutput {
    token: CompletionToken,
    slot: BitstreamSlot,
    frame_index: u64,
    /// Leading part of a packet whose remainder comes from a resubmission.
    partial: bool,
}

/// What one encoder submission produced.
enum EncodeProgress {
    NeedData,
    Output,
    /// Part of a packet was produced; the same input must be submitted
    /// again to collect the rest.
    MoreOutput,
}

struct EncodeStage<'a> {
    ctx: Ctx<'a>,
    target_id: u32,
    upstream: StageKind,
    driver: StageDriver,
    store: BitstreamStore,
    pending: VecDeque<PendingOutput>,
    resync: ResyncTracker,
    sink: Box<dyn FrameSink>,
    report: StageReport,
}

impl<'a> EncodeStage<'a> {
    fn new(ctx: Ctx<'a>, target_id: u32, upstream: StageKind, sink: Box<dyn FrameSink>) -> Self {
        Self {
            ctx,
            target_id,
            upstream,
            driver: ctx.driver(StageKind::Encode),
            store: BitstreamStore::new(ctx.config.async_depth, ctx.config.output_buffer_size),
            pending: VecDeque::with_capacity(ctx.config.async_depth),
            resync: ResyncTracker::new(ctx.config.reset_interval),
            sink,
            report: StageReport::new(StageRole::Encode { target_id }),
        }
    }

    fn run(&mut self, input: &HandoffQueue) -> Result<(), PipelineError> {
        loop {
            self.ctx.check_stop()?;
            let HandoffEntry {
                resource: Some(frame),
                token,
                mut meta,
            } = self.ctx.pop(input, self.upstream)?
            else {
                break;
            };
            let result = self.encode_frame(&frame, token, meta.encode_ctrl.take(), meta.frame_index);
            input.release(&frame)?;
            self.report.busy = self.driver.stats();
            if let Err(err) = result {
                self.recover(err, meta.frame_index)?;
            }
        }

        loop {
            self.ctx.check_stop()?;
            let index = self.report.frames + self.pending.len() as u64;
            match self.submit(None, None, index) {
                Ok(EncodeProgress::Output | EncodeProgress::MoreOutput) => {}
                Ok(EncodeProgress::NeedData) => break,
                Err(err) => {
                    self.recover(err, index)?;
                    break;
                }
            }
        }
        while let Some(oldest) = self.pending.front() {
            let index = oldest.frame_index;
            if let Err(err) = self.write_oldest() {
                self.recover(err, index)?;
            }
        }
        self.sink
            .finish()
            .map_err(|err| err.at_stage(StageKind::Encode, self.report.frames))
    }

    fn encode_frame(
        &mut self,
        frame: &FrameResource,
        token: Option<CompletionToken>,
        ctrl: Option<EncodeCtrlExt>,
        frame_index: u64,
    ) -> Result<(), PipelineError> {
        if let Some(token) = token {
            self.driver.synchronize(token, self.ctx.config.sync_timeout)?;
        }
        let upstream_resync = ctrl.as_ref().is_some_and(|ctrl| ctrl.forces_keyframe());
        let mut ctrl = ctrl;
        if self.resync.next_frame(upstream_resync) {
            debug!(target_id = self.target_id, frame_index, "forcing keyframe");
            ctrl.get_or_insert_with(keyframe_ctrl).frame_type = FrameType::Idr;
        }
        while let EncodeProgress::MoreOutput =
            self.submit(Some(frame), ctrl.as_ref(), frame_index)?
        {
            trace!(target_id = self.target_id, frame_index, "resubmitting for remaining output");
        }
        Ok(())
    }

    fn submit(
        &mut self,
        frame: Option<&FrameResource>,
        ctrl: Option<&EncodeCtrlExt>,
        frame_index: u64,
    ) -> Result<EncodeProgress, PipelineError> {
        let slot = self.next_slot()?;
        match self.driver.submit_encode(self.target_id, ctrl, frame, &slot) {
            Ok(StageOutcome::Complete { token, .. }) => {
                self.pending.push_back(PendingOutput {
                    token,
                    slot,
                    frame_index,
                    partial: false,
                });
                Ok(EncodeProgress::Output)
            }
            Ok(StageOutcome::MoreOutputPending { token, .. }) => {
                self.pending.push_back(PendingOutput {
                    token,
                    slot,
                    frame_index,
                    partial: true,
                });
                Ok(EncodeProgress::MoreOutput)
            }
            Ok(StageOutcome::MoreDataNeeded) => {
                self.store.release(&slot);
                Ok(EncodeProgress::NeedData)
            }
            Ok(StageOutcome::DeviceHang) => {
                self.store.release(&slot);
                Err(PipelineError::DeviceHang {
                    stage: StageKind::Encode,
                })
            }
            Err(err) => {
                self.store.release(&slot);
                Err(err)
            }
        }
    }

    fn next_slot(&mut self) -> Result<BitstreamSlot, PipelineError> {
        loop {
            if let Some(slot) = self.store.acquire() {
                return Ok(slot);
            }
            if self.pending.is_empty() {
                return Err(PipelineError::Backend(
                    "no free encoder output buffer".to_string(),
                ));
            }
            self.write_oldest()?;
        }
    }

    fn write_oldest(&mut self) -> Result<(), PipelineError> {
        let Some(PendingOutput {
            token,
            slot,
            partial,
            ..
        }) = self.pending.pop_front()
        else {
            return Ok(());
        };
        let written = self
            .driver
            .synchronize(token, self.ctx.config.sync_timeout)
            .and_then(|()| {
                let buffer = slot.lock();
                let keyframe = buffer.keyframe;
                self.sink.write_output(buffer.remaining()).map(|()| keyframe)
            });
        self.store.release(&slot);
        if written? {
            self.report.keyframes += 1;
        }
        if !partial {
            self.report.frames += 1;
        }
        Ok(())
    }

    /// After a recovered hang the next frame is encoded as a keyframe. A hang
    /// of the encoder itself also drops every in-flight output.
    fn recover(&mut self, err: PipelineError, frame_index: u64) -> Result<(), PipelineError> {
        let encoder_hang = matches!(
            err,
            PipelineError::DeviceHang {
                stage: StageKind::Encode
            }
        );
        self.ctx
            .recover(err, StageKind::Encode, frame_index, &mut self.report)?;
        if encoder_hang {
            self.report.discarded += self.pending.len() as u64;
            self.pending.clear();
            self.store.release_all();
        }
        self.resync.on_hang();
        Ok(())
    }
}

struct RawStage<'a> {
    ctx: Ctx<'a>,
    upstream: StageKind,
    driver: StageDriver,
    sink: Box<dyn FrameSink>,
    report: StageReport,
}

impl<'a> RawStage<'a> {
    fn new(ctx: Ctx<'a>, role: StageRole, upstream: StageKind, sink: Box<dyn FrameSink>) -> Self {
        Self {
            ctx,
            upstream,
            driver: ctx.driver(upstream),
            sink,
            report: StageReport::new(role),
        }
    }

    fn run(&mut self, input: &HandoffQueue) -> Result<(), PipelineError> {
        loop {
            self.ctx.check_stop()?;
            let HandoffEntry {
                resource: Some(frame),
                token,
                meta,
            } = self.ctx.pop(input, self.upstream)?
            else {
                break;
            };
            let result = self.write_frame(&frame, token);
            input.release(&frame)?;
            if let Err(err) = result {
                self.ctx
                    .recover(err, self.upstream, meta.frame_index, &mut self.report)?;
            }
        }
        self.sink
            .finish()
            .map_err(|err| err.at_stage(self.upstream, self.report.frames))
    }

    fn write_frame(
        &mut self,
        frame: &FrameResource,
        token: Option<CompletionToken>,
    ) -> Result<(), PipelineError> {
        if let Some(token) = token {
            self.driver.synchronize(token, self.ctx.config.sync_timeout)?;
        }
        let data = self.ctx.backend.read_frame(frame)?;
        self.sink.write_output(&data)?;
        self.report.frames += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemorySink, MemorySource};
    use crate::sim_backend::{SimBackend, SimConfig, SimPacket, frame_stream};

    fn backend() -> Arc<dyn SessionBackend> {
        Arc::new(SimBackend::new(SimConfig::default()))
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            pool_size: 4,
            geometry: FrameGeometry::new(Dimensions::new(16, 16).unwrap(), PixelFormat::Nv12),
            surface_wait: Duration::from_secs(2),
            upstream_timeout: Duration::from_secs(5),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn config_validation_rejects_zero_sizes() {
        let mut config = small_config();
        config.validate().unwrap();
        config.async_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
        let config = PipelineConfig {
            queue_capacity: Some(0),
            ..small_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_requires_source_and_unique_outputs() {
        let missing_source = Pipeline::builder(backend(), small_config())
            .raw_output(1, MemorySink::new())
            .build();
        assert!(matches!(missing_source, Err(PipelineError::InvalidConfig(_))));

        let duplicate = Pipeline::builder(backend(), small_config())
            .source(MemorySource::new(&[], 16))
            .raw_output(1, MemorySink::new())
            .raw_output(1, MemorySink::new())
            .build();
        assert!(matches!(duplicate, Err(PipelineError::InvalidConfig(_))));

        let no_outputs = Pipeline::builder(backend(), small_config())
            .source(MemorySource::new(&[], 16))
            .build();
        assert!(no_outputs.is_err());
    }

    #[test]
    fn empty_input_finishes_cleanly() {
        let sink = MemorySink::new();
        let pipeline = Pipeline::builder(backend(), small_config())
            .source(MemorySource::new(&[], 16))
            .encode_output(1, &VideoParamsExt::default(), sink.clone())
            .unwrap()
            .build()
            .unwrap();
        let pool = pipeline.pool();
        let report = pipeline.run().unwrap();
        assert!(!report.stopped);
        assert_eq!(report.output(1).unwrap().frames, 0);
        assert!(sink.contents().is_empty());
        assert_eq!(pool.free_count(), pool.len());
    }

    #[test]
    fn raw_output_sees_decoded_payloads_in_order() {
        let stream = frame_stream([b"f0", b"f1", b"f2"]);
        let sink = MemorySink::new();
        let report = Pipeline::builder(backend(), small_config())
            .source(MemorySource::new(&stream, 3))
            .raw_output(9, sink.clone())
            .build()
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(sink.contents(), b"f0f1f2");
        assert_eq!(report.stage(StageRole::Decode).unwrap().frames, 3);
        assert_eq!(report.output(9).unwrap().frames, 3);
    }

    #[test]
    fn stop_before_run_is_not_an_error() {
        let stream = frame_stream((0..50u8).map(|i| vec![i; 8]));
        let pipeline = Pipeline::builder(backend(), small_config())
            .source(MemorySource::new(&stream, 7))
            .raw_output(1, MemorySink::new())
            .build()
            .unwrap();
        pipeline.stop_handle().stop();
        let report = pipeline.run().unwrap();
        assert!(report.stopped);
    }

    #[test]
    fn encoder_split_output_is_collected_per_frame() {
        let backend = Arc::new(SimBackend::new(SimConfig {
            encode_splits: true,
            encode_delay: 1,
            ..SimConfig::default()
        }));
        let stream = frame_stream((0..5u8).map(|i| vec![i; 12]));
        let sink = MemorySink::new();
        let mut params = VideoParamsExt::default();
        params.gop_size = 2;
        let report = Pipeline::builder(backend.clone(), small_config())
            .source(MemorySource::new(&stream, 11))
            .encode_output(0, &params, sink.clone())
            .unwrap()
            .build()
            .unwrap()
            .run()
            .unwrap();

        let packets = SimPacket::parse_all(&sink.contents()).unwrap();
        let orders: Vec<u64> = packets.iter().map(|packet| packet.frame_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
        let encode = report.output(0).unwrap();
        assert_eq!(encode.frames, 5);
        assert_eq!(encode.keyframes, 3);
        assert_eq!(backend.outstanding_ops(), 0);
    }

    #[test]
    fn unbounded_timeouts_run_to_completion() {
        let config = PipelineConfig {
            surface_wait: Duration::MAX,
            upstream_timeout: Duration::MAX,
            sync_timeout: Duration::MAX,
            busy_policy: BusyPolicy {
                busy_timeout: Duration::MAX,
                ..BusyPolicy::default()
            },
            queue_capacity: Some(1),
            ..small_config()
        };
        let stream = frame_stream((0..6u8).map(|i| vec![i; 4]));
        let sink = MemorySink::new();
        let report = Pipeline::builder(backend(), config)
            .source(MemorySource::new(&stream, 5))
            .raw_output(2, sink.clone())
            .build()
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(report.output(2).unwrap().frames, 6);
        assert_eq!(sink.contents().len(), 24);
    }

    #[test]
    fn session_is_initialized_before_allocation() {
        let backend = Arc::new(SimBackend::new(SimConfig::default()));
        Pipeline::builder(backend.clone(), small_config())
            .source(MemorySource::new(&[], 16))
            .raw_output(1, MemorySink::new())
            .build()
            .unwrap();
        let init = backend.session_init().unwrap();
        assert_eq!(init.async_depth, 4);
        assert!(!init.gpu_copy);

        let backend = Arc::new(SimBackend::new(SimConfig::default()));
        let mut params = InitParamsExt::default();
        params.async_depth = 2;
        params.num_threads = 3;
        Pipeline::builder(backend.clone(), small_config())
            .init_params(&params)
            .unwrap()
            .source(MemorySource::new(&[], 16))
            .raw_output(1, MemorySink::new())
            .build()
            .unwrap();
        assert_eq!(backend.session_init(), Some(params.base().clone()));

        let rejected = Pipeline::builder(backend, small_config())
            .init_params(&InitParamsExt::default())
            .unwrap()
            .source(MemorySource::new(&[], 16))
            .raw_output(1, MemorySink::new())
            .build();
        assert!(matches!(rejected, Err(PipelineError::InvalidConfig(_))));
    }
}

//! Orchestration core for hardware media pipelines.
//!
//! Frames come from a shared [`ResourcePool`], move between stages through
//! reference-counted [`HandoffQueue`]s, and are produced by a
//! [`SessionBackend`] behind busy-retrying [`StageDriver`]s. A [`Pipeline`]
//! runs decode, an optional filter, and any number of output branches on
//! their own threads.

mod bitstream;
mod contract;
mod coordinator;
mod ext_params;
mod io;
mod params;
mod pipeline;
mod pool;
mod sim_backend;
mod stage;

pub use bitstream::{BitstreamBuffer, BitstreamSlot, BitstreamStore};
pub use contract::{
    BitstreamSource, CapabilityReport, Codec, CompletionToken, Dimensions, ErrorClass,
    FrameGeometry, FrameHandle, FrameSink, PipelineError, PixelFormat, SessionBackend, StageKind,
    SubmitStatus, SyncStatus, Timestamp90k,
};
pub use coordinator::{
    Pipeline, PipelineBuilder, PipelineConfig, PipelineReport, StageReport, StageRole, StopHandle,
};
pub use ext_params::{BlockKind, ExtBlock, ExtParams, ExtensionBlock, ParamError};
pub use io::{DEFAULT_CHUNK_SIZE, FileSink, FileSource, MemorySink, MemorySource, NullSink};
pub use params::{
    AllocationHints, Av1BitstreamParam, Av1ResolutionParam, Av1TileParam, AvcRefListCtrl,
    AvcRoundingOffset, BitrateControl, BitstreamExt, COPY_ALLOWED_KINDS, CodingOption,
    CodingOption2, CodingOption3, DecVideoProcessing, EncodeControl, EncodeCtrlExt,
    EncodedFrameInfo, EncoderRoi, FrameType, HevcParam, InitParams, InitParamsExt, PAIRED_KINDS,
    PredWeightTable, RoiRegion, VideoParams, VideoParamsExt, Vp9Param, is_copy_allowed, is_paired,
    keyframe_ctrl,
};
pub use pipeline::{
    EntryMeta, HandoffEntry, HandoffQueue, QueueRecvError, QueueSendError, QueueState, QueueStats,
};
pub use pool::{FrameMeta, FrameResource, ResourcePool};
pub use sim_backend::{BusyFault, FaultPlan, SimBackend, SimConfig, SimPacket, frame_stream};
pub use stage::{BusyPolicy, BusyStats, ResyncTracker, StageDriver, StageOutcome};

use std::num::NonZeroU32;
use std::time::Duration;
use std::{fmt, fmt::Display};

use crate::bitstream::{BitstreamBuffer, BitstreamSlot};
use crate::params::{EncodeCtrlExt, InitParamsExt, VideoParamsExt};
use crate::pool::FrameResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Hevc,
    Av1,
}

impl Codec {
    pub(crate) fn wire_id(self) -> u8 {
        match self {
            Self::H264 => 1,
            Self::Hevc => 2,
            Self::Av1 => 3,
        }
    }

    pub(crate) fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::H264),
            2 => Some(Self::Hevc),
            3 => Some(Self::Av1),
            _ => None,
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::Hevc => f.write_str("hevc"),
            Self::Av1 => f.write_str("av1"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp90k(pub i64);

impl Display for Timestamp90k {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@90k", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Nv12,
    I420,
    P010,
    Yuy2,
    Rgb4,
}

impl PixelFormat {
    /// Bytes needed for one tightly packed frame of `dims`.
    pub fn frame_size(self, dims: Dimensions) -> usize {
        let w = dims.width.get() as usize;
        let h = dims.height.get() as usize;
        match self {
            Self::Nv12 | Self::I420 => w * h + w * h / 2,
            Self::P010 => (w * h + w * h / 2) * 2,
            Self::Yuy2 => w * h * 2,
            Self::Rgb4 => w * h * 4,
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nv12 => f.write_str("nv12"),
            Self::I420 => f.write_str("i420"),
            Self::P010 => f.write_str("p010"),
            Self::Yuy2 => f.write_str("yuy2"),
            Self::Rgb4 => f.write_str("rgb4"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub dims: Dimensions,
    pub format: PixelFormat,
}

impl FrameGeometry {
    #[must_use]
    pub fn new(dims: Dimensions, format: PixelFormat) -> Self {
        Self { dims, format }
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.dims)
    }
}

impl Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dims, self.format)
    }
}

/// Opaque backend surface identifier. This layer never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Decode,
    Filter,
    Encode,
}

impl Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => f.write_str("decode"),
            Self::Filter => f.write_str("filter"),
            Self::Encode => f.write_str("encode"),
        }
    }
}

/// Handle to one in-flight asynchronous backend operation.
///
/// Not `Clone`. `StageDriver::synchronize` takes it by value, so a token is
/// synchronized at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct CompletionToken {
    id: u64,
    stage: StageKind,
}

impl CompletionToken {
    #[must_use]
    pub fn new(stage: StageKind, id: u64) -> Self {
        Self { id, stage }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }
}

impl Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stage, self.id)
    }
}

/// Raw result of one backend submit call.
#[derive(Debug)]
pub enum SubmitStatus<O> {
    Complete { token: CompletionToken, output: O },
    MoreDataNeeded,
    MoreOutputPending { token: CompletionToken, output: O },
    DeviceBusy,
    DeviceHang,
    NotEnoughBuffer { required: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Ready,
    TimedOut,
    Aborted,
    DeviceHang,
    UnknownToken,
}

#[derive(Debug, Clone)]
pub struct CapabilityReport {
    pub decode_codecs: Vec<Codec>,
    pub encode_codecs: Vec<Codec>,
    pub filter_supported: bool,
    pub hardware_acceleration: bool,
    pub max_frames: usize,
}

impl CapabilityReport {
    pub fn supports_decode(&self, codec: Codec) -> bool {
        self.decode_codecs.contains(&codec)
    }

    pub fn supports_encode(&self, codec: Codec) -> bool {
        self.encode_codecs.contains(&codec)
    }
}

impl Display for CapabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapabilityReport(decode={:?}, encode={:?}, filter={}, hardware_acceleration={}, max_frames={})",
            self.decode_codecs,
            self.encode_codecs,
            self.filter_supported,
            self.hardware_acceleration,
            self.max_frames
        )
    }
}

/// How a failure should be treated by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Recoverable,
    Fatal,
    ProgrammingError,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("resource exhausted: requested {requested} frames, backend provided {available}")]
    ResourceExhausted { requested: usize, available: usize },
    #[error("no free frame in pool after {waited:?}")]
    PoolExhausted { waited: Duration },
    #[error("frame {handle:?} released more times than it was locked")]
    DoubleRelease { handle: FrameHandle },
    #[error("{stage} device busy for {busy_for:?}, giving up")]
    DeviceFailed { stage: StageKind, busy_for: Duration },
    #[error("{stage} device hang")]
    DeviceHang { stage: StageKind },
    #[error("{stage} synchronize timed out after {timeout:?}")]
    SyncTimedOut { stage: StageKind, timeout: Duration },
    #[error("{stage} operation aborted")]
    Aborted { stage: StageKind },
    #[error("unknown or already consumed completion token {0}")]
    UnknownToken(String),
    #[error("timed out after {waited:?} waiting for upstream {stage}")]
    UpstreamTimeout { stage: StageKind, waited: Duration },
    #[error("invalid hand-off entry: {0}")]
    InvalidEntry(String),
    #[error("invalid bitstream: {0}")]
    InvalidBitstream(String),
    #[error("extension parameters: {0}")]
    Param(#[from] crate::ext_params::ParamError),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backend error: {0}")]
    Backend(String),
    #[error("pipeline stopped")]
    Stopped,
    #[error("{stage} stage failed at frame {frame_index}: {source}")]
    StageFailed {
        stage: StageKind,
        frame_index: u64,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DeviceHang { .. } => ErrorClass::Recoverable,
            Self::DoubleRelease { .. } | Self::UnknownToken(_) => ErrorClass::ProgrammingError,
            Self::StageFailed { source, .. } => source.class(),
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_device_hang(&self) -> bool {
        matches!(self, Self::DeviceHang { .. })
    }

    pub(crate) fn at_stage(self, stage: StageKind, frame_index: u64) -> Self {
        match self {
            already @ Self::StageFailed { .. } => already,
            Self::Stopped => Self::Stopped,
            other => Self::StageFailed {
                stage,
                frame_index,
                source: Box::new(other),
            },
        }
    }
}

/// Native codec backend bound to one session.
///
/// Every call may block the calling stage thread; none of the pipeline's
/// internal locks are held while it runs.
pub trait SessionBackend: Send + Sync {
    /// Called once per pipeline, before capabilities are queried.
    fn init_session(&self, _params: &InitParamsExt) -> Result<(), PipelineError> {
        Ok(())
    }

    fn query_capabilities(&self) -> CapabilityReport;

    fn allocate_frames(
        &self,
        count: usize,
        geometry: FrameGeometry,
    ) -> Result<Vec<FrameHandle>, PipelineError>;

    /// `bitstream == None` drains frames the decoder still buffers.
    fn submit_decode(
        &self,
        bitstream: Option<&mut BitstreamBuffer>,
        work: &FrameResource,
    ) -> Result<SubmitStatus<FrameResource>, PipelineError>;

    fn submit_filter(
        &self,
        _input: Option<&FrameResource>,
        _work: &FrameResource,
    ) -> Result<SubmitStatus<FrameResource>, PipelineError> {
        Err(PipelineError::UnsupportedOperation(
            "filtering is not supported by this backend".to_string(),
        ))
    }

    fn configure_encoder(
        &self,
        _target_id: u32,
        _params: &VideoParamsExt,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// `input == None` drains frames the encoder still buffers.
    fn submit_encode(
        &self,
        _target_id: u32,
        _ctrl: Option<&EncodeCtrlExt>,
        _input: Option<&FrameResource>,
        _output: &BitstreamSlot,
    ) -> Result<SubmitStatus<()>, PipelineError> {
        Err(PipelineError::UnsupportedOperation(
            "encoding is not supported by this backend".to_string(),
        ))
    }

    fn synchronize(&self, token: &CompletionToken, timeout: Duration) -> SyncStatus;

    /// Copies out the contents of a synchronized surface.
    fn read_frame(&self, _frame: &FrameResource) -> Result<Vec<u8>, PipelineError> {
        Err(PipelineError::UnsupportedOperation(
            "frame readback is not supported by this backend".to_string(),
        ))
    }
}

pub trait BitstreamSource: Send {
    /// `Ok(None)` marks end of stream.
    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, PipelineError>;
}

pub trait FrameSink: Send {
    fn write_output(&mut self, data: &[u8]) -> Result<(), PipelineError>;

    fn finish(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

impl<T: BitstreamSource + ?Sized> BitstreamSource for Box<T> {
    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, PipelineError> {
        (**self).read_chunk()
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn write_output(&mut self, data: &[u8]) -> Result<(), PipelineError> {
        (**self).write_output(data)
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        (**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_keeps_inner_class() {
        let err = PipelineError::DeviceHang {
            stage: StageKind::Encode,
        }
        .at_stage(StageKind::Encode, 10);
        assert_eq!(err.class(), ErrorClass::Recoverable);
        assert!(err.to_string().contains("frame 10"));

        let double = PipelineError::DoubleRelease {
            handle: FrameHandle(3),
        };
        assert_eq!(double.class(), ErrorClass::ProgrammingError);
    }

    #[test]
    fn at_stage_does_not_nest() {
        let err = PipelineError::Backend("boom".to_string())
            .at_stage(StageKind::Decode, 1)
            .at_stage(StageKind::Encode, 2);
        assert!(matches!(
            err,
            PipelineError::StageFailed {
                stage: StageKind::Decode,
                frame_index: 1,
                ..
            }
        ));
        assert!(matches!(
            PipelineError::Stopped.at_stage(StageKind::Filter, 0),
            PipelineError::Stopped
        ));
    }

    #[test]
    fn nv12_frame_size_is_one_and_a_half_bytes_per_pixel() {
        let dims = Dimensions::new(64, 36).unwrap();
        assert_eq!(PixelFormat::Nv12.frame_size(dims), 64 * 36 * 3 / 2);
        assert_eq!(PixelFormat::Rgb4.frame_size(dims), 64 * 36 * 4);
        assert!(Dimensions::new(0, 36).is_none());
    }
}

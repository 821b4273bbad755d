//! Deterministic in-process backend.
//!
//! Input streams are sequences of `u32` big-endian length prefixes followed by
//! that many payload bytes; each record is one compressed frame. Encoded
//! output is a sequence of [`SimPacket`]s, each tagged with an
//! [`EncodedFrameInfo`] block on the output buffer. Faults (busy runs, hangs,
//! small allocation caps) are injected through [`FaultPlan`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

use crate::bitstream::{BitstreamBuffer, BitstreamSlot};
use crate::contract::{
    CapabilityReport, Codec, CompletionToken, FrameGeometry, FrameHandle, PipelineError,
    SessionBackend, StageKind, SubmitStatus, SyncStatus, Timestamp90k,
};
use crate::params::{
    EncodeCtrlExt, EncodedFrameInfo, FrameType, InitParams, InitParamsExt, VideoParamsExt,
};
use crate::pool::{FrameMeta, FrameResource};

const PACKET_MAGIC: &[u8; 4] = b"SIMP";
const PACKET_HEADER_LEN: usize = 4 + 1 + 1 + 4 + 8 + 4;
const PTS_STEP_90K: i64 = 3000;
const DEFAULT_QP: u8 = 26;

/// Builds a length-prefixed input stream from individual frame payloads.
pub fn frame_stream<I, P>(frames: I) -> Vec<u8>
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for frame in frames {
        let frame = frame.as_ref();
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimPacket {
    pub codec: Codec,
    pub keyframe: bool,
    pub target_id: u32,
    pub frame_order: u64,
    pub payload: Vec<u8>,
}

impl SimPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        out.extend_from_slice(PACKET_MAGIC);
        out.push(self.codec.wire_id());
        out.push(u8::from(self.keyframe));
        out.extend_from_slice(&self.target_id.to_be_bytes());
        out.extend_from_slice(&self.frame_order.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse_all(mut data: &[u8]) -> Result<Vec<SimPacket>, PipelineError> {
        let mut packets = Vec::new();
        while !data.is_empty() {
            if data.len() < PACKET_HEADER_LEN || &data[..4] != PACKET_MAGIC {
                return Err(PipelineError::InvalidBitstream(format!(
                    "truncated or unknown packet header at packet {}",
                    packets.len()
                )));
            }
            let codec = Codec::from_wire_id(data[4]).ok_or_else(|| {
                PipelineError::InvalidBitstream(format!("unknown codec id {}", data[4]))
            })?;
            let keyframe = data[5] & 1 == 1;
            let target_id = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
            let mut order = [0u8; 8];
            order.copy_from_slice(&data[10..18]);
            let frame_order = u64::from_be_bytes(order);
            let len = u32::from_be_bytes([data[18], data[19], data[20], data[21]]) as usize;
            let end = PACKET_HEADER_LEN + len;
            if data.len() < end {
                return Err(PipelineError::InvalidBitstream(format!(
                    "packet payload truncated: need {len} bytes"
                )));
            }
            packets.push(SimPacket {
                codec,
                keyframe,
                target_id,
                frame_order,
                payload: data[PACKET_HEADER_LEN..end].to_vec(),
            });
            data = &data[end..];
        }
        Ok(packets)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyFault {
    pub stage: StageKind,
    pub frame_order: u64,
    pub count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub busy: Vec<BusyFault>,
    pub hang_on_submit: Vec<(StageKind, u64)>,
    pub hang_on_sync: Vec<(StageKind, u64)>,
}

impl FaultPlan {
    #[must_use]
    pub fn busy(mut self, stage: StageKind, frame_order: u64, count: u32) -> Self {
        self.busy.push(BusyFault {
            stage,
            frame_order,
            count,
        });
        self
    }

    #[must_use]
    pub fn hang_on_submit(mut self, stage: StageKind, frame_order: u64) -> Self {
        self.hang_on_submit.push((stage, frame_order));
        self
    }

    #[must_use]
    pub fn hang_on_sync(mut self, stage: StageKind, frame_order: u64) -> Self {
        self.hang_on_sync.push((stage, frame_order));
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Most frames the device will ever hand out.
    pub max_frames: usize,
    /// Frames the decoder holds back before emitting output.
    pub decode_reorder: usize,
    /// Filter emits two frames per input.
    pub filter_doubles_rate: bool,
    /// Frames each encoder holds back before emitting output.
    pub encode_delay: usize,
    /// Encoders return each packet in two buffers: the first with
    /// `MoreOutputPending`, the rest when the same input is resubmitted.
    pub encode_splits: bool,
    pub faults: FaultPlan,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_frames: 64,
            decode_reorder: 0,
            filter_doubles_rate: false,
            encode_delay: 0,
            encode_splits: false,
            faults: FaultPlan::default(),
        }
    }
}

#[derive(Debug)]
struct PendingOp {
    stage: StageKind,
    frame_order: u64,
}

#[derive(Debug)]
struct EncodedPacket {
    packet: SimPacket,
    qp: u8,
}

/// Second half of a split packet, owed to the submission that repeats
/// `input` (`None` while draining).
#[derive(Debug)]
struct SplitTail {
    input: Option<u64>,
    frame_order: u64,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct EncoderState {
    codec: Codec,
    gop_size: u16,
    encoded: u64,
    delayed: VecDeque<EncodedPacket>,
    split_tail: Option<SplitTail>,
}

#[derive(Debug, Default)]
struct SimState {
    init: Option<InitParams>,
    surfaces: HashMap<FrameHandle, Vec<u8>>,
    allocated: usize,
    next_token: u64,
    ops: HashMap<u64, PendingOp>,
    decoded: u64,
    reorder: VecDeque<FrameResource>,
    filter_second_pending: Option<u64>,
    encoders: HashMap<u32, EncoderState>,
    busy_left: HashMap<(StageKind, u64), u32>,
    hang_on_submit: HashSet<(StageKind, u64)>,
    hang_on_sync: HashSet<(StageKind, u64)>,
}

impl SimState {
    fn issue(&mut self, stage: StageKind, frame_order: u64) -> CompletionToken {
        self.next_token += 1;
        self.ops.insert(self.next_token, PendingOp { stage, frame_order });
        CompletionToken::new(stage, self.next_token)
    }

    fn take_busy(&mut self, stage: StageKind, frame_order: u64) -> bool {
        match self.busy_left.get_mut(&(stage, frame_order)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_hang(&mut self, stage: StageKind, frame_order: u64) -> bool {
        self.hang_on_submit.remove(&(stage, frame_order))
    }

    fn surface(&self, frame: &FrameResource) -> Result<&Vec<u8>, PipelineError> {
        self.surfaces.get(&frame.handle()).ok_or_else(|| {
            PipelineError::Backend(format!("frame {:?} was not allocated here", frame.handle()))
        })
    }

    fn encoder(&mut self, target_id: u32) -> Result<&mut EncoderState, PipelineError> {
        self.encoders.get_mut(&target_id).ok_or_else(|| {
            PipelineError::Backend(format!("encoder {target_id} is not configured"))
        })
    }
}

pub struct SimBackend {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimBackend {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let mut state = SimState::default();
        for fault in &config.faults.busy {
            state
                .busy_left
                .insert((fault.stage, fault.frame_order), fault.count);
        }
        state.hang_on_submit = config.faults.hang_on_submit.iter().copied().collect();
        state.hang_on_sync = config.faults.hang_on_sync.iter().copied().collect();
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Operations issued but never synchronized.
    pub fn outstanding_ops(&self) -> usize {
        self.lock().ops.len()
    }

    /// Session parameters received at initialization.
    pub fn session_init(&self) -> Option<InitParams> {
        self.lock().init.clone()
    }

    /// Writes `encoded` into `output`, or only its first half when splits are
    /// enabled.
    fn emit_encoded(
        &self,
        state: &mut SimState,
        target_id: u32,
        input: Option<u64>,
        encoded: EncodedPacket,
        output: &BitstreamSlot,
    ) -> Result<SubmitStatus<()>, PipelineError> {
        let EncodedPacket { packet, qp } = encoded;
        let mut bytes = packet.to_bytes();
        let tail = if self.config.encode_splits {
            bytes.split_off(bytes.len() / 2)
        } else {
            Vec::new()
        };
        {
            let mut buffer = output.lock();
            buffer.set_payload(&bytes);
            buffer.keyframe = packet.keyframe;
            buffer.frame_order = Some(packet.frame_order);
            buffer.pts_90k = Some(Timestamp90k(packet.frame_order as i64 * PTS_STEP_90K));
            *buffer.add_block::<EncodedFrameInfo>()? = EncodedFrameInfo {
                frame_type: if packet.keyframe {
                    FrameType::Idr
                } else {
                    FrameType::P
                },
                qp: Some(qp),
            };
        }
        let token = state.issue(StageKind::Encode, packet.frame_order);
        if tail.is_empty() {
            return Ok(SubmitStatus::Complete { token, output: () });
        }
        state.encoder(target_id)?.split_tail = Some(SplitTail {
            input,
            frame_order: packet.frame_order,
            bytes: tail,
        });
        Ok(SubmitStatus::MoreOutputPending { token, output: () })
    }

    fn emit_tail(
        state: &mut SimState,
        target_id: u32,
        input: Option<u64>,
        output: &BitstreamSlot,
    ) -> Result<SubmitStatus<()>, PipelineError> {
        let encoder = state.encoder(target_id)?;
        let Some(tail) = encoder.split_tail.take() else {
            return Ok(SubmitStatus::MoreDataNeeded);
        };
        if tail.input != input {
            let expected = tail.input;
            encoder.split_tail = Some(tail);
            return Err(PipelineError::Backend(format!(
                "encoder {target_id} still owes output for input {expected:?}, got {input:?}"
            )));
        }
        if tail.bytes.len() > output.capacity() {
            let required = tail.bytes.len();
            encoder.split_tail = Some(tail);
            return Ok(SubmitStatus::NotEnoughBuffer { required });
        }
        {
            let mut buffer = output.lock();
            buffer.set_payload(&tail.bytes);
            buffer.frame_order = Some(tail.frame_order);
        }
        let token = state.issue(StageKind::Encode, tail.frame_order);
        Ok(SubmitStatus::Complete { token, output: () })
    }

    fn decode_one(
        &self,
        state: &mut SimState,
        bitstream: &mut BitstreamBuffer,
        work: &FrameResource,
    ) -> Result<SubmitStatus<FrameResource>, PipelineError> {
        let data = bitstream.remaining();
        if data.len() < 4 {
            return Ok(SubmitStatus::MoreDataNeeded);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Ok(SubmitStatus::MoreDataNeeded);
        }
        let order = state.decoded;
        if state.take_busy(StageKind::Decode, order) {
            return Ok(SubmitStatus::DeviceBusy);
        }
        let payload = data[4..4 + len].to_vec();
        bitstream.consume(4 + len);
        state.decoded += 1;
        if state.take_hang(StageKind::Decode, order) {
            info!(frame_order = order, "simulated decode hang");
            return Ok(SubmitStatus::DeviceHang);
        }

        state.surfaces.insert(work.handle(), payload);
        work.set_meta(FrameMeta {
            pts_90k: Some(Timestamp90k(order as i64 * PTS_STEP_90K)),
            frame_order: Some(order),
        });
        work.retain()?;
        state.reorder.push_back(work.clone());
        if state.reorder.len() > self.config.decode_reorder {
            return Ok(Self::emit_decoded(state));
        }
        Ok(SubmitStatus::MoreDataNeeded)
    }

    fn emit_decoded(state: &mut SimState) -> SubmitStatus<FrameResource> {
        match state.reorder.pop_front() {
            Some(output) => {
                let order = output.meta().frame_order.unwrap_or_default();
                let token = state.issue(StageKind::Decode, order);
                SubmitStatus::Complete { token, output }
            }
            None => SubmitStatus::MoreDataNeeded,
        }
    }
}

impl SessionBackend for SimBackend {
    fn init_session(&self, params: &InitParamsExt) -> Result<(), PipelineError> {
        params.validate()?;
        if params.async_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "session async depth must be at least 1".to_string(),
            ));
        }
        debug!(
            async_depth = params.async_depth,
            gpu_copy = params.gpu_copy,
            threads = params.num_threads,
            "simulated session initialized"
        );
        self.lock().init = Some(params.base().clone());
        Ok(())
    }

    fn query_capabilities(&self) -> CapabilityReport {
        CapabilityReport {
            decode_codecs: vec![Codec::H264, Codec::Hevc, Codec::Av1],
            encode_codecs: vec![Codec::H264, Codec::Hevc, Codec::Av1],
            filter_supported: true,
            hardware_acceleration: false,
            max_frames: self.config.max_frames,
        }
    }

    fn allocate_frames(
        &self,
        count: usize,
        geometry: FrameGeometry,
    ) -> Result<Vec<FrameHandle>, PipelineError> {
        let mut state = self.lock();
        let available = self.config.max_frames.saturating_sub(state.allocated);
        let granted = count.min(available);
        let first = state.allocated as u64;
        state.allocated += granted;
        let handles: Vec<FrameHandle> = (first..first + granted as u64).map(FrameHandle).collect();
        for handle in &handles {
            state.surfaces.insert(*handle, Vec::new());
        }
        debug!(requested = count, granted, %geometry, "simulated frame allocation");
        Ok(handles)
    }

    fn submit_decode(
        &self,
        bitstream: Option<&mut BitstreamBuffer>,
        work: &FrameResource,
    ) -> Result<SubmitStatus<FrameResource>, PipelineError> {
        let mut state = self.lock();
        match bitstream {
            Some(bitstream) => self.decode_one(&mut state, bitstream, work),
            None => Ok(Self::emit_decoded(&mut state)),
        }
    }

    fn submit_filter(
        &self,
        input: Option<&FrameResource>,
        work: &FrameResource,
    ) -> Result<SubmitStatus<FrameResource>, PipelineError> {
        let Some(input) = input else {
            return Ok(SubmitStatus::MoreDataNeeded);
        };
        let mut state = self.lock();
        let meta = input.meta();
        let order = meta.frame_order.unwrap_or_default();
        let second = state.filter_second_pending == Some(order);
        if !second {
            if state.take_busy(StageKind::Filter, order) {
                return Ok(SubmitStatus::DeviceBusy);
            }
            if state.take_hang(StageKind::Filter, order) {
                info!(frame_order = order, "simulated filter hang");
                return Ok(SubmitStatus::DeviceHang);
            }
        }

        let filtered: Vec<u8> = state.surface(input)?.iter().map(|byte| !byte).collect();
        state.surfaces.insert(work.handle(), filtered);
        let out_order = if self.config.filter_doubles_rate {
            order * 2 + u64::from(second)
        } else {
            order
        };
        work.set_meta(FrameMeta {
            pts_90k: meta.pts_90k,
            frame_order: Some(out_order),
        });
        work.retain()?;
        let token = state.issue(StageKind::Filter, out_order);
        if self.config.filter_doubles_rate && !second {
            state.filter_second_pending = Some(order);
            return Ok(SubmitStatus::MoreOutputPending {
                token,
                output: work.clone(),
            });
        }
        state.filter_second_pending = None;
        Ok(SubmitStatus::Complete {
            token,
            output: work.clone(),
        })
    }

    fn configure_encoder(
        &self,
        target_id: u32,
        params: &VideoParamsExt,
    ) -> Result<(), PipelineError> {
        params.validate()?;
        let mut state = self.lock();
        state.encoders.insert(
            target_id,
            EncoderState {
                codec: params.codec,
                gop_size: params.gop_size,
                encoded: 0,
                delayed: VecDeque::new(),
                split_tail: None,
            },
        );
        debug!(target_id, codec = %params.codec, gop = params.gop_size, "simulated encoder configured");
        Ok(())
    }

    fn submit_encode(
        &self,
        target_id: u32,
        ctrl: Option<&EncodeCtrlExt>,
        input: Option<&FrameResource>,
        output: &BitstreamSlot,
    ) -> Result<SubmitStatus<()>, PipelineError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let delay = self.config.encode_delay;
        let input_order = input.map(|frame| frame.meta().frame_order.unwrap_or_default());

        if state.encoder(target_id)?.split_tail.is_some() {
            return Self::emit_tail(state, target_id, input_order, output);
        }

        let (Some(input), Some(order)) = (input, input_order) else {
            let encoder = state.encoder(target_id)?;
            let Some(encoded) = encoder.delayed.pop_front() else {
                return Ok(SubmitStatus::MoreDataNeeded);
            };
            let required = PACKET_HEADER_LEN + encoded.packet.payload.len();
            if required > output.capacity() {
                encoder.delayed.push_front(encoded);
                return Ok(SubmitStatus::NotEnoughBuffer { required });
            }
            return self.emit_encoded(state, target_id, None, encoded, output);
        };

        if state.take_busy(StageKind::Encode, order) {
            return Ok(SubmitStatus::DeviceBusy);
        }
        let payload = state.surface(input)?.clone();
        let encoder = state.encoder(target_id)?;

        let keyframe = ctrl.is_some_and(|ctrl| ctrl.forces_keyframe())
            || encoder.encoded == 0
            || (encoder.gop_size > 0 && encoder.encoded % u64::from(encoder.gop_size) == 0);
        let encoded = EncodedPacket {
            packet: SimPacket {
                codec: encoder.codec,
                keyframe,
                target_id,
                frame_order: order,
                payload,
            },
            qp: ctrl.and_then(|ctrl| ctrl.qp).unwrap_or(DEFAULT_QP),
        };

        // Size check happens before any state changes so a retry is identical.
        let emitted_len = if encoder.delayed.len() >= delay {
            let next = encoder.delayed.front().unwrap_or(&encoded);
            PACKET_HEADER_LEN + next.packet.payload.len()
        } else {
            0
        };
        if emitted_len > output.capacity() {
            return Ok(SubmitStatus::NotEnoughBuffer {
                required: emitted_len,
            });
        }

        if state.take_hang(StageKind::Encode, order) {
            info!(target_id, frame_order = order, "simulated encode hang");
            return Ok(SubmitStatus::DeviceHang);
        }
        let encoder = state.encoder(target_id)?;
        encoder.encoded += 1;
        encoder.delayed.push_back(encoded);
        if encoder.delayed.len() <= delay {
            return Ok(SubmitStatus::MoreDataNeeded);
        }
        let Some(encoded) = encoder.delayed.pop_front() else {
            return Ok(SubmitStatus::MoreDataNeeded);
        };
        self.emit_encoded(state, target_id, Some(order), encoded, output)
    }

    fn synchronize(&self, token: &CompletionToken, _timeout: Duration) -> SyncStatus {
        let mut state = self.lock();
        let Some(op) = state.ops.remove(&token.id()) else {
            return SyncStatus::UnknownToken;
        };
        if op.stage != token.stage() {
            return SyncStatus::UnknownToken;
        }
        if state.hang_on_sync.remove(&(op.stage, op.frame_order)) {
            info!(stage = %op.stage, frame_order = op.frame_order, "simulated hang on synchronize");
            return SyncStatus::DeviceHang;
        }
        SyncStatus::Ready
    }

    fn read_frame(&self, frame: &FrameResource) -> Result<Vec<u8>, PipelineError> {
        self.lock().surface(frame).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitstreamStore;
    use crate::contract::{Dimensions, PixelFormat};
    use crate::params::keyframe_ctrl;
    use crate::pool::ResourcePool;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(Dimensions::new(16, 16).unwrap(), PixelFormat::Nv12)
    }

    #[test]
    fn allocation_is_capped() {
        let backend = SimBackend::new(SimConfig {
            max_frames: 3,
            ..SimConfig::default()
        });
        assert_eq!(backend.allocate_frames(2, geometry()).unwrap().len(), 2);
        assert_eq!(backend.allocate_frames(2, geometry()).unwrap().len(), 1);
        assert!(matches!(
            ResourcePool::allocate(&backend, 1, geometry()),
            Err(PipelineError::ResourceExhausted {
                requested: 1,
                available: 0
            })
        ));
    }

    #[test]
    fn decoder_waits_for_complete_records() {
        let backend = SimBackend::new(SimConfig::default());
        let pool = ResourcePool::allocate(&backend, 2, geometry()).unwrap();
        let work = pool.acquire_free(Duration::ZERO).unwrap();
        let stream = frame_stream([b"abc"]);

        let mut bitstream = BitstreamBuffer::default();
        bitstream.append(&stream[..5]);
        assert!(matches!(
            backend.submit_decode(Some(&mut bitstream), &work).unwrap(),
            SubmitStatus::MoreDataNeeded
        ));
        assert_eq!(bitstream.len(), 5);

        bitstream.append(&stream[5..]);
        let SubmitStatus::Complete { token, output } =
            backend.submit_decode(Some(&mut bitstream), &work).unwrap()
        else {
            panic!("expected a decoded frame");
        };
        assert!(output.same_frame(&work));
        assert_eq!(output.lock_count(), 2);
        assert_eq!(backend.synchronize(&token, Duration::ZERO), SyncStatus::Ready);
        assert_eq!(backend.synchronize(&token, Duration::ZERO), SyncStatus::UnknownToken);
        assert_eq!(backend.read_frame(&output).unwrap(), b"abc");
    }

    #[test]
    fn reorder_depth_holds_frames_until_drain() {
        let backend = SimBackend::new(SimConfig {
            decode_reorder: 1,
            ..SimConfig::default()
        });
        let pool = ResourcePool::allocate(&backend, 2, geometry()).unwrap();
        let mut bitstream = BitstreamBuffer::default();
        bitstream.append(&frame_stream([b"one"]));
        let work = pool.acquire_free(Duration::ZERO).unwrap();

        assert!(matches!(
            backend.submit_decode(Some(&mut bitstream), &work).unwrap(),
            SubmitStatus::MoreDataNeeded
        ));
        work.release().unwrap();
        assert_eq!(work.lock_count(), 1);

        let spare = pool.acquire_free(Duration::ZERO).unwrap();
        let SubmitStatus::Complete { output, .. } = backend.submit_decode(None, &spare).unwrap()
        else {
            panic!("drain should emit the held frame");
        };
        assert!(output.same_frame(&work));
        assert!(matches!(
            backend.submit_decode(None, &spare).unwrap(),
            SubmitStatus::MoreDataNeeded
        ));
    }

    #[test]
    fn encoder_forces_keyframes_and_requests_room() {
        let backend = SimBackend::new(SimConfig::default());
        let mut params = VideoParamsExt::default();
        params.codec = Codec::Hevc;
        backend.configure_encoder(7, &params).unwrap();
        let pool = ResourcePool::allocate(&backend, 1, geometry()).unwrap();
        let mut bitstream = BitstreamBuffer::default();
        bitstream.append(&frame_stream([vec![1u8; 64]]));
        let work = pool.acquire_free(Duration::ZERO).unwrap();
        let SubmitStatus::Complete { output: frame, .. } =
            backend.submit_decode(Some(&mut bitstream), &work).unwrap()
        else {
            panic!("expected a decoded frame");
        };

        let mut store = BitstreamStore::new(1, 8);
        let slot = store.acquire().unwrap();
        let status = backend.submit_encode(7, None, Some(&frame), &slot).unwrap();
        assert!(matches!(
            status,
            SubmitStatus::NotEnoughBuffer { required } if required == PACKET_HEADER_LEN + 64
        ));

        slot.lock().ensure_capacity(256);
        let ctrl = keyframe_ctrl();
        assert!(matches!(
            backend.submit_encode(7, Some(&ctrl), Some(&frame), &slot).unwrap(),
            SubmitStatus::Complete { .. }
        ));
        let packets = SimPacket::parse_all(slot.lock().remaining()).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].codec, Codec::Hevc);
        assert!(packets[0].keyframe);
        assert_eq!(packets[0].target_id, 7);
    }

    fn decode_frames(
        backend: &SimBackend,
        pool: &ResourcePool,
        count: usize,
    ) -> Vec<FrameResource> {
        let payloads: Vec<Vec<u8>> = (0..count).map(|index| vec![index as u8; 20]).collect();
        let mut bitstream = BitstreamBuffer::default();
        bitstream.append(&frame_stream(&payloads));
        (0..count)
            .map(|_| {
                let work = pool.acquire_free(Duration::ZERO).unwrap();
                let SubmitStatus::Complete { token, output } =
                    backend.submit_decode(Some(&mut bitstream), &work).unwrap()
                else {
                    panic!("expected a decoded frame");
                };
                assert_eq!(backend.synchronize(&token, Duration::ZERO), SyncStatus::Ready);
                work.release().unwrap();
                output
            })
            .collect()
    }

    #[test]
    fn split_output_is_collected_by_resubmitting_the_same_frame() {
        let backend = SimBackend::new(SimConfig {
            encode_splits: true,
            ..SimConfig::default()
        });
        backend
            .configure_encoder(0, &VideoParamsExt::default())
            .unwrap();
        let pool = ResourcePool::allocate(&backend, 4, geometry()).unwrap();
        let frames = decode_frames(&backend, &pool, 2);
        let mut store = BitstreamStore::new(2, 256);

        let head = store.acquire().unwrap();
        let mut ctrl = EncodeCtrlExt::default();
        ctrl.qp = Some(31);
        assert!(matches!(
            backend
                .submit_encode(0, Some(&ctrl), Some(&frames[0]), &head)
                .unwrap(),
            SubmitStatus::MoreOutputPending { .. }
        ));

        let rest = store.acquire().unwrap();
        assert!(matches!(
            backend.submit_encode(0, None, Some(&frames[1]), &rest),
            Err(PipelineError::Backend(_))
        ));
        assert!(matches!(
            backend.submit_encode(0, None, Some(&frames[0]), &rest).unwrap(),
            SubmitStatus::Complete { .. }
        ));

        let mut bytes = head.lock().remaining().to_vec();
        bytes.extend_from_slice(rest.lock().remaining());
        let packets = SimPacket::parse_all(&bytes).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].frame_order, 0);

        let head = head.lock();
        assert!(head.keyframe);
        assert_eq!(head.frame_order, Some(0));
        assert_eq!(head.pts_90k, Some(Timestamp90k(0)));
        let info = head.get_block::<EncodedFrameInfo>(0).unwrap();
        assert_eq!(info.frame_type, FrameType::Idr);
        assert_eq!(info.qp, Some(31));
        assert!(!rest.lock().keyframe);
    }

    #[test]
    fn encoded_buffer_carries_frame_info() {
        let backend = SimBackend::new(SimConfig::default());
        let mut params = VideoParamsExt::default();
        params.gop_size = 2;
        backend.configure_encoder(3, &params).unwrap();
        let pool = ResourcePool::allocate(&backend, 4, geometry()).unwrap();
        let frames = decode_frames(&backend, &pool, 2);
        let mut store = BitstreamStore::new(1, 256);

        let slot = store.acquire().unwrap();
        backend.submit_encode(3, None, Some(&frames[0]), &slot).unwrap();
        store.release(&slot);
        let slot = store.acquire().unwrap();
        backend.submit_encode(3, None, Some(&frames[1]), &slot).unwrap();

        let buffer = slot.lock();
        assert!(!buffer.keyframe);
        assert_eq!(buffer.frame_order, Some(1));
        assert_eq!(buffer.pts_90k, Some(Timestamp90k(PTS_STEP_90K)));
        let info = buffer.get_block::<EncodedFrameInfo>(0).unwrap();
        assert_eq!(info.frame_type, FrameType::P);
        assert_eq!(info.qp, Some(DEFAULT_QP));
    }

    #[test]
    fn session_init_is_recorded_and_checked() {
        let backend = SimBackend::new(SimConfig::default());
        assert!(backend.session_init().is_none());
        assert!(matches!(
            backend.init_session(&InitParamsExt::default()),
            Err(PipelineError::InvalidConfig(_))
        ));

        let mut init = InitParamsExt::default();
        init.async_depth = 3;
        init.gpu_copy = true;
        backend.init_session(&init).unwrap();
        assert_eq!(backend.session_init(), Some(init.base().clone()));
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let packet = SimPacket {
            codec: Codec::Av1,
            keyframe: false,
            target_id: 1,
            frame_order: 2,
            payload: b"xyz".to_vec(),
        };
        let bytes = packet.to_bytes();
        assert_eq!(SimPacket::parse_all(&bytes).unwrap(), vec![packet]);
        assert!(SimPacket::parse_all(&bytes[..bytes.len() - 1]).is_err());
    }
}

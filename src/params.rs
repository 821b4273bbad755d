use crate::bitstream::BitstreamBuffer;
use crate::contract::{Codec, FrameGeometry};
use crate::ext_params::{BlockKind, ExtParams, ExtensionBlock};

#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub codec: Codec,
    pub geometry: Option<FrameGeometry>,
    pub target_kbps: u32,
    /// Keyframe period in frames; 0 means only the first frame.
    pub gop_size: u16,
    pub async_depth: u16,
    pub low_power: bool,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            geometry: None,
            target_kbps: 0,
            gop_size: 0,
            async_depth: 4,
            low_power: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Unspecified,
    I,
    P,
    B,
    Idr,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EncodeControl {
    pub frame_type: FrameType,
    pub qp: Option<u8>,
    pub skip_frame: bool,
}

impl EncodeControl {
    pub fn forces_keyframe(&self) -> bool {
        matches!(self.frame_type, FrameType::Idr)
    }
}

/// Session-wide settings handed to the backend once, before any frame is
/// allocated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitParams {
    pub async_depth: u16,
    pub gpu_copy: bool,
    pub num_threads: u16,
}

pub type VideoParamsExt = ExtParams<VideoParams>;
pub type EncodeCtrlExt = ExtParams<EncodeControl>;
pub type InitParamsExt = ExtParams<InitParams>;
/// Encoder output buffer; encoders may attach blocks such as
/// [`EncodedFrameInfo`].
pub type BitstreamExt = ExtParams<BitstreamBuffer>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodingOption {
    pub rate_distortion_opt: bool,
    pub max_dec_frame_buffering: u16,
    pub aud_delimiter: bool,
    pub pic_timing_sei: bool,
}

impl ExtensionBlock for CodingOption {
    const KIND: BlockKind = BlockKind::from_fourcc(b"CDOP");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodingOption2 {
    pub max_frame_size: u32,
    pub look_ahead_depth: u16,
    pub b_ref_type: u16,
    pub repeat_pps: bool,
}

impl ExtensionBlock for CodingOption2 {
    const KIND: BlockKind = BlockKind::from_fourcc(b"CDP2");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodingOption3 {
    pub weighted_pred: u16,
    pub gpb: bool,
    pub low_delay_brc: bool,
}

impl ExtensionBlock for CodingOption3 {
    const KIND: BlockKind = BlockKind::from_fourcc(b"CDP3");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BitrateControl {
    pub max_kbps: u32,
    pub buffer_size_kb: u32,
    pub initial_delay_kb: u32,
}

impl ExtensionBlock for BitrateControl {
    const KIND: BlockKind = BlockKind::from_fourcc(b"EBRC");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HevcParam {
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    pub general_constraint_flags: u64,
}

impl ExtensionBlock for HevcParam {
    const KIND: BlockKind = BlockKind::from_fourcc(b"2DOH");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vp9Param {
    pub frame_width: u16,
    pub frame_height: u16,
    pub num_tile_columns: u16,
}

impl ExtensionBlock for Vp9Param {
    const KIND: BlockKind = BlockKind::from_fourcc(b"9PAR");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Av1BitstreamParam {
    pub write_ivf_headers: bool,
}

impl ExtensionBlock for Av1BitstreamParam {
    const KIND: BlockKind = BlockKind::from_fourcc(b"1BSP");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Av1ResolutionParam {
    pub frame_width: u32,
    pub frame_height: u32,
}

impl ExtensionBlock for Av1ResolutionParam {
    const KIND: BlockKind = BlockKind::from_fourcc(b"1RSP");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Av1TileParam {
    pub num_tile_rows: u16,
    pub num_tile_columns: u16,
    pub num_tile_groups: u16,
}

impl ExtensionBlock for Av1TileParam {
    const KIND: BlockKind = BlockKind::from_fourcc(b"1TLP");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecVideoProcessing {
    pub out_width: u16,
    pub out_height: u16,
    pub crop_x: u16,
    pub crop_y: u16,
}

impl ExtensionBlock for DecVideoProcessing {
    const KIND: BlockKind = BlockKind::from_fourcc(b"DCVP");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AllocationHints {
    pub wanted_additional_surfaces: u16,
}

impl ExtensionBlock for AllocationHints {
    const KIND: BlockKind = BlockKind::from_fourcc(b"VAHT");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AvcRefListCtrl {
    pub num_ref_idx_l0_active: u16,
    pub num_ref_idx_l1_active: u16,
    pub preferred_ref_list: [u32; 8],
}

impl ExtensionBlock for AvcRefListCtrl {
    const KIND: BlockKind = BlockKind::from_fourcc(b"RLST");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AvcRoundingOffset {
    pub enable_intra: bool,
    pub intra_offset: u16,
    pub enable_inter: bool,
    pub inter_offset: u16,
}

impl ExtensionBlock for AvcRoundingOffset {
    const KIND: BlockKind = BlockKind::from_fourcc(b"RDOF");
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u16,
    pub chroma_log2_weight_denom: u16,
    pub luma_weights: Vec<i16>,
}

impl ExtensionBlock for PredWeightTable {
    const KIND: BlockKind = BlockKind::from_fourcc(b"EPWT");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoiRegion {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub delta_qp: i16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EncoderRoi {
    pub regions: Vec<RoiRegion>,
}

impl ExtensionBlock for EncoderRoi {
    const KIND: BlockKind = BlockKind::from_fourcc(b"EROI");
}

/// What the encoder decided for one output packet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EncodedFrameInfo {
    pub frame_type: FrameType,
    pub qp: Option<u8>,
}

impl ExtensionBlock for EncodedFrameInfo {
    const KIND: BlockKind = BlockKind::from_fourcc(b"ENFI");
}

/// Kinds stored as two adjacent blocks, one per field of an interlaced frame.
pub const PAIRED_KINDS: &[BlockKind] = &[
    AvcRefListCtrl::KIND,
    AvcRoundingOffset::KIND,
    PredWeightTable::KIND,
];

pub fn is_paired(kind: BlockKind) -> bool {
    PAIRED_KINDS.contains(&kind)
}

/// Kinds that may be deep-copied between parameter containers.
pub const COPY_ALLOWED_KINDS: &[BlockKind] = &[
    CodingOption::KIND,
    CodingOption2::KIND,
    CodingOption3::KIND,
    BitrateControl::KIND,
    HevcParam::KIND,
    Vp9Param::KIND,
    Av1BitstreamParam::KIND,
    Av1ResolutionParam::KIND,
    Av1TileParam::KIND,
    DecVideoProcessing::KIND,
    AllocationHints::KIND,
];

pub fn is_copy_allowed(kind: BlockKind) -> bool {
    COPY_ALLOWED_KINDS.contains(&kind)
}

/// Control that asks the encoder for a keyframe on the frame it accompanies.
#[must_use]
pub fn keyframe_ctrl() -> EncodeCtrlExt {
    EncodeCtrlExt::from_base(EncodeControl {
        frame_type: FrameType::Idr,
        ..EncodeControl::default()
    })
}

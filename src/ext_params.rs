//! Parameter structures carrying an ordered list of typed extension blocks.
//!
//! A block is identified by its [`BlockKind`]. Most kinds occur at most once
//! per container; *paired* kinds (one block per field of an interlaced frame)
//! always occupy two adjacent slots. Pairing is a property of the kind, looked
//! up in [`crate::params::PAIRED_KINDS`], so typed and raw access agree on it.
//! Deep copies are restricted to the kinds listed in
//! [`crate::params::COPY_ALLOWED_KINDS`].

use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::params::{is_copy_allowed, is_paired};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKind(pub u32);

impl BlockKind {
    #[must_use]
    pub const fn from_fourcc(code: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*code))
    }

    pub fn fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.fourcc() {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockKind('{self}')")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("extension block '{kind}' with size {size} is invalid")]
    InvalidBlock { kind: BlockKind, size: u32 },
    #[error("extension block '{kind}' is stored with a different layout")]
    KindMismatch { kind: BlockKind },
    #[error("'{kind}' extension block parity has been broken")]
    BrokenPairing { kind: BlockKind },
    #[error("deep copy of '{kind}' extension block is not allowed")]
    CopyNotAllowed { kind: BlockKind },
    #[error("extension block '{kind}' appears more than once")]
    DuplicateKind { kind: BlockKind },
}

/// A typed extension block.
pub trait ExtensionBlock: Any + Send + Sync + Default + Clone + PartialEq + fmt::Debug {
    const KIND: BlockKind;
}

trait BlockPayload: Any + Send + Sync + fmt::Debug {
    fn clone_box(&self) -> Box<dyn BlockPayload>;
    fn eq_dyn(&self, other: &dyn BlockPayload) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<K: ExtensionBlock> BlockPayload for K {
    fn clone_box(&self) -> Box<dyn BlockPayload> {
        Box::new(self.clone())
    }

    fn eq_dyn(&self, other: &dyn BlockPayload) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Zero-initialized payload for kinds that have no Rust type.
#[derive(Debug, Clone, PartialEq)]
struct RawPayload(Vec<u8>);

impl BlockPayload for RawPayload {
    fn clone_box(&self) -> Box<dyn BlockPayload> {
        Box::new(self.clone())
    }

    fn eq_dyn(&self, other: &dyn BlockPayload) -> bool {
        other
            .as_any()
            .downcast_ref::<RawPayload>()
            .is_some_and(|other| other == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct ExtBlock {
    kind: BlockKind,
    size: u32,
    payload: Box<dyn BlockPayload>,
}

impl ExtBlock {
    fn typed<K: ExtensionBlock>() -> Self {
        Self {
            kind: K::KIND,
            size: block_size::<K>(),
            payload: Box::new(K::default()),
        }
    }

    fn raw(kind: BlockKind, size: u32) -> Self {
        Self {
            kind,
            size,
            payload: Box::new(RawPayload(vec![0; size as usize])),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn downcast_ref<K: ExtensionBlock>(&self) -> Option<&K> {
        self.payload.as_any().downcast_ref::<K>()
    }

    pub fn downcast_mut<K: ExtensionBlock>(&mut self) -> Option<&mut K> {
        self.payload.as_any_mut().downcast_mut::<K>()
    }

    pub fn raw_bytes(&self) -> Option<&[u8]> {
        self.payload
            .as_any()
            .downcast_ref::<RawPayload>()
            .map(|raw| raw.0.as_slice())
    }

    pub fn raw_bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.payload
            .as_any_mut()
            .downcast_mut::<RawPayload>()
            .map(|raw| raw.0.as_mut_slice())
    }

    /// Address of the payload storage, for aliasing checks.
    pub fn payload_addr(&self) -> *const () {
        let any: &dyn Any = self.payload.as_any();
        any as *const dyn Any as *const ()
    }

    fn duplicate(&self) -> Self {
        Self {
            kind: self.kind,
            size: self.size,
            payload: self.payload.clone_box(),
        }
    }
}

impl PartialEq for ExtBlock {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.size == other.size
            && self.payload.eq_dyn(other.payload.as_ref())
    }
}

fn block_size<K>() -> u32 {
    u32::try_from(std::mem::size_of::<K>()).unwrap_or(u32::MAX)
}

/// A base parameter value plus its owned extension blocks.
///
/// Blocks are exclusively owned by the container. Copying goes through
/// [`ExtParams::try_clone`] / [`ExtParams::assign_from`], which either
/// produce a fully independent copy or fail without touching the
/// destination. Moving (including [`ExtParams::take`]) never copies.
pub struct ExtParams<T> {
    base: T,
    blocks: Vec<ExtBlock>,
}

impl<T: Default> Default for ExtParams<T> {
    fn default() -> Self {
        Self::from_base(T::default())
    }
}

impl<T> ExtParams<T> {
    #[must_use]
    pub fn from_base(base: T) -> Self {
        Self {
            base,
            blocks: Vec::new(),
        }
    }

    pub fn base(&self) -> &T {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut T {
        &mut self.base
    }

    pub fn into_parts(self) -> (T, Vec<ExtBlock>) {
        (self.base, self.blocks)
    }

    pub fn blocks(&self) -> &[ExtBlock] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn kinds(&self) -> Vec<BlockKind> {
        self.blocks.iter().map(ExtBlock::kind).collect()
    }

    pub fn contains(&self, kind: BlockKind) -> bool {
        self.position(kind).is_some()
    }

    pub fn clear_blocks(&mut self) {
        self.blocks.clear();
    }

    fn position(&self, kind: BlockKind) -> Option<usize> {
        self.blocks.iter().position(|block| block.kind == kind)
    }

    /// Returns the block of kind `K`, inserting a default one (two for paired
    /// kinds) if the container has none yet.
    pub fn add_block<K: ExtensionBlock>(&mut self) -> Result<&mut K, ParamError> {
        if block_size::<K>() == 0 || K::KIND.0 == 0 {
            return Err(ParamError::InvalidBlock {
                kind: K::KIND,
                size: block_size::<K>(),
            });
        }
        let index = match self.position(K::KIND) {
            Some(index) => index,
            None => {
                let index = self.blocks.len();
                self.blocks.push(ExtBlock::typed::<K>());
                if is_paired(K::KIND) {
                    self.blocks.push(ExtBlock::typed::<K>());
                }
                index
            }
        };
        self.blocks[index]
            .downcast_mut::<K>()
            .ok_or(ParamError::KindMismatch { kind: K::KIND })
    }

    /// Untyped variant of [`ExtParams::add_block`]; the payload is `size`
    /// zero bytes.
    pub fn add_raw_block(
        &mut self,
        kind: BlockKind,
        size: u32,
    ) -> Result<&mut ExtBlock, ParamError> {
        if kind.0 == 0 || size == 0 {
            return Err(ParamError::InvalidBlock { kind, size });
        }
        if let Some(index) = self.position(kind) {
            let block = &mut self.blocks[index];
            if block.size != size {
                return Err(ParamError::KindMismatch { kind });
            }
            return Ok(block);
        }
        let index = self.blocks.len();
        self.blocks.push(ExtBlock::raw(kind, size));
        if is_paired(kind) {
            self.blocks.push(ExtBlock::raw(kind, size));
        }
        Ok(&mut self.blocks[index])
    }

    /// Removes the block of kind `K` (both halves for paired kinds).
    ///
    /// Returns `Ok(false)` when the kind is absent. A paired kind whose
    /// partner is missing is reported and nothing is removed.
    pub fn remove_block<K: ExtensionBlock>(&mut self) -> Result<bool, ParamError> {
        self.remove_kind(K::KIND)
    }

    pub fn remove_kind(&mut self, kind: BlockKind) -> Result<bool, ParamError> {
        let Some(index) = self.position(kind) else {
            return Ok(false);
        };
        if is_paired(kind) {
            let partner_ok = self
                .blocks
                .get(index + 1)
                .is_some_and(|partner| partner.kind == kind);
            if !partner_ok {
                return Err(ParamError::BrokenPairing { kind });
            }
            self.blocks.drain(index..index + 2);
        } else {
            self.blocks.remove(index);
        }
        Ok(true)
    }

    /// Looks up the block of kind `K`. A non-zero `field_index` selects the
    /// second field of a paired kind.
    pub fn get_block<K: ExtensionBlock>(&self, field_index: usize) -> Option<&K> {
        let index = self.field_position(K::KIND, field_index)?;
        self.blocks[index].downcast_ref::<K>()
    }

    pub fn get_block_mut<K: ExtensionBlock>(&mut self, field_index: usize) -> Option<&mut K> {
        let index = self.field_position(K::KIND, field_index)?;
        self.blocks[index].downcast_mut::<K>()
    }

    pub fn get_raw_block(&self, kind: BlockKind) -> Option<&ExtBlock> {
        self.position(kind).map(|index| &self.blocks[index])
    }

    fn field_position(&self, kind: BlockKind, field_index: usize) -> Option<usize> {
        let first = self.position(kind)?;
        let index = if field_index == 0 { first } else { first + 1 };
        self.blocks
            .get(index)
            .filter(|block| block.kind == kind)
            .map(|_| index)
    }

    /// Checks that non-paired kinds are unique and paired kinds come as
    /// exactly one adjacent pair.
    pub fn validate(&self) -> Result<(), ParamError> {
        let mut seen: Vec<BlockKind> = Vec::with_capacity(self.blocks.len());
        let mut index = 0;
        while index < self.blocks.len() {
            let kind = self.blocks[index].kind;
            if seen.contains(&kind) {
                return Err(ParamError::DuplicateKind { kind });
            }
            seen.push(kind);
            let run = self.blocks[index..]
                .iter()
                .take_while(|block| block.kind == kind)
                .count();
            match (is_paired(kind), run) {
                (true, 2) | (false, 1) => {}
                (true, _) => return Err(ParamError::BrokenPairing { kind }),
                (false, _) => return Err(ParamError::DuplicateKind { kind }),
            }
            index += run;
        }
        Ok(())
    }

    /// Moves the contents out, leaving an empty container behind.
    pub fn take(&mut self) -> Self
    where
        T: Default,
    {
        std::mem::take(self)
    }
}

impl<T: Clone> ExtParams<T> {
    /// Deep copy. Fails with [`ParamError::CopyNotAllowed`] if any block kind
    /// is outside the copy allow-list.
    pub fn try_clone(&self) -> Result<Self, ParamError> {
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            if !is_copy_allowed(block.kind) {
                return Err(ParamError::CopyNotAllowed { kind: block.kind });
            }
            blocks.push(block.duplicate());
        }
        Ok(Self {
            base: self.base.clone(),
            blocks,
        })
    }

    /// Replaces `self` with a deep copy of `source`. On error `self` is left
    /// unchanged.
    pub fn assign_from(&mut self, source: &Self) -> Result<(), ParamError> {
        let copy = source.try_clone()?;
        *self = copy;
        Ok(())
    }
}

impl<T> Deref for ExtParams<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.base
    }
}

impl<T> DerefMut for ExtParams<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.base
    }
}

impl<T: PartialEq> PartialEq for ExtParams<T> {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.blocks == other.blocks
    }
}

impl<T: fmt::Debug> fmt::Debug for ExtParams<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtParams")
            .field("base", &self.base)
            .field("blocks", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{
        AvcRefListCtrl, BitrateControl, CodingOption, CodingOption2, EncoderRoi, VideoParams,
    };

    type Params = ExtParams<VideoParams>;

    #[test]
    fn add_block_is_get_or_insert() {
        let mut params = Params::default();
        params.add_block::<CodingOption2>().unwrap().max_frame_size = 4096;
        params.add_block::<CodingOption2>().unwrap().look_ahead_depth = 8;

        assert_eq!(params.block_count(), 1);
        let block = params.get_block::<CodingOption2>(0).unwrap();
        assert_eq!(block.max_frame_size, 4096);
        assert_eq!(block.look_ahead_depth, 8);
        assert_eq!(
            params.blocks()[0].size() as usize,
            std::mem::size_of::<CodingOption2>()
        );
    }

    #[test]
    fn paired_kind_occupies_two_slots() {
        let mut params = Params::default();
        params.add_block::<AvcRefListCtrl>().unwrap().num_ref_idx_l0_active = 2;
        assert_eq!(params.block_count(), 2);
        assert_eq!(params.kinds(), vec![AvcRefListCtrl::KIND; 2]);

        params.get_block_mut::<AvcRefListCtrl>(1).unwrap().num_ref_idx_l0_active = 3;
        assert_eq!(params.get_block::<AvcRefListCtrl>(0).unwrap().num_ref_idx_l0_active, 2);
        assert_eq!(params.get_block::<AvcRefListCtrl>(1).unwrap().num_ref_idx_l0_active, 3);

        assert!(params.remove_block::<AvcRefListCtrl>().unwrap());
        assert_eq!(params.block_count(), 0);
        params.validate().unwrap();
    }

    #[test]
    fn field_index_on_unpaired_kind_finds_nothing() {
        let mut params = Params::default();
        params.add_block::<CodingOption>().unwrap();
        assert!(params.get_block::<CodingOption>(1).is_none());
    }

    #[test]
    fn remove_absent_kind_is_a_no_op() {
        let mut params = Params::default();
        params.add_block::<CodingOption>().unwrap();
        assert!(!params.remove_block::<CodingOption2>().unwrap());
        assert_eq!(params.block_count(), 1);
    }

    #[test]
    fn broken_pairing_is_reported_without_mutation() {
        let mut params = Params::default();
        params.blocks.push(ExtBlock::raw(AvcRefListCtrl::KIND, 16));
        assert_eq!(
            params.validate(),
            Err(ParamError::BrokenPairing {
                kind: AvcRefListCtrl::KIND
            })
        );
        let err = params.remove_block::<AvcRefListCtrl>().unwrap_err();
        assert_eq!(
            err,
            ParamError::BrokenPairing {
                kind: AvcRefListCtrl::KIND
            }
        );
        assert_eq!(params.block_count(), 1);
    }

    #[test]
    fn zero_kind_or_size_is_rejected() {
        let mut params = Params::default();
        assert!(matches!(
            params.add_raw_block(BlockKind(0), 8),
            Err(ParamError::InvalidBlock { .. })
        ));
        assert!(matches!(
            params.add_raw_block(BlockKind::from_fourcc(b"ABCD"), 0),
            Err(ParamError::InvalidBlock { .. })
        ));
        assert_eq!(params.block_count(), 0);
    }

    #[test]
    fn raw_blocks_are_zeroed_and_keep_their_size() {
        let kind = BlockKind::from_fourcc(b"XTRA");
        let mut params = Params::default();
        params.add_raw_block(kind, 12).unwrap();
        let block = params.get_raw_block(kind).unwrap();
        assert_eq!(block.raw_bytes().unwrap(), &[0u8; 12]);
        assert!(params.add_raw_block(kind, 16).is_err());
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut source = Params::default();
        source.gop_size = 30;
        source.add_block::<CodingOption2>().unwrap().max_frame_size = 1000;
        source.add_block::<BitrateControl>().unwrap().max_kbps = 6000;

        let mut copy = source.try_clone().unwrap();
        assert_eq!(copy, source);
        assert_eq!(copy.kinds(), source.kinds());
        for (a, b) in copy.blocks().iter().zip(source.blocks()) {
            assert_ne!(a.payload_addr(), b.payload_addr());
        }

        copy.get_block_mut::<CodingOption2>(0).unwrap().max_frame_size = 5;
        assert_eq!(source.get_block::<CodingOption2>(0).unwrap().max_frame_size, 1000);
    }

    #[test]
    fn copy_of_disallowed_kind_fails_and_leaves_destination_untouched() {
        let mut source = Params::default();
        source.add_block::<CodingOption>().unwrap();
        source.add_block::<EncoderRoi>().unwrap();

        let mut destination = Params::default();
        destination.add_block::<CodingOption2>().unwrap().max_frame_size = 77;

        let err = destination.assign_from(&source).unwrap_err();
        assert_eq!(err, ParamError::CopyNotAllowed { kind: EncoderRoi::KIND });
        assert!(err.to_string().contains("EROI"));
        assert_eq!(destination.kinds(), vec![CodingOption2::KIND]);
        assert_eq!(destination.get_block::<CodingOption2>(0).unwrap().max_frame_size, 77);
    }

    #[test]
    fn assign_replaces_previous_blocks() {
        let mut source = Params::default();
        source.add_block::<CodingOption>().unwrap();
        let mut destination = Params::default();
        destination.add_block::<BitrateControl>().unwrap();

        destination.assign_from(&source).unwrap();
        assert_eq!(destination.kinds(), vec![CodingOption::KIND]);
    }

    #[test]
    fn take_transfers_without_copying() {
        let mut source = Params::default();
        source.add_block::<EncoderRoi>().unwrap();
        let addr = source.blocks()[0].payload_addr();

        let moved = source.take();
        assert_eq!(source.block_count(), 0);
        assert_eq!(moved.blocks()[0].payload_addr(), addr);
    }

    #[test]
    fn validate_rejects_adjacent_duplicate_of_unpaired_kind() {
        let kind = BlockKind::from_fourcc(b"TRPL");
        let mut params = Params::default();
        params.add_raw_block(kind, 4).unwrap();
        params.validate().unwrap();
        params.blocks.push(ExtBlock::raw(kind, 4));
        assert_eq!(params.validate(), Err(ParamError::DuplicateKind { kind }));
    }

    #[test]
    fn raw_access_to_paired_kind_follows_the_registry() {
        let size = block_size::<AvcRefListCtrl>();
        let mut params = Params::default();
        params.add_raw_block(AvcRefListCtrl::KIND, size).unwrap();
        assert_eq!(params.kinds(), vec![AvcRefListCtrl::KIND; 2]);
        params.validate().unwrap();

        params.blocks.push(ExtBlock::raw(AvcRefListCtrl::KIND, size));
        assert_eq!(
            params.validate(),
            Err(ParamError::BrokenPairing {
                kind: AvcRefListCtrl::KIND
            })
        );
        params.blocks.pop();

        assert!(params.remove_kind(AvcRefListCtrl::KIND).unwrap());
        assert_eq!(params.block_count(), 0);
    }
}

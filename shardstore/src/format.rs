use std::mem::size_of;
use std::ops::Range;

use bytemuck::{Pod, PodCastError, Zeroable};
use modular_bitfield::prelude::*;
use xxhash_rust::xxh3::Xxh3;

pub const MAGIC: [u8; 8] = *b"PHSHARD1";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = size_of::<Header>();
pub const SLOT_SIZE: usize = size_of::<Slot>();
pub const DISPLACEMENT_SIZE: usize = size_of::<Displacement>();
/// Largest object offset a slot tag can address (62 bits).
pub const MAX_DATA_OFFSET: u64 = (1 << 62) - 1;
const CHECKSUMMED_HEADER_LEN: usize = HEADER_SIZE - size_of::<u64>();

/// ┌───────────────────────────────────────────────────────────────────────────────┐
/// │ Shard file                                                                    │
/// │┌ ─ ─ ─ ─ ─ ─┌ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─┌ ─ ─ ─ ─ ─ ─ ─ ─┌ ─ ─ ─ ─ ─ ─ ─┌ ─ ─ ─ ─ ─ ─ │
/// │   header    │ displacements      │ slots          │ keys         │ data        │
/// ││  64 bytes  │ buckets x (u32,u32)│ n x 24 bytes   │ n x key_len  │ payloads   ││
/// │ ─ ─ ─ ─ ─ ─ ┘─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┘─ ─ ─ ─ ─ ─ ─ ─ ┘─ ─ ─ ─ ─ ─ ─ ┘─ ─ ─ ─ ─ ─ ─│
/// └───────────────────────────────────────────────────────────────────────────────┘
///
/// The header is written last. A zeroed magic means the build never finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub key_len: u32,
    pub object_count: u64,
    pub seed: u64,
    pub bucket_count: u64,
    pub data_offset: u64,
    pub data_len: u64,
    pub checksum: u64,
}

impl Header {
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]))
    }

    pub fn is_finalized(&self) -> bool {
        self.magic == MAGIC
    }
}

#[derive(Specifier, PartialEq, Eq, Debug, Clone, Copy)]
pub enum SlotStatus {
    Empty,
    Live,
    Deleted,
    Reserved,
}

#[bitfield(bits = 64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTag {
    #[bits = 2]
    pub status: SlotStatus,
    pub offset: B62,
}

impl From<SlotTag> for u64 {
    fn from(tag: SlotTag) -> u64 {
        u64::from_le_bytes(tag.into_bytes())
    }
}

impl From<u64> for SlotTag {
    fn from(value: u64) -> Self {
        SlotTag::from_bytes(value.to_le_bytes())
    }
}

impl SlotTag {
    pub fn live_at(offset: u64) -> Self {
        SlotTag::new()
            .with_status(SlotStatus::Live)
            .with_offset(offset)
    }

    pub fn tombstone(self) -> Self {
        self.with_status(SlotStatus::Deleted)
    }
}

/// One index slot. `tag` is the only field that changes after finalize.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Slot {
    tag: u64,
    pub len: u64,
    pub fingerprint: u64,
}

impl Slot {
    pub fn live(offset: u64, len: u64, fingerprint: u64) -> Self {
        Self {
            tag: SlotTag::live_at(offset).into(),
            len,
            fingerprint,
        }
    }

    pub fn tag(&self) -> SlotTag {
        SlotTag::from(self.tag)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Displacement {
    pub d1: u32,
    pub d2: u32,
}

/// Byte ranges of every index region for a given key count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub object_count: usize,
    pub bucket_count: usize,
    pub key_len: usize,
    displacements: Range<usize>,
    slots: Range<usize>,
    keys: Range<usize>,
    pub data_offset: usize,
}

impl Layout {
    /// Returns `None` if the regions do not fit in the address space.
    pub fn new(object_count: usize, bucket_count: usize, key_len: usize) -> Option<Self> {
        let disp_end = bucket_count
            .checked_mul(DISPLACEMENT_SIZE)?
            .checked_add(HEADER_SIZE)?;
        let slots_end = object_count.checked_mul(SLOT_SIZE)?.checked_add(disp_end)?;
        let keys_end = object_count.checked_mul(key_len)?.checked_add(slots_end)?;
        let data_offset = keys_end.checked_next_multiple_of(8)?;

        Some(Self {
            object_count,
            bucket_count,
            key_len,
            displacements: HEADER_SIZE..disp_end,
            slots: disp_end..slots_end,
            keys: slots_end..keys_end,
            data_offset,
        })
    }

    /// Length of everything before the data region.
    pub fn index_len(&self) -> usize {
        self.data_offset
    }

    /// File position of the tag word of slot `i`.
    pub fn tag_position(&self, i: usize) -> u64 {
        (self.slots.start + i * SLOT_SIZE) as u64
    }

    pub fn split_mut<'a>(&self, index: &'a mut [u8]) -> Result<IndexMut<'a>, PodCastError> {
        if index.len() < self.index_len() {
            return Err(PodCastError::SizeMismatch);
        }
        let (header, rest) = index.split_at_mut(HEADER_SIZE);
        let (displacements, rest) = rest.split_at_mut(self.displacements.len());
        let (slots, rest) = rest.split_at_mut(self.slots.len());
        let (keys, _) = rest.split_at_mut(self.keys.len());

        Ok(IndexMut {
            header: bytemuck::try_from_bytes_mut(header)?,
            displacements: bytemuck::try_cast_slice_mut(displacements)?,
            slots: bytemuck::try_cast_slice_mut(slots)?,
            keys,
        })
    }

    pub fn view<'a>(&self, index: &'a [u8]) -> Result<IndexRef<'a>, PodCastError> {
        if index.len() < self.index_len() {
            return Err(PodCastError::SizeMismatch);
        }
        Ok(IndexRef {
            displacements: bytemuck::try_cast_slice(&index[self.displacements.clone()])?,
            slots: bytemuck::try_cast_slice(&index[self.slots.clone()])?,
            keys: &index[self.keys.clone()],
            key_len: self.key_len,
        })
    }
}

pub struct IndexMut<'a> {
    pub header: &'a mut Header,
    pub displacements: &'a mut [Displacement],
    pub slots: &'a mut [Slot],
    pub keys: &'a mut [u8],
}

#[derive(Clone, Copy)]
pub struct IndexRef<'a> {
    pub displacements: &'a [Displacement],
    pub slots: &'a [Slot],
    keys: &'a [u8],
    key_len: usize,
}

impl<'a> IndexRef<'a> {
    pub fn key_at(&self, i: usize) -> &'a [u8] {
        let start = i * self.key_len;
        &self.keys[start..start + self.key_len]
    }

    /// Reads the tag of slot `i` with a single aligned load, so a concurrent
    /// tombstone write is observed either entirely or not at all.
    pub fn load_tag(&self, i: usize) -> SlotTag {
        let slot = &self.slots[i];
        let raw = unsafe { std::ptr::read_volatile(std::ptr::addr_of!(slot.tag)) };
        SlotTag::from(raw)
    }

    pub fn keys(&self) -> &'a [u8] {
        self.keys
    }
}

/// xxh3 over the header (minus the checksum itself), the displacement table
/// and the key table. Slots are left out because tombstones rewrite them.
pub fn checksum(header: &Header, displacements: &[Displacement], keys: &[u8]) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&bytemuck::bytes_of(header)[..CHECKSUMMED_HEADER_LEN]);
    hasher.update(bytemuck::cast_slice(displacements));
    hasher.update(keys);
    hasher.digest()
}

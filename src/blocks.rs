//! Hash directory (`.h`) + block chains (`.blk`).
//!
//! A hash slot holds either `0` (empty bucket) or the offset of a chain's
//! head block. A block is a fixed 4096-byte region whose header is either
//! a slot-occupancy count (top bit clear) or the FULL flag plus the next
//! block's *index* (top bit set, low 31 bits are `(offset - HSIZE_BLK) /
//! SIZE_BLK`, not a byte offset); a chain always terminates at the first
//! non-full block, which is exactly where this module's scan stops looking
//! for further blocks.

use crate::error::{Error, Result};
use crate::format::{
    read_u32, read_u32_opt, write_u32, FLAG_USED, HSIZE_BLK, HSIZE_H, L, MAX_BLK_ENTRIES, MAX_BLOCKS, SIZE_BLK,
};
use crate::payload;
use std::fs::File;

/// `value` is the occupied-slot count when `full` is clear, or the next
/// block's *index* (not byte offset — the index is what the top bit leaves
/// room for) when `full` is set.
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    full: bool,
    value: u32,
}

impl BlockHeader {
    fn decode(raw: u32) -> Self {
        if raw & FLAG_USED != 0 {
            BlockHeader { full: true, value: raw & !FLAG_USED }
        } else {
            BlockHeader { full: false, value: raw }
        }
    }

    fn encode(self) -> u32 {
        if self.full {
            self.value | FLAG_USED
        } else {
            self.value
        }
    }
}

/// Converts a `.blk` byte offset to the block index the FULL header encodes
/// in its low 31 bits.
fn block_index(block_offset: u32) -> u32 {
    (block_offset - HSIZE_BLK) / SIZE_BLK
}

/// Inverse of [`block_index`].
fn block_offset_from_index(index: u32) -> u32 {
    HSIZE_BLK + index * SIZE_BLK
}

fn slot_addr(block_offset: u32, slot_index: u32) -> u32 {
    block_offset + L as u32 + (slot_index - 1) * L as u32
}

fn read_header(blk: &mut File, block_offset: u32) -> Result<BlockHeader> {
    Ok(BlockHeader::decode(read_u32(blk, block_offset)?))
}

fn write_header(blk: &mut File, block_offset: u32, header: BlockHeader) -> Result<()> {
    write_u32(blk, block_offset, header.encode())
}

fn read_slot(blk: &mut File, block_offset: u32, slot_index: u32) -> Result<u32> {
    read_u32(blk, slot_addr(block_offset, slot_index))
}

/// Writes a payload offset (or `0` to clear) into a block slot.
pub fn write_slot(blk: &mut File, block_offset: u32, slot_index: u32, payload_offset: u32) -> Result<()> {
    write_u32(blk, slot_addr(block_offset, slot_index), payload_offset)
}

fn h_slot_addr(hash: u32) -> u32 {
    HSIZE_H + hash * L as u32
}

/// Reads the head-block offset for `hash`'s bucket. An untouched, sparse
/// slot reads back as `0` (empty bucket), not an error.
pub fn read_head(h: &mut File, hash: u32) -> Result<u32> {
    Ok(read_u32_opt(h, h_slot_addr(hash))?.unwrap_or(0))
}

/// Allocates a fresh, zeroed (count = 0, not full) block at the end of
/// `.blk` and returns its offset.
fn allocate_block(blk: &mut File, nb_blocks: &mut u32) -> Result<u32> {
    if *nb_blocks >= MAX_BLOCKS {
        return Err(Error::OutOfSpace("block chain storage exhausted".into()));
    }
    let offset = HSIZE_BLK + *nb_blocks * SIZE_BLK;
    write_u32(blk, offset, 0)?;
    *nb_blocks += 1;
    Ok(offset)
}

/// Where a key was found, or where a new entry for it should go, within an
/// existing (non-empty) chain.
pub enum SlotLocation {
    Match { block_offset: u32, slot_index: u32, payload_offset: u32 },
    Free { block_offset: u32, slot_index: u32 },
    AppendNewSlot { block_offset: u32, slot_index: u32, new_count: u32 },
    ExtendChain { last_block_offset: u32 },
}

/// Scans every block of the chain starting at `head`, comparing the
/// stored key at each occupied slot against `key`. Stops as soon as a
/// match is found; otherwise keeps scanning to the chain's end (the first
/// non-full block) so a free slot noticed early doesn't mask a match
/// further down the chain.
pub fn scan_chain(blk: &mut File, kv: &mut File, head: u32, key: &[u8]) -> Result<SlotLocation> {
    let mut block_offset = head;
    let mut first_free: Option<(u32, u32)> = None;

    loop {
        let header = read_header(blk, block_offset)?;
        let limit = if header.full { MAX_BLK_ENTRIES } else { header.value };

        for slot_index in 1..=limit {
            let payload_offset = read_slot(blk, block_offset, slot_index)?;
            if payload_offset == 0 {
                if first_free.is_none() {
                    first_free = Some((block_offset, slot_index));
                }
                continue;
            }
            if payload::key_matches(kv, payload_offset, key)? {
                return Ok(SlotLocation::Match { block_offset, slot_index, payload_offset });
            }
        }

        if !header.full {
            if let Some((block_offset, slot_index)) = first_free {
                return Ok(SlotLocation::Free { block_offset, slot_index });
            }
            return Ok(if header.value < MAX_BLK_ENTRIES {
                SlotLocation::AppendNewSlot {
                    block_offset,
                    slot_index: header.value + 1,
                    new_count: header.value + 1,
                }
            } else {
                SlotLocation::ExtendChain { last_block_offset: block_offset }
            });
        }

        block_offset = block_offset_from_index(header.value);
    }
}

/// Creates a bucket's first block: writes the payload offset into slot 1,
/// sets the header's count to 1, and only then publishes the block to the
/// `.h` slot. This ordering (block contents before `.h` publication) is
/// deliberate: a crash between the two leaves the bucket empty rather than
/// pointing at a block whose single slot was never written.
pub fn insert_first_entry(blk: &mut File, h: &mut File, nb_blocks: &mut u32, hash: u32, payload_offset: u32) -> Result<()> {
    let block_offset = allocate_block(blk, nb_blocks)?;
    write_slot(blk, block_offset, 1, payload_offset)?;
    write_header(blk, block_offset, BlockHeader { full: false, value: 1 })?;
    write_u32(h, h_slot_addr(hash), block_offset)?;
    Ok(())
}

/// Fills a slot already known to be free within an existing block. The
/// header's count is untouched since the slot was already counted (it was
/// freed by a prior delete, or is otherwise within the declared count).
pub fn fill_free_slot(blk: &mut File, block_offset: u32, slot_index: u32, payload_offset: u32) -> Result<()> {
    write_slot(blk, block_offset, slot_index, payload_offset)
}

/// Appends a new occupied slot to a block that has room, advancing its
/// count.
pub fn append_slot(blk: &mut File, block_offset: u32, slot_index: u32, new_count: u32, payload_offset: u32) -> Result<()> {
    write_slot(blk, block_offset, slot_index, payload_offset)?;
    write_header(blk, block_offset, BlockHeader { full: false, value: new_count })
}

/// Extends a chain past a block that has no room left: allocates a new
/// block, writes the new entry into its first slot, and marks the old
/// last block FULL with a pointer to the new one.
pub fn extend_chain(blk: &mut File, nb_blocks: &mut u32, last_block_offset: u32, payload_offset: u32) -> Result<()> {
    let new_block_offset = allocate_block(blk, nb_blocks)?;
    write_slot(blk, new_block_offset, 1, payload_offset)?;
    write_header(blk, new_block_offset, BlockHeader { full: false, value: 1 })?;
    write_header(
        blk,
        last_block_offset,
        BlockHeader { full: true, value: block_index(new_block_offset) },
    )
}

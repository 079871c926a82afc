//! `#[repr(C)]` structures that live in the shared region.
//!
//! All structs use fixed-size fields and explicit padding so the layout is
//! identical across compilations and processes: a peer attaching to an
//! existing buffer can reconstruct the view purely from (N, K, V) read out
//! of the header.

use std::sync::atomic::{AtomicI32, AtomicU32};

/// Magic bytes at the start of the header, used to validate a mapping.
pub const MAGIC: [u8; 8] = *b"SHRDTBL1";

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 128;

/// Sentinel `next` value meaning "chain tail" or, for an empty slot, "no
/// successor". Equal to the table's capacity N (depends on N, so it's a
/// function of the header rather than a single constant).
pub const fn invalid_for(capacity: u32) -> u32 {
    capacity
}

/// Header lives at offset 0 of the shared region.
///
/// Fields are ordered widest-first to avoid implicit alignment padding in
/// `#[repr(C)]`. `clear()` and traversal (`keys`/`map`/`reduce`) are
/// serialized against each other directly through `global_gate` (exclusive
/// vs. shared) — there is no separate epoch counter, since the gate
/// already provides the mutual exclusion.
#[repr(C)]
pub struct Header {
    // 8-byte aligned group
    pub magic: [u8; 8], // 0..8

    // 4-byte aligned group
    pub version: u32,           // 8..12
    pub capacity: u32,          // 12..16 (N, immutable after construction)
    pub key_cap: u32,           // 16..20 (K, code units)
    pub value_cap: u32,         // 20..24 (V, code units)
    pub size: AtomicU32,        // 24..28
    pub free_cursor: AtomicU32, // 28..32 (advisory rotating free-slot cursor)
    pub global_gate: AtomicI32, // 32..36 (0 free, >0 shared count, -1 exclusive)

    // Explicit padding to HEADER_SIZE.
    pub _pad: [u8; HEADER_SIZE - 36],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// Fixed-size header of a single table slot. The key cells and value cells
/// follow immediately after it in the slot's byte span (`key_cell_offset`,
/// `value_cell_offset`) — a fixed header struct with raw bytes after it,
/// since K and V are runtime construction parameters and can't be encoded
/// in a `#[repr(C)]` struct's field list.
#[repr(C)]
pub struct SlotHeader {
    pub lock: AtomicI32, // 0 unlocked, >0 writer-held, <0 shared reader count
    pub key_len: u32,    // 0 == empty-slot sentinel, 1..=K occupied
    pub value_len: u32,
    pub next: u32, // slot index, or invalid_for(capacity) if tail/empty
}

/// Byte size of the fixed slot header (lock + lengths + next).
pub const SLOT_HEADER_SIZE: usize = 4 + 4 + 4 + 4;

const _: () = assert!(std::mem::size_of::<SlotHeader>() == SLOT_HEADER_SIZE);

/// Total byte size of one slot record given K and V code-unit capacities.
pub fn slot_size(key_cap: u32, value_cap: u32) -> usize {
    SLOT_HEADER_SIZE + (key_cap as usize + value_cap as usize) * 2
}

/// Offset (bytes, from the start of a slot record) of the key cell array.
pub const fn key_cell_offset() -> usize {
    SLOT_HEADER_SIZE
}

/// Offset (bytes, from the start of a slot record) of the value cell array.
pub fn value_cell_offset(key_cap: u32) -> usize {
    SLOT_HEADER_SIZE + key_cap as usize * 2
}

/// Offset of the slot array from the start of the region (immediately
/// after the fixed header).
pub const fn slots_offset() -> usize {
    HEADER_SIZE
}

/// Total byte size of the region for the given capacity/key/value sizes.
pub fn region_size(capacity: u32, key_cap: u32, value_cap: u32) -> usize {
    HEADER_SIZE + capacity as usize * slot_size(key_cap, value_cap)
}

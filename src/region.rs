//! Shared region management.
//!
//! The region is a single contiguous byte buffer: header, then the slot
//! array (layout.rs). Three ways to obtain one:
//!
//! - an anonymous `memmap2` mapping, usable within one process or shared
//!   with `fork`ed children (`Region::create`);
//! - a named, file-backed mapping for true cross-process attach
//!   (`Region::create_named` / `Region::open_named`);
//! - attaching directly to a caller-supplied raw buffer produced by a
//!   prior construction (`Region::from_raw_parts`), for peers that receive
//!   the buffer through a transport this crate doesn't concern itself with.

use std::fs;
use std::io;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::layout::{self, Header, MAGIC};

/// Owner of the region's backing storage. `Foreign` buffers are not
/// unmapped or freed on drop — the caller owns their lifetime.
enum Backing {
    Anon(MmapMut),
    Named(MmapMut),
    Foreign { ptr: *mut u8, len: usize },
}

/// The shared region: owns (or borrows) the backing bytes and exposes raw
/// accessors to the header and slot array within them.
pub struct Region {
    backing: Backing,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate and initialize a fresh anonymous region.
    pub fn create(capacity: u32, key_cap: u32, value_cap: u32) -> io::Result<Self> {
        let size = layout::region_size(capacity, key_cap, value_cap);
        tracing::debug!(capacity, key_cap, value_cap, size, "mapping anonymous region");
        let mut mmap = MmapOptions::new().len(size).map_anon()?;
        init_region(mmap.as_mut_ptr(), capacity, key_cap, value_cap);
        Ok(Region {
            backing: Backing::Anon(mmap),
        })
    }

    /// Create (truncating if present) a named, file-backed region for
    /// cross-process attach.
    pub fn create_named(
        path: &Path,
        capacity: u32,
        key_cap: u32,
        value_cap: u32,
    ) -> io::Result<Self> {
        let size = layout::region_size(capacity, key_cap, value_cap);
        tracing::debug!(path = %path.display(), size, "creating named region");
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        init_region(mmap.as_mut_ptr(), capacity, key_cap, value_cap);
        mmap.flush()?;

        Ok(Region {
            backing: Backing::Named(mmap),
        })
    }

    /// Attach to an existing named region, validating its magic.
    pub fn open_named(path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let header = unsafe { &*(mmap.as_ptr() as *const Header) };
        if header.magic != MAGIC {
            tracing::warn!(path = %path.display(), "rejected region: bad magic");
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a valid shared table region: bad magic",
            ));
        }
        tracing::debug!(path = %path.display(), capacity = header.capacity, "attached to named region");

        Ok(Region {
            backing: Backing::Named(mmap),
        })
    }

    /// Attach to a pre-existing raw buffer produced by a prior
    /// construction, for a peer that received it by some other transport.
    /// The caller must ensure `ptr` stays valid and `len` matches the
    /// producing side's `region_size`.
    ///
    /// # Safety
    /// `ptr` must point to `len` bytes of memory already initialized by a
    /// prior call to [`Region::create`], [`Region::create_named`], or the
    /// producing peer's equivalent — this crate has no separate entry
    /// point for stamping a header onto a zeroed foreign buffer, so the
    /// buffer must already carry a valid magic and header.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> io::Result<Self> {
        let header = &*(ptr as *const Header);
        if header.magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a valid shared table region: bad magic",
            ));
        }
        let _ = len;
        Ok(Region {
            backing: Backing::Foreign { ptr, len },
        })
    }

    pub fn base_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::Anon(m) => m.as_ptr(),
            Backing::Named(m) => m.as_ptr(),
            Backing::Foreign { ptr, .. } => *ptr as *const u8,
        }
    }

    pub fn base_mut_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Anon(m) => m.as_ptr() as *mut u8,
            Backing::Named(m) => m.as_ptr() as *mut u8,
            Backing::Foreign { ptr, .. } => *ptr,
        }
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.base_ptr() as *const Header) }
    }
}

/// Zero the region and stamp a fresh header + all-empty slot array.
fn init_region(base: *mut u8, capacity: u32, key_cap: u32, value_cap: u32) {
    let size = layout::region_size(capacity, key_cap, value_cap);
    unsafe {
        std::ptr::write_bytes(base, 0, size);
    }

    let header = unsafe { &mut *(base as *mut Header) };
    header.magic = MAGIC;
    header.version = 1;
    header.capacity = capacity;
    header.key_cap = key_cap;
    header.value_cap = value_cap;
    header
        .size
        .store(0, std::sync::atomic::Ordering::Relaxed);
    header
        .free_cursor
        .store(0, std::sync::atomic::Ordering::Relaxed);
    header
        .global_gate
        .store(0, std::sync::atomic::Ordering::Relaxed);

    let slot_size = layout::slot_size(key_cap, value_cap);
    let invalid = layout::invalid_for(capacity);
    for i in 0..capacity as usize {
        let slot_ptr = unsafe { base.add(layout::slots_offset() + i * slot_size) };
        let slot = unsafe { &mut *(slot_ptr as *mut layout::SlotHeader) };
        slot.lock = std::sync::atomic::AtomicI32::new(0);
        slot.key_len = 0;
        slot.value_len = 0;
        slot.next = invalid;
    }
}

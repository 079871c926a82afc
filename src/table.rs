//! The public façade: `SharedTable`.
//!
//! Each operation acquires the appropriate global gate, then delegates to
//! the chain engine (which takes line locks as it walks), mirroring the
//! teacher's `ShmCache::{get, insert, clear}` — a thin lock-then-delegate
//! wrapper around the inner algorithm — generalized from one process-wide
//! rwlock to the line-lock protocol of `lock.rs`.

use std::path::Path;
use std::sync::atomic::Ordering;

use crate::chain::{self, SlotArray};
use crate::error::Error;
use crate::hash::{MurmurHash2, TableHasher};
use crate::lock::GlobalGate;
use crate::region::Region;
use crate::traversal::{self, KeysCursor};

/// Per-call override: when `lock_write` is `true`, the caller has already
/// taken the global gate exclusively via [`SharedTable::lock_write`], and
/// the operation must skip acquiring the gate (and must not take any line
/// locks either, since the exclusive gate already serializes everything).
#[derive(Debug, Default, Clone, Copy)]
pub struct Options {
    pub lock_write: bool,
}

impl Options {
    /// The default: acquire the global gate in shared mode as usual.
    pub fn new() -> Self {
        Options::default()
    }

    /// Declare that the caller already holds the exclusive global gate
    /// (via [`SharedTable::lock_write`]); the operation skips both gate
    /// acquisition and line locking.
    pub fn caller_holds_lock_write() -> Self {
        Options { lock_write: true }
    }
}

/// A shared-memory, fixed-capacity, coalesced-chaining hash table.
///
/// ```
/// use sharedmap::SharedTable;
///
/// let table = SharedTable::create(8, 8, 8).unwrap();
/// table.set("a", "1").unwrap();
/// assert_eq!(table.get("a"), Some("1".to_string()));
/// assert_eq!(table.length(), 1);
/// ```
pub struct SharedTable<H: TableHasher = MurmurHash2> {
    region: Region,
    hasher: H,
}

unsafe impl<H: TableHasher + Send> Send for SharedTable<H> {}
unsafe impl<H: TableHasher + Sync> Sync for SharedTable<H> {}

impl SharedTable<MurmurHash2> {
    /// Create a fresh, anonymous, in-process-shareable table with the
    /// default MurmurHash2-over-UTF-16 hasher.
    pub fn create(capacity: u32, key_cap: u32, value_cap: u32) -> Result<Self, Error> {
        Self::create_with_hasher(capacity, key_cap, value_cap, MurmurHash2)
    }

    /// Create a named, file-backed table for cross-process attach.
    pub fn create_named(
        path: &Path,
        capacity: u32,
        key_cap: u32,
        value_cap: u32,
    ) -> Result<Self, Error> {
        let region = Region::create_named(path, capacity, key_cap, value_cap)?;
        Ok(SharedTable {
            region,
            hasher: MurmurHash2,
        })
    }

    /// Attach to an existing named table.
    pub fn open_named(path: &Path) -> Result<Self, Error> {
        let region = Region::open_named(path)?;
        Ok(SharedTable {
            region,
            hasher: MurmurHash2,
        })
    }
}

impl<H: TableHasher> SharedTable<H> {
    /// Create a fresh, anonymous table using a caller-supplied hasher.
    /// All peers sharing this buffer must agree on the hasher — the crate
    /// can't enforce that across process boundaries.
    pub fn create_with_hasher(
        capacity: u32,
        key_cap: u32,
        value_cap: u32,
        hasher: H,
    ) -> Result<Self, Error> {
        let region = Region::create(capacity, key_cap, value_cap)?;
        Ok(SharedTable { region, hasher })
    }

    /// Attach to a pre-existing raw buffer produced by a prior
    /// construction, with a caller-supplied hasher matching the producing
    /// side's.
    ///
    /// # Safety
    /// See [`Region::from_raw_parts`].
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize, hasher: H) -> Result<Self, Error> {
        let region = Region::from_raw_parts(ptr, len)?;
        Ok(SharedTable { region, hasher })
    }

    fn arr(&self) -> SlotArray {
        let h = self.region.header();
        SlotArray {
            base: self.region.base_mut_ptr(),
            capacity: h.capacity,
            key_cap: h.key_cap,
            value_cap: h.value_cap,
        }
    }

    fn gate(&self) -> GlobalGate<'_> {
        GlobalGate::new(&self.region.header().global_gate)
    }

    /// Upsert `key -> value`.
    pub fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.set_opt(key, value, Options::default())
    }

    pub fn set_opt(&self, key: &str, value: &str, opts: Options) -> Result<(), Error> {
        let _guard = (!opts.lock_write).then(|| self.gate().acquire_shared());
        chain::insert(self.arr(), self.region.header(), &self.hasher, key, value)
    }

    /// Look up `key`. Never fails; returns `None` on a transient empty
    /// chain as well as a genuine miss.
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_opt(key, Options::default())
    }

    pub fn get_opt(&self, key: &str, opts: Options) -> Option<String> {
        let _guard = (!opts.lock_write).then(|| self.gate().acquire_shared());
        match chain::lookup(self.arr(), &self.hasher, key) {
            Ok(Some((_, value))) => Some(value),
            _ => None,
        }
    }

    /// Same lookup as [`Self::get`], discarding the value.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Delete `key`. No-op if absent. Triggers rechaining.
    pub fn delete(&self, key: &str) -> Result<(), Error> {
        self.delete_opt(key, Options::default())
    }

    pub fn delete_opt(&self, key: &str, opts: Options) -> Result<(), Error> {
        let _shared_guard = (!opts.lock_write).then(|| self.gate().acquire_shared());

        let unlink = match chain::delete(self.arr(), self.region.header(), &self.hasher, key)? {
            Some(u) => u,
            None => return Ok(()), // absent: no-op
        };

        // Rechaining is its own critical section requiring the global
        // gate exclusively. If the caller already holds the gate
        // exclusively via lock_write, it's already exclusive and we
        // rechain directly; otherwise drop the shared hold and escalate.
        if opts.lock_write {
            chain::rechain(self.arr(), self.region.header(), &self.hasher, &unlink);
        } else {
            drop(_shared_guard);
            let _exclusive = self.gate().acquire_exclusive();
            chain::rechain(self.arr(), self.region.header(), &self.hasher, &unlink);
        }

        Ok(())
    }

    /// A lazy, finite, weakly-consistent cursor over the table's keys:
    /// no line lock is held between yields, but the global gate is held
    /// shared for the cursor's whole lifetime, which is what actually
    /// serializes a traversal against a concurrent `clear()`.
    pub fn keys(&self) -> KeysCursor<'_> {
        let gate = self.gate().acquire_shared();
        KeysCursor::new(self.arr(), gate)
    }

    /// Apply `f` to each `(key, value)` pair under a per-entry shared
    /// line lock, with the global gate held shared for the whole call —
    /// this is what serializes the traversal against a concurrent
    /// `clear()`. Do not call back into this table from `f` without
    /// [`Options::caller_holds_lock_write`] threaded through — it will
    /// deadlock against the held line lock otherwise.
    pub fn map<R>(&self, f: impl FnMut(&str, &str) -> R) -> Vec<R> {
        let _guard = self.gate().acquire_shared();
        traversal::map(self.arr(), f)
    }

    /// Fold over the table's entries, per-entry atomic exactly like
    /// [`Self::map`].
    pub fn reduce<A>(&self, init: A, f: impl FnMut(A, &str, &str) -> A) -> A {
        let _guard = self.gate().acquire_shared();
        traversal::reduce(self.arr(), init, f)
    }

    /// Acquire the global gate exclusively. Must be paired with
    /// [`Self::unlock_write`] — there is no automatic release. A
    /// re-entrant acquisition from the same caller without the
    /// `lock_write` option set on the inner calls would deadlock.
    pub fn lock_write(&self) {
        self.gate().acquire_exclusive_manual();
    }

    /// Release the exclusive global gate taken by [`Self::lock_write`].
    pub fn unlock_write(&self) {
        self.gate().release_exclusive_manual();
    }

    /// Empty the table. Implies the exclusive gate.
    pub fn clear(&self) {
        let _guard = self.gate().acquire_exclusive();
        let arr = self.arr();
        let header = self.region.header();
        tracing::debug!(size = header.size.load(Ordering::Acquire), "clearing table");
        let invalid = crate::layout::invalid_for(header.capacity);

        for idx in 0..header.capacity {
            let lock = arr.lock(idx);
            lock.acquire_exclusive(std::time::Duration::from_secs(1));
            // Safety: exclusive global gate means no other operation can
            // be touching any slot concurrently; the per-slot exclusive
            // acquire above is a formality that always succeeds.
            unsafe {
                let slot = &mut *(arr.base.add(
                    crate::layout::slots_offset()
                        + idx as usize * crate::layout::slot_size(arr.key_cap, arr.value_cap),
                ) as *mut crate::layout::SlotHeader);
                slot.key_len = 0;
                slot.value_len = 0;
                slot.next = invalid;
            }
            lock.release_exclusive();
        }

        header.size.store(0, Ordering::Release);
        header.free_cursor.store(0, Ordering::Release);
    }

    /// Current size (snapshot, unlocked).
    pub fn length(&self) -> usize {
        self.region.header().size.load(Ordering::Acquire) as usize
    }

    /// Hash `key` with this table's hasher.
    pub fn hash(&self, key: &str) -> u32 {
        self.hasher.hash(key, self.region.header().capacity)
    }
}

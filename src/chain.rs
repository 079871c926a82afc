//! Chain engine: coalesced chaining without a separate cellar.
//!
//! Each key's *home slot* is `hash(key)`. If a new key's home is occupied
//! by an entry belonging to a different chain, that entry is evicted to a
//! free slot and the new key takes its home. If the home belongs to this
//! key's own chain, the new entry is appended as the chain's tail. This
//! module implements the pure slot-array algorithm; the surrounding
//! global-gate acquisition lives in `table.rs`, but the
//! per-slot line locking is interleaved here because the two can't be
//! cleanly separated — you can't know which slot to lock next until
//! you've read the one before it.

use std::sync::atomic::Ordering;

use crate::error::Error;
use crate::hash::TableHasher;
use crate::layout::{self, Header, SlotHeader};
use crate::lock::{LineLock, RetryBudget, LINE_LOCK_TIMEOUT};

/// Skip rechaining past this fill ratio. Correctness doesn't depend on
/// the threshold (invariant 4 holds either way); it only trades a longer
/// chain for a cheaper delete near capacity.
pub const RECHAIN_SKIP_FILL_RATIO: f64 = 0.95;

/// A raw view over one table's slot array, with the accessors the chain
/// engine needs. Does not own the memory — `base` must outlive `self`.
#[derive(Clone, Copy)]
pub struct SlotArray {
    pub base: *mut u8,
    pub capacity: u32,
    pub key_cap: u32,
    pub value_cap: u32,
}

impl SlotArray {
    fn slot_size(&self) -> usize {
        layout::slot_size(self.key_cap, self.value_cap)
    }

    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        unsafe {
            self.base
                .add(layout::slots_offset() + idx as usize * self.slot_size())
        }
    }

    fn header(&self, idx: u32) -> &SlotHeader {
        unsafe { &*(self.slot_ptr(idx) as *const SlotHeader) }
    }

    fn header_mut(&self, idx: u32) -> &mut SlotHeader {
        unsafe { &mut *(self.slot_ptr(idx) as *mut SlotHeader) }
    }

    fn key_cells(&self, idx: u32) -> &[u16] {
        let p = unsafe { self.slot_ptr(idx).add(layout::key_cell_offset()) as *const u16 };
        unsafe { std::slice::from_raw_parts(p, self.key_cap as usize) }
    }

    fn key_cells_mut(&self, idx: u32) -> &mut [u16] {
        let p = unsafe { self.slot_ptr(idx).add(layout::key_cell_offset()) as *mut u16 };
        unsafe { std::slice::from_raw_parts_mut(p, self.key_cap as usize) }
    }

    fn value_cells(&self, idx: u32) -> &[u16] {
        let p = unsafe {
            self.slot_ptr(idx)
                .add(layout::value_cell_offset(self.key_cap)) as *const u16
        };
        unsafe { std::slice::from_raw_parts(p, self.value_cap as usize) }
    }

    fn value_cells_mut(&self, idx: u32) -> &mut [u16] {
        let p = unsafe {
            self.slot_ptr(idx)
                .add(layout::value_cell_offset(self.key_cap)) as *mut u16
        };
        unsafe { std::slice::from_raw_parts_mut(p, self.value_cap as usize) }
    }

    fn invalid(&self) -> u32 {
        layout::invalid_for(self.capacity)
    }

    pub(crate) fn is_occupied(&self, idx: u32) -> bool {
        self.header(idx).key_len > 0
    }

    fn key_matches(&self, idx: u32, units: &[u16]) -> bool {
        let len = self.header(idx).key_len as usize;
        len == units.len() && &self.key_cells(idx)[..len] == units
    }

    fn read_key_units(&self, idx: u32) -> Vec<u16> {
        let len = self.header(idx).key_len as usize;
        self.key_cells(idx)[..len].to_vec()
    }

    fn read_value(&self, idx: u32) -> String {
        let len = self.header(idx).value_len as usize;
        String::from_utf16_lossy(&self.value_cells(idx)[..len])
    }

    /// Read the key at `idx` as a `String`. Caller must hold at least a
    /// shared line lock on `idx`.
    pub(crate) fn read_key_string(&self, idx: u32) -> String {
        String::from_utf16_lossy(&self.read_key_units(idx))
    }

    /// Read the value at `idx` as a `String`. Caller must hold at least a
    /// shared line lock on `idx`.
    pub(crate) fn read_value_string(&self, idx: u32) -> String {
        self.read_value(idx)
    }

    pub(crate) fn lock(&self, idx: u32) -> LineLock<'_> {
        LineLock::new(unsafe { &(*(self.slot_ptr(idx) as *const SlotHeader)).lock })
    }
}

fn encode(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Validate key/value sizes against the table's K/V capacities.
pub fn check_sizes(arr: &SlotArray, key_units: &[u16], value_units: &[u16]) -> Result<(), Error> {
    if key_units.is_empty() {
        return Err(Error::InvalidKey);
    }
    if key_units.len() > arr.key_cap as usize {
        return Err(Error::KeyTooLong {
            len: key_units.len(),
            cap: arr.key_cap,
        });
    }
    if value_units.len() > arr.value_cap as usize {
        return Err(Error::ValueTooLong {
            len: value_units.len(),
            cap: arr.value_cap,
        });
    }
    Ok(())
}

/// Lookup: follow the chain starting at `home = hash(key)`. A chain is
/// "this key's chain" iff the home slot's own home equals `home`; if
/// home is occupied by a usurping different chain, the key is absent.
///
/// Acquires at most one shared line lock at a time, released before
/// advancing to the next.
pub fn lookup<H: TableHasher>(
    arr: SlotArray,
    hasher: &H,
    key: &str,
) -> Result<Option<(u32, String)>, Error> {
    let units = encode(key);
    if units.is_empty() {
        return Err(Error::InvalidKey);
    }
    let home = hasher.hash(key, arr.capacity);

    let mut budget = RetryBudget::new();
    loop {
        match try_lookup(arr, hasher, home, &units) {
            Some(found) => return Ok(found),
            None => {
                budget.retry()?;
            }
        }
    }
}

/// One attempt at a lookup walk. Returns `Some(None)` for a definitive
/// "not found", `Some(Some(..))` for a hit, or `None` if a line lock
/// acquisition timed out and the caller should retry.
fn try_lookup<H: TableHasher>(
    arr: SlotArray,
    hasher: &H,
    home: u32,
    units: &[u16],
) -> Option<Option<(u32, String)>> {
    let lock = arr.lock(home);
    if !lock.acquire_shared(LINE_LOCK_TIMEOUT) {
        return None;
    }
    if !arr.is_occupied(home) {
        lock.release_shared();
        return Some(None);
    }
    if hasher.hash(&String::from_utf16_lossy(&arr.read_key_units(home)), arr.capacity) != home {
        // home usurped by a different chain: this key is not present.
        lock.release_shared();
        return Some(None);
    }

    let mut cur = home;
    loop {
        if arr.key_matches(cur, units) {
            let value = arr.read_value(cur);
            arr.lock(cur).release_shared();
            return Some(Some((cur, value)));
        }
        let next = arr.header(cur).next;
        if next == arr.invalid() {
            arr.lock(cur).release_shared();
            return Some(None);
        }
        let next_lock = arr.lock(next);
        if !next_lock.acquire_shared(LINE_LOCK_TIMEOUT) {
            arr.lock(cur).release_shared();
            return None;
        }
        arr.lock(cur).release_shared();
        cur = next;
    }
}

/// Find a free slot via the rotating cursor, wrapping once. Caller must
/// hold the global gate; the cursor update itself is a single atomic
/// increment and is advisory only. The scan itself is unlocked, so the
/// slot it returns is only a candidate — two concurrent inserts on
/// different home chains can both land on the same candidate, which is
/// why every call site must re-check occupancy after taking the
/// candidate's exclusive line lock and retry the whole operation if it
/// lost the race.
fn allocate_free_slot(arr: SlotArray, header: &Header) -> Option<u32> {
    let start = header.free_cursor.load(Ordering::Relaxed) % arr.capacity.max(1);
    for i in 0..arr.capacity {
        let idx = (start + i) % arr.capacity;
        if !arr.is_occupied(idx) {
            header
                .free_cursor
                .store((idx + 1) % arr.capacity.max(1), Ordering::Relaxed);
            return Some(idx);
        }
    }
    None
}

/// Insert/upsert `key -> value`. Takes exclusive line locks on at most two
/// slots at a time: the predecessor/home and the slot being written.
pub fn insert<H: TableHasher>(
    arr: SlotArray,
    header: &Header,
    hasher: &H,
    key: &str,
    value: &str,
) -> Result<(), Error> {
    let key_units = encode(key);
    let value_units = encode(value);
    check_sizes(&arr, &key_units, &value_units)?;
    let home = hasher.hash(key, arr.capacity);

    let mut budget = RetryBudget::new();
    loop {
        match try_insert(arr, header, hasher, home, &key_units, &value_units) {
            Ok(Some(())) => return Ok(()),
            Ok(None) => {
                budget.retry()?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_insert<H: TableHasher>(
    arr: SlotArray,
    header: &Header,
    hasher: &H,
    home: u32,
    key_units: &[u16],
    value_units: &[u16],
) -> Result<Option<()>, Error> {
    let home_lock = arr.lock(home);
    if !home_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
        return Ok(None);
    }

    if !arr.is_occupied(home) {
        write_slot_fresh(arr, home, key_units, value_units, arr.invalid());
        header.size.fetch_add(1, Ordering::AcqRel);
        home_lock.release_exclusive();
        return Ok(Some(()));
    }

    let occupant_home = hasher.hash(
        &String::from_utf16_lossy(&arr.read_key_units(home)),
        arr.capacity,
    );

    if occupant_home != home {
        // Eviction: the occupant belongs to a different chain. Move it to
        // a free slot and fix up its predecessor's `next`, then install
        // the new key at `home`.
        let free = match allocate_free_slot(arr, header) {
            Some(f) => f,
            None => {
                tracing::debug!(capacity = arr.capacity, "insert failed: table full");
                home_lock.release_exclusive();
                return Err(Error::TableFull);
            }
        };
        let free_lock = arr.lock(free);
        if !free_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
            home_lock.release_exclusive();
            return Ok(None);
        }
        if arr.is_occupied(free) {
            // Another insert on a different home chain claimed this slot
            // between the unlocked scan and our exclusive acquire. Retry
            // the whole operation rather than clobber it.
            free_lock.release_exclusive();
            home_lock.release_exclusive();
            return Ok(None);
        }

        // Relink the evicted occupant's predecessor (found by walking its
        // own home's chain) to point at `free` instead of `home`.
        if !relink_predecessor(arr, occupant_home, home, free) {
            free_lock.release_exclusive();
            home_lock.release_exclusive();
            return Ok(None);
        }

        let occ_header = arr.header(home);
        let occ_key_units = arr.read_key_units(home);
        let occ_value_units = {
            let len = occ_header.value_len as usize;
            arr.value_cells(home)[..len].to_vec()
        };
        let occ_next = occ_header.next;
        write_slot_fresh(arr, free, &occ_key_units, &occ_value_units, occ_next);
        free_lock.release_exclusive();

        write_slot_fresh(arr, home, key_units, value_units, arr.invalid());
        header.size.fetch_add(1, Ordering::AcqRel);
        home_lock.release_exclusive();
        return Ok(Some(()));
    }

    // `home`'s chain is this key's chain: walk it, holding at most two
    // exclusive line locks (predecessor + current) at a time.
    let mut prev = home;
    let mut prev_lock_held = true; // we already hold `home`'s lock
    loop {
        if arr.key_matches(prev, key_units) {
            // Overwrite value in place; no size change.
            let slot = arr.header_mut(prev);
            slot.value_len = value_units.len() as u32;
            arr.value_cells_mut(prev)[..value_units.len()].copy_from_slice(value_units);
            arr.lock(prev).release_exclusive();
            return Ok(Some(()));
        }

        let next = arr.header(prev).next;
        if next == arr.invalid() {
            // Append a new tail.
            let free = match allocate_free_slot(arr, header) {
                Some(f) => f,
                None => {
                    tracing::debug!(capacity = arr.capacity, "insert failed: table full");
                    arr.lock(prev).release_exclusive();
                    return Err(Error::TableFull);
                }
            };
            let free_lock = arr.lock(free);
            if !free_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
                arr.lock(prev).release_exclusive();
                return Ok(None);
            }
            if arr.is_occupied(free) {
                // Claimed by a concurrent insert on another home chain
                // since the unlocked scan found it free. Retry.
                free_lock.release_exclusive();
                arr.lock(prev).release_exclusive();
                return Ok(None);
            }
            write_slot_fresh(arr, free, key_units, value_units, arr.invalid());
            arr.header_mut(prev).next = free;
            free_lock.release_exclusive();
            arr.lock(prev).release_exclusive();
            header.size.fetch_add(1, Ordering::AcqRel);
            return Ok(Some(()));
        }

        let next_lock = arr.lock(next);
        if !next_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
            if prev_lock_held {
                arr.lock(prev).release_exclusive();
            }
            return Ok(None);
        }
        arr.lock(prev).release_exclusive();
        prev_lock_held = true;
        prev = next;
    }
}

/// Walk the chain rooted at `chain_home` to find the slot whose `next`
/// currently points at `old_target`, and repoint it at `new_target`.
/// Returns `false` if a line lock timed out mid-walk (caller retries the
/// whole operation).
///
/// Only called for the eviction path, where `chain_home` is the evicted
/// occupant's own home and `old_target` is the slot it's being moved out
/// of — by construction `chain_home != old_target` (the occupant belongs
/// to a *different* chain than the one rooted at `old_target`).
fn relink_predecessor(arr: SlotArray, chain_home: u32, old_target: u32, new_target: u32) -> bool {
    let mut cur = chain_home;
    loop {
        let cur_lock = arr.lock(cur);
        if !cur_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
            return false;
        }
        let next = arr.header(cur).next;
        if next == old_target {
            arr.header_mut(cur).next = new_target;
            cur_lock.release_exclusive();
            return true;
        }
        cur_lock.release_exclusive();
        if next == arr.invalid() {
            return true; // shouldn't happen; defensively stop
        }
        cur = next;
    }
}

fn write_slot_fresh(arr: SlotArray, idx: u32, key_units: &[u16], value_units: &[u16], next: u32) {
    let slot = arr.header_mut(idx);
    slot.key_len = key_units.len() as u32;
    slot.value_len = value_units.len() as u32;
    slot.next = next;
    arr.key_cells_mut(idx)[..key_units.len()].copy_from_slice(key_units);
    arr.value_cells_mut(idx)[..value_units.len()].copy_from_slice(value_units);
}

/// Delete `key`. Returns `true` if a key was removed. The unlink step
/// takes exclusive line locks like `insert`; the rechaining step is a
/// separate critical section requiring the global gate exclusively (the
/// caller in `table.rs` handles that escalation).
pub fn delete<H: TableHasher>(
    arr: SlotArray,
    header: &Header,
    hasher: &H,
    key: &str,
) -> Result<Option<DeleteUnlink>, Error> {
    let units = encode(key);
    if units.is_empty() {
        return Err(Error::InvalidKey);
    }
    let home = hasher.hash(key, arr.capacity);

    let mut budget = RetryBudget::new();
    loop {
        match try_delete_unlink(arr, header, hasher, home, &units) {
            Some(result) => return Ok(result),
            None => budget.retry()?,
        }
    }
}

/// Result of unlinking a deleted slot: `rechain_from` is the slot (if
/// any) that should be checked by the optional rechain pass, and
/// `link_pred` is whichever slot's `next` field currently points at it —
/// the one pointer the rechain pass may need to rewrite if `rechain_from`
/// itself turns out to migrate.
pub struct DeleteUnlink {
    pub rechain_from: u32,
    pub link_pred: u32,
}

fn try_delete_unlink<H: TableHasher>(
    arr: SlotArray,
    header: &Header,
    hasher: &H,
    home: u32,
    units: &[u16],
) -> Option<Option<DeleteUnlink>> {
    let home_lock = arr.lock(home);
    if !home_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
        return None;
    }
    if !arr.is_occupied(home) {
        home_lock.release_exclusive();
        return Some(None);
    }
    if hasher.hash(&String::from_utf16_lossy(&arr.read_key_units(home)), arr.capacity) != home {
        home_lock.release_exclusive();
        return Some(None);
    }

    if arr.key_matches(home, units) {
        // Deleting the home slot itself: every other member of this
        // chain shares the same home (invariant 3), so if we simply
        // cleared `home` the rest of the chain would become unreachable
        // (invariant 4 is defined relative to each key's home slot).
        // The immediate successor must be promoted into `home` — this
        // single hop is mandatory, not part of the skippable rechain
        // pass (e.g. colliding keys "a" then "b" both hashing to slot 0:
        // deleting "a" must leave "b" rechained into slot 0).
        let old_next = arr.header(home).next;
        if old_next == arr.invalid() {
            clear_slot(arr, home);
            header.size.fetch_sub(1, Ordering::AcqRel);
            home_lock.release_exclusive();
            return Some(Some(DeleteUnlink {
                rechain_from: arr.invalid(),
                link_pred: home,
            }));
        }

        let next_lock = arr.lock(old_next);
        if !next_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
            home_lock.release_exclusive();
            return None;
        }
        let promoted_key = arr.read_key_units(old_next);
        let promoted_value_len = arr.header(old_next).value_len as usize;
        let promoted_value = arr.value_cells(old_next)[..promoted_value_len].to_vec();
        let promoted_next = arr.header(old_next).next;
        write_slot_fresh(arr, home, &promoted_key, &promoted_value, promoted_next);
        clear_slot(arr, old_next);
        next_lock.release_exclusive();

        header.size.fetch_sub(1, Ordering::AcqRel);
        home_lock.release_exclusive();
        return Some(Some(DeleteUnlink {
            rechain_from: promoted_next,
            link_pred: home,
        }));
    }

    let mut prev = home;
    loop {
        let next = arr.header(prev).next;
        if next == arr.invalid() {
            arr.lock(prev).release_exclusive();
            return Some(None); // not found
        }
        let next_lock = arr.lock(next);
        if !next_lock.acquire_exclusive(LINE_LOCK_TIMEOUT) {
            arr.lock(prev).release_exclusive();
            return None;
        }

        if arr.key_matches(next, units) {
            // A middle/tail deletion never breaks invariant 4: `home`
            // stays occupied, so no promotion is needed — just unlink.
            let removed = next;
            let removed_next = arr.header(removed).next;
            arr.header_mut(prev).next = removed_next;
            clear_slot(arr, removed);
            header.size.fetch_sub(1, Ordering::AcqRel);
            next_lock.release_exclusive();
            arr.lock(prev).release_exclusive();
            return Some(Some(DeleteUnlink {
                rechain_from: removed_next,
                link_pred: prev,
            }));
        }

        arr.lock(prev).release_exclusive();
        // `next_lock` stays exclusively held (the atomic word itself
        // records that) as we advance `prev` to it.
        prev = next;
    }
}

fn clear_slot(arr: SlotArray, idx: u32) {
    let slot = arr.header_mut(idx);
    slot.key_len = 0;
    slot.value_len = 0;
    slot.next = arr.invalid();
}

/// Best-effort rechaining: walk the chain downstream of a deletion,
/// migrating any entry whose home is now empty back into that home slot.
/// Must be called with the global gate held exclusively.
///
/// The one case required for correctness — promoting a home slot's
/// immediate successor when the home itself was deleted — already
/// happened inline during unlinking, under the home slot's own exclusive
/// line lock, because deferring it would leave the home slot visibly
/// empty to concurrent lookups/inserts racing in before this exclusive
/// pass ever runs. Everything this function finds beyond that is
/// defense-in-depth: under invariant 3 every member of one chain shares
/// the same home, so a downstream entry's home is never empty here
/// unless something upstream has already diverged from that invariant.
///
/// Skipped above [`RECHAIN_SKIP_FILL_RATIO`] fill as a documented
/// performance tradeoff; the chain is left long but every invariant
/// still holds.
pub fn rechain<H: TableHasher>(arr: SlotArray, header: &Header, hasher: &H, unlink: &DeleteUnlink) {
    let size = header.size.load(Ordering::Acquire);
    let fill_ratio = size as f64 / arr.capacity.max(1) as f64;
    if fill_ratio > RECHAIN_SKIP_FILL_RATIO {
        tracing::trace!(fill_ratio, "skipping rechain pass near capacity");
        return;
    }

    let mut cur = unlink.rechain_from;
    let mut upstream = unlink.link_pred;
    while cur != arr.invalid() {
        let cur_key = arr.read_key_units(cur);
        let cur_home = hasher.hash(&String::from_utf16_lossy(&cur_key), arr.capacity);
        let next = arr.header(cur).next;

        if !arr.is_occupied(cur_home) && cur_home != cur {
            // Splice `cur` out of its current position and move it into
            // its home. Never write `next = self` (invariant 5).
            let cur_value_len = arr.header(cur).value_len as usize;
            let cur_value = arr.value_cells(cur)[..cur_value_len].to_vec();
            let cur_next = next;

            // Unlink `cur` from upstream.
            if upstream != cur {
                arr.header_mut(upstream).next = if cur_next == cur_home { cur_home } else { cur_next };
            }

            let new_next = if cur_next == cur_home { arr.invalid() } else { cur_next };
            write_slot_fresh(arr, cur_home, &cur_key, &cur_value, new_next);
            clear_slot(arr, cur);

            upstream = cur_home;
            cur = new_next;
        } else {
            upstream = cur;
            cur = next;
        }
    }
}

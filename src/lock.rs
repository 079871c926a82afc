//! Lock manager: a global readers–writer gate plus per-slot line locks,
//! with bounded-timeout deadlock detection and release-and-retry recovery.
//!
//! Two tiers:
//!
//! - The **global gate** (`GlobalGate`) is shared-mode for `get`/`set`/
//!   `delete`/traversal steps (many concurrent holders) and exclusive-mode
//!   for `lockWrite`/`clear`/delete's rechaining critical section (one
//!   holder, blocks new shared acquisitions).
//! - **Line locks** (`LineLock`) are per-slot shared/exclusive locks taken
//!   incrementally while walking a chain.
//!
//! Suspension on contention uses a futex-style wait on Linux
//! (`libc::syscall(SYS_futex, ...)`, the same direct-syscall idiom used
//! elsewhere in this corpus for non-pthread synchronization primitives)
//! with a spin/backoff fallback on other targets.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::Error;

/// Per-acquisition timeout before a contended lock is treated as a
/// potential deadlock and the whole operation restarts.
pub const LINE_LOCK_TIMEOUT: Duration = Duration::from_millis(2);

/// Upper bound on the randomized backoff between restarts.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(8);

/// Number of restarts an operation may make before surfacing
/// [`Error::Deadlock`] to the caller.
pub const MAX_RETRIES: u32 = 64;

/// Block the calling thread until `word` no longer equals `expected`, or
/// `timeout` elapses. Returns `true` if the value changed, `false` on
/// timeout.
#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicI32, expected: i32, timeout: Duration) -> bool {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as i64,
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0,
        );
    }
    word.load(Ordering::Acquire) != expected
}

/// Wake any threads blocked in `futex_wait` on `word`.
#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicI32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0,
        );
    }
}

/// Non-Linux fallback: short spin/sleep loop. There is no portable
/// process-shared futex outside Linux, so contention here costs a little
/// more latency rather than a true park/unpark.
#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicI32, expected: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if word.load(Ordering::Acquire) != expected {
            return true;
        }
        std::thread::yield_now();
    }
    word.load(Ordering::Acquire) != expected
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicI32) {}

/// Randomized backoff before an operation restarts after a timed-out
/// acquisition, bounding live-lock between two operations perpetually
/// contending for each other's slots.
pub fn backoff(attempt: u32) {
    let capped = attempt.min(6);
    let upper = (MAX_RETRY_BACKOFF.as_micros() as u64).saturating_mul(1 << capped).min(
        MAX_RETRY_BACKOFF.as_micros() as u64 * 64,
    );
    let micros = rand::thread_rng().gen_range(0..=upper.max(1));
    std::thread::sleep(Duration::from_micros(micros));
}

/// Tracks restart attempts for one logical operation and turns an
/// exhausted retry budget into [`Error::Deadlock`].
pub struct RetryBudget {
    attempt: u32,
}

impl RetryBudget {
    pub fn new() -> Self {
        RetryBudget { attempt: 0 }
    }

    /// Call after a failed acquisition. Backs off, then returns `Ok(())` to
    /// retry or `Err(Error::Deadlock)` once the budget is exhausted.
    pub fn retry(&mut self) -> Result<(), Error> {
        self.attempt += 1;
        if self.attempt > MAX_RETRIES {
            tracing::warn!(attempts = self.attempt, "giving up after repeated line-lock contention");
            return Err(Error::Deadlock {
                retries: self.attempt,
            });
        }
        if self.attempt % 8 == 0 {
            tracing::debug!(attempt = self.attempt, "retrying operation after line-lock timeout");
        }
        backoff(self.attempt);
        Ok(())
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-slot line lock: `0` unlocked, `>0` writer-held (always `1`, a
/// single exclusive holder), `<0` shared-readers count (`-n` for `n`
/// concurrent readers).
pub struct LineLock<'a> {
    word: &'a AtomicI32,
}

impl<'a> LineLock<'a> {
    pub fn new(word: &'a AtomicI32) -> Self {
        LineLock { word }
    }

    fn try_shared(&self) -> bool {
        let mut cur = self.word.load(Ordering::Acquire);
        loop {
            if cur > 0 {
                return false; // writer-held
            }
            match self.word.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    fn try_exclusive(&self) -> bool {
        self.word
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire in shared mode, suspending on contention. Returns `false`
    /// once `timeout` has elapsed without success.
    pub fn acquire_shared(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_shared() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            futex_wait(self.word, self.word.load(Ordering::Relaxed), remaining.min(timeout));
            if Instant::now() >= deadline {
                return self.try_shared();
            }
        }
    }

    /// Acquire in exclusive mode, suspending on contention.
    pub fn acquire_exclusive(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_exclusive() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            futex_wait(self.word, self.word.load(Ordering::Relaxed), remaining.min(timeout));
            if Instant::now() >= deadline {
                return self.try_exclusive();
            }
        }
    }

    pub fn release_shared(&self) {
        self.word.fetch_add(1, Ordering::AcqRel);
        futex_wake(self.word);
    }

    pub fn release_exclusive(&self) {
        self.word.store(0, Ordering::Release);
        futex_wake(self.word);
    }
}

/// Roles the global gate distinguishes, with "writer" meaning an ordinary
/// `set`/`get`/`delete`/traversal-step caller, in deliberately inverted
/// terminology (the real mutual exclusion is against `lockWrite`/`clear`).
pub struct GlobalGate<'a> {
    word: &'a AtomicI32,
}

impl<'a> GlobalGate<'a> {
    pub fn new(word: &'a AtomicI32) -> Self {
        GlobalGate { word }
    }

    fn try_shared(&self) -> bool {
        let mut cur = self.word.load(Ordering::Acquire);
        loop {
            if cur < 0 {
                return false; // exclusive (lockWrite) held
            }
            match self.word.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Acquire shared mode, blocking until available. Ordinary operations
    /// never time out here — only line locks use bounded timeouts — since
    /// the gate is only ever held exclusively for the bounded duration of
    /// `lockWrite`/`clear`.
    pub fn acquire_shared(&self) -> SharedGateGuard<'a> {
        loop {
            if self.try_shared() {
                return SharedGateGuard { word: self.word };
            }
            futex_wait(self.word, self.word.load(Ordering::Relaxed), Duration::from_millis(5));
        }
    }

    pub fn acquire_exclusive(&self) -> ExclusiveGateGuard<'a> {
        loop {
            if self
                .word
                .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return ExclusiveGateGuard { word: self.word };
            }
            futex_wait(self.word, self.word.load(Ordering::Relaxed), Duration::from_millis(5));
        }
    }

    /// Acquire exclusive mode without returning an RAII guard, for
    /// `lockWrite`/`unlockWrite` — a caller-paired acquisition that spans
    /// arbitrary, non-lexically-scoped calls, which an RAII guard can't
    /// express.
    pub fn acquire_exclusive_manual(&self) {
        std::mem::forget(self.acquire_exclusive());
    }

    /// Release an exclusive hold taken via [`Self::acquire_exclusive_manual`].
    pub fn release_exclusive_manual(&self) {
        self.word.store(0, Ordering::Release);
        futex_wake(self.word);
    }
}

/// RAII guard releasing one shared hold on the global gate.
pub struct SharedGateGuard<'a> {
    word: &'a AtomicI32,
}

impl Drop for SharedGateGuard<'_> {
    fn drop(&mut self) {
        self.word.fetch_sub(1, Ordering::AcqRel);
        futex_wake(self.word);
    }
}

/// RAII guard releasing the exclusive hold on the global gate.
pub struct ExclusiveGateGuard<'a> {
    word: &'a AtomicI32,
}

impl Drop for ExclusiveGateGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
        futex_wake(self.word);
    }
}

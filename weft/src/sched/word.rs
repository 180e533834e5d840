//! The packed atomic scheduling word.
//!
//! A single 32-bit atomic holds the fields `entersyscall`/`exitsyscall`
//! need to decide whether they must coordinate with the scheduler, so the
//! common case is one atomic read-modify-write and no lock:
//!
//! ```text
//! [15 bits] mcpu      workers currently counted against the CPU cap
//! [15 bits] mcpumax   the cap
//! [ 1 bit ] waitstop  a stop-the-world coordinator waits on `stopped`
//! [ 1 bit ] gwaiting  the run queue is non-empty
//! ```
//!
//! Outside the syscall paths these fields change only under the scheduler
//! lock, so lock holders need only reason about what the two syscall
//! paths can do concurrently. The syscall paths read `mcpumax`,
//! `waitstop` and `gwaiting` but never write them.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::consts::MAX_WORKERS_CAP;

const MCPU_WIDTH: u32 = 15;
const MCPU_MASK: u32 = (1 << MCPU_WIDTH) - 1;
const MCPU_SHIFT: u32 = 0;
const MCPUMAX_SHIFT: u32 = MCPU_SHIFT + MCPU_WIDTH;
const WAITSTOP_SHIFT: u32 = MCPUMAX_SHIFT + MCPU_WIDTH;
const GWAITING_SHIFT: u32 = WAITSTOP_SHIFT + 1;

const _: () = assert!(MAX_WORKERS_CAP == MCPU_MASK - 10);

/// Field deltas for [`SchedWord::xadd`] / [`SchedWord::xsub`].
pub const MCPU_DELTA: u32 = 1 << MCPU_SHIFT;
pub const WAITSTOP_DELTA: u32 = 1 << WAITSTOP_SHIFT;
pub const GWAITING_DELTA: u32 = 1 << GWAITING_SHIFT;

pub fn mcpu(v: u32) -> u32 {
    (v >> MCPU_SHIFT) & MCPU_MASK
}

pub fn mcpumax(v: u32) -> u32 {
    (v >> MCPUMAX_SHIFT) & MCPU_MASK
}

pub fn waitstop(v: u32) -> bool {
    (v >> WAITSTOP_SHIFT) & 1 != 0
}

pub fn gwaiting(v: u32) -> bool {
    (v >> GWAITING_SHIFT) & 1 != 0
}

pub struct SchedWord(AtomicU32);

impl SchedWord {
    pub const fn new() -> SchedWord {
        SchedWord(AtomicU32::new(0))
    }

    pub fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn cas(&self, old: u32, new: u32) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Atomic add; returns the post-update word. The syscall fast paths
    /// must decide on this value, never on a stale pre-update read.
    pub fn xadd(&self, delta: u32) -> u32 {
        self.0
            .fetch_add(delta, Ordering::SeqCst)
            .wrapping_add(delta)
    }

    /// Atomic subtract; returns the post-update word.
    pub fn xsub(&self, delta: u32) -> u32 {
        self.0
            .fetch_sub(delta, Ordering::SeqCst)
            .wrapping_sub(delta)
    }

    /// Replace the `mcpumax` field.
    pub fn set_mcpumax(&self, n: u32) {
        loop {
            let v = self.load();
            let w = (v & !(MCPU_MASK << MCPUMAX_SHIFT)) | (n << MCPUMAX_SHIFT);
            if self.cas(v, w) {
                break;
            }
        }
    }

    /// Increment `mcpu` if it is below `mcpumax`. Reports success.
    pub fn can_add_mcpu(&self) -> bool {
        loop {
            let v = self.load();
            if mcpu(v) >= mcpumax(v) {
                return false;
            }
            if self.cas(v, v + (1 << MCPU_SHIFT)) {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_pack_independently() {
        let w = SchedWord::new();
        w.set_mcpumax(7);
        assert_eq!(mcpumax(w.load()), 7);
        assert_eq!(mcpu(w.load()), 0);
        assert!(!waitstop(w.load()));
        assert!(!gwaiting(w.load()));

        w.xadd(GWAITING_DELTA);
        assert!(gwaiting(w.load()));
        assert_eq!(mcpumax(w.load()), 7);

        w.xadd(WAITSTOP_DELTA);
        assert!(waitstop(w.load()));
        w.xsub(WAITSTOP_DELTA);
        assert!(!waitstop(w.load()));
        assert!(gwaiting(w.load()));

        w.xsub(GWAITING_DELTA);
        assert!(!gwaiting(w.load()));
    }

    #[test]
    fn can_add_mcpu_respects_cap() {
        let w = SchedWord::new();
        w.set_mcpumax(2);
        assert!(w.can_add_mcpu());
        assert!(w.can_add_mcpu());
        assert!(!w.can_add_mcpu());
        assert_eq!(mcpu(w.load()), 2);

        w.xsub(MCPU_DELTA);
        assert_eq!(mcpu(w.load()), 1);
        assert!(w.can_add_mcpu());
        assert!(!w.can_add_mcpu());
    }

    #[test]
    fn lowering_mcpumax_keeps_mcpu() {
        let w = SchedWord::new();
        w.set_mcpumax(4);
        for _ in 0..3 {
            assert!(w.can_add_mcpu());
        }
        w.set_mcpumax(1);
        assert_eq!(mcpu(w.load()), 3);
        assert_eq!(mcpumax(w.load()), 1);
        assert!(!w.can_add_mcpu());
    }

    #[test]
    fn underflow_is_detectable() {
        let w = SchedWord::new();
        w.set_mcpumax(1);
        let v = w.xsub(MCPU_DELTA);
        assert!(mcpu(v) > MAX_WORKERS_CAP);
    }
}

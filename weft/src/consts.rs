//! Stack geometry and scheduler limits.
//!
//! A stack segment is the byte range `[base, base + size)`. The segment
//! header sits at the high end and `stackguard = base + STACK_GUARD`;
//! frame growth must be requested before the stack pointer crosses the
//! guard. All invariants elsewhere are relational (`stackguard -
//! STACK_GUARD == stack0` and so on), so the concrete values here can be
//! tuned without touching the scheduler.

/// Per-OS slack added to every segment (signal frames etc.). Zero on the
/// platforms currently supported.
pub const STACK_SYSTEM: usize = 0;

/// Minimum segment size, and the size class cached per worker.
pub const STACK_MIN: usize = 64 * 0x400;

/// Bytes below which the stack pointer must not go without growing. The
/// grow machinery itself runs real frames inside this zone, so it is
/// sized generously.
pub const STACK_GUARD: usize = 16 * 0x400;

/// Extra headroom added to every allocated segment beyond the requested
/// frame, so small follow-on calls do not immediately grow again.
pub const STACK_EXTRA: usize = 8 * 0x400;

/// Cached segment size class.
pub const FIXED_STACK: usize = STACK_MIN + STACK_SYSTEM;

/// Segments of the fixed size class kept per worker before falling back
/// to the heap.
pub const STACK_CACHE_MAX: usize = 4;

/// Upper bound on the CPU cap. The scheduling word stores `mcpu` and
/// `mcpumax` in 15-bit fields; the top few values are reserved so that a
/// decrement past zero is detectable as an impossible count.
pub const MAX_WORKERS_CAP: u32 = (1 << 15) - 11;

/// Spawn copies the argument block onto the new task's stack; beyond this
/// it is treated as a caller error.
pub const SPAWN_ARGS_MAX: usize = STACK_MIN - 1024;

/// Cap on program counters collected per traceback.
pub const TRACE_PCS_MAX: usize = 100;

//! `get_tick`: nanoseconds since an arbitrary fixed epoch (process start),
//! used for report timestamps and transmission deadlines alike (§4.3).

use std::time::Instant;

use std::sync::OnceLock;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call to any `now_ns`/`get_tick` in this
/// process. Monotonic; not wall-clock time.
pub fn now_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Public alias matching the operation name in §4.3.
pub fn get_tick() -> u64 {
    now_ns()
}

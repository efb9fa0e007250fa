//! Kernel logging subsystem
//!
//! Routes kernel messages through the `log` facade and keeps the global
//! tick counter used for timestamps (shared-memory atime/ctime stamps only
//! need a monotonic clock, so they use it too).

use core::sync::atomic::{AtomicU64, Ordering};

/// Global tick counter for timestamps
static TICK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get current tick count as timestamp
pub fn get_timestamp() -> u64 {
    TICK_COUNTER.load(Ordering::Relaxed)
}

/// Alias for get_timestamp
pub fn get_ticks() -> u64 {
    get_timestamp()
}

/// Increment tick counter (called by the timer interrupt)
pub fn tick() {
    TICK_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Messages accepted by the fallback sink since boot
static ACCEPTED: AtomicU64 = AtomicU64::new(0);

/// Minimal `log::Log` sink. On hardware the platform layer installs its
/// serial-backed logger instead; this one only counts messages so hosted
/// runs keep a working facade.
pub struct KernelLog;

static KERNEL_LOG: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            ACCEPTED.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {}
}

/// Install the fallback logger. Safe to call more than once; later calls
/// lose the race and keep the first logger.
pub fn init() {
    let _ = log::set_logger(&KERNEL_LOG);
    log::set_max_level(log::LevelFilter::Debug);
}

/// Messages accepted by the fallback sink
pub fn accepted() -> u64 {
    ACCEPTED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let before = get_ticks();
        tick();
        tick();
        assert!(get_ticks() >= before + 2);
    }
}

use idempotency_common::now_ms;

/// Abstraction over current time, so tests can advance the clock without
/// sleeping. Mirrors the teacher's `Clock` trait, at millisecond precision
/// since lock leases are specified in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when explicitly advanced.
#[cfg(any(test, feature = "test-util"))]
pub struct MockClock(std::sync::atomic::AtomicU64);

#[cfg(any(test, feature = "test-util"))]
impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(start_ms))
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, value_ms: u64) {
        self.0.store(value_ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

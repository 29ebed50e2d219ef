//! Wall-clock time

/// Physical time source; the queue schedules retries against it
pub trait PhysicalTimeEffects: Send + Sync {
    /// Milliseconds since the unix epoch
    fn now_ms(&self) -> u64;
}

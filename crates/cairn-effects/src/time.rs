//! System clock

use cairn_core::effects::PhysicalTimeEffects;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock time from the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a system clock
    pub fn new() -> Self {
        Self
    }
}

impl PhysicalTimeEffects for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }
}

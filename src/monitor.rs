// src/monitor.rs - Consecutive communication failure accounting

/// Consecutive failures tolerated before the session must be rebuilt.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Counts consecutive I/O and protocol failures. Any successful round-trip
/// resets the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMonitor {
    consecutive: u32,
    threshold: u32,
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorMonitor {
    pub fn new() -> Self {
        Self::with_threshold(MAX_CONSECUTIVE_ERRORS)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self { consecutive: 0, threshold }
    }

    pub fn record(&mut self, success: bool) {
        if success {
            self.consecutive = 0;
        } else {
            self.consecutive = self.consecutive.saturating_add(1);
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// True once the count exceeds the threshold.
    pub fn should_reconnect(&self) -> bool {
        self.consecutive > self.threshold
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

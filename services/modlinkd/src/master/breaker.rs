//! Error budget for failed device polls
//!
//! With `N` devices, a reconnect multiplier `R` and a terminate multiplier
//! `T`:
//!
//! | failures        | verdict   |
//! |-----------------|-----------|
//! | `< R*N`         | tolerate  |
//! | `R*N ..< T*N`   | reconnect |
//! | `>= T*N`        | terminate |
//!
//! Any clean pass resets the count.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Tolerate,
    Reconnect,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct ErrorBudget {
    devices: u32,
    reconnect_multiplier: u32,
    terminate_multiplier: u32,
    failures: u32,
}

impl ErrorBudget {
    pub fn new(devices: usize, reconnect_multiplier: u32, terminate_multiplier: u32) -> Self {
        Self {
            devices: (devices as u32).max(1),
            reconnect_multiplier,
            terminate_multiplier,
            failures: 0,
        }
    }

    /// Count one failed device poll
    pub fn record_failure(&mut self) -> Verdict {
        self.failures = self.failures.saturating_add(1);
        self.verdict()
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn verdict(&self) -> Verdict {
        if self.failures >= self.devices.saturating_mul(self.terminate_multiplier) {
            Verdict::Terminate
        } else if self.failures >= self.devices.saturating_mul(self.reconnect_multiplier) {
            Verdict::Reconnect
        } else {
            Verdict::Tolerate
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_single_device() {
        let mut budget = ErrorBudget::new(1, 6, 12);
        for _ in 0..5 {
            assert_eq!(budget.record_failure(), Verdict::Tolerate);
        }
        assert_eq!(budget.record_failure(), Verdict::Reconnect);
        for _ in 6..11 {
            assert_eq!(budget.record_failure(), Verdict::Reconnect);
        }
        assert_eq!(budget.record_failure(), Verdict::Terminate);
        assert_eq!(budget.failures(), 12);
    }

    #[test]
    fn test_thresholds_scale_with_devices() {
        let mut budget = ErrorBudget::new(3, 6, 12);
        for _ in 0..17 {
            budget.record_failure();
        }
        assert_eq!(budget.verdict(), Verdict::Tolerate);
        assert_eq!(budget.record_failure(), Verdict::Reconnect);
        for _ in 18..35 {
            budget.record_failure();
        }
        assert_eq!(budget.verdict(), Verdict::Reconnect);
        assert_eq!(budget.record_failure(), Verdict::Terminate);
    }

    #[test]
    fn test_success_resets() {
        let mut budget = ErrorBudget::new(1, 6, 12);
        for _ in 0..7 {
            budget.record_failure();
        }
        budget.record_success();
        assert_eq!(budget.failures(), 0);
        assert_eq!(budget.verdict(), Verdict::Tolerate);
    }

    #[test]
    fn test_custom_multipliers() {
        let mut budget = ErrorBudget::new(2, 1, 2);
        assert_eq!(budget.record_failure(), Verdict::Tolerate);
        assert_eq!(budget.record_failure(), Verdict::Reconnect);
        budget.record_failure();
        assert_eq!(budget.record_failure(), Verdict::Terminate);
    }
}

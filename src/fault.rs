//! Named fault-injection sites.
//!
//! Each namespace carries its own set of armable sites; tests arm one
//! and the corresponding code path trips over it exactly once, letting
//! races, delays and interruptions be forced deterministically.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Observable fault sites.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultSite {
    /// Interrupt the completion wait before it parks.
    IntrCpAst = 0,
    /// Simulate a completion racing a blocking callback.
    CpBlRace = 1,
    /// Delay the cancel RPC by the configured pause.
    PauseCancel = 2,
    /// Short-circuit the cancel RPC as if it had been sent.
    CancelRace = 3,
}

const SITES: usize = 4;

/// Per-namespace armed-site state.
#[derive(Debug, Default)]
pub struct FaultState {
    armed: [AtomicBool; SITES],
    pause_ms: AtomicU64,
}

impl FaultState {
    /// Arms a site; the next check consumes it.
    pub fn arm(&self, site: FaultSite) {
        self.armed[site as usize].store(true, Ordering::SeqCst);
    }

    /// Arms the cancel pause with a duration in milliseconds.
    pub fn arm_pause(&self, ms: u64) {
        self.pause_ms.store(ms, Ordering::SeqCst);
        self.arm(FaultSite::PauseCancel);
    }

    /// One-shot check: true when the site was armed, disarming it.
    pub fn check_reset(&self, site: FaultSite) -> bool {
        self.armed[site as usize].swap(false, Ordering::SeqCst)
    }

    /// Consumes an armed cancel pause, returning the delay to apply.
    pub fn take_pause(&self) -> Option<std::time::Duration> {
        if self.check_reset(FaultSite::PauseCancel) {
            Some(std::time::Duration::from_millis(self.pause_ms.load(Ordering::SeqCst)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_consumes_the_arm() {
        let faults = FaultState::default();
        faults.arm(FaultSite::CancelRace);
        assert!(faults.check_reset(FaultSite::CancelRace));
        assert!(!faults.check_reset(FaultSite::CancelRace));
    }

    #[test]
    fn pause_reports_its_duration_once() {
        let faults = FaultState::default();
        faults.arm_pause(7);
        assert_eq!(faults.take_pause(), Some(std::time::Duration::from_millis(7)));
        assert_eq!(faults.take_pause(), None);
    }
}

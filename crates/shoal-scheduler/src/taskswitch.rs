//! Binary enable/disable gate for the scheduling loops.
//!
//! The switch starts disabled; loops block on it at every scheduling point
//! and the worker-facing surface fast-fails with a paused error while it is
//! off. Waiting is always bounded so shutdown stays responsive.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Enable/disable latch shared by the manager's loops and RPC surface.
#[derive(Default)]
pub struct TaskSwitch {
    enabled: Mutex<bool>,
    cond: Condvar,
}

impl TaskSwitch {
    /// A new switch, disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        *self.enabled.lock()
    }

    pub fn enable(&self) {
        let mut enabled = self.enabled.lock();
        *enabled = true;
        self.cond.notify_all();
    }

    pub fn disable(&self) {
        *self.enabled.lock() = false;
    }

    /// Block until the switch is enabled, up to `timeout`.
    ///
    /// Returns the switch state at return time.
    pub fn wait_enabled_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut enabled = self.enabled.lock();
        while !*enabled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cond.wait_for(&mut enabled, deadline - now);
        }
        *enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_disabled_and_toggles() {
        let switch = TaskSwitch::new();
        assert!(!switch.enabled());
        switch.enable();
        assert!(switch.enabled());
        switch.disable();
        assert!(!switch.enabled());
    }

    #[test]
    fn wait_times_out_while_disabled() {
        let switch = TaskSwitch::new();
        let started = Instant::now();
        assert!(!switch.wait_enabled_for(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_returns_immediately_when_enabled() {
        let switch = TaskSwitch::new();
        switch.enable();
        assert!(switch.wait_enabled_for(Duration::from_secs(10)));
    }

    #[test]
    fn enable_wakes_a_blocked_waiter() {
        let switch = Arc::new(TaskSwitch::new());
        let waiter = {
            let switch = Arc::clone(&switch);
            std::thread::spawn(move || switch.wait_enabled_for(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        switch.enable();
        assert!(waiter.join().expect("waiter thread"));
    }
}

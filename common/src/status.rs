use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// What the LED renderer should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    /// Fast red pulse while a factory reset is imminent.
    PendingReset,
    /// Slow blue pulse until the node has joined a network.
    Steering,
    Normal,
}

#[derive(Debug, Default)]
struct StatusFlags {
    reset_pending: AtomicBool,
    steering: AtomicBool,
}

/// Read side shared with the LED renderer. Only the lifecycle core flips the
/// flags; every clone observes the same values.
#[derive(Debug, Clone)]
pub struct StatusSurface {
    flags: Arc<StatusFlags>,
}

impl Default for StatusSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSurface {
    pub fn new() -> Self {
        let flags = StatusFlags::default();
        flags.steering.store(true, Ordering::Relaxed);
        Self {
            flags: Arc::new(flags),
        }
    }

    pub fn reset_pending(&self) -> bool {
        self.flags.reset_pending.load(Ordering::Acquire)
    }

    pub fn steering(&self) -> bool {
        self.flags.steering.load(Ordering::Acquire)
    }

    pub fn led_pattern(&self) -> LedPattern {
        if self.reset_pending() {
            LedPattern::PendingReset
        } else if self.steering() {
            LedPattern::Steering
        } else {
            LedPattern::Normal
        }
    }

    /// One-way: only a device restart clears the flag.
    pub(crate) fn mark_reset_pending(&self) {
        self.flags.reset_pending.store(true, Ordering::Release);
    }

    pub(crate) fn set_steering(&self, steering: bool) {
        self.flags.steering.store(steering, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_flags() {
        let status = StatusSurface::new();
        let renderer = status.clone();
        assert_eq!(renderer.led_pattern(), LedPattern::Steering);

        status.set_steering(false);
        assert_eq!(renderer.led_pattern(), LedPattern::Normal);

        status.mark_reset_pending();
        assert!(renderer.reset_pending());
        assert_eq!(renderer.led_pattern(), LedPattern::PendingReset);
    }
}

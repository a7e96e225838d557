//! Reboot-loop watchdog.
//!
//! Every boot bumps a persisted counter. Reaching the threshold schedules a
//! factory reset once the countdown elapses; otherwise the same countdown acts
//! as a stability window after which the counter is cleared.

use log::{error, info, warn};

use crate::{
    countdown::{CountdownTimer, TimerOwner},
    reset::ResetSource,
    status::StatusSurface,
    store::{read_or, update_u8, CounterStore, KEY_REBOOT_COUNT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    /// `on_boot` has not run yet.
    Idle,
    /// Counting down the stability window.
    Stabilizing,
    /// Threshold reached, reset fires when the countdown elapses.
    PendingReset,
    /// Stability window passed and the counter was cleared.
    Settled,
}

#[derive(Debug, Clone)]
pub struct RebootLoopWatchdog {
    threshold: u8,
    window_ms: u64,
    phase: WatchdogPhase,
}

impl RebootLoopWatchdog {
    pub fn new(threshold: u8, window_ms: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            window_ms,
            phase: WatchdogPhase::Idle,
        }
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.phase
    }

    pub fn reboot_count<S: CounterStore + ?Sized>(store: &S) -> u8 {
        read_or(store, KEY_REBOOT_COUNT, 0)
    }

    /// Runs once per boot. Returns true when a factory reset is now pending.
    pub fn on_boot<S: CounterStore + ?Sized>(
        &mut self,
        store: &mut S,
        timer: &mut CountdownTimer,
        status: &StatusSurface,
        now_ms: u64,
    ) -> bool {
        let count = Self::reboot_count(store).saturating_add(1);
        update_u8(store, KEY_REBOOT_COUNT, count);

        let pending = count >= self.threshold;
        if pending {
            warn!("reboot count reached {count}, factory reset pending");
            status.mark_reset_pending();
            update_u8(store, KEY_REBOOT_COUNT, 0);
            self.phase = WatchdogPhase::PendingReset;
        } else {
            info!("reboot count is {count}");
            self.phase = WatchdogPhase::Stabilizing;
        }

        if let Err(err) = timer.arm(TimerOwner::Watchdog, self.window_ms, now_ms) {
            error!("watchdog could not arm countdown: {err}");
        }

        pending
    }

    /// Handles expiry of the watchdog's countdown.
    pub fn on_countdown_elapsed<S: CounterStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Option<ResetSource> {
        match self.phase {
            WatchdogPhase::PendingReset => Some(ResetSource::RebootLoop),
            WatchdogPhase::Stabilizing => {
                info!("device stable, clearing reboot count");
                update_u8(store, KEY_REBOOT_COUNT, 0);
                self.phase = WatchdogPhase::Settled;
                None
            }
            WatchdogPhase::Idle | WatchdogPhase::Settled => None,
        }
    }

    pub fn clear_count<S: CounterStore + ?Sized>(store: &mut S) {
        update_u8(store, KEY_REBOOT_COUNT, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn boot(store: &mut MemoryStore, now_ms: u64) -> (RebootLoopWatchdog, CountdownTimer, bool) {
        let mut watchdog = RebootLoopWatchdog::new(3, 3_000);
        let mut timer = CountdownTimer::new();
        let pending = watchdog.on_boot(store, &mut timer, &StatusSurface::new(), now_ms);
        (watchdog, timer, pending)
    }

    #[test]
    fn single_clean_boot_never_resets() {
        let mut store = MemoryStore::new();
        let (mut watchdog, mut timer, pending) = boot(&mut store, 0);

        assert!(!pending);
        assert_eq!(store.get(KEY_REBOOT_COUNT), Some(1));
        assert_eq!(timer.poll_expired(3_000), Some(TimerOwner::Watchdog));
        assert_eq!(watchdog.on_countdown_elapsed(&mut store), None);
        assert_eq!(store.get(KEY_REBOOT_COUNT), Some(0));
        assert_eq!(watchdog.phase(), WatchdogPhase::Settled);
    }

    #[test]
    fn counts_unclean_boots_up_to_threshold() {
        let mut store = MemoryStore::new();

        for expected in 1..3 {
            let (_, _, pending) = boot(&mut store, 0);
            assert!(!pending);
            assert_eq!(store.get(KEY_REBOOT_COUNT), Some(expected));
        }

        let (mut watchdog, mut timer, pending) = boot(&mut store, 0);
        assert!(pending);
        assert_eq!(store.get(KEY_REBOOT_COUNT), Some(0));
        assert_eq!(timer.poll_expired(2_999), None);
        assert_eq!(timer.poll_expired(3_000), Some(TimerOwner::Watchdog));
        assert_eq!(
            watchdog.on_countdown_elapsed(&mut store),
            Some(ResetSource::RebootLoop)
        );
    }

    #[test]
    fn read_failure_counts_as_first_boot() {
        let mut store = MemoryStore::new().with_value(KEY_REBOOT_COUNT, 2);
        store.set_fail_reads(true);

        let (_, _, pending) = boot(&mut store, 0);

        assert!(!pending);
    }

    #[test]
    fn write_failure_keeps_booting() {
        let mut store = MemoryStore::new().with_value(KEY_REBOOT_COUNT, 1);
        store.set_fail_writes(true);

        let (mut watchdog, mut timer, pending) = boot(&mut store, 0);

        assert!(!pending);
        assert_eq!(timer.poll_expired(3_000), Some(TimerOwner::Watchdog));
        assert_eq!(watchdog.on_countdown_elapsed(&mut store), None);
        assert_eq!(store.get(KEY_REBOOT_COUNT), Some(1));
    }
}

use log::warn;

use crate::{
    attributes::{AttributeBridge, AttributeWrite},
    button::{ButtonHoldState, LongPressDetector},
    commissioning::CommissioningPolicy,
    config::{NodeConfig, PersistedSettings},
    countdown::{CountdownTimer, TimerOwner},
    error::{AttributeError, OtaError},
    ota::{FirmwareStore, OtaEvent, OtaOutcome, OtaStatus, OtaUpdater},
    reset::{FactoryResetTrigger, ResetSource},
    status::StatusSurface,
    store::CounterStore,
    types::{CommissioningSignal, CommissioningState, Level, NodeAction},
    watchdog::{RebootLoopWatchdog, WatchdogPhase},
};

/// Device lifecycle core: owns the persisted store, the shared countdown and
/// every state machine that can gate the boot path. All calls are expected
/// from one task; the runtime serializes access behind a mutex.
pub struct NodeLifecycle<S: CounterStore, F: FirmwareStore> {
    config: NodeConfig,
    store: S,
    timer: CountdownTimer,
    watchdog: RebootLoopWatchdog,
    button: LongPressDetector,
    trigger: FactoryResetTrigger,
    commissioning: CommissioningPolicy,
    ota: OtaUpdater<F>,
    attributes: AttributeBridge,
    status: StatusSurface,
}

impl<S: CounterStore, F: FirmwareStore> NodeLifecycle<S, F> {
    pub fn new(mut config: NodeConfig, store: S, firmware: F) -> Self {
        config.sanitize();
        let status = StatusSurface::new();
        let attributes = AttributeBridge::load(&store, config.endpoint);

        Self {
            watchdog: RebootLoopWatchdog::new(config.reset_threshold, config.reset_timeout_ms),
            button: LongPressDetector::new(config.reset_timeout_ms),
            trigger: FactoryResetTrigger::new(status.clone()),
            commissioning: CommissioningPolicy::new(config.time_sync_interval_ms, status.clone()),
            ota: OtaUpdater::new(firmware, config.ota.clone()),
            timer: CountdownTimer::new(),
            attributes,
            status,
            store,
            config,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn status(&self) -> StatusSurface {
        self.status.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn firmware(&self) -> &F {
        self.ota.firmware()
    }

    pub fn settings(&self) -> PersistedSettings {
        self.attributes.settings()
    }

    pub fn reboot_count(&self) -> u8 {
        RebootLoopWatchdog::reboot_count(&self.store)
    }

    pub fn watchdog_phase(&self) -> WatchdogPhase {
        self.watchdog.phase()
    }

    pub fn button_state(&self) -> ButtonHoldState {
        self.button.state()
    }

    pub fn countdown_owner(&self) -> Option<TimerOwner> {
        self.timer.owner()
    }

    pub fn commissioning_state(&self) -> CommissioningState {
        self.commissioning.state()
    }

    pub fn ota_status(&self) -> Option<OtaStatus> {
        self.ota.status()
    }

    pub fn reset_source(&self) -> Option<ResetSource> {
        self.trigger.fired()
    }

    /// Runs the reboot-loop watchdog. Must be the first call after power-up.
    /// Returns true when a factory reset is pending.
    pub fn boot(&mut self, now_ms: u64) -> bool {
        self.watchdog
            .on_boot(&mut self.store, &mut self.timer, &self.status, now_ms)
    }

    /// Reset button wake-up with the level sampled on the detector task.
    pub fn on_button(&mut self, level: Level, now_ms: u64) {
        self.button.on_wake(level, &mut self.timer, now_ms);
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();

        if let Some(owner) = self.timer.poll_expired(now_ms) {
            let source = match owner {
                TimerOwner::Watchdog => self.watchdog.on_countdown_elapsed(&mut self.store),
                TimerOwner::Button => Some(ResetSource::LongPress),
            };
            if let Some(source) = source {
                self.fire_reset(source, &mut actions);
            }
        }

        self.button.on_timer_free(&mut self.timer, now_ms);
        actions.extend(self.commissioning.tick(now_ms));
        actions
    }

    pub fn on_commissioning_signal(
        &mut self,
        signal: CommissioningSignal,
        now_ms: u64,
    ) -> Vec<NodeAction> {
        let mut actions = Vec::new();

        match signal {
            CommissioningSignal::FirstStart { status } | CommissioningSignal::Reboot { status }
                if !status.is_ok() =>
            {
                RebootLoopWatchdog::clear_count(&mut self.store);
            }
            _ if CommissioningPolicy::is_leave_reset(&signal) => {
                self.fire_reset(ResetSource::NetworkLeave, &mut actions);
                return actions;
            }
            _ => {}
        }

        actions.extend(self.commissioning.on_signal(signal, now_ms));
        actions
    }

    pub fn on_ota_event(&mut self, event: OtaEvent<'_>) -> Result<OtaOutcome, OtaError> {
        self.ota.handle(event)
    }

    pub fn on_attribute_write(
        &mut self,
        write: AttributeWrite,
    ) -> Result<Option<NodeAction>, AttributeError> {
        self.attributes.apply(&mut self.store, write).map_err(|err| {
            warn!("attribute write rejected: {err}");
            err
        })
    }

    fn fire_reset(&mut self, source: ResetSource, actions: &mut Vec<NodeAction>) {
        if let Some(action) = self.trigger.fire(source) {
            RebootLoopWatchdog::clear_count(&mut self.store);
            actions.push(action);
        }
    }
}

use log::{error, info, warn};

use crate::{
    status::StatusSurface,
    types::{CommissioningSignal, CommissioningState, LeaveKind, NodeAction},
};

#[derive(Debug, Clone, Copy)]
struct TimeSync {
    next_due_ms: u64,
}

/// Decides when to (re)issue network steering and when the node counts as
/// joined. Periodic time reads start on the first join and are never restarted.
#[derive(Debug, Clone)]
pub struct CommissioningPolicy {
    state: CommissioningState,
    time_sync_interval_ms: u64,
    time_sync: Option<TimeSync>,
    steering_requests: u32,
    status: StatusSurface,
}

impl CommissioningPolicy {
    pub fn new(time_sync_interval_ms: u64, status: StatusSurface) -> Self {
        status.set_steering(true);
        Self {
            state: CommissioningState::Joining,
            time_sync_interval_ms,
            time_sync: None,
            steering_requests: 0,
            status,
        }
    }

    pub fn state(&self) -> CommissioningState {
        self.state
    }

    pub fn steering_requests(&self) -> u32 {
        self.steering_requests
    }

    pub fn time_sync_running(&self) -> bool {
        self.time_sync.is_some()
    }

    /// Steering, join and time-sync handling. Leave and stack-init failures
    /// touch other subsystems and are routed by the lifecycle before this runs.
    pub fn on_signal(&mut self, signal: CommissioningSignal, now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();

        match signal {
            CommissioningSignal::FirstStart { status } | CommissioningSignal::Reboot { status } => {
                if !status.is_ok() {
                    error!("failed to initialize mesh stack (status: {status})");
                }
                self.request_steering(&mut actions);
            }
            CommissioningSignal::SteeringResult { status, .. }
                if self.state == CommissioningState::Joined =>
            {
                info!("steering result after join ignored (status: {status})");
            }
            CommissioningSignal::SteeringResult { status, network } => {
                if !status.is_ok() {
                    warn!("network steering failed, error: {status}");
                    self.state = CommissioningState::SteeringFailed;
                    self.request_steering(&mut actions);
                } else {
                    match network {
                        Some(network) => info!("successfully joined network ({network})"),
                        None => info!("successfully joined network"),
                    }
                    self.state = CommissioningState::Joined;
                    self.status.set_steering(false);
                    self.start_time_sync(now_ms, &mut actions);
                }
            }
            CommissioningSignal::Leave { kind } => {
                info!("left network ({kind:?})");
            }
            CommissioningSignal::Other { id, status } => {
                info!("mesh signal 0x{id:02x} received, status: {status}");
            }
        }

        actions
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();

        if let Some(sync) = self.time_sync.as_mut() {
            if now_ms >= sync.next_due_ms {
                actions.push(NodeAction::ReadLocalTime);
                sync.next_due_ms = now_ms.saturating_add(self.time_sync_interval_ms);
            }
        }

        actions
    }

    pub fn is_leave_reset(signal: &CommissioningSignal) -> bool {
        matches!(
            signal,
            CommissioningSignal::Leave {
                kind: LeaveKind::Reset
            }
        )
    }

    fn request_steering(&mut self, actions: &mut Vec<NodeAction>) {
        if self.state != CommissioningState::Joined {
            self.status.set_steering(true);
        }
        self.steering_requests = self.steering_requests.saturating_add(1);
        actions.push(NodeAction::StartSteering);
    }

    fn start_time_sync(&mut self, now_ms: u64, actions: &mut Vec<NodeAction>) {
        if self.time_sync.is_some() {
            return;
        }

        info!(
            "starting time sync every {}s",
            self.time_sync_interval_ms / 1_000
        );
        actions.push(NodeAction::ReadLocalTime);
        self.time_sync = Some(TimeSync {
            next_due_ms: now_ms.saturating_add(self.time_sync_interval_ms),
        });
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::{NetworkIdentity, StackStatus};

    const HOUR_MS: u64 = 3_600_000;

    fn joined() -> CommissioningSignal {
        CommissioningSignal::SteeringResult {
            status: StackStatus::OK,
            network: Some(NetworkIdentity {
                pan_id: 0x1a62,
                extended_pan_id: [1, 2, 3, 4, 5, 6, 7, 8],
            }),
        }
    }

    #[test]
    fn start_requests_steering_even_after_init_error() {
        let mut policy = CommissioningPolicy::new(12 * HOUR_MS, StatusSurface::new());

        let actions = policy.on_signal(
            CommissioningSignal::FirstStart {
                status: StackStatus(-1),
            },
            0,
        );

        assert_eq!(actions, vec![NodeAction::StartSteering]);
        assert_eq!(policy.state(), CommissioningState::Joining);
    }

    #[test]
    fn steering_failure_retries_once_per_failure() {
        let mut policy = CommissioningPolicy::new(12 * HOUR_MS, StatusSurface::new());
        let failure = CommissioningSignal::SteeringResult {
            status: StackStatus(5),
            network: None,
        };

        for _ in 0..4 {
            assert_eq!(policy.on_signal(failure, 0), vec![NodeAction::StartSteering]);
            assert_eq!(policy.state(), CommissioningState::SteeringFailed);
        }
        assert_eq!(policy.steering_requests(), 4);
        assert!(!policy.time_sync_running());
    }

    #[test]
    fn join_starts_time_sync_exactly_once() {
        let status = StatusSurface::new();
        let mut policy = CommissioningPolicy::new(12 * HOUR_MS, status.clone());

        assert_eq!(policy.on_signal(joined(), 1_000), vec![NodeAction::ReadLocalTime]);
        assert_eq!(policy.state(), CommissioningState::Joined);
        assert!(!status.steering());

        assert_eq!(policy.on_signal(joined(), 2_000), Vec::<NodeAction>::new());
        assert_eq!(policy.tick(1_000 + 12 * HOUR_MS - 1), Vec::<NodeAction>::new());
        assert_eq!(
            policy.tick(1_000 + 12 * HOUR_MS),
            vec![NodeAction::ReadLocalTime]
        );
        assert_eq!(policy.tick(1_000 + 12 * HOUR_MS + 1), Vec::<NodeAction>::new());
    }

    #[test]
    fn joined_ignores_later_steering_results() {
        let status = StatusSurface::new();
        let mut policy = CommissioningPolicy::new(12 * HOUR_MS, status.clone());
        policy.on_signal(joined(), 1_000);

        let failure = CommissioningSignal::SteeringResult {
            status: StackStatus(5),
            network: None,
        };
        assert_eq!(policy.on_signal(failure, 2_000), Vec::<NodeAction>::new());

        assert_eq!(policy.state(), CommissioningState::Joined);
        assert!(!status.steering());
        assert_eq!(policy.steering_requests(), 0);
    }

    #[test]
    fn no_time_reads_before_join() {
        let mut policy = CommissioningPolicy::new(1_000, StatusSurface::new());

        assert_eq!(policy.tick(1_000_000), Vec::<NodeAction>::new());
    }

    #[test]
    fn recognises_reset_leave() {
        assert!(CommissioningPolicy::is_leave_reset(&CommissioningSignal::Leave {
            kind: LeaveKind::Reset
        }));
        assert!(!CommissioningPolicy::is_leave_reset(&CommissioningSignal::Leave {
            kind: LeaveKind::Rejoin
        }));
    }
}

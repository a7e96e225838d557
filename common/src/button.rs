use log::{info, warn};

use crate::{
    countdown::{CountdownTimer, TimerOwner},
    error::TimerError,
    types::Level,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonHoldState {
    Idle,
    /// Held while another owner had the countdown; arms once it is released.
    Waiting,
    Pressed,
}

/// Turns edge wake-ups from the active-low reset button into a "held long
/// enough" countdown on the shared timer.
#[derive(Debug, Clone)]
pub struct LongPressDetector {
    state: ButtonHoldState,
    hold_ms: u64,
}

impl LongPressDetector {
    pub fn new(hold_ms: u64) -> Self {
        Self {
            state: ButtonHoldState::Idle,
            hold_ms,
        }
    }

    pub fn state(&self) -> ButtonHoldState {
        self.state
    }

    /// Called on the detector task after an edge interrupt, with the level
    /// sampled at wake-up time.
    pub fn on_wake(&mut self, level: Level, timer: &mut CountdownTimer, now_ms: u64) {
        match (level, self.state) {
            (Level::Low, ButtonHoldState::Idle) => {
                if let Err(err) = self.try_arm(timer, now_ms) {
                    warn!("reset button press deferred: {err}");
                    self.state = ButtonHoldState::Waiting;
                }
            }
            (Level::High, ButtonHoldState::Waiting) => {
                info!("reset button released before the countdown was free");
                self.state = ButtonHoldState::Idle;
            }
            (Level::High, ButtonHoldState::Pressed) => {
                if let Err(err) = timer.stop(TimerOwner::Button) {
                    warn!("reset button release: {err}");
                }
                info!("reset button released");
                self.state = ButtonHoldState::Idle;
            }
            _ => {}
        }
    }

    /// Arms a deferred hold once the countdown has no other owner. The hold
    /// is measured from this call.
    pub fn on_timer_free(&mut self, timer: &mut CountdownTimer, now_ms: u64) {
        if self.state == ButtonHoldState::Waiting && timer.owner().is_none() {
            if let Err(err) = self.try_arm(timer, now_ms) {
                warn!("reset button still waiting for countdown: {err}");
            }
        }
    }

    fn try_arm(&mut self, timer: &mut CountdownTimer, now_ms: u64) -> Result<(), TimerError> {
        timer.arm(TimerOwner::Button, self.hold_ms, now_ms)?;
        info!("reset button pressed, holding for {}ms", self.hold_ms);
        self.state = ButtonHoldState::Pressed;
        Ok(())
    }
}

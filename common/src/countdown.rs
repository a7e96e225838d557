use crate::error::TimerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOwner {
    Watchdog,
    Button,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    owner: TimerOwner,
    started_ms: u64,
    duration_ms: u64,
}

/// The node's single countdown resource. At most one owner may have it armed;
/// another owner has to wait until it is stopped or has expired.
#[derive(Debug, Clone, Default)]
pub struct CountdownTimer {
    armed: Option<Armed>,
}

impl CountdownTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<TimerOwner> {
        self.armed.map(|armed| armed.owner)
    }

    /// Zeroes and starts the countdown. Re-arming by the current owner restarts it.
    pub fn arm(&mut self, owner: TimerOwner, duration_ms: u64, now_ms: u64) -> Result<(), TimerError> {
        if let Some(armed) = self.armed {
            if armed.owner != owner {
                return Err(TimerError::Busy {
                    current: armed.owner,
                    requested: owner,
                });
            }
        }

        self.armed = Some(Armed {
            owner,
            started_ms: now_ms,
            duration_ms,
        });
        Ok(())
    }

    /// Stopping an idle countdown is a no-op.
    pub fn stop(&mut self, owner: TimerOwner) -> Result<(), TimerError> {
        match self.armed {
            Some(armed) if armed.owner != owner => Err(TimerError::NotOwner {
                current: armed.owner,
                requested: owner,
            }),
            _ => {
                self.armed = None;
                Ok(())
            }
        }
    }

    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.armed.map(|armed| {
            let elapsed = now_ms.saturating_sub(armed.started_ms);
            armed.duration_ms.saturating_sub(elapsed)
        })
    }

    /// Returns the owner whose countdown has elapsed and releases the resource.
    pub fn poll_expired(&mut self, now_ms: u64) -> Option<TimerOwner> {
        let armed = self.armed?;
        if now_ms.saturating_sub(armed.started_ms) < armed.duration_ms {
            return None;
        }
        self.armed = None;
        Some(armed.owner)
    }
}

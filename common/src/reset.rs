use log::warn;

use crate::{status::StatusSurface, types::NodeAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetSource {
    RebootLoop,
    LongPress,
    NetworkLeave,
}

impl ResetSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RebootLoop => "reboot loop",
            Self::LongPress => "button long press",
            Self::NetworkLeave => "network leave",
        }
    }
}

/// Single choke point for factory resets. Fires at most once per boot.
#[derive(Debug, Clone)]
pub struct FactoryResetTrigger {
    fired: Option<ResetSource>,
    status: StatusSurface,
}

impl FactoryResetTrigger {
    pub fn new(status: StatusSurface) -> Self {
        Self {
            fired: None,
            status,
        }
    }

    pub fn fired(&self) -> Option<ResetSource> {
        self.fired
    }

    pub fn fire(&mut self, source: ResetSource) -> Option<NodeAction> {
        if let Some(previous) = self.fired {
            warn!(
                "factory reset from {} ignored, already triggered by {}",
                source.as_str(),
                previous.as_str()
            );
            return None;
        }

        warn!("factory reset triggered by {}", source.as_str());
        self.status.mark_reset_pending();
        self.fired = Some(source);
        Some(NodeAction::FactoryReset)
    }
}

use core::fmt;

use serde::{Deserialize, Serialize};

/// Logical level sampled from the reset button line. The button is active-low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_high(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    Off,
    Low,
    Medium,
    High,
}

impl FanMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningState {
    Joining,
    SteeringFailed,
    Joined,
}

impl CommissioningState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joining => "JOINING",
            Self::SteeringFailed => "STEERING_FAILED",
            Self::Joined => "JOINED",
        }
    }
}

/// Raw status code attached to mesh stack callbacks. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackStatus(pub i32);

impl StackStatus {
    pub const OK: Self = Self(0);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub pan_id: u16,
    pub extended_pan_id: [u8; 8],
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PAN ID 0x{:04x}, extended PAN ID ", self.pan_id)?;
        // Extended PAN id is stored little-endian; print most significant byte first.
        for (index, byte) in self.extended_pan_id.iter().rev().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveKind {
    /// Coordinator asked the node to leave and forget the network.
    Reset,
    Rejoin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissioningSignal {
    FirstStart {
        status: StackStatus,
    },
    Reboot {
        status: StackStatus,
    },
    SteeringResult {
        status: StackStatus,
        network: Option<NetworkIdentity>,
    },
    Leave {
        kind: LeaveKind,
    },
    Other {
        id: u32,
        status: StackStatus,
    },
}

/// Work the runtime must carry out on behalf of the lifecycle core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    /// Clear network credentials through the stack and reboot.
    FactoryReset,
    Restart,
    StartSteering,
    ReadLocalTime,
    SetLedEnabled(bool),
    SetLedBrightness(u8),
    SetFanMode(FanMode),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_mode_rejects_unknown_values() {
        assert_eq!(FanMode::from_u8(2), Some(FanMode::Medium));
        assert_eq!(FanMode::from_u8(4), None);
        assert_eq!(FanMode::High.as_u8(), 3);
    }

    #[test]
    fn network_identity_prints_extended_pan_big_endian() {
        let network = NetworkIdentity {
            pan_id: 0x1a2b,
            extended_pan_id: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
        };

        assert_eq!(
            network.to_string(),
            "PAN ID 0x1a2b, extended PAN ID 08:07:06:05:04:03:02:01"
        );
    }
}

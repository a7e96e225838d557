pub mod attributes;
pub mod button;
pub mod commissioning;
pub mod config;
pub mod countdown;
pub mod error;
pub mod lifecycle;
pub mod ota;
pub mod reset;
pub mod status;
pub mod store;
pub mod types;
pub mod watchdog;

pub use attributes::{AttributeBridge, AttributeType, AttributeWrite};
pub use button::{ButtonHoldState, LongPressDetector};
pub use commissioning::CommissioningPolicy;
pub use config::{NodeConfig, OtaConfig, PersistedSettings};
pub use countdown::{CountdownTimer, TimerOwner};
pub use error::{AttributeError, OtaError, StoreError, TimerError};
pub use lifecycle::NodeLifecycle;
pub use ota::{FirmwareStore, OtaEvent, OtaHeader, OtaOutcome, OtaPhase, OtaStatus, UpdateSlot};
pub use reset::{FactoryResetTrigger, ResetSource};
pub use status::{LedPattern, StatusSurface};
pub use store::{CounterStore, MemoryStore};
pub use types::{
    CommissioningSignal, CommissioningState, FanMode, LeaveKind, Level, NetworkIdentity,
    NodeAction, StackStatus,
};
pub use watchdog::{RebootLoopWatchdog, WatchdogPhase};

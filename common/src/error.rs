use thiserror::Error;

use crate::countdown::TimerOwner;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("failed to read `{key}` from persistent store: {reason}")]
    Read { key: String, reason: String },
    #[error("failed to write `{key}` to persistent store: {reason}")]
    Write { key: String, reason: String },
}

impl StoreError {
    pub fn read(key: &str, reason: impl Into<String>) -> Self {
        Self::Read {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn write(key: &str, reason: impl Into<String>) -> Self {
        Self::Write {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("countdown is armed by {current:?}, {requested:?} must wait for it to be stopped")]
    Busy {
        current: TimerOwner,
        requested: TimerOwner,
    },
    #[error("countdown is armed by {current:?}, {requested:?} cannot stop it")]
    NotOwner {
        current: TimerOwner,
        requested: TimerOwner,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("stack reported OTA status {0}")]
    StackStatus(i32),
    #[error("no OTA session is open")]
    NoSession,
    #[error("failed to open update partition: {0}")]
    Open(String),
    #[error("failed to write update partition at offset {offset}: {reason}")]
    Write { offset: u32, reason: String },
    #[error("failed to close update partition: {0}")]
    Close(String),
    #[error("failed to select boot partition: {0}")]
    SetBoot(String),
    #[error("image size mismatch (declared {declared}, received {received})")]
    SizeMismatch { declared: u32, received: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttributeError {
    #[error("write addressed endpoint {0}")]
    WrongEndpoint(u8),
    #[error("stack reported attribute status {0}")]
    StackStatus(i32),
    #[error("unsupported attribute 0x{attribute:04x} on cluster 0x{cluster:04x}")]
    Unsupported { cluster: u16, attribute: u16 },
    #[error("attribute 0x{attribute:04x} on cluster 0x{cluster:04x} has unexpected type 0x{kind:02x}")]
    TypeMismatch { cluster: u16, attribute: u16, kind: u8 },
    #[error("attribute write carries no value")]
    MissingValue,
    #[error("value {0} is out of range")]
    OutOfRange(u8),
}

use log::warn;

use crate::{
    config::PersistedSettings,
    error::AttributeError,
    store::{read_or, update_u8, CounterStore, KEY_FAN_MODE, KEY_LED_BRIGHTNESS, KEY_LED_ENABLED},
    types::{FanMode, NodeAction, StackStatus},
};

pub const CLUSTER_ON_OFF: u16 = 0x0006;
pub const CLUSTER_LEVEL_CONTROL: u16 = 0x0008;
pub const CLUSTER_FAN_CONTROL: u16 = 0x0202;

pub const ATTR_ON_OFF: u16 = 0x0000;
pub const ATTR_CURRENT_LEVEL: u16 = 0x0000;
pub const ATTR_FAN_MODE: u16 = 0x0000;

/// ZCL data type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Bool,
    U8,
    Enum8,
    Other(u8),
}

impl AttributeType {
    pub fn from_id(id: u8) -> Self {
        match id {
            0x10 => Self::Bool,
            0x20 => Self::U8,
            0x30 => Self::Enum8,
            other => Self::Other(other),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Bool => 0x10,
            Self::U8 => 0x20,
            Self::Enum8 => 0x30,
            Self::Other(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeWrite {
    pub endpoint: u8,
    pub status: StackStatus,
    pub cluster: u16,
    pub attribute: u16,
    pub kind: AttributeType,
    pub value: Option<u8>,
}

/// Applies remote attribute writes to the persisted LED and fan settings.
#[derive(Debug, Clone)]
pub struct AttributeBridge {
    endpoint: u8,
    settings: PersistedSettings,
}

impl AttributeBridge {
    pub fn load<S: CounterStore + ?Sized>(store: &S, endpoint: u8) -> Self {
        let defaults = PersistedSettings::default();
        let fan_raw = read_or(store, KEY_FAN_MODE, defaults.fan_mode.as_u8());
        let fan_mode = FanMode::from_u8(fan_raw).unwrap_or_else(|| {
            warn!("stored fan mode {fan_raw} is invalid, using default");
            defaults.fan_mode
        });

        Self {
            endpoint,
            settings: PersistedSettings {
                led_enabled: read_or(store, KEY_LED_ENABLED, u8::from(defaults.led_enabled)) != 0,
                led_brightness: read_or(store, KEY_LED_BRIGHTNESS, defaults.led_brightness),
                fan_mode,
            },
        }
    }

    pub fn settings(&self) -> PersistedSettings {
        self.settings
    }

    /// Returns the collaborator action when the write changed a setting.
    pub fn apply<S: CounterStore + ?Sized>(
        &mut self,
        store: &mut S,
        write: AttributeWrite,
    ) -> Result<Option<NodeAction>, AttributeError> {
        if write.endpoint != self.endpoint {
            return Err(AttributeError::WrongEndpoint(write.endpoint));
        }

        if !write.status.is_ok() {
            return Err(AttributeError::StackStatus(write.status.0));
        }

        let expected = match (write.cluster, write.attribute) {
            (CLUSTER_ON_OFF, ATTR_ON_OFF) => AttributeType::Bool,
            (CLUSTER_LEVEL_CONTROL, ATTR_CURRENT_LEVEL) => AttributeType::U8,
            (CLUSTER_FAN_CONTROL, ATTR_FAN_MODE) => AttributeType::Enum8,
            (cluster, attribute) => {
                return Err(AttributeError::Unsupported { cluster, attribute });
            }
        };

        if write.kind != expected {
            return Err(AttributeError::TypeMismatch {
                cluster: write.cluster,
                attribute: write.attribute,
                kind: write.kind.id(),
            });
        }

        let value = write.value.ok_or(AttributeError::MissingValue)?;

        let action = match expected {
            AttributeType::Bool => {
                let enabled = value != 0;
                if enabled == self.settings.led_enabled {
                    return Ok(None);
                }
                self.settings.led_enabled = enabled;
                update_u8(store, KEY_LED_ENABLED, u8::from(enabled));
                NodeAction::SetLedEnabled(enabled)
            }
            AttributeType::U8 => {
                if value == self.settings.led_brightness {
                    return Ok(None);
                }
                self.settings.led_brightness = value;
                update_u8(store, KEY_LED_BRIGHTNESS, value);
                NodeAction::SetLedBrightness(value)
            }
            AttributeType::Enum8 => {
                let mode = FanMode::from_u8(value).ok_or(AttributeError::OutOfRange(value))?;
                if mode == self.settings.fan_mode {
                    return Ok(None);
                }
                self.settings.fan_mode = mode;
                update_u8(store, KEY_FAN_MODE, value);
                NodeAction::SetFanMode(mode)
            }
            AttributeType::Other(_) => return Ok(None),
        };

        Ok(Some(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn write(cluster: u16, kind: AttributeType, value: u8) -> AttributeWrite {
        AttributeWrite {
            endpoint: 1,
            status: StackStatus::OK,
            cluster,
            attribute: 0x0000,
            kind,
            value: Some(value),
        }
    }

    #[test]
    fn loads_defaults_for_missing_keys() {
        let store = MemoryStore::new().with_value(KEY_LED_BRIGHTNESS, 120);
        let bridge = AttributeBridge::load(&store, 1);

        assert_eq!(
            bridge.settings(),
            PersistedSettings {
                led_enabled: true,
                led_brightness: 120,
                fan_mode: FanMode::High,
            }
        );
    }

    #[test]
    fn invalid_stored_fan_mode_falls_back() {
        let store = MemoryStore::new().with_value(KEY_FAN_MODE, 9);

        assert_eq!(AttributeBridge::load(&store, 1).settings().fan_mode, FanMode::High);
    }

    #[test]
    fn accepted_writes_persist_and_report() {
        let mut store = MemoryStore::new();
        let mut bridge = AttributeBridge::load(&store, 1);

        assert_eq!(
            bridge.apply(&mut store, write(CLUSTER_ON_OFF, AttributeType::Bool, 0)),
            Ok(Some(NodeAction::SetLedEnabled(false)))
        );
        assert_eq!(
            bridge.apply(&mut store, write(CLUSTER_LEVEL_CONTROL, AttributeType::U8, 200)),
            Ok(Some(NodeAction::SetLedBrightness(200)))
        );
        assert_eq!(
            bridge.apply(&mut store, write(CLUSTER_FAN_CONTROL, AttributeType::Enum8, 1)),
            Ok(Some(NodeAction::SetFanMode(FanMode::Low)))
        );

        assert_eq!(store.get(KEY_LED_ENABLED), Some(0));
        assert_eq!(store.get(KEY_LED_BRIGHTNESS), Some(200));
        assert_eq!(store.get(KEY_FAN_MODE), Some(1));
    }

    #[test]
    fn unchanged_value_is_accepted_without_write() {
        let mut store = MemoryStore::new();
        let mut bridge = AttributeBridge::load(&store, 1);

        assert_eq!(
            bridge.apply(&mut store, write(CLUSTER_FAN_CONTROL, AttributeType::Enum8, 3)),
            Ok(None)
        );
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn rejects_foreign_endpoint_type_and_attribute() {
        let mut store = MemoryStore::new();
        let mut bridge = AttributeBridge::load(&store, 1);

        let mut foreign = write(CLUSTER_ON_OFF, AttributeType::Bool, 1);
        foreign.endpoint = 2;
        assert_eq!(
            bridge.apply(&mut store, foreign),
            Err(AttributeError::WrongEndpoint(2))
        );

        assert_eq!(
            bridge.apply(&mut store, write(CLUSTER_LEVEL_CONTROL, AttributeType::Bool, 1)),
            Err(AttributeError::TypeMismatch {
                cluster: CLUSTER_LEVEL_CONTROL,
                attribute: ATTR_CURRENT_LEVEL,
                kind: 0x10,
            })
        );

        assert_eq!(
            bridge.apply(&mut store, write(0x0402, AttributeType::U8, 1)),
            Err(AttributeError::Unsupported {
                cluster: 0x0402,
                attribute: 0x0000,
            })
        );

        assert_eq!(
            bridge.apply(&mut store, write(CLUSTER_FAN_CONTROL, AttributeType::Enum8, 4)),
            Err(AttributeError::OutOfRange(4))
        );

        let mut empty = write(CLUSTER_ON_OFF, AttributeType::Bool, 1);
        empty.value = None;
        assert_eq!(bridge.apply(&mut store, empty), Err(AttributeError::MissingValue));
    }
}

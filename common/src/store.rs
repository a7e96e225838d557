use std::collections::HashMap;

use log::{info, warn};

use crate::error::StoreError;

pub const KEY_REBOOT_COUNT: &str = "reboot_count";
pub const KEY_LED_ENABLED: &str = "led_enabled";
pub const KEY_LED_BRIGHTNESS: &str = "led_brightness";
pub const KEY_FAN_MODE: &str = "fan_mode";

/// Durable key to small-integer storage. Each key is written atomically and
/// independently; nothing spans more than one key.
pub trait CounterStore {
    fn read_u8(&self, key: &str) -> Result<Option<u8>, StoreError>;
    fn write_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError>;
}

/// Reads `key`, falling back to `default` when it is absent or unreadable.
pub fn read_or<S: CounterStore + ?Sized>(store: &S, key: &str, default: u8) -> u8 {
    match store.read_u8(key) {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(err) => {
            warn!("{err}; using default {default}");
            default
        }
    }
}

/// Writes `value` only when it differs from what is stored. Failures are
/// logged and reported as "not written" so callers carry on with the old value.
pub fn update_u8<S: CounterStore + ?Sized>(store: &mut S, key: &str, value: u8) -> bool {
    let current = store.read_u8(key).unwrap_or_else(|err| {
        warn!("{err}");
        None
    });

    if current == Some(value) {
        return false;
    }

    match store.write_u8(key, value) {
        Ok(()) => {
            info!("{key} is {value}");
            true
        }
        Err(err) => {
            warn!("{err}");
            false
        }
    }
}

/// Volatile store with failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, u8>,
    fail_reads: bool,
    fail_writes: bool,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: &str, value: u8) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn get(&self, key: &str) -> Option<u8> {
        self.values.get(key).copied()
    }

    pub fn values(&self) -> &HashMap<String, u8> {
        &self.values
    }

    /// Number of successful writes, used to check redundant writes are skipped.
    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl From<HashMap<String, u8>> for MemoryStore {
    fn from(values: HashMap<String, u8>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }
}

impl CounterStore for MemoryStore {
    fn read_u8(&self, key: &str) -> Result<Option<u8>, StoreError> {
        if self.fail_reads {
            return Err(StoreError::read(key, "injected read failure"));
        }
        Ok(self.values.get(key).copied())
    }

    fn write_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::write(key, "injected write failure"));
        }
        self.values.insert(key.to_string(), value);
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_or_falls_back_on_missing_and_failed_reads() {
        let mut store = MemoryStore::new().with_value(KEY_FAN_MODE, 1);
        assert_eq!(read_or(&store, KEY_FAN_MODE, 3), 1);
        assert_eq!(read_or(&store, KEY_LED_BRIGHTNESS, 50), 50);

        store.set_fail_reads(true);
        assert_eq!(read_or(&store, KEY_FAN_MODE, 3), 3);
    }

    #[test]
    fn update_skips_unchanged_values() {
        let mut store = MemoryStore::new();

        assert!(update_u8(&mut store, KEY_REBOOT_COUNT, 1));
        assert!(!update_u8(&mut store, KEY_REBOOT_COUNT, 1));
        assert!(update_u8(&mut store, KEY_REBOOT_COUNT, 0));
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn update_reports_write_failure_without_changing_value() {
        let mut store = MemoryStore::new().with_value(KEY_REBOOT_COUNT, 2);
        store.set_fail_writes(true);

        assert!(!update_u8(&mut store, KEY_REBOOT_COUNT, 0));
        assert_eq!(store.get(KEY_REBOOT_COUNT), Some(2));
    }
}

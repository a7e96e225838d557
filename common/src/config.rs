use serde::{Deserialize, Serialize};

use crate::types::FanMode;

pub const DEFAULT_ENDPOINT: u8 = 0x01;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub reset_threshold: u8,
    pub reset_timeout_ms: u64,
    pub time_sync_interval_ms: u64,
    pub endpoint: u8,
    pub button_pin: i32,
    pub ota: OtaConfig,
    pub basic: BasicInfo,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            reset_threshold: 3,
            reset_timeout_ms: 3_000,
            time_sync_interval_ms: 12 * 3_600 * 1_000,
            endpoint: DEFAULT_ENDPOINT,
            button_pin: 9,
            ota: OtaConfig::default(),
            basic: BasicInfo::default(),
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.reset_threshold == 0 {
            self.reset_threshold = defaults.reset_threshold;
        }

        if self.reset_timeout_ms == 0 {
            self.reset_timeout_ms = defaults.reset_timeout_ms;
        }

        if self.time_sync_interval_ms == 0 {
            self.time_sync_interval_ms = defaults.time_sync_interval_ms;
        }

        if self.button_pin < 0 {
            self.button_pin = defaults.button_pin;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OtaConfig {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    /// Fail the session on a partition write error instead of only logging it.
    pub strict_writes: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            manufacturer_code: 0x1234,
            image_type: 0x0001,
            file_version: 0x0000_0001,
            strict_writes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BasicInfo {
    pub zcl_version: u8,
    pub application_version: u8,
    pub power_source: u8,
    pub manufacturer_name: String,
    pub model_identifier: String,
    pub sw_build: String,
}

impl Default for BasicInfo {
    fn default() -> Self {
        Self {
            zcl_version: 0x03,
            application_version: 0x01,
            power_source: 0x01,
            manufacturer_name: "HOMEd".to_string(),
            model_identifier: "ESP32H2".to_string(),
            sw_build: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl BasicInfo {
    /// Length-prefixed character string as carried in basic cluster attributes.
    pub fn zcl_string(value: &str) -> Vec<u8> {
        let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
        let mut encoded = Vec::with_capacity(bytes.len() + 1);
        encoded.push(bytes.len() as u8);
        encoded.extend_from_slice(bytes);
        encoded
    }
}

/// Settings written remotely through the attribute bridge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedSettings {
    pub led_enabled: bool,
    pub led_brightness: u8,
    pub fan_mode: FanMode,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            led_enabled: true,
            led_brightness: 50,
            fan_mode: FanMode::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_restores_zeroed_timings() {
        let mut config = NodeConfig {
            reset_threshold: 0,
            reset_timeout_ms: 0,
            time_sync_interval_ms: 0,
            button_pin: -1,
            ..NodeConfig::default()
        };

        config.sanitize();

        assert_eq!(config.reset_threshold, 3);
        assert_eq!(config.reset_timeout_ms, 3_000);
        assert_eq!(config.time_sync_interval_ms, 43_200_000);
        assert_eq!(config.button_pin, 9);
    }

    #[test]
    fn partial_json_uses_nested_defaults() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"reset_threshold":5,"reset_timeout_ms":1000,"time_sync_interval_ms":60000,"endpoint":2,"button_pin":4}"#,
        )
        .unwrap();

        assert_eq!(config.reset_threshold, 5);
        assert_eq!(config.ota, OtaConfig::default());
        assert_eq!(config.basic.manufacturer_name, "HOMEd");
    }

    #[test]
    fn missing_top_level_fields_take_defaults() {
        let config: NodeConfig = serde_json::from_str(r#"{"reset_threshold":4}"#).unwrap();

        assert_eq!(config.reset_threshold, 4);
        assert_eq!(config.reset_timeout_ms, 3_000);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.button_pin, 9);
        assert_eq!(config.ota, OtaConfig::default());
    }

    #[test]
    fn zcl_string_is_length_prefixed() {
        assert_eq!(BasicInfo::zcl_string("HOMEd"), b"\x05HOMEd".to_vec());
    }
}

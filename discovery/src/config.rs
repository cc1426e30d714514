//! Discovery configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tech::TechSet;

/// NFCID3 used in ATR_REQ towards NFC-A peers.
pub const DEFAULT_NFCID3: [u8; 10] = [0x01, 0xFE, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A];

/// LLCP magic number followed by VERSION, MIUX, WKS, LTO and OPT parameters.
pub const DEFAULT_GENERAL_BYTES: [u8; 20] = [
    0x46, 0x66, 0x6d, 0x01, 0x01, 0x11, 0x02, 0x02, 0x07, 0x80, 0x03, 0x02, 0x00, 0x03, 0x04, 0x01,
    0x32, 0x07, 0x01, 0x03,
];

/// Largest device limit accepted; the front-end counts devices in a byte.
pub const MAX_DEVICE_LIMIT: usize = u8::MAX as usize;

/// FSDI 8: 256 byte frames.
pub const DEFAULT_ISO_DEP_FSXI: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Technologies polled each cycle.
    pub techs: TechSet,
    /// Maximum devices registered per cycle.
    pub device_limit: usize,
    /// Run presence checks after activation.
    pub data_exchange: bool,
    /// Prefer NFC-DEP over ISO-DEP for NFC-A listeners supporting both.
    pub nfca_p2p_priority: bool,
    /// Block read from an NFC-V tag before its first presence check.
    pub nfcv_read_block: Option<u8>,
    pub iso_dep_fsxi: u8,
    pub nfcid3: [u8; 10],
    pub general_bytes: Vec<u8>,
    /// Frame waiting time for raw frame probes.
    pub raw_fwt_ms: u32,
    pub tick_period_ms: u64,
    /// Pause between two completed presence checks.
    pub exchange_interval_ms: u64,
    /// Field-off time after deactivation.
    pub guard_period_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            techs: TechSet::all(),
            device_limit: 10,
            data_exchange: true,
            nfca_p2p_priority: true,
            nfcv_read_block: None,
            iso_dep_fsxi: DEFAULT_ISO_DEP_FSXI,
            nfcid3: DEFAULT_NFCID3,
            general_bytes: DEFAULT_GENERAL_BYTES.to_vec(),
            raw_fwt_ms: 20,
            tick_period_ms: 10,
            exchange_interval_ms: 100,
            guard_period_ms: 500,
        }
    }
}

impl DiscoveryConfig {
    /// Defaults overridden by `NFC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("NFC_TECHS") {
            config.techs = parse("NFC_TECHS", &v)?;
        }
        if let Some(v) = lookup("NFC_DEVICE_LIMIT") {
            config.device_limit = parse("NFC_DEVICE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("NFC_DATA_EXCHANGE") {
            config.data_exchange = parse_bool("NFC_DATA_EXCHANGE", &v)?;
        }
        if let Some(v) = lookup("NFC_P2P_PRIORITY") {
            config.nfca_p2p_priority = parse_bool("NFC_P2P_PRIORITY", &v)?;
        }
        if let Some(v) = lookup("NFC_NFCV_READ_BLOCK") {
            config.nfcv_read_block = Some(parse("NFC_NFCV_READ_BLOCK", &v)?);
        }
        if let Some(v) = lookup("NFC_TICK_MS") {
            config.tick_period_ms = parse("NFC_TICK_MS", &v)?;
        }
        if let Some(v) = lookup("NFC_EXCHANGE_INTERVAL_MS") {
            config.exchange_interval_ms = parse("NFC_EXCHANGE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("NFC_GUARD_MS") {
            config.guard_period_ms = parse("NFC_GUARD_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_limit == 0 {
            return Err(ConfigError::ZeroDeviceLimit);
        }
        if self.device_limit > MAX_DEVICE_LIMIT {
            return Err(ConfigError::DeviceLimitTooHigh {
                limit: self.device_limit,
                max: MAX_DEVICE_LIMIT,
            });
        }
        if self.techs.is_empty() {
            return Err(ConfigError::NoTechnology);
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms.max(1))
    }

    pub fn exchange_interval(&self) -> Duration {
        Duration::from_millis(self.exchange_interval_ms)
    }

    pub fn guard_period(&self) -> Duration {
        Duration::from_millis(self.guard_period_ms)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        message: e.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key,
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

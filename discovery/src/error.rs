use thiserror::Error;

use crate::device::InterfaceKind;
use crate::tech::Technology;

/// Failure reported by an RF primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RfError {
    #[error("no response within the frame waiting time")]
    Timeout,
    #[error("transmission error")]
    Transmission,
    #[error("protocol error")]
    Protocol,
    #[error("collision detected")]
    Collision,
    #[error("link lost (device removed or field dropped)")]
    LinkLoss,
    #[error("front-end busy")]
    Busy,
    #[error("invalid parameter")]
    Param,
    #[error("operation not supported")]
    NotSupported,
    #[error("bus error: {0}")]
    Io(String),
}

/// Failure of one orchestration phase. Terminal for the current cycle only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("device index {index} out of range ({len} registered)")]
    InvalidDeviceIndex { index: usize, len: usize },

    #[error("no device is active")]
    NoActiveDevice,

    #[error("{technology} activation failed: {source}")]
    Activation {
        technology: Technology,
        #[source]
        source: RfError,
    },

    #[error("no presence probe for {technology} over {interface:?}")]
    UnsupportedProbe {
        technology: Technology,
        interface: InterfaceKind,
    },

    #[error("no block read for {technology} over {interface:?}")]
    UnsupportedBlockRead {
        technology: Technology,
        interface: InterfaceKind,
    },

    #[error("reading block {block} failed (error code {code:?})")]
    BlockRead { block: u8, code: Option<u8> },

    #[error("a data exchange is already in flight")]
    ExchangeInFlight,

    #[error("no data exchange in flight")]
    NoExchangeInFlight,

    #[error(transparent)]
    Rf(#[from] RfError),
}

/// Invalid discovery configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("device limit must be at least 1")]
    ZeroDeviceLimit,

    #[error("device limit {limit} exceeds the maximum of {max}")]
    DeviceLimitTooHigh { limit: usize, max: usize },

    #[error("no technology enabled for polling")]
    NoTechnology,
}

/// Failure driving a status LED.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("GPIO access failed: {0:?}")]
    Gpio(embedded_hal::digital::ErrorKind),
}

pub type RfResult<T> = std::result::Result<T, RfError>;
pub type Result<T> = std::result::Result<T, DiscoveryError>;

//! Poll-mode NFC discovery.
//!
//! Drives an NFC front-end through a repeating cycle: detect which
//! technologies answer, resolve the listeners of each, activate the first
//! one, keep checking it is still present, then release it and start over.
//! The chip itself sits behind [`RfLayer`]; [`sim::SimulatedField`] stands
//! in for it in tests and in the simulator.

pub mod activator;
pub mod config;
pub mod deactivator;
pub mod detector;
pub mod device;
pub mod error;
pub mod event;
pub mod exchange;
pub mod orchestrator;
pub mod p2p;
pub mod platform;
pub mod resolver;
pub mod rf;
pub mod sim;
pub mod tech;

pub use config::DiscoveryConfig;
pub use device::{Device, DeviceRegistry, InterfaceKind, RfInterface, TechData};
pub use error::{ConfigError, DiscoveryError, PlatformError, RfError};
pub use event::{DeviceSummary, DiscoveryEvent};
pub use orchestrator::{DiscoverySession, DiscoveryState, Orchestrator, Step};
pub use rf::RfLayer;
pub use tech::{TechSet, Technology};

//! Notifications published by the orchestrator.

use serde::Serialize;

use crate::device::{Device, InterfaceKind};
use crate::orchestrator::DiscoveryState;
use crate::tech::{TechSet, Technology};

/// What a subscriber needs to know about an activated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub technology: Technology,
    pub description: &'static str,
    pub id: String,
    pub interface: InterfaceKind,
}

impl From<&Device> for DeviceSummary {
    fn from(device: &Device) -> Self {
        Self {
            technology: device.technology(),
            description: device.description(),
            id: device.display_id(),
            interface: device.interface().kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    StateChanged {
        from: DiscoveryState,
        to: DiscoveryState,
    },
    DevicesResolved {
        techs: TechSet,
        count: usize,
    },
    Activated(DeviceSummary),
    ActivationFailed {
        technology: Option<Technology>,
        error: String,
    },
    ExchangeCompleted {
        response: Vec<u8>,
    },
    ExchangeFailed {
        error: String,
    },
    BlockRead {
        block: u8,
        data: Vec<u8>,
    },
    BlockReadFailed {
        block: u8,
        error: String,
    },
    Deactivated {
        cycle: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{NfcvListenDevice, TechData};

    #[test]
    fn serializes_with_type_tag() {
        let device = Device::new(TechData::V(NfcvListenDevice::new([1, 2, 3, 4, 5, 6, 7, 0xE0])));
        let event = DiscoveryEvent::Activated(DeviceSummary::from(&device));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "activated");
        assert_eq!(json["technology"], "V");
        assert_eq!(json["id"], "E007060504030201");
        assert_eq!(json["interface"], "RawFrame");

        let json = serde_json::to_value(DiscoveryEvent::Deactivated { cycle: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "deactivated", "cycle": 3}));
    }
}

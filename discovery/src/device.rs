//! Device registry: listen descriptors discovered in one cycle and the
//! interface each device ends up on after activation.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, Result};
use crate::rf::{BitRate, IsoDepInfo, NfcDepInfo};
use crate::tech::Technology;

/// NFCID1 is 4, 7 or 10 bytes long.
pub type Nfcid1 = heapless::Vec<u8, 10>;

/// NFC-A listener platform, derived from SENS_RES / SEL_RES.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NfcaType {
    /// Topaz / Type 1 tag
    T1T,
    /// Type 2 tag (NTAG, Ultralight)
    T2T,
    /// ISO-DEP capable Type 4A tag
    T4T,
    /// NFC-DEP capable peer
    NfcDep,
    /// Supports both ISO-DEP and NFC-DEP
    T4tNfcDep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfcaListenDevice {
    pub kind: NfcaType,
    pub nfcid1: Nfcid1,
    #[serde(default)]
    pub sens_res: [u8; 2],
    #[serde(default)]
    pub sel_res: u8,
    /// Device was put to sleep (HLTA) during collision resolution.
    #[serde(default)]
    pub is_sleep: bool,
}

impl NfcaListenDevice {
    pub fn new(kind: NfcaType, nfcid1: &[u8]) -> Self {
        let len = nfcid1.len().min(10);
        Self {
            kind,
            nfcid1: Nfcid1::from_slice(&nfcid1[..len]).unwrap_or_default(),
            sens_res: [0x44, 0x00],
            sel_res: match kind {
                NfcaType::T1T | NfcaType::T2T => 0x00,
                NfcaType::T4T => 0x20,
                NfcaType::NfcDep => 0x40,
                NfcaType::T4tNfcDep => 0x60,
            },
            is_sleep: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfcbListenDevice {
    pub nfcid0: [u8; 4],
    #[serde(default)]
    pub app_data: [u8; 4],
    #[serde(default)]
    pub prot_info: [u8; 3],
    #[serde(default)]
    pub is_sleep: bool,
}

impl NfcbListenDevice {
    pub fn new(nfcid0: [u8; 4]) -> Self {
        Self {
            nfcid0,
            app_data: [0; 4],
            prot_info: [0x80, 0x81, 0x71],
            is_sleep: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfcfListenDevice {
    pub nfcid2: [u8; 8],
    #[serde(default)]
    pub system_code: [u8; 2],
    #[serde(default)]
    pub bit_rate: BitRate,
}

impl NfcfListenDevice {
    pub fn new(nfcid2: [u8; 8]) -> Self {
        Self {
            nfcid2,
            system_code: [0x12, 0xFC],
            bit_rate: BitRate::Kbps212,
        }
    }

    /// NFCID2 prefix `01 FE` announces NFC-DEP support.
    pub fn supports_nfc_dep(&self) -> bool {
        self.nfcid2[0] == 0x01 && self.nfcid2[1] == 0xFE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfcvListenDevice {
    /// UID as received over the air (LSB first).
    pub uid: [u8; 8],
    #[serde(default)]
    pub dsfid: u8,
    #[serde(default)]
    pub is_sleep: bool,
}

impl NfcvListenDevice {
    pub fn new(uid: [u8; 8]) -> Self {
        Self {
            uid,
            dsfid: 0,
            is_sleep: false,
        }
    }
}

/// Technology specific listen descriptor. The variant determines the
/// device's technology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tech")]
pub enum TechData {
    A(NfcaListenDevice),
    B(NfcbListenDevice),
    F(NfcfListenDevice),
    V(NfcvListenDevice),
}

impl TechData {
    pub fn technology(&self) -> Technology {
        match self {
            TechData::A(_) => Technology::A,
            TechData::B(_) => Technology::B,
            TechData::F(_) => Technology::F,
            TechData::V(_) => Technology::V,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceKind {
    RawFrame,
    IsoDep,
    NfcDep,
}

/// Interface a device communicates over after activation, carrying the
/// protocol parameters negotiated by the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RfInterface {
    #[default]
    RawFrame,
    IsoDep(IsoDepInfo),
    NfcDep(NfcDepInfo),
}

impl RfInterface {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            RfInterface::RawFrame => InterfaceKind::RawFrame,
            RfInterface::IsoDep(_) => InterfaceKind::IsoDep,
            RfInterface::NfcDep(_) => InterfaceKind::NfcDep,
        }
    }
}

/// One discovered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    tech: TechData,
    interface: RfInterface,
}

impl Device {
    pub fn new(tech: TechData) -> Self {
        Self {
            tech,
            interface: RfInterface::RawFrame,
        }
    }

    pub fn technology(&self) -> Technology {
        self.tech.technology()
    }

    pub fn tech(&self) -> &TechData {
        &self.tech
    }

    pub fn interface(&self) -> &RfInterface {
        &self.interface
    }

    pub(crate) fn set_interface(&mut self, interface: RfInterface) {
        self.interface = interface;
    }

    /// Identifier used for addressing: NFCID1, NFCID0, NFCID2 or UID.
    pub fn nfcid(&self) -> &[u8] {
        match &self.tech {
            TechData::A(a) => a.nfcid1.as_slice(),
            TechData::B(b) => &b.nfcid0[..],
            TechData::F(f) => &f.nfcid2[..],
            TechData::V(v) => &v.uid[..],
        }
    }

    /// Upper-case hex identifier. NFC-V UIDs are shown MSB first.
    pub fn display_id(&self) -> String {
        match &self.tech {
            TechData::V(v) => {
                let mut uid = v.uid;
                uid.reverse();
                hex(&uid)
            }
            _ => hex(self.nfcid()),
        }
    }

    pub fn description(&self) -> &'static str {
        match &self.tech {
            TechData::A(a) => match a.kind {
                NfcaType::T1T => "ISO14443A/Topaz (NFC-A T1T) TAG",
                NfcaType::T4T => "NFCA Passive ISO-DEP device",
                NfcaType::NfcDep | NfcaType::T4tNfcDep => "NFCA Passive P2P device",
                NfcaType::T2T => "ISO14443A/NFC-A card",
            },
            TechData::B(_) => "ISO14443B/NFC-B card",
            TechData::F(f) if f.supports_nfc_dep() => "NFCF Passive P2P device",
            TechData::F(_) => "Felica/NFC-F card",
            TechData::V(_) => "ISO15693/NFC-V card",
        }
    }
}

/// Upper-case hex without separators.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

/// Bounded list of devices discovered in the current cycle plus the index
/// of the activated one.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    capacity: usize,
    active: Option<usize>,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            devices: Vec::new(),
            capacity,
            active: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.devices.len()
    }

    /// Appends a device. Returns false (and drops it) once full.
    pub fn push(&mut self, device: Device) -> bool {
        if self.devices.len() >= self.capacity {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Device> {
        self.devices.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_device(&self) -> Option<&Device> {
        self.active.and_then(|i| self.devices.get(i))
    }

    pub(crate) fn set_active(&mut self, index: usize) -> Result<()> {
        if index >= self.devices.len() {
            return Err(DiscoveryError::InvalidDeviceIndex {
                index,
                len: self.devices.len(),
            });
        }
        self.active = Some(index);
        Ok(())
    }

    pub(crate) fn clear_active(&mut self) {
        self.active = None;
    }

    /// Forgets all devices and the active selection.
    pub fn clear(&mut self) {
        self.devices.clear();
        self.active = None;
    }
}

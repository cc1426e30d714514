//! NFC-DEP (peer-to-peer) initiator activation.

use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::device::{Device, RfInterface, TechData};
use crate::error::RfResult;
use crate::rf::{BitRate, CommMode, LengthReduction, NfcDepFlags, NfcDepInfo, NfcDepRequest, Nfcid3, RfLayer};

/// Full chaining on, empty DEP frames off, ATN and RTOX handling on.
pub const INITIATOR_FLAGS: NfcDepFlags = NfcDepFlags {
    full_chaining: true,
    empty_dep_frames: false,
    attention: true,
    rtox_requests: true,
};

/// ATR_REQ for `device`: NFC-F peers are addressed by their NFCID2, every
/// other peer by the configured NFCID3.
pub fn build_request(device: &Device, config: &DiscoveryConfig) -> NfcDepRequest {
    let nfcid3 = match device.tech() {
        TechData::F(f) => Nfcid3::from_slice(&f.nfcid2),
        _ => Nfcid3::from_slice(&config.nfcid3),
    }
    .unwrap_or_default();

    NfcDepRequest {
        technology: device.technology(),
        nfcid3,
        bs: BitRate::Kbps106,
        br: BitRate::Kbps106,
        lr: LengthReduction::Lr254,
        comm_mode: CommMode::Passive,
        did: None,
        nad: None,
        general_bytes: config.general_bytes.clone(),
        flags: INITIATOR_FLAGS,
    }
}

/// Runs the ATR handshake with `device`. On success the device moves to
/// the NFC-DEP interface carrying the target's ATR_RES parameters.
pub fn activate_nfc_dep<R: RfLayer>(rf: &mut R, device: &mut Device, config: &DiscoveryConfig) -> RfResult<()> {
    let request = build_request(device, config);
    debug!(technology = %request.technology, nfcid3_len = request.nfcid3.len(), "sending ATR_REQ");

    let info: NfcDepInfo = rf.nfc_dep_activate(&request)?;
    device.set_interface(RfInterface::NfcDep(info));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_GENERAL_BYTES, DEFAULT_NFCID3};
    use crate::device::{InterfaceKind, NfcaListenDevice, NfcaType, NfcfListenDevice};
    use crate::error::RfError;
    use crate::sim::{SimTag, SimulatedField};

    #[test]
    fn nfca_peer_uses_configured_nfcid3() {
        let device = Device::new(TechData::A(NfcaListenDevice::new(NfcaType::NfcDep, &[8, 1, 2, 3])));
        let request = build_request(&device, &DiscoveryConfig::default());

        assert_eq!(request.nfcid3.as_slice(), &DEFAULT_NFCID3);
        assert_eq!(request.general_bytes, DEFAULT_GENERAL_BYTES.to_vec());
        assert_eq!(request.lr, LengthReduction::Lr254);
        assert_eq!(request.comm_mode, CommMode::Passive);
        assert_eq!(request.bs, BitRate::Kbps106);
        assert_eq!(request.br, BitRate::Kbps106);
        assert!(request.flags.full_chaining);
        assert!(!request.flags.empty_dep_frames);
        assert!(request.flags.attention && request.flags.rtox_requests);
    }

    #[test]
    fn nfcf_peer_uses_its_nfcid2() {
        let nfcid2 = [0x01, 0xFE, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let device = Device::new(TechData::F(NfcfListenDevice::new(nfcid2)));
        let request = build_request(&device, &DiscoveryConfig::default());

        assert_eq!(request.nfcid3.as_slice(), &nfcid2);
    }

    #[test]
    fn successful_handshake_sets_protocol_data() {
        let tech = TechData::A(NfcaListenDevice::new(NfcaType::NfcDep, &[8, 1, 2, 3]));
        let mut rf = SimulatedField::new(vec![SimTag::new(tech.clone())]);
        let mut device = Device::new(tech);

        activate_nfc_dep(&mut rf, &mut device, &DiscoveryConfig::default()).unwrap();
        match device.interface() {
            RfInterface::NfcDep(info) => assert_eq!(info.lr, LengthReduction::Lr254),
            other => panic!("unexpected interface {other:?}"),
        }
    }

    #[test]
    fn failed_handshake_leaves_device_untouched() {
        let tech = TechData::A(NfcaListenDevice::new(NfcaType::NfcDep, &[8, 1, 2, 3]));
        let mut rf = SimulatedField::new(vec![SimTag::new(tech.clone()).failing_nfc_dep()]);
        let mut device = Device::new(tech);

        let err = activate_nfc_dep(&mut rf, &mut device, &DiscoveryConfig::default()).unwrap_err();
        assert_eq!(err, RfError::Timeout);
        assert_eq!(device.interface().kind(), InterfaceKind::RawFrame);
    }
}

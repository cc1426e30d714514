//! Brings one resolved device into a communicating state.

use tracing::{debug, info};

use crate::config::DiscoveryConfig;
use crate::device::{Device, DeviceRegistry, NfcaType, RfInterface, TechData};
use crate::error::{DiscoveryError, Result, RfError, RfResult};
use crate::p2p;
use crate::rf::{BitRate, IsoDepRequest, IsoDepTarget, RfLayer};

/// Highest bit rate proposed during ISO-DEP activation.
pub const ISO_DEP_MAX_BIT_RATE: BitRate = BitRate::Kbps424;

/// Activates the device at `index` and marks it active.
///
/// On failure the registry's active selection is left as it was.
pub fn activate<R: RfLayer>(
    rf: &mut R,
    registry: &mut DeviceRegistry,
    index: usize,
    config: &DiscoveryConfig,
) -> Result<()> {
    let len = registry.len();
    let device = registry
        .get_mut(index)
        .ok_or(DiscoveryError::InvalidDeviceIndex { index, len })?;
    let technology = device.technology();

    activate_device(rf, device, config).map_err(|source| DiscoveryError::Activation { technology, source })?;

    info!(
        technology = %technology,
        id = %device.display_id(),
        interface = ?device.interface().kind(),
        "{} activated",
        device.description()
    );
    registry.set_active(index)
}

fn activate_device<R: RfLayer>(rf: &mut R, device: &mut Device, config: &DiscoveryConfig) -> RfResult<()> {
    match device.tech().clone() {
        TechData::A(nfca) => {
            if nfca.is_sleep {
                rf.nfca_wake_all()?;
                rf.nfca_select(&nfca.nfcid1)?;
            }
            match nfca.kind {
                NfcaType::T1T | NfcaType::T2T => {
                    device.set_interface(RfInterface::RawFrame);
                    Ok(())
                }
                NfcaType::NfcDep => p2p::activate_nfc_dep(rf, device, config),
                NfcaType::T4tNfcDep if config.nfca_p2p_priority => p2p::activate_nfc_dep(rf, device, config),
                NfcaType::T4T | NfcaType::T4tNfcDep => {
                    let info = rf.iso_dep_activate(&iso_dep_request(IsoDepTarget::A, config))?;
                    device.set_interface(RfInterface::IsoDep(info));
                    Ok(())
                }
            }
        }

        TechData::B(nfcb) => {
            if nfcb.is_sleep {
                // ATTRIB below is addressed by NFCID0, so colliding answers
                // to the wake-up are harmless.
                match rf.nfcb_wake_all() {
                    Ok(()) | Err(RfError::Collision) => {}
                    Err(e) => return Err(e),
                }
            }
            match rf.iso_dep_activate(&iso_dep_request(IsoDepTarget::B(nfcb), config)) {
                Ok(info) => device.set_interface(RfInterface::IsoDep(info)),
                Err(e) => {
                    debug!(error = %e, "NFC-B ISO-DEP activation failed, staying on raw frames");
                    device.set_interface(RfInterface::RawFrame);
                }
            }
            Ok(())
        }

        TechData::F(nfcf) if nfcf.supports_nfc_dep() => p2p::activate_nfc_dep(rf, device, config),

        TechData::F(_) | TechData::V(_) => {
            device.set_interface(RfInterface::RawFrame);
            Ok(())
        }
    }
}

fn iso_dep_request(target: IsoDepTarget, config: &DiscoveryConfig) -> IsoDepRequest {
    IsoDepRequest {
        target,
        fsdi: config.iso_dep_fsxi,
        did: None,
        max_bit_rate: ISO_DEP_MAX_BIT_RATE,
    }
}

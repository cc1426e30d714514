use tracing::{debug, warn};

use crate::device::{DeviceRegistry, RfInterface};
use crate::rf::RfLayer;

/// Releases the active device, if any, and switches the field off.
///
/// Never fails: primitive errors are logged and the registry still ends up
/// with no active device.
pub fn deactivate<R: RfLayer>(rf: &mut R, registry: &mut DeviceRegistry) {
    if let Some(device) = registry.active_device() {
        let released = match device.interface() {
            RfInterface::RawFrame => Ok(()),
            RfInterface::IsoDep(_) => rf.iso_dep_deselect(),
            RfInterface::NfcDep(_) => rf.nfc_dep_release(),
        };
        if let Err(e) = released {
            warn!(technology = %device.technology(), error = %e, "releasing device failed");
        }
    }

    if let Err(e) = rf.field_off() {
        warn!(error = %e, "switching field off failed");
    }
    registry.clear_active();
    debug!("deactivated");
}

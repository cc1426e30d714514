use tracing::{debug, warn};

use crate::device::{Device, DeviceRegistry};
use crate::rf::RfLayer;
use crate::tech::TechSet;

/// Runs collision resolution for every found technology and appends the
/// resolved listeners to `registry` until it is full.
///
/// Returns true when at least one device is registered.
pub fn resolve_collisions<R: RfLayer>(rf: &mut R, found: TechSet, registry: &mut DeviceRegistry) -> bool {
    for tech in found.iter() {
        let slots = registry.remaining();
        if slots == 0 {
            debug!(technology = %tech, "device list full, skipping");
            break;
        }

        // Polling other technologies may have consumed the guard time.
        let resolved = rf
            .initialize(tech)
            .and_then(|_| rf.field_on())
            .and_then(|_| rf.collision_resolve(tech, slots));

        let descriptors = match resolved {
            Ok(descriptors) => descriptors,
            Err(e) => {
                warn!(technology = %tech, error = %e, "collision resolution failed");
                continue;
            }
        };

        debug!(technology = %tech, count = descriptors.len(), "collision resolution done");

        for descriptor in descriptors {
            if descriptor.technology() != tech {
                warn!(
                    technology = %tech,
                    got = %descriptor.technology(),
                    "dropping listen descriptor of another technology"
                );
                continue;
            }
            if !registry.push(Device::new(descriptor)) {
                break;
            }
        }
    }

    !registry.is_empty()
}

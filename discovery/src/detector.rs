use tracing::{debug, warn};

use crate::rf::RfLayer;
use crate::tech::TechSet;

/// Polls every enabled technology once, in A, B, F, V order, with the field
/// on. Returns the technologies that answered.
pub fn detect_technologies<R: RfLayer>(rf: &mut R, enabled: TechSet) -> TechSet {
    let mut found = TechSet::empty();

    for tech in enabled.iter() {
        let detected = rf
            .initialize(tech)
            .and_then(|_| rf.field_on())
            .and_then(|_| rf.technology_detect(tech));

        match detected {
            Ok(true) => {
                debug!(technology = %tech, "technology detected");
                found.insert(tech);
            }
            Ok(false) => {}
            Err(e) => warn!(technology = %tech, error = %e, "technology detection failed"),
        }
    }

    found
}

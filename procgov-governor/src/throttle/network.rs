//! Network throttling: group bandwidth cap and DSCP tag

use procgov_core::NetworkLimitSpec;
use tracing::{debug, warn};

use super::Target;
use crate::math::network_rate_control;

/// Apply `spec` to the kernel group of `target`.
///
/// A kernel without bandwidth control is a soft failure: it is logged and
/// counts as success so the other dimensions are unaffected.
pub async fn apply(target: &Target<'_>, spec: &NetworkLimitSpec) -> bool {
    let Some(handle) = target.handle else {
        warn!(group = target.group, "No kernel group, network limits not applied");
        return false;
    };

    let control = network_rate_control(spec);
    if control.max_bytes_per_sec == 0 && control.dscp_tag.is_none() {
        debug!(group = target.group, "Network limit has no rate or tag, nothing to apply");
        return true;
    }

    debug!(
        group = target.group,
        max_bytes_per_sec = control.max_bytes_per_sec,
        dscp_tag = ?control.dscp_tag,
        "Setting network rate control"
    );

    match handle.set_network_rate(control).await {
        Ok(()) => true,
        Err(e) if e.is_soft_fail() => {
            warn!(
                group = target.group,
                error = %e,
                "Network rate control not supported on this system, skipping"
            );
            true
        }
        Err(e) => {
            warn!(group = target.group, error = %e, "Set network rate failed");
            false
        }
    }
}

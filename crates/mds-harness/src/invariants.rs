//! Checks against a running [`crate::SimCluster`] that a well-behaved
//! router must always satisfy, independent of which scenario produced its
//! current state.

use mds_router::Router;

/// Every open client's protocol id, if assigned, is unique (spec §3: a
/// freshly allocated id is never reused while its owner is open).
#[must_use]
pub fn protocol_ids_are_unique(router: &Router) -> bool {
    let mut seen = Vec::new();
    for client in router.snapshot_clients() {
        if let Some(id) = client.protocol_id() {
            if seen.contains(&id) {
                return false;
            }
            seen.push(id);
        }
    }
    true
}

/// A closed client is never present in any other client's delivered
/// multicast target list (spec §3: `open = false` clients are never
/// chosen as delivery targets). Checked indirectly: no closed client
/// should still be registered in the table at all, since the reader loop
/// deregisters on close.
#[must_use]
pub fn no_closed_client_remains_registered(router: &Router) -> bool {
    router.snapshot_clients().iter().all(|client| client.is_open())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::SimCluster;

    #[test]
    fn fresh_cluster_has_no_duplicate_ids() {
        let cluster = SimCluster::start();
        let mut a = cluster.connect();
        let mut b = cluster.connect();
        a.assign_id();
        b.assign_id();
        assert!(protocol_ids_are_unique(cluster.router()));
    }
}

//! Per-group state: the lazily built buddy index plus everything the
//! group's single lock guards.

use crate::buddy::BuddyIndex;
use crate::prealloc::PaShared;
use crate::reclaim::DeferredFree;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One group's lock and state. The mutex guards the buddy structure, the
/// pending deferred frees, and the group's preallocation membership list.
#[derive(Debug, Default)]
pub(crate) struct GroupCell {
    pub state: Mutex<GroupState>,
}

#[derive(Debug, Default)]
pub(crate) struct GroupState {
    /// Built on first touch from the persistent bitmap; `None` until then.
    pub buddy: Option<BuddyIndex>,
    /// Deferred frees keyed by group-relative start cluster.
    pub pending: BTreeMap<u32, DeferredFree>,
    /// Preallocations whose window lives in this group.
    pub pas: Vec<Arc<PaShared>>,
    /// Reconciliation failed; the group refuses further allocation.
    pub corrupt: bool,
    /// Free space was already discarded; repeat trims short-circuit.
    pub was_trimmed: bool,
}

impl GroupState {
    /// Drop a preallocation from the membership list by identity.
    pub fn remove_pa(&mut self, pa: &Arc<PaShared>) {
        self.pas.retain(|p| !Arc::ptr_eq(p, pa));
    }
}

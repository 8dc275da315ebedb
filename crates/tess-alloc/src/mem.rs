//! In-memory collaborator implementations.
//!
//! Reference implementations of the consumed interfaces, backed by plain
//! memory. The engine's own tests and benches run against these; embedders
//! can use them for experiments before wiring up a real block cache.

use crate::{BitmapStore, DiscardDevice, QuotaSink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tess_error::{AllocError, Result};
use tess_types::{AllocGeometry, ClusterNumber, Cx, GroupNumber};

/// Bitmap store over plain vectors; every group starts fully free.
pub struct MemBitmapStore {
    bitmaps: Vec<Mutex<Vec<u8>>>,
    declared: Vec<AtomicU32>,
    clusters: Vec<u32>,
}

impl MemBitmapStore {
    #[must_use]
    pub fn new(geometry: &AllocGeometry) -> Self {
        let bytes = (geometry.clusters_per_group as usize).div_ceil(8);
        let clusters: Vec<u32> = (0..geometry.group_count)
            .map(|g| geometry.clusters_in_group(GroupNumber(g)))
            .collect();
        Self {
            bitmaps: (0..geometry.group_count)
                .map(|_| Mutex::new(vec![0_u8; bytes]))
                .collect(),
            declared: clusters.iter().map(|&c| AtomicU32::new(c)).collect(),
            clusters,
        }
    }

    /// Reset a group to "everything used except the given free runs",
    /// keeping the declared count consistent. Test scaffolding for
    /// fragmented layouts.
    pub fn fill_group(&self, group: GroupNumber, free_runs: &[(u32, u32)]) {
        let mut bm = self.bitmaps[group.0 as usize].lock();
        for byte in bm.iter_mut() {
            *byte = 0xFF;
        }
        let limit = self.clusters[group.0 as usize];
        let mut free = 0;
        for &(start, len) in free_runs {
            debug_assert!(start + len <= limit, "free run outside group");
            crate::bitmap::clear_range(&mut bm, start, len);
            free += len;
        }
        self.declared[group.0 as usize].store(free, Ordering::Relaxed);
    }
}

impl BitmapStore for MemBitmapStore {
    fn read_group_bitmap(&self, cx: &Cx, group: GroupNumber) -> Result<Vec<u8>> {
        cx.checkpoint()?;
        Ok(self.bitmaps[group.0 as usize].lock().clone())
    }

    fn write_group_bitmap(&self, cx: &Cx, group: GroupNumber, bitmap: &[u8]) -> Result<()> {
        cx.checkpoint()?;
        let mut bm = self.bitmaps[group.0 as usize].lock();
        let len = bm.len().min(bitmap.len());
        bm[..len].copy_from_slice(&bitmap[..len]);
        Ok(())
    }

    fn declared_free(&self, group: GroupNumber) -> u32 {
        self.declared[group.0 as usize].load(Ordering::Relaxed)
    }

    fn set_declared_free(&self, group: GroupNumber, free: u32) {
        self.declared[group.0 as usize].store(free, Ordering::Relaxed);
    }
}

/// Quota sink that always grants.
pub struct NoQuota;

impl QuotaSink for NoQuota {
    fn charge(&self, _clusters: u32) -> bool {
        true
    }

    fn release(&self, _clusters: u32) {}
}

/// Discard device recording every issued extent; can be told to fail.
#[derive(Default)]
pub struct RecordingDiscard {
    issued: Mutex<Vec<(u64, u32)>>,
    fail: AtomicBool,
}

impl RecordingDiscard {
    #[must_use]
    pub fn issued(&self) -> Vec<(u64, u32)> {
        self.issued.lock().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl DiscardDevice for RecordingDiscard {
    fn issue_discard(&self, start: ClusterNumber, count: u32) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(AllocError::Device("injected discard failure".into()));
        }
        self.issued.lock().push((start.0, count));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_roundtrip() {
        let geometry = AllocGeometry::new(4096, 64, 128, 0).unwrap();
        let store = MemBitmapStore::new(&geometry);
        let cx = Cx::for_testing();
        let mut bm = store.read_group_bitmap(&cx, GroupNumber(0)).unwrap();
        crate::bitmap::set(&mut bm, 5);
        store.write_group_bitmap(&cx, GroupNumber(0), &bm).unwrap();
        let back = store.read_group_bitmap(&cx, GroupNumber(0)).unwrap();
        assert!(crate::bitmap::get(&back, 5));
        assert_eq!(store.declared_free(GroupNumber(1)), 64);
    }

    #[test]
    fn fill_group_sets_declared_count() {
        let geometry = AllocGeometry::new(4096, 64, 64, 0).unwrap();
        let store = MemBitmapStore::new(&geometry);
        store.fill_group(GroupNumber(0), &[(0, 10), (20, 6)]);
        assert_eq!(store.declared_free(GroupNumber(0)), 16);
        let cx = Cx::for_testing();
        let bm = store.read_group_bitmap(&cx, GroupNumber(0)).unwrap();
        assert_eq!(crate::bitmap::count_free(&bm, 64), 16);
    }

    #[test]
    fn recording_discard_failure_mode() {
        let dev = RecordingDiscard::default();
        dev.issue_discard(ClusterNumber(8), 4).unwrap();
        assert_eq!(dev.issued(), vec![(8, 4)]);
        dev.set_fail(true);
        assert!(dev.issue_discard(ClusterNumber(0), 1).is_err());
    }
}

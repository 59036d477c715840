//! Identity map of live directory nodes.
//!
//! At most one [`DirNode`] exists per directory. A node stays in the map
//! while it has cache holds or open handles and is evicted when both drop
//! to zero. Both counters are only changed under the map mutex, which is a
//! leaf lock: no node lock is ever taken while it is held.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;
use log::debug;

use super::node::{DirNode, NodeId};

#[derive(Default)]
pub struct DirCache {
    map: Mutex<HashMap<NodeId, Arc<DirNode>>>,
}

impl DirCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<NodeId, Arc<DirNode>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a hold on a resident node.
    pub fn acquire(&self, id: NodeId) -> Option<Arc<DirNode>> {
        let map = self.map();
        let node = map.get(&id)?;
        node.holds.fetch_add(1, Ordering::AcqRel);
        Some(node.clone())
    }

    /// Take a hold on `id`, creating its node if it is not resident.
    pub fn create_or_acquire(&self, id: NodeId, start_cluster: u32, mtime: NaiveDateTime) -> Arc<DirNode> {
        let mut map = self.map();
        let node = map
            .entry(id)
            .or_insert_with(|| {
                debug!("dcache: loading directory {id:?}");
                Arc::new(DirNode::new(id, start_cluster, mtime))
            })
            .clone();
        node.holds.fetch_add(1, Ordering::AcqRel);
        node
    }

    /// Take another hold on a node the caller already holds or has open.
    pub fn hold(&self, node: &Arc<DirNode>) {
        let _map = self.map();
        node.holds.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a hold.
    pub fn release(&self, node: &Arc<DirNode>) {
        let mut map = self.map();
        let prev = node.holds.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "hold underflow on {:?}", node.id());
        Self::evict_if_unused(&mut map, node);
    }

    /// Count a new open handle.
    pub fn add_ref(&self, node: &Arc<DirNode>) {
        let _map = self.map();
        node.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Give back an open handle.
    pub fn drop_ref(&self, node: &Arc<DirNode>) {
        let mut map = self.map();
        let prev = node.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "ref underflow on {:?}", node.id());
        Self::evict_if_unused(&mut map, node);
    }

    /// Resident node without changing any counter.
    pub fn peek(&self, id: NodeId) -> Option<Arc<DirNode>> {
        self.map().get(&id).cloned()
    }

    /// Snapshot of every resident node.
    pub fn resident(&self) -> Vec<Arc<DirNode>> {
        self.map().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn evict_if_unused(map: &mut HashMap<NodeId, Arc<DirNode>>, node: &Arc<DirNode>) {
        if node.holds.load(Ordering::Acquire) == 0 && node.refs.load(Ordering::Acquire) == 0 {
            // Only evict the node that is actually mapped.
            if map.get(&node.id()).is_some_and(|n| Arc::ptr_eq(n, node)) {
                map.remove(&node.id());
                debug!("dcache: evicted directory {:?}", node.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::entry::fat_epoch;
    use std::thread;

    #[test]
    fn test_single_node_per_id() {
        let cache = DirCache::new();
        let a = cache.create_or_acquire(NodeId(7), 7, fat_epoch());
        let b = cache.create_or_acquire(NodeId(7), 7, fat_epoch());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.holds(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_when_both_counters_zero() {
        let cache = DirCache::new();
        let node = cache.create_or_acquire(NodeId(3), 3, fat_epoch());
        cache.add_ref(&node);
        cache.release(&node);
        // Still open.
        assert!(cache.peek(NodeId(3)).is_some());
        cache.drop_ref(&node);
        assert!(cache.peek(NodeId(3)).is_none());
        assert!(cache.acquire(NodeId(3)).is_none());
    }

    #[test]
    fn test_hold_keeps_resident() {
        let cache = DirCache::new();
        let node = cache.create_or_acquire(NodeId::ROOT, 0, fat_epoch());
        cache.hold(&node);
        cache.release(&node);
        assert!(cache.peek(NodeId::ROOT).is_some());
        let again = cache.acquire(NodeId::ROOT).unwrap();
        assert_eq!(again.holds(), 2);
        cache.release(&again);
        cache.release(&node);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_create_or_acquire() {
        let cache = Arc::new(DirCache::new());
        let nodes: Vec<Arc<DirNode>> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.create_or_acquire(NodeId(11), 11, fat_epoch()))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        for n in &nodes[1..] {
            assert!(Arc::ptr_eq(&nodes[0], n));
        }
        assert_eq!(nodes[0].holds(), 8);
    }
}

//! Per-segment node arena with deferred reclamation.
//!
//! Every dynamic tree of a segment allocates its nodes through one
//! [`NodeArena`]. The arena owns all node slots, accounts node memory and keeps
//! replaced node snapshots on a retirement list until no reader can still be
//! looking at them.
//!
//! Reclamation is epoch based. A reader pins the current epoch for the duration
//! of a traversal; retiring a node stamps it with the epoch at which it became
//! unreachable and advances the epoch. A retired node is reclaimed once every
//! active pin is newer than its stamp.
//!
//! The optional memory quota bounds live node memory (published plus retired).
//! Exceeding it poisons the arena: the owning segment is unusable from then on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{trace, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::config::DynamicTreeConfig;
use crate::lexical::dynamic::tree::{Node, NodeSlot};

/// Memory counters of an arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Bytes ever allocated.
    pub total_bytes: u64,
    /// Bytes currently held, published and retired.
    pub allocated_bytes: u64,
    /// Bytes retired and awaiting reclamation.
    pub retired_bytes: u64,
    /// Bytes reclaimed so far.
    pub freed_bytes: u64,
    /// Number of node slots.
    pub slot_count: usize,
    /// Retired snapshots awaiting reclamation.
    pub retired_nodes: usize,
    /// Current epoch.
    pub epoch: u64,
}

#[derive(Debug)]
struct Retired {
    epoch: u64,
    bytes: u64,
    // Held only to keep the snapshot alive until reclamation.
    _node: Arc<Node>,
}

/// Node arena shared by all trees of one segment.
#[derive(Debug)]
pub struct NodeArena {
    segment_id: SegmentId,
    node_capacity: usize,
    quota: Option<u64>,
    total: AtomicU64,
    allocated: AtomicU64,
    retired_bytes: AtomicU64,
    freed: AtomicU64,
    epoch: AtomicU64,
    poisoned: AtomicBool,
    pins: Mutex<BTreeMap<u64, usize>>,
    retired: Mutex<Vec<Retired>>,
    slots: Mutex<Vec<Arc<NodeSlot>>>,
    next_slot_id: AtomicU64,
}

impl NodeArena {
    /// Create an arena for `segment_id`.
    pub fn new(segment_id: SegmentId, config: &DynamicTreeConfig) -> Self {
        NodeArena {
            segment_id,
            node_capacity: config.node_capacity,
            quota: config.memory_quota_bytes,
            total: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            retired_bytes: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            pins: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            slots: Mutex::new(Vec::new()),
            next_slot_id: AtomicU64::new(0),
        }
    }

    /// Segment owning the arena.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Maximum entries per node of every tree in the arena.
    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    /// Whether the quota was exceeded.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Account `bytes` of new node memory.
    pub fn allocate(&self, bytes: u64) -> Result<()> {
        self.check_poisoned()?;

        if let Some(quota) = self.quota {
            if self.allocated.load(Ordering::Acquire) + bytes > quota {
                self.reclaim();
            }
            let live = self.allocated.load(Ordering::Acquire);
            if live + bytes > quota {
                self.poisoned.store(true, Ordering::Release);
                warn!(
                    "dynamic index arena of segment {} exhausted: {live} + {bytes} bytes over quota {quota}",
                    self.segment_id
                );
                return Err(SegpatchError::resource_exhausted(format!(
                    "segment {} node arena quota of {quota} bytes exceeded",
                    self.segment_id
                )));
            }
        }

        self.allocated.fetch_add(bytes, Ordering::AcqRel);
        self.total.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate a slot holding `node`.
    pub fn new_slot(&self, node: Node) -> Result<Arc<NodeSlot>> {
        self.allocate(node.memory_size())?;
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(NodeSlot::new(id, node));
        self.slots.lock().push(Arc::clone(&slot));
        Ok(slot)
    }

    /// Pin the current epoch. Nodes retired from now on stay alive until the
    /// guard is dropped.
    pub fn pin(self: &Arc<Self>) -> EpochGuard {
        let mut pins = self.pins.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        *pins.entry(epoch).or_insert(0) += 1;
        EpochGuard {
            arena: Arc::clone(self),
            epoch,
        }
    }

    /// Number of active pins.
    pub fn active_pins(&self) -> usize {
        self.pins.lock().values().sum()
    }

    /// Retire a replaced node snapshot.
    pub fn retire(&self, node: Arc<Node>) {
        let bytes = node.memory_size();
        let mut retired = self.retired.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel);
        retired.push(Retired {
            epoch,
            bytes,
            _node: node,
        });
        self.retired_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Release retired snapshots no pinned reader can see. Returns the number of
    /// bytes reclaimed.
    pub fn reclaim(&self) -> u64 {
        let oldest_pin = self.pins.lock().keys().next().copied();
        let mut retired = self.retired.lock();

        let mut freed = 0u64;
        let mut nodes = 0usize;
        retired.retain(|entry| {
            let reclaimable = oldest_pin.is_none_or(|pin| entry.epoch < pin);
            if reclaimable {
                freed += entry.bytes;
                nodes += 1;
            }
            !reclaimable
        });
        drop(retired);

        if freed > 0 {
            self.retired_bytes.fetch_sub(freed, Ordering::AcqRel);
            self.allocated.fetch_sub(freed, Ordering::AcqRel);
            self.freed.fetch_add(freed, Ordering::Relaxed);
            trace!(
                "segment {}: reclaimed {nodes} nodes ({freed} bytes)",
                self.segment_id
            );
        }
        freed
    }

    /// Memory counters.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            total_bytes: self.total.load(Ordering::Relaxed),
            allocated_bytes: self.allocated.load(Ordering::Acquire),
            retired_bytes: self.retired_bytes.load(Ordering::Acquire),
            freed_bytes: self.freed.load(Ordering::Relaxed),
            slot_count: self.slots.lock().len(),
            retired_nodes: self.retired.lock().len(),
            epoch: self.epoch.load(Ordering::Acquire),
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(SegpatchError::resource_exhausted(format!(
                "segment {} node arena is exhausted",
                self.segment_id
            )));
        }
        Ok(())
    }

    fn unpin(&self, epoch: u64) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&epoch);
            }
        }
    }
}

/// An active epoch pin.
#[derive(Debug)]
pub struct EpochGuard {
    arena: Arc<NodeArena>,
    epoch: u64,
}

impl EpochGuard {
    /// Pinned epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Arena the pin belongs to.
    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.arena
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.arena.unpin(self.epoch);
    }
}

//! The host's circular list of pending updates.
//!
//! The scene root holds a pointer to the list's sentinel node. The list is
//! empty when the sentinel's `next` link points back at the sentinel.

use argon_config::log_pass_debug;
use argon_layout::{Address, ComponentRef, Coordinate, QueueLayout};

use crate::fault::LayoutFault;
use crate::memory::{all_or_nothing, ForeignMemory, POINTER_ALIGN};

const WHAT: &str = "pending-update list";

/// One queued update, read out of its list node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdate {
    pub position: Coordinate,
    pub originator: ComponentRef,
    pub node: Address,
}

pub struct PendingUpdateQueue<'a> {
    layout: &'a QueueLayout,
    root: Address,
    walk_limit: u64,
}

impl<'a> PendingUpdateQueue<'a> {
    pub fn new(layout: &'a QueueLayout, root: Address, walk_limit: u64) -> Self {
        Self {
            layout,
            root,
            walk_limit,
        }
    }

    /// Sentinel node, or `None` if the host never allocated the list.
    pub fn sentinel<M: ForeignMemory + ?Sized>(&self, mem: &M) -> Result<Option<Address>, LayoutFault> {
        let sentinel = mem.read_addr(self.root.add(self.layout.sentinel_pointer_offset))?;
        if sentinel.is_null() {
            return Ok(None);
        }
        if !sentinel.is_aligned(POINTER_ALIGN) {
            return Err(LayoutFault::Misaligned {
                what: "pending-list sentinel",
                addr: sentinel,
            });
        }
        Ok(Some(sentinel))
    }

    pub fn is_empty<M: ForeignMemory + ?Sized>(&self, mem: &M) -> Result<bool, LayoutFault> {
        let Some(sentinel) = self.sentinel(mem)? else {
            return Ok(true);
        };
        let first = mem.read_ptr(sentinel.add(self.layout.node_next_offset), "pending next link")?;
        Ok(first == sentinel)
    }

    /// Read every queued update in list order without modifying the list.
    ///
    /// Each node's back link is checked on the way, so a snapshot that
    /// succeeds describes a well-formed list.
    pub fn snapshot<M: ForeignMemory + ?Sized>(
        &self,
        mem: &M,
    ) -> Result<Vec<PendingUpdate>, LayoutFault> {
        let layout = self.layout;
        let Some(sentinel) = self.sentinel(mem)? else {
            return Ok(Vec::new());
        };

        let mut updates = Vec::new();
        let mut prev = sentinel;
        let mut cur = mem.read_ptr(sentinel.add(layout.node_next_offset), "pending next link")?;
        while cur != sentinel {
            if updates.len() as u64 >= self.walk_limit {
                return Err(LayoutFault::RunawayChain {
                    what: WHAT,
                    limit: self.walk_limit,
                });
            }
            if mem.read_addr(cur.add(layout.node_prev_offset))? != prev {
                return Err(LayoutFault::BrokenLink {
                    what: WHAT,
                    node: cur,
                });
            }
            updates.push(PendingUpdate {
                position: mem.read_coordinate(cur.add(layout.node_position_offset))?,
                originator: ComponentRef(mem.read_addr(cur.add(layout.node_originator_offset))?),
                node: cur,
            });
            prev = cur;
            cur = mem.read_ptr(cur.add(layout.node_next_offset), "pending next link")?;
        }
        if mem.read_addr(sentinel.add(layout.node_prev_offset))? != prev {
            return Err(LayoutFault::BrokenLink {
                what: WHAT,
                node: sentinel,
            });
        }
        Ok(updates)
    }

    /// Unlink and release every node in `updates`, which must be the full
    /// result of a [`snapshot`](Self::snapshot) taken since the last change.
    pub fn drain<M: ForeignMemory + ?Sized>(
        &self,
        mem: &mut M,
        updates: &[PendingUpdate],
    ) -> Result<u64, LayoutFault> {
        if updates.is_empty() {
            return Ok(0);
        }
        let layout = self.layout;
        let sentinel = self.sentinel(mem)?.ok_or(LayoutFault::NullPointer {
            what: "pending-list sentinel",
        })?;
        let count = updates.len() as u64;

        let remaining = match layout.len_offset {
            Some(offset) => {
                let len = mem.read_u64(self.root.add(offset))?;
                Some(
                    len.checked_sub(count)
                        .ok_or(LayoutFault::CounterUnderflow { what: WHAT })?,
                )
            }
            None => None,
        };

        all_or_nothing(mem, |mem| {
            mem.write_addr(sentinel.add(layout.node_next_offset), sentinel)?;
            mem.write_addr(sentinel.add(layout.node_prev_offset), sentinel)?;
            if let (Some(offset), Some(remaining)) = (layout.len_offset, remaining) {
                mem.write_u64(self.root.add(offset), remaining)?;
            }
            Ok::<_, LayoutFault>(())
        })?;
        for update in updates {
            mem.release(update.node, layout.node_size)?;
        }

        log_pass_debug!("Drained pending-update list", nodes = count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHeap, SimScene};
    use argon_layout::LayoutContract;

    fn queue(scene: &SimScene) -> PendingUpdateQueue<'_> {
        let contract = scene.contract();
        PendingUpdateQueue::new(&contract.pending, scene.root(), contract.max_chain_walk)
    }

    #[test]
    fn test_new_scene_has_empty_queue() {
        let mut heap = SimHeap::new();
        let scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        let q = queue(&scene);
        assert!(q.is_empty(&heap).unwrap());
        assert!(q.snapshot(&heap).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_in_enqueue_order() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        let a = scene.add_component(&mut heap, Coordinate::new(0, 0, 0)).unwrap();
        scene.enqueue(&mut heap, Coordinate::new(1, 0, 0), a).unwrap();
        scene
            .enqueue(&mut heap, Coordinate::new(2, 0, 0), ComponentRef::NONE)
            .unwrap();

        let q = queue(&scene);
        assert!(!q.is_empty(&heap).unwrap());
        let updates = q.snapshot(&heap).unwrap();
        let seen: Vec<_> = updates.iter().map(|u| (u.position, u.originator)).collect();
        assert_eq!(
            seen,
            vec![
                (Coordinate::new(1, 0, 0), a),
                (Coordinate::new(2, 0, 0), ComponentRef::NONE)
            ]
        );
    }

    #[test]
    fn test_drain_releases_nodes_and_counter() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        for x in 0..3 {
            scene
                .enqueue(&mut heap, Coordinate::new(x, 0, 0), ComponentRef::NONE)
                .unwrap();
        }
        let live = heap.live_blocks();
        let q = queue(&scene);
        let updates = q.snapshot(&heap).unwrap();
        assert_eq!(q.drain(&mut heap, &updates).unwrap(), 3);
        assert!(q.is_empty(&heap).unwrap());
        assert_eq!(scene.pending_len(&heap).unwrap(), 0);
        assert_eq!(heap.live_blocks(), live - 3);
    }

    #[test]
    fn test_missing_sentinel_reads_as_empty() {
        let mut heap = SimHeap::new();
        let scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        let offset = scene.contract().pending.sentinel_pointer_offset;
        heap.write_addr(scene.root().add(offset), Address::NULL).unwrap();
        let q = queue(&scene);
        assert!(q.is_empty(&heap).unwrap());
        assert!(q.snapshot(&heap).unwrap().is_empty());
    }

    #[test]
    fn test_broken_back_link_is_a_fault() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        scene
            .enqueue(&mut heap, Coordinate::new(1, 1, 1), ComponentRef::NONE)
            .unwrap();
        scene
            .enqueue(&mut heap, Coordinate::new(2, 2, 2), ComponentRef::NONE)
            .unwrap();
        let q = queue(&scene);
        let second = q.snapshot(&heap).unwrap()[1].node;
        let prev_offset = scene.contract().pending.node_prev_offset;
        heap.write_addr(second.add(prev_offset), second).unwrap();
        assert!(matches!(
            q.snapshot(&heap),
            Err(LayoutFault::BrokenLink { .. })
        ));
    }

    #[test]
    fn test_counter_underflow_rejected_before_writes() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        scene
            .enqueue(&mut heap, Coordinate::new(1, 1, 1), ComponentRef::NONE)
            .unwrap();
        let len_offset = scene.contract().pending.len_offset.unwrap();
        heap.write_u64(scene.root().add(len_offset), 0).unwrap();
        let q = queue(&scene);
        let updates = q.snapshot(&heap).unwrap();
        let writes = heap.write_count();
        assert!(matches!(
            q.drain(&mut heap, &updates),
            Err(LayoutFault::CounterUnderflow { .. })
        ));
        assert_eq!(heap.write_count(), writes);
        assert_eq!(q.snapshot(&heap).unwrap().len(), 1);
    }

    #[test]
    fn test_misaligned_sentinel_is_a_fault() {
        let mut heap = SimHeap::new();
        let scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        let slot = scene.root().add(scene.contract().pending.sentinel_pointer_offset);
        let sentinel = heap.read_addr(slot).unwrap();
        heap.write_addr(slot, sentinel.add(4)).unwrap();
        let q = queue(&scene);
        assert!(matches!(
            q.sentinel(&heap),
            Err(LayoutFault::Misaligned { .. })
        ));
        assert!(q.is_empty(&heap).is_err());
    }

    #[test]
    fn test_failed_drain_keeps_list_and_nodes() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        for x in 0..2 {
            scene
                .enqueue(&mut heap, Coordinate::new(x, 0, 0), ComponentRef::NONE)
                .unwrap();
        }
        let live = heap.live_blocks();
        let q = queue(&scene);
        let updates = q.snapshot(&heap).unwrap();
        heap.fail_write_after(2);
        assert!(matches!(
            q.drain(&mut heap, &updates),
            Err(LayoutFault::WriteRejected { .. })
        ));
        assert_eq!(q.snapshot(&heap).unwrap(), updates);
        assert_eq!(scene.pending_len(&heap).unwrap(), 2);
        assert_eq!(heap.live_blocks(), live);
    }
}

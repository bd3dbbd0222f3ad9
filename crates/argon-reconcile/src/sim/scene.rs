//! A circuit scene laid out in a [`SimHeap`] exactly as a contract describes.

use argon_layout::{Address, ComponentRef, Coordinate, HashTableLayout, LayoutContract};

use crate::fault::LayoutFault;
use crate::hash_index::ForeignHashIndex;
use crate::host::CoordinateHasher;
use crate::memory::ForeignMemory;
use crate::queue::PendingUpdateQueue;
use crate::record::AssociationRecord;

use super::{Hash3Combine, SimHeap};

/// Spare entries allocated past the end of each record.
const RECORD_SPARE: u64 = 2;
/// Largest bucket array a simulated table gets.
pub const MAX_BUCKETS: u64 = 1 << 16;
/// `removeSource` entry of the vtable shared by plain simulated components.
/// Never called; notifiers only record it.
pub const BASE_REMOVE_SOURCE: Address = Address::new(0x7ff0_0000_1000);

/// Simulated components hold a vtable pointer at the contract's offset,
/// followed by their position.
pub struct SimScene<H = Hash3Combine> {
    contract: LayoutContract,
    hasher: H,
    root: Address,
    vtable: Address,
}

impl SimScene<Hash3Combine> {
    pub fn new(
        heap: &mut SimHeap,
        contract: LayoutContract,
        bucket_count: u64,
    ) -> Result<Self, LayoutFault> {
        Self::with_hasher(heap, contract, bucket_count, Hash3Combine::default())
    }
}

impl<H: CoordinateHasher> SimScene<H> {
    /// Lay out an empty scene. `bucket_count` is rounded up to a power of
    /// two and may not exceed [`MAX_BUCKETS`].
    pub fn with_hasher(
        heap: &mut SimHeap,
        contract: LayoutContract,
        bucket_count: u64,
        hasher: H,
    ) -> Result<Self, LayoutFault> {
        let bucket_count = bucket_count
            .max(1)
            .checked_next_power_of_two()
            .filter(|count| *count <= MAX_BUCKETS)
            .ok_or(LayoutFault::BucketOutOfRange {
                what: "simulated table",
                index: bucket_count,
                buckets: MAX_BUCKETS,
            })?;
        let root = heap.allocate(contract.root_extent());
        init_table(heap, &contract.registry, root, bucket_count)?;
        init_table(heap, &contract.association, root, bucket_count)?;

        let pending = &contract.pending;
        let sentinel = heap.allocate(pending.node_size);
        heap.write_addr(sentinel.add(pending.node_next_offset), sentinel)?;
        heap.write_addr(sentinel.add(pending.node_prev_offset), sentinel)?;
        heap.write_addr(root.add(pending.sentinel_pointer_offset), sentinel)?;

        let vtable = allocate_vtable(heap, &contract, BASE_REMOVE_SOURCE)?;
        Ok(Self {
            contract,
            hasher,
            root,
            vtable,
        })
    }

    pub fn root(&self) -> Address {
        self.root
    }

    pub fn contract(&self) -> &LayoutContract {
        &self.contract
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    fn registry(&self) -> ForeignHashIndex<'_> {
        ForeignHashIndex::new(
            "component registry",
            &self.contract.registry,
            self.root,
            self.contract.max_chain_walk,
        )
    }

    fn association(&self) -> ForeignHashIndex<'_> {
        ForeignHashIndex::new(
            "association index",
            &self.contract.association,
            self.root,
            self.contract.max_chain_walk,
        )
    }

    fn pending(&self) -> PendingUpdateQueue<'_> {
        PendingUpdateQueue::new(
            &self.contract.pending,
            self.root,
            self.contract.max_chain_walk,
        )
    }

    fn position_offset(&self) -> u64 {
        self.contract.component.vtable_offset + 8
    }

    fn component_size(&self) -> u64 {
        self.position_offset() + Coordinate::SIZE as u64
    }

    /// A vtable whose `removeSource` slot holds `remove_source`, standing in
    /// for a component subclass that overrides it.
    pub fn subclass_vtable(
        &self,
        heap: &mut SimHeap,
        remove_source: Address,
    ) -> Result<Address, LayoutFault> {
        allocate_vtable(heap, &self.contract, remove_source)
    }

    /// Create a component at `pos`, replacing any component already there.
    pub fn add_component(
        &mut self,
        heap: &mut SimHeap,
        pos: Coordinate,
    ) -> Result<ComponentRef, LayoutFault> {
        let vtable = self.vtable;
        self.add_component_with_vtable(heap, pos, vtable)
    }

    /// [`add_component`](Self::add_component) with a caller-chosen vtable.
    pub fn add_component_with_vtable(
        &mut self,
        heap: &mut SimHeap,
        pos: Coordinate,
        vtable: Address,
    ) -> Result<ComponentRef, LayoutFault> {
        self.remove_component(heap, pos)?;
        let component = heap.allocate(self.component_size());
        heap.write_addr(component.add(self.contract.component.vtable_offset), vtable)?;
        heap.write_bytes(component.add(self.position_offset()), &pos.to_le_bytes())?;
        let slot = self.contract.component_pointer_offset;
        let node = self.insert(heap, &self.contract.registry, pos)?;
        heap.write_addr(
            node.add(self.contract.registry.node_value_offset + slot),
            component,
        )?;
        Ok(ComponentRef(component))
    }

    /// Destroy the component at `pos`, leaving any association entries
    /// pointing at it stale. Returns false if there was none.
    pub fn remove_component(
        &mut self,
        heap: &mut SimHeap,
        pos: Coordinate,
    ) -> Result<bool, LayoutFault> {
        let slot = self.contract.component_pointer_offset;
        let size = self.component_size();
        self.registry()
            .erase(heap, &self.hasher, pos, |heap, value| {
                let component = heap.read_addr(value.add(slot))?;
                if component.is_null() {
                    return Ok(());
                }
                heap.release(component, size)
            })
    }

    /// Set the record at `key` to `entries`, creating the key if needed.
    ///
    /// An empty `entries` leaves the key mapped to an unallocated record,
    /// which is the leaked state the pass evicts.
    pub fn associate(
        &mut self,
        heap: &mut SimHeap,
        key: Coordinate,
        entries: &[Coordinate],
    ) -> Result<(), LayoutFault> {
        let value = match self.record_value_address(heap, key)? {
            Some(value) => {
                AssociationRecord::release_storage(heap, value, &self.contract.record)?;
                value
            }
            None => {
                let node = self.insert(heap, &self.contract.association, key)?;
                node.add(self.contract.association.node_value_offset)
            }
        };
        if entries.is_empty() {
            return Ok(());
        }

        let record = &self.contract.record;
        let len = entries.len() as u64;
        let start = heap.allocate((len + RECORD_SPARE) * record.entry_stride);
        for (i, pos) in entries.iter().enumerate() {
            let entry = start.add(i as u64 * record.entry_stride);
            heap.write_bytes(entry.add(record.entry_position_offset), &pos.to_le_bytes())?;
        }
        heap.write_addr(value.add(record.start_offset), start)?;
        heap.write_addr(
            value.add(record.finish_offset),
            start.add(len * record.entry_stride),
        )?;
        heap.write_addr(
            value.add(record.storage_end_offset),
            start.add((len + RECORD_SPARE) * record.entry_stride),
        )?;
        Ok(())
    }

    /// Append a pending update to the back of the queue.
    pub fn enqueue(
        &mut self,
        heap: &mut SimHeap,
        position: Coordinate,
        originator: ComponentRef,
    ) -> Result<Address, LayoutFault> {
        let layout = &self.contract.pending;
        let sentinel = heap.read_ptr(
            self.root.add(layout.sentinel_pointer_offset),
            "pending-list sentinel",
        )?;
        let node = heap.allocate(layout.node_size);
        heap.write_bytes(node.add(layout.node_position_offset), &position.to_le_bytes())?;
        heap.write_addr(node.add(layout.node_originator_offset), originator.address())?;

        let last = heap.read_ptr(sentinel.add(layout.node_prev_offset), "pending prev link")?;
        heap.write_addr(node.add(layout.node_prev_offset), last)?;
        heap.write_addr(node.add(layout.node_next_offset), sentinel)?;
        heap.write_addr(last.add(layout.node_next_offset), node)?;
        heap.write_addr(sentinel.add(layout.node_prev_offset), node)?;
        if let Some(offset) = layout.len_offset {
            let len = heap.read_u64(self.root.add(offset))?;
            heap.write_u64(self.root.add(offset), len + 1)?;
        }
        Ok(node)
    }

    /// Link a fresh node for `key` at the head of its bucket.
    fn insert(
        &self,
        heap: &mut SimHeap,
        layout: &HashTableLayout,
        key: Coordinate,
    ) -> Result<Address, LayoutFault> {
        let base = self.root.add(layout.table_offset);
        let sentinel = heap.read_ptr(base.add(layout.sentinel_offset), "table sentinel")?;
        let buckets = heap.read_ptr(base.add(layout.buckets_offset), "bucket array")?;
        let mask = heap.read_u64(base.add(layout.mask_offset))?;
        let bucket = buckets.add((self.hasher.hash(key) & mask) * layout.bucket_stride);
        let head_slot = bucket.add(layout.bucket_head_offset);
        let tail_slot = bucket.add(layout.bucket_tail_offset);

        let node = heap.allocate(layout.node_size);
        heap.write_bytes(node.add(layout.node_key_offset), &key.to_le_bytes())?;

        let head = heap.read_addr(head_slot)?;
        let (before, empty) = if head == sentinel {
            (sentinel, true)
        } else {
            (head, false)
        };
        let prev = heap.read_ptr(before.add(layout.node_prev_offset), "chain prev link")?;
        heap.write_addr(node.add(layout.node_prev_offset), prev)?;
        heap.write_addr(node.add(layout.node_next_offset), before)?;
        heap.write_addr(prev.add(layout.node_next_offset), node)?;
        heap.write_addr(before.add(layout.node_prev_offset), node)?;
        heap.write_addr(head_slot, node)?;
        if empty {
            heap.write_addr(tail_slot, node)?;
        }

        let len = heap.read_u64(base.add(layout.len_offset))?;
        heap.write_u64(base.add(layout.len_offset), len + 1)?;
        Ok(node)
    }

    /// Every key in the association index, in list order.
    pub fn association_keys(&self, heap: &SimHeap) -> Result<Vec<Coordinate>, LayoutFault> {
        let layout = &self.contract.association;
        let base = self.root.add(layout.table_offset);
        let sentinel = heap.read_ptr(base.add(layout.sentinel_offset), "table sentinel")?;
        let mut keys = Vec::new();
        let mut cur = heap.read_ptr(sentinel.add(layout.node_next_offset), "chain next link")?;
        while cur != sentinel {
            if keys.len() as u64 >= self.contract.max_chain_walk {
                return Err(LayoutFault::RunawayChain {
                    what: "association index",
                    limit: self.contract.max_chain_walk,
                });
            }
            keys.push(heap.read_coordinate(cur.add(layout.node_key_offset))?);
            cur = heap.read_ptr(cur.add(layout.node_next_offset), "chain next link")?;
        }
        Ok(keys)
    }

    pub fn record_value_address(
        &self,
        heap: &SimHeap,
        key: Coordinate,
    ) -> Result<Option<Address>, LayoutFault> {
        let table = self.association();
        Ok(table
            .lookup(heap, &self.hasher, key)?
            .map(|entry| table.value_address(&entry)))
    }

    /// Entry positions of the record at `key`, or `None` if the key is absent.
    pub fn association_entries(
        &self,
        heap: &SimHeap,
        key: Coordinate,
    ) -> Result<Option<Vec<Coordinate>>, LayoutFault> {
        let Some(value) = self.record_value_address(heap, key)? else {
            return Ok(None);
        };
        let record = AssociationRecord::load(heap, value, &self.contract.record)?;
        Ok(Some(record.positions().collect()))
    }

    pub fn association_len(&self, heap: &SimHeap) -> Result<u64, LayoutFault> {
        self.association().len(heap)
    }

    pub fn registry_len(&self, heap: &SimHeap) -> Result<u64, LayoutFault> {
        self.registry().len(heap)
    }

    /// Queued updates, from the host counter if the layout has one.
    pub fn pending_len(&self, heap: &SimHeap) -> Result<u64, LayoutFault> {
        match self.contract.pending.len_offset {
            Some(offset) => heap.read_u64(self.root.add(offset)),
            None => Ok(self.pending().snapshot(heap)?.len() as u64),
        }
    }

    pub fn component_at(
        &self,
        heap: &SimHeap,
        pos: Coordinate,
    ) -> Result<Option<ComponentRef>, LayoutFault> {
        let table = self.registry();
        let Some(entry) = table.lookup(heap, &self.hasher, pos)? else {
            return Ok(None);
        };
        let slot = table
            .value_address(&entry)
            .add(self.contract.component_pointer_offset);
        Ok(Some(ComponentRef(heap.read_addr(slot)?)))
    }

    /// Position a simulated component was created at.
    pub fn position_of(
        &self,
        heap: &SimHeap,
        component: ComponentRef,
    ) -> Result<Coordinate, LayoutFault> {
        heap.read_coordinate(component.address().add(self.position_offset()))
    }
}

fn allocate_vtable(
    heap: &mut SimHeap,
    contract: &LayoutContract,
    remove_source: Address,
) -> Result<Address, LayoutFault> {
    let slot = contract.component.remove_source_offset();
    let vtable = heap.allocate(slot + 8);
    heap.write_addr(vtable.add(slot), remove_source)?;
    Ok(vtable)
}

fn init_table(
    heap: &mut SimHeap,
    layout: &HashTableLayout,
    root: Address,
    bucket_count: u64,
) -> Result<(), LayoutFault> {
    let base = root.add(layout.table_offset);
    let sentinel = heap.allocate(layout.node_size);
    heap.write_addr(sentinel.add(layout.node_next_offset), sentinel)?;
    heap.write_addr(sentinel.add(layout.node_prev_offset), sentinel)?;

    let span = bucket_count
        .checked_mul(layout.bucket_stride)
        .ok_or(LayoutFault::BucketOutOfRange {
            what: "simulated table",
            index: bucket_count,
            buckets: MAX_BUCKETS,
        })?;
    let buckets = heap.allocate(span);
    for i in 0..bucket_count {
        let bucket = buckets.add(i * layout.bucket_stride);
        heap.write_addr(bucket.add(layout.bucket_head_offset), sentinel)?;
        heap.write_addr(bucket.add(layout.bucket_tail_offset), sentinel)?;
    }

    heap.write_addr(base.add(layout.sentinel_offset), sentinel)?;
    heap.write_u64(base.add(layout.len_offset), 0)?;
    heap.write_addr(base.add(layout.buckets_offset), buckets)?;
    heap.write_addr(base.add(layout.buckets_end_offset), buckets.add(span))?;
    heap.write_u64(base.add(layout.mask_offset), bucket_count - 1)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: i32, y: i32, z: i32) -> Coordinate {
        Coordinate::new(x, y, z)
    }

    #[test]
    fn test_components_roundtrip_through_registry() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 4).unwrap();
        let a = scene.add_component(&mut heap, c(1, 2, 3)).unwrap();
        assert_eq!(scene.component_at(&heap, c(1, 2, 3)).unwrap(), Some(a));
        assert_eq!(scene.position_of(&heap, a).unwrap(), c(1, 2, 3));
        assert_eq!(scene.registry_len(&heap).unwrap(), 1);

        assert!(scene.remove_component(&mut heap, c(1, 2, 3)).unwrap());
        assert_eq!(scene.component_at(&heap, c(1, 2, 3)).unwrap(), None);
        assert!(!heap.is_live(a.address()));
    }

    #[test]
    fn test_many_keys_share_few_buckets() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 2).unwrap();
        for x in 0..20 {
            scene.associate(&mut heap, c(x, -x, 7), &[c(x, 0, 0)]).unwrap();
        }
        assert_eq!(scene.association_len(&heap).unwrap(), 20);
        assert_eq!(scene.association_keys(&heap).unwrap().len(), 20);
        for x in 0..20 {
            assert_eq!(
                scene.association_entries(&heap, c(x, -x, 7)).unwrap(),
                Some(vec![c(x, 0, 0)])
            );
        }
    }

    #[test]
    fn test_reassociate_replaces_record() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        scene.associate(&mut heap, c(0, 0, 0), &[c(1, 0, 0)]).unwrap();
        let live = heap.live_blocks();
        scene
            .associate(&mut heap, c(0, 0, 0), &[c(2, 0, 0), c(3, 0, 0)])
            .unwrap();
        assert_eq!(heap.live_blocks(), live);
        assert_eq!(scene.association_len(&heap).unwrap(), 1);
        assert_eq!(
            scene.association_entries(&heap, c(0, 0, 0)).unwrap(),
            Some(vec![c(2, 0, 0), c(3, 0, 0)])
        );
    }

    #[test]
    fn test_bucket_count_rounds_to_power_of_two() {
        let mut heap = SimHeap::new();
        let scene = SimScene::new(&mut heap, LayoutContract::simulated(), 5).unwrap();
        let layout = &scene.contract().association;
        let mask = heap
            .read_u64(scene.root().add(layout.table_offset + layout.mask_offset))
            .unwrap();
        assert_eq!(mask, 7);
        let buckets = heap
            .read_addr(scene.root().add(layout.table_offset + layout.buckets_offset))
            .unwrap();
        assert_eq!(heap.block_size(buckets), Some(8 * layout.bucket_stride));
    }

    #[test]
    fn test_oversized_bucket_count_is_an_error() {
        for count in [MAX_BUCKETS + 1, (1 << 62) + 1, u64::MAX] {
            let mut heap = SimHeap::new();
            let err = SimScene::new(&mut heap, LayoutContract::simulated(), count)
                .err()
                .unwrap();
            assert!(matches!(err, LayoutFault::BucketOutOfRange { .. }));
            assert_eq!(heap.live_blocks(), 0);
        }
        let mut heap = SimHeap::new();
        assert!(SimScene::new(&mut heap, LayoutContract::simulated(), MAX_BUCKETS).is_ok());
    }

    #[test]
    fn test_components_dispatch_through_their_vtable() {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 4).unwrap();
        let plain = scene.add_component(&mut heap, c(0, 0, 0)).unwrap();
        let override_at = Address::new(0x7ff0_0000_2000);
        let vtable = scene.subclass_vtable(&mut heap, override_at).unwrap();
        let special = scene
            .add_component_with_vtable(&mut heap, c(1, 0, 0), vtable)
            .unwrap();

        let component = &scene.contract().component;
        let slot_of = |obj: ComponentRef| {
            let vptr = heap
                .read_addr(obj.address().add(component.vtable_offset))
                .unwrap();
            heap.read_addr(vptr.add(component.remove_source_offset()))
                .unwrap()
        };
        assert_eq!(slot_of(plain), BASE_REMOVE_SOURCE);
        assert_eq!(slot_of(special), override_at);
        assert_eq!(scene.position_of(&heap, special).unwrap(), c(1, 0, 0));
    }
}

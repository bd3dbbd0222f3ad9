//! Association records: fixed-stride entry runs stored in a host vector.
//!
//! A record is loaded into a staged copy, edited there, and written back by
//! [`AssociationRecord::commit`]. The `finish` pointer is written last, so a
//! fault during commit never leaves the host's length bookkeeping half-updated.

use argon_layout::{Address, Coordinate, RecordLayout};

use crate::fault::LayoutFault;
use crate::memory::ForeignMemory;

#[derive(Debug, Clone)]
pub struct AssociationRecord {
    value: Address,
    start: Address,
    stride: u64,
    position_offset: u64,
    finish_offset: u64,
    /// Staged entry bytes; `len * stride` of them are live.
    entries: Vec<u8>,
    len: usize,
    loaded_len: usize,
}

impl AssociationRecord {
    /// Read the record stored at `value` (the owning node's mapped value).
    pub fn load<M: ForeignMemory + ?Sized>(
        mem: &M,
        value: Address,
        layout: &RecordLayout,
    ) -> Result<Self, LayoutFault> {
        let start = mem.read_addr(value.add(layout.start_offset))?;
        let finish = mem.read_addr(value.add(layout.finish_offset))?;
        let storage_end = mem.read_addr(value.add(layout.storage_end_offset))?;
        let corrupt = || LayoutFault::CorruptRecord {
            start,
            finish,
            storage_end,
        };

        // Never-allocated vectors are all null.
        if start.is_null() && !(finish.is_null() && storage_end.is_null()) {
            return Err(corrupt());
        }
        if start > finish || finish > storage_end {
            return Err(corrupt());
        }
        let bytes = finish.distance_from(start).ok_or_else(corrupt)?;
        if bytes % layout.entry_stride != 0 || bytes / layout.entry_stride > layout.max_len {
            return Err(corrupt());
        }

        let len = (bytes / layout.entry_stride) as usize;
        let mut entries = vec![0u8; bytes as usize];
        if len > 0 {
            mem.read_bytes(start, &mut entries)?;
        }

        Ok(Self {
            value,
            start,
            stride: layout.entry_stride,
            position_offset: layout.entry_position_offset,
            finish_offset: layout.finish_offset,
            entries,
            len,
            loaded_len: len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.len != self.loaded_len
    }

    fn slot(&self, index: usize) -> std::ops::Range<usize> {
        let stride = self.stride as usize;
        index * stride..(index + 1) * stride
    }

    pub fn position(&self, index: usize) -> Option<Coordinate> {
        if index >= self.len {
            return None;
        }
        let at = self.slot(index).start + self.position_offset as usize;
        let mut raw = [0u8; Coordinate::SIZE];
        raw.copy_from_slice(&self.entries[at..at + Coordinate::SIZE]);
        Some(Coordinate::from_le_bytes(raw))
    }

    pub fn positions(&self) -> impl Iterator<Item = Coordinate> + '_ {
        (0..self.len).filter_map(move |i| self.position(i))
    }

    /// Remove entry `index` by moving the last entry into its slot.
    ///
    /// Entry order is not preserved. Returns the removed entry's position.
    pub fn remove_at(&mut self, index: usize) -> Option<Coordinate> {
        let removed = self.position(index)?;
        let last = self.len - 1;
        if index != last {
            let src = self.slot(last);
            let dst = self.slot(index).start;
            self.entries.copy_within(src, dst);
        }
        self.len = last;
        Some(removed)
    }

    /// Write staged changes back. Returns the number of entries removed.
    pub fn commit<M: ForeignMemory + ?Sized>(&mut self, mem: &mut M) -> Result<usize, LayoutFault> {
        if !self.is_dirty() {
            return Ok(0);
        }
        let live = self.len * self.stride as usize;
        if live > 0 {
            mem.write_bytes(self.start, &self.entries[..live])?;
        }
        mem.write_addr(
            self.value.add(self.finish_offset),
            self.start.add(live as u64),
        )?;

        let removed = self.loaded_len - self.len;
        self.entries.truncate(live);
        self.loaded_len = self.len;
        Ok(removed)
    }

    /// Free the entry storage of the record at `value` and null its pointers.
    pub fn release_storage<M: ForeignMemory + ?Sized>(
        mem: &mut M,
        value: Address,
        layout: &RecordLayout,
    ) -> Result<(), LayoutFault> {
        if !Self::release_buffer(mem, value, layout)? {
            return Ok(());
        }
        for offset in [
            layout.start_offset,
            layout.finish_offset,
            layout.storage_end_offset,
        ] {
            mem.write_addr(value.add(offset), Address::NULL)?;
        }
        Ok(())
    }

    /// Free the entry storage without touching the record itself, for a
    /// record whose node is freed next. Returns false if none was allocated.
    pub fn release_buffer<M: ForeignMemory + ?Sized>(
        mem: &mut M,
        value: Address,
        layout: &RecordLayout,
    ) -> Result<bool, LayoutFault> {
        let start = mem.read_addr(value.add(layout.start_offset))?;
        if start.is_null() {
            return Ok(false);
        }
        let storage_end = mem.read_addr(value.add(layout.storage_end_offset))?;
        let capacity = storage_end
            .distance_from(start)
            .ok_or(LayoutFault::CorruptRecord {
                start,
                finish: Address::NULL,
                storage_end,
            })?;
        mem.release(start, capacity)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHeap, SimScene};
    use argon_layout::LayoutContract;

    fn c(x: i32) -> Coordinate {
        Coordinate::new(x, 0, 0)
    }

    fn setup(entries: &[Coordinate]) -> (SimHeap, SimScene, Address) {
        let mut heap = SimHeap::new();
        let mut scene = SimScene::new(&mut heap, LayoutContract::simulated(), 8).unwrap();
        scene.associate(&mut heap, c(100), entries).unwrap();
        let value = scene.record_value_address(&heap, c(100)).unwrap().unwrap();
        (heap, scene, value)
    }

    #[test]
    fn test_load_reads_positions() {
        let (heap, scene, value) = setup(&[c(1), c(2), c(3)]);
        let record = AssociationRecord::load(&heap, value, &scene.contract().record).unwrap();
        assert_eq!(record.len(), 3);
        assert_eq!(record.positions().collect::<Vec<_>>(), vec![c(1), c(2), c(3)]);
        assert!(!record.is_dirty());
    }

    #[test]
    fn test_remove_at_swaps_with_last() {
        let (heap, scene, value) = setup(&[c(1), c(2), c(3), c(4)]);
        let mut record = AssociationRecord::load(&heap, value, &scene.contract().record).unwrap();
        assert_eq!(record.remove_at(1), Some(c(2)));
        assert_eq!(record.positions().collect::<Vec<_>>(), vec![c(1), c(4), c(3)]);
        assert_eq!(record.remove_at(2), Some(c(3)));
        assert_eq!(record.positions().collect::<Vec<_>>(), vec![c(1), c(4)]);
        assert_eq!(record.remove_at(5), None);
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_commit_writes_entries_then_finish() {
        let (mut heap, scene, value) = setup(&[c(1), c(2), c(3)]);
        let layout = scene.contract().record.clone();
        let mut record = AssociationRecord::load(&heap, value, &layout).unwrap();
        record.remove_at(0);
        assert_eq!(record.commit(&mut heap).unwrap(), 1);
        assert_eq!(
            scene.association_entries(&heap, c(100)).unwrap().unwrap(),
            vec![c(3), c(2)]
        );
        // Nothing staged, nothing written.
        let writes = heap.write_count();
        assert_eq!(record.commit(&mut heap).unwrap(), 0);
        assert_eq!(heap.write_count(), writes);
    }

    #[test]
    fn test_commit_fault_keeps_length() {
        let (mut heap, scene, value) = setup(&[c(1), c(2)]);
        let layout = scene.contract().record.clone();
        let mut record = AssociationRecord::load(&heap, value, &layout).unwrap();
        while record.remove_at(0).is_some() {}
        heap.fail_writes_at(value.add(layout.finish_offset));
        assert!(matches!(
            record.commit(&mut heap),
            Err(LayoutFault::WriteRejected { .. })
        ));
        assert_eq!(
            scene.association_entries(&heap, c(100)).unwrap().unwrap(),
            vec![c(1), c(2)]
        );
    }

    #[test]
    fn test_empty_unallocated_record() {
        let (heap, scene, value) = setup(&[]);
        let record = AssociationRecord::load(&heap, value, &scene.contract().record).unwrap();
        assert!(record.is_empty());
        assert_eq!(record.positions().count(), 0);
    }

    #[test]
    fn test_load_rejects_inverted_bounds() {
        let (mut heap, scene, value) = setup(&[c(1), c(2)]);
        let layout = scene.contract().record.clone();
        let start = heap.read_addr(value.add(layout.start_offset)).unwrap();
        // finish before start
        heap.write_addr(value.add(layout.finish_offset), Address::new(start.raw() - 32))
            .unwrap();
        assert!(matches!(
            AssociationRecord::load(&heap, value, &layout),
            Err(LayoutFault::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_load_rejects_partial_entry() {
        let (mut heap, scene, value) = setup(&[c(1), c(2)]);
        let layout = scene.contract().record.clone();
        let finish = heap.read_addr(value.add(layout.finish_offset)).unwrap();
        heap.write_addr(value.add(layout.finish_offset), Address::new(finish.raw() - 4))
            .unwrap();
        assert!(matches!(
            AssociationRecord::load(&heap, value, &layout),
            Err(LayoutFault::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_release_storage_frees_buffer() {
        let (mut heap, scene, value) = setup(&[c(1)]);
        let layout = scene.contract().record.clone();
        let live = heap.live_blocks();
        AssociationRecord::release_storage(&mut heap, value, &layout).unwrap();
        assert_eq!(heap.live_blocks(), live - 1);
        assert!(heap.read_addr(value.add(layout.start_offset)).unwrap().is_null());
        // Second release is a no-op on the nulled triple.
        AssociationRecord::release_storage(&mut heap, value, &layout).unwrap();
        assert_eq!(heap.live_blocks(), live - 1);
    }

    #[test]
    fn test_release_buffer_leaves_record_alone() {
        let (mut heap, scene, value) = setup(&[c(1), c(2)]);
        let layout = scene.contract().record.clone();
        let live = heap.live_blocks();
        let writes = heap.write_count();
        assert!(AssociationRecord::release_buffer(&mut heap, value, &layout).unwrap());
        assert_eq!(heap.live_blocks(), live - 1);
        assert_eq!(heap.write_count(), writes);
        assert!(!heap.read_addr(value.add(layout.start_offset)).unwrap().is_null());
    }
}

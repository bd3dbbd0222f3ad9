//! Simulated address space.

use std::collections::{BTreeMap, BTreeSet};

use argon_layout::Address;

use crate::fault::LayoutFault;
use crate::memory::ForeignMemory;

const HEAP_BASE: u64 = 0x1000_0000;
const BLOCK_ALIGN: u64 = 16;
/// Unmapped gap left after every block so overruns hit nothing.
const GUARD: u64 = 64;

/// Bounds-checked heap of zero-initialised blocks.
///
/// Reads and writes must fall entirely inside one live block, and releases
/// must name a block's exact base and size. Writes can be made to fail on
/// demand to exercise fault handling.
#[derive(Debug, Default)]
pub struct SimHeap {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
    writes: u64,
    fail_at: BTreeSet<u64>,
    writes_left: Option<u64>,
}

impl SimHeap {
    pub fn new() -> Self {
        Self {
            next: HEAP_BASE,
            ..Self::default()
        }
    }

    /// Allocate `size` zeroed bytes. Zero-sized requests get one byte.
    pub fn allocate(&mut self, size: u64) -> Address {
        if self.next == 0 {
            self.next = HEAP_BASE;
        }
        let size = size.max(1);
        let base = self.next;
        self.blocks.insert(base, vec![0; size as usize]);
        self.next = (base + size + GUARD).div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN;
        Address::new(base)
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_live(&self, addr: Address) -> bool {
        self.blocks.contains_key(&addr.raw())
    }

    /// Size of the live block starting at `addr`.
    pub fn block_size(&self, addr: Address) -> Option<u64> {
        self.blocks.get(&addr.raw()).map(|b| b.len() as u64)
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Reject any write that touches `addr`.
    pub fn fail_writes_at(&mut self, addr: Address) {
        self.fail_at.insert(addr.raw());
    }

    /// Allow `n` more writes, then reject the next one.
    pub fn fail_write_after(&mut self, n: u64) {
        self.writes_left = Some(n);
    }

    pub fn clear_faults(&mut self) {
        self.fail_at.clear();
        self.writes_left = None;
    }

    fn locate(&self, addr: Address, len: usize) -> Result<(u64, usize), LayoutFault> {
        let unmapped = LayoutFault::Unmapped { addr, len };
        if addr.is_null() {
            return Err(LayoutFault::NullPointer {
                what: "simulated access",
            });
        }
        let (&base, block) = self
            .blocks
            .range(..=addr.raw())
            .next_back()
            .ok_or(unmapped.clone())?;
        let offset = (addr.raw() - base) as usize;
        match offset.checked_add(len) {
            Some(end) if end <= block.len() => Ok((base, offset)),
            _ => Err(unmapped),
        }
    }
}

impl ForeignMemory for SimHeap {
    fn read_bytes(&self, addr: Address, buf: &mut [u8]) -> Result<(), LayoutFault> {
        let (base, offset) = self.locate(addr, buf.len())?;
        let block = &self.blocks[&base];
        buf.copy_from_slice(&block[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, addr: Address, bytes: &[u8]) -> Result<(), LayoutFault> {
        let (base, offset) = self.locate(addr, bytes.len())?;
        let rejected = LayoutFault::WriteRejected {
            addr,
            len: bytes.len(),
        };
        let end = addr.raw() + bytes.len() as u64;
        if self.fail_at.range(addr.raw()..end).next().is_some() {
            return Err(rejected);
        }
        match self.writes_left {
            Some(0) => {
                self.writes_left = None;
                return Err(rejected);
            }
            Some(left) => self.writes_left = Some(left - 1),
            None => {}
        }
        if let Some(block) = self.blocks.get_mut(&base) {
            block[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        self.writes += 1;
        Ok(())
    }

    fn release(&mut self, addr: Address, size: u64) -> Result<(), LayoutFault> {
        match self.blocks.get(&addr.raw()) {
            Some(block) if block.len() as u64 == size.max(1) => {
                self.blocks.remove(&addr.raw());
                Ok(())
            }
            _ => Err(LayoutFault::BadRelease { addr, size }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_disjoint_and_aligned() {
        let mut heap = SimHeap::new();
        let a = heap.allocate(24);
        let b = heap.allocate(8);
        assert!(a.is_aligned(BLOCK_ALIGN) && b.is_aligned(BLOCK_ALIGN));
        assert!(b.raw() >= a.raw() + 24 + GUARD);
        assert_eq!(heap.live_blocks(), 2);
    }

    #[test]
    fn test_access_outside_block_is_unmapped() {
        let mut heap = SimHeap::new();
        let a = heap.allocate(16);
        heap.write_u64(a.add(8), 7).unwrap();
        assert_eq!(heap.read_u64(a.add(8)).unwrap(), 7);
        assert!(matches!(
            heap.read_u64(a.add(12)),
            Err(LayoutFault::Unmapped { .. })
        ));
        assert!(matches!(
            heap.read_u64(Address::new(0x10)),
            Err(LayoutFault::Unmapped { .. })
        ));
        assert!(matches!(
            heap.read_u64(Address::NULL),
            Err(LayoutFault::NullPointer { .. })
        ));
    }

    #[test]
    fn test_release_requires_exact_block() {
        let mut heap = SimHeap::new();
        let a = heap.allocate(32);
        assert!(matches!(
            heap.release(a, 16),
            Err(LayoutFault::BadRelease { .. })
        ));
        assert!(heap.release(a.add(8), 24).is_err());
        heap.release(a, 32).unwrap();
        assert!(!heap.is_live(a));
        // double free
        assert!(heap.release(a, 32).is_err());
        assert!(heap.read_u64(a).is_err());
    }

    #[test]
    fn test_write_fault_injection() {
        let mut heap = SimHeap::new();
        let a = heap.allocate(32);
        heap.fail_writes_at(a.add(20));
        assert!(heap.write_u64(a.add(16), 1).is_err());
        heap.write_u64(a.add(8), 1).unwrap();
        assert_eq!(heap.write_count(), 1);

        heap.clear_faults();
        heap.fail_write_after(1);
        heap.write_u64(a.add(16), 2).unwrap();
        assert!(matches!(
            heap.write_u64(a, 3),
            Err(LayoutFault::WriteRejected { .. })
        ));
        assert_eq!(heap.read_u64(a).unwrap(), 0);
        // One rejection only.
        heap.write_u64(a, 4).unwrap();
        assert_eq!(heap.read_u64(a).unwrap(), 4);
    }
}

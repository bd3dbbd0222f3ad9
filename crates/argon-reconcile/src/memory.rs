//! Fallible access to foreign memory.
//!
//! The reconciliation core never dereferences a host pointer directly: every
//! read, write and release goes through [`ForeignMemory`], which can refuse it
//! with a [`LayoutFault`].

use std::ffi::c_void;

use argon_config::log_fault_error;
use argon_layout::{Address, Coordinate};

use crate::fault::LayoutFault;

pub(crate) const POINTER_ALIGN: u64 = 8;

/// Byte-addressed view of memory owned by someone else.
pub trait ForeignMemory {
    fn read_bytes(&self, addr: Address, buf: &mut [u8]) -> Result<(), LayoutFault>;

    fn write_bytes(&mut self, addr: Address, bytes: &[u8]) -> Result<(), LayoutFault>;

    /// Return `size` bytes at `addr` to the allocator that produced them.
    fn release(&mut self, addr: Address, size: u64) -> Result<(), LayoutFault>;

    fn read_u64(&self, addr: Address) -> Result<u64, LayoutFault> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&mut self, addr: Address, value: u64) -> Result<(), LayoutFault> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Read a pointer field as-is (null allowed).
    fn read_addr(&self, addr: Address) -> Result<Address, LayoutFault> {
        self.read_u64(addr).map(Address)
    }

    /// Read a pointer field that must be non-null and pointer aligned.
    fn read_ptr(&self, addr: Address, what: &'static str) -> Result<Address, LayoutFault> {
        let ptr = self.read_addr(addr)?;
        if ptr.is_null() {
            return Err(LayoutFault::NullPointer { what });
        }
        if !ptr.is_aligned(POINTER_ALIGN) {
            return Err(LayoutFault::Misaligned { what, addr: ptr });
        }
        Ok(ptr)
    }

    fn write_addr(&mut self, addr: Address, value: Address) -> Result<(), LayoutFault> {
        self.write_u64(addr, value.raw())
    }

    fn read_coordinate(&self, addr: Address) -> Result<Coordinate, LayoutFault> {
        let mut buf = [0u8; Coordinate::SIZE];
        self.read_bytes(addr, &mut buf)?;
        Ok(Coordinate::from_le_bytes(buf))
    }
}

/// Write-through view of another [`ForeignMemory`] that remembers the bytes
/// each write replaced, so the whole batch can be undone.
///
/// Releases cannot be undone and are refused.
pub struct WriteJournal<'m, M: ForeignMemory + ?Sized> {
    mem: &'m mut M,
    undo: Vec<(Address, Vec<u8>)>,
}

impl<'m, M: ForeignMemory + ?Sized> WriteJournal<'m, M> {
    pub fn new(mem: &'m mut M) -> Self {
        Self {
            mem,
            undo: Vec::new(),
        }
    }

    /// Writes applied so far.
    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    /// Restore every written range, newest first.
    pub fn rollback(mut self) -> Result<(), LayoutFault> {
        while let Some((addr, bytes)) = self.undo.pop() {
            self.mem.write_bytes(addr, &bytes)?;
        }
        Ok(())
    }
}

impl<M: ForeignMemory + ?Sized> ForeignMemory for WriteJournal<'_, M> {
    fn read_bytes(&self, addr: Address, buf: &mut [u8]) -> Result<(), LayoutFault> {
        self.mem.read_bytes(addr, buf)
    }

    fn write_bytes(&mut self, addr: Address, bytes: &[u8]) -> Result<(), LayoutFault> {
        let mut old = vec![0u8; bytes.len()];
        self.mem.read_bytes(addr, &mut old)?;
        self.mem.write_bytes(addr, bytes)?;
        self.undo.push((addr, old));
        Ok(())
    }

    fn release(&mut self, addr: Address, _size: u64) -> Result<(), LayoutFault> {
        Err(LayoutFault::ReleaseInJournal { addr })
    }
}

/// Apply `writes` to `mem` as one unit: if it fails, every byte it wrote is
/// put back before the error is returned.
pub fn all_or_nothing<M, T, E, F>(mem: &mut M, writes: F) -> Result<T, E>
where
    M: ForeignMemory + ?Sized,
    F: FnOnce(&mut WriteJournal<'_, M>) -> Result<T, E>,
{
    let mut journal = WriteJournal::new(mem);
    match writes(&mut journal) {
        Ok(value) => Ok(value),
        Err(err) => {
            let written = journal.len();
            if let Err(fault) = journal.rollback() {
                log_fault_error!(
                    "Rollback of a partial write failed",
                    writes = written,
                    fault = tracing::field::display(&fault),
                );
            }
            Err(err)
        }
    }
}

/// Host sized deallocation routine (`operator delete(void*, size_t)`).
pub type SizedDelete = unsafe extern "C" fn(*mut c_void, usize);

/// Lowest address treated as mapped; the first 64 KiB are never valid.
const USER_SPACE_MIN: u64 = 0x1_0000;
/// End of the canonical user-mode address range on x86-64.
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// The current process's address space.
///
/// Accesses are rejected before dereference when the range is null, below
/// the first 64 KiB, or outside the canonical user range. Anything that
/// passes those checks is read and written with unaligned raw copies.
#[derive(Clone, Copy)]
pub struct ProcessMemory {
    sized_delete: SizedDelete,
}

impl ProcessMemory {
    /// # Safety
    ///
    /// The caller must guarantee that structures reached through this
    /// accessor are not mutated concurrently, and that `sized_delete` is the
    /// deallocator matching the host's allocations.
    pub unsafe fn new(sized_delete: SizedDelete) -> Self {
        Self { sized_delete }
    }

    fn check(addr: Address, len: usize) -> Result<(), LayoutFault> {
        let end = addr.checked_add(len as u64);
        match end {
            Some(end) if addr.raw() >= USER_SPACE_MIN && end.raw() <= USER_SPACE_END => Ok(()),
            _ if addr.is_null() => Err(LayoutFault::NullPointer {
                what: "process memory access",
            }),
            _ => Err(LayoutFault::Unmapped { addr, len }),
        }
    }
}

impl ForeignMemory for ProcessMemory {
    fn read_bytes(&self, addr: Address, buf: &mut [u8]) -> Result<(), LayoutFault> {
        Self::check(addr, buf.len())?;
        // SAFETY: range checked above; liveness is the constructor's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(addr.raw() as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_bytes(&mut self, addr: Address, bytes: &[u8]) -> Result<(), LayoutFault> {
        Self::check(addr, bytes.len())?;
        // SAFETY: as for read_bytes; copy handles overlap with our own buffers.
        unsafe {
            std::ptr::copy(bytes.as_ptr(), addr.raw() as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn release(&mut self, addr: Address, size: u64) -> Result<(), LayoutFault> {
        Self::check(addr, size as usize)?;
        // SAFETY: the host allocated `size` bytes at `addr` with the matching allocator.
        unsafe { (self.sized_delete)(addr.raw() as *mut c_void, size as usize) };
        Ok(())
    }
}

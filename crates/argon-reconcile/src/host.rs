//! Routines the reconciliation core borrows from the host.
//!
//! The host decides bucket placement and owns the components; the core only
//! reproduces the bucket selection and forwards notifications.

use std::ffi::c_void;

use argon_layout::{Address, ComponentRef, Coordinate};

use crate::fault::LayoutFault;

/// Hash used by the host tables to place a coordinate into a bucket.
pub trait CoordinateHasher {
    fn hash(&self, pos: Coordinate) -> u64;
}

impl<F> CoordinateHasher for F
where
    F: Fn(Coordinate) -> u64,
{
    fn hash(&self, pos: Coordinate) -> u64 {
        self(pos)
    }
}

/// Notification that a component lost one of its power sources.
pub trait SourceNotifier {
    /// `method` is the component's own `removeSource`, read from its vtable.
    fn remove_source(
        &mut self,
        method: Address,
        component: ComponentRef,
        position: Coordinate,
        originator: ComponentRef,
    ) -> Result<(), LayoutFault>;
}

/// Host `hash3(const int&, const int&, const int&)`.
pub type Hash3Fn = unsafe extern "C" fn(*const i32, *const i32, *const i32) -> u64;

/// Host `BaseCircuitComponent::removeSource(const BlockPos&, const BaseCircuitComponent*)`.
pub type RemoveSourceFn = unsafe extern "C" fn(*mut c_void, *const Coordinate, *const c_void);

/// Bucket hash computed by calling the host's own routine.
#[derive(Clone, Copy)]
pub struct HostHash3 {
    routine: Hash3Fn,
}

impl HostHash3 {
    /// # Safety
    ///
    /// `addr` must be the entry point of a routine with the [`Hash3Fn`] signature.
    pub unsafe fn from_address(addr: Address) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let routine = std::mem::transmute::<usize, Hash3Fn>(addr.raw() as usize);
        Some(Self { routine })
    }
}

impl CoordinateHasher for HostHash3 {
    fn hash(&self, pos: Coordinate) -> u64 {
        // SAFETY: signature guaranteed at construction; arguments outlive the call.
        unsafe { (self.routine)(&pos.x, &pos.y, &pos.z) }
    }
}

/// Notifications delivered by calling each component's `removeSource`
/// through the address found in its vtable, so subclass overrides run.
#[derive(Debug, Clone, Copy)]
pub struct HostRemoveSource {
    _private: (),
}

impl HostRemoveSource {
    /// # Safety
    ///
    /// Every `method` later passed to [`SourceNotifier::remove_source`] must
    /// be a routine with the [`RemoveSourceFn`] signature taken from the live
    /// vtable of the `component` passed with it.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl SourceNotifier for HostRemoveSource {
    fn remove_source(
        &mut self,
        method: Address,
        component: ComponentRef,
        position: Coordinate,
        originator: ComponentRef,
    ) -> Result<(), LayoutFault> {
        if component.is_none() {
            return Err(LayoutFault::NullPointer {
                what: "notified component",
            });
        }
        if method.is_null() {
            return Err(LayoutFault::NullPointer {
                what: "removeSource vtable slot",
            });
        }
        // SAFETY: constructor contract; component and method were read from
        // live host memory during planning.
        unsafe {
            let routine = std::mem::transmute::<usize, RemoveSourceFn>(method.raw() as usize);
            routine(
                component.address().raw() as *mut c_void,
                &position,
                originator.address().raw() as *const c_void,
            )
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    unsafe extern "C" fn fake_hash3(x: *const i32, y: *const i32, z: *const i32) -> u64 {
        ((*x as u64) << 40) ^ ((*y as u64) << 20) ^ (*z as u64)
    }

    static CALLS: Mutex<Vec<(u64, Coordinate, u64)>> = Mutex::new(Vec::new());

    unsafe extern "C" fn fake_remove_source(
        this: *mut c_void,
        pos: *const Coordinate,
        originator: *const c_void,
    ) {
        CALLS
            .lock()
            .unwrap()
            .push((this as u64, *pos, originator as u64));
    }

    #[test]
    fn test_host_hash_calls_routine() {
        let hasher =
            unsafe { HostHash3::from_address(Address::new(fake_hash3 as usize as u64)) }.unwrap();
        assert_eq!(hasher.hash(Coordinate::new(1, 2, 3)), (1 << 40) ^ (2 << 20) ^ 3);
    }

    fn fake_method() -> Address {
        Address::new(fake_remove_source as usize as u64)
    }

    #[test]
    fn test_null_routine_rejected() {
        assert!(unsafe { HostHash3::from_address(Address::NULL) }.is_none());
    }

    #[test]
    fn test_host_remove_source_calls_given_method() {
        let mut notifier = unsafe { HostRemoveSource::new() };
        notifier
            .remove_source(
                fake_method(),
                ComponentRef(Address::new(0x5000)),
                Coordinate::new(4, 5, 6),
                ComponentRef(Address::new(0x6000)),
            )
            .unwrap();
        let calls = CALLS.lock().unwrap();
        assert!(calls.contains(&(0x5000, Coordinate::new(4, 5, 6), 0x6000)));
    }

    #[test]
    fn test_host_remove_source_rejects_missing_component() {
        let mut notifier = unsafe { HostRemoveSource::new() };
        let err = notifier
            .remove_source(
                fake_method(),
                ComponentRef::NONE,
                Coordinate::default(),
                ComponentRef::NONE,
            )
            .unwrap_err();
        assert!(matches!(err, LayoutFault::NullPointer { .. }));
    }

    #[test]
    fn test_host_remove_source_rejects_empty_slot() {
        let mut notifier = unsafe { HostRemoveSource::new() };
        let err = notifier
            .remove_source(
                Address::NULL,
                ComponentRef(Address::new(0x5000)),
                Coordinate::default(),
                ComponentRef::NONE,
            )
            .unwrap_err();
        assert_eq!(
            err,
            LayoutFault::NullPointer {
                what: "removeSource vtable slot"
            }
        );
    }

    #[test]
    fn test_closure_hasher() {
        let hasher = |pos: Coordinate| pos.x as u64;
        assert_eq!(CoordinateHasher::hash(&hasher, Coordinate::new(9, 0, 0)), 9);
    }
}

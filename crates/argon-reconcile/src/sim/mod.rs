//! In-memory stand-in for the host's circuit scene.
//!
//! Used by the test suite, the benches and `argon simulate`. Structures are
//! laid out byte for byte from a [`LayoutContract`](argon_layout::LayoutContract),
//! so the pass runs against them through the same code paths it uses in the
//! host process.

mod heap;
mod scene;

pub use heap::SimHeap;
pub use scene::{SimScene, BASE_REMOVE_SOURCE, MAX_BUCKETS};

use argon_layout::{Address, ComponentRef, Coordinate};
use serde::Serialize;

use crate::fault::LayoutFault;
use crate::host::{CoordinateHasher, SourceNotifier};

/// Seeded `hash_combine` over the three fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hash3Combine {
    pub seed: u64,
}

impl CoordinateHasher for Hash3Combine {
    fn hash(&self, pos: Coordinate) -> u64 {
        [pos.x, pos.y, pos.z].into_iter().fold(self.seed, |seed, v| {
            seed ^ (v as u32 as u64)
                .wrapping_add(0x9e37_79b9_7f4a_7c15)
                .wrapping_add(seed << 6)
                .wrapping_add(seed >> 2)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// `removeSource` implementation the call was dispatched to.
    pub method: Address,
    pub component: ComponentRef,
    pub position: Coordinate,
    pub originator: ComponentRef,
}

/// Notifier that records every call instead of touching a component.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub calls: Vec<Notification>,
    fail_after: Option<usize>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `n` notifications, then fault on every further one.
    pub fn fail_after(n: usize) -> Self {
        Self {
            calls: Vec::new(),
            fail_after: Some(n),
        }
    }

    /// How many notifications went to `component`.
    pub fn count_for(&self, component: ComponentRef) -> usize {
        self.calls.iter().filter(|n| n.component == component).count()
    }
}

impl SourceNotifier for RecordingNotifier {
    fn remove_source(
        &mut self,
        method: Address,
        component: ComponentRef,
        position: Coordinate,
        originator: ComponentRef,
    ) -> Result<(), LayoutFault> {
        if self.fail_after.is_some_and(|n| self.calls.len() >= n) {
            return Err(LayoutFault::NullPointer {
                what: "notified component",
            });
        }
        self.calls.push(Notification {
            method,
            component,
            position,
            originator,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash3_combine_spreads_fields() {
        let h = Hash3Combine::default();
        let a = h.hash(Coordinate::new(1, 0, 0));
        let b = h.hash(Coordinate::new(0, 1, 0));
        let c = h.hash(Coordinate::new(0, 0, 1));
        assert!(a != b && b != c && a != c);
        assert_ne!(Hash3Combine { seed: 1 }.hash(Coordinate::new(1, 0, 0)), a);
    }

    #[test]
    fn test_recording_notifier_fault_injection() {
        let mut n = RecordingNotifier::fail_after(1);
        let pos = Coordinate::default();
        n.remove_source(BASE_REMOVE_SOURCE, ComponentRef::NONE, pos, ComponentRef::NONE)
            .unwrap();
        assert!(n
            .remove_source(BASE_REMOVE_SOURCE, ComponentRef::NONE, pos, ComponentRef::NONE)
            .is_err());
        assert_eq!(n.calls.len(), 1);
        assert_eq!(n.count_for(ComponentRef::NONE), 1);
    }
}

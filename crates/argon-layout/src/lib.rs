//! # argon-layout
//!
//! Shared layout types for argon: the key and pointer newtypes, and the
//! versioned [`LayoutContract`] describing where the circuit scene keeps its
//! component registry, power-association map and pending-update list.
//!
//! Every offset the reconciliation core uses comes from a contract; nothing
//! downstream hard-codes a field position.

pub mod contract;
pub mod coord;

pub use contract::{
    ComponentLayout, ContractError, DrainPolicy, HashTableLayout, LayoutContract, QueueLayout,
    RecordLayout, PRESET_BDS_1_18_2, PRESET_SIMULATED,
};
pub use coord::{Address, ComponentRef, Coordinate};

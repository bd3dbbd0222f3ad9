//! # argon-reconcile
//!
//! Clears stale power associations out of a circuit scene whose tables live
//! in memory laid out by someone else.
//!
//! The host keeps three structures reachable from a scene root: a component
//! registry, an association index mapping each position to the components
//! that draw power from it, and a list of pending updates. When an update is
//! queued for a position, every association recorded there is superseded.
//! The host's own routine removes the dependents but never evicts the
//! emptied key, so the index grows without bound.
//!
//! [`ReconciliationPass`] empties each targeted record, notifies every
//! dependent component that is still registered, and evicts the key. All
//! foreign access goes through [`ForeignMemory`]; a [`LayoutFault`] aborts the
//! pass through the [`FaultBoundary`] instead of crashing the host.

pub mod fault;
pub mod hash_index;
pub mod host;
pub mod install;
pub mod memory;
pub mod pass;
pub mod queue;
pub mod record;
pub mod sim;

pub use fault::{AtStage, FaultBoundary, FaultReporter, LayoutFault, PassStage, StagedFault};
pub use hash_index::{EntryHandle, ForeignHashIndex, UnlinkPlan};
pub use host::{CoordinateHasher, HostHash3, HostRemoveSource, SourceNotifier};
pub use install::{
    install_pass, reconcile_entry, resolve_symbols, run_reconciliation_pass, InterceptStatus,
    Interceptor, OriginalRoutine, ResolvedSymbols, SetupError, SymbolNames,
};
pub use memory::{all_or_nothing, ForeignMemory, ProcessMemory, WriteJournal};
pub use pass::{PassOptions, PassOutcome, PassStats, ReconciliationPass};
pub use queue::{PendingUpdate, PendingUpdateQueue};
pub use record::AssociationRecord;

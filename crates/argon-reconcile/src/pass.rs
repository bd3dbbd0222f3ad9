//! The reconciliation pass.
//!
//! For every queued update the pass looks the target position up in the
//! association index, empties its record, evicts the now-empty key, and then
//! notifies each dependent component that is still registered.
//!
//! Each update runs in four stages:
//!
//! 1. plan: load the record, resolve every dependent component and its
//!    `removeSource` through the vtable, and plan the key's unlink (reads only)
//! 2. commit: the compacted record and the unlink, written as one unit
//! 3. release: free the record storage and the node
//! 4. notify: `removeSource` on each resolved component
//!
//! A fault before or during the commit leaves the key, its record and the
//! table's element counter exactly as they were.

use argon_config::{log_pass_debug, log_pass_trace, Config};
use argon_layout::{Address, ComponentRef, Coordinate, DrainPolicy, LayoutContract};
use serde::Serialize;

use crate::fault::{AtStage, FaultBoundary, LayoutFault, PassStage, StagedFault};
use crate::hash_index::ForeignHashIndex;
use crate::host::{CoordinateHasher, SourceNotifier};
use crate::memory::{all_or_nothing, ForeignMemory};
use crate::queue::{PendingUpdate, PendingUpdateQueue};
use crate::record::AssociationRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOptions {
    /// Run the host's original routine after a pass aborts.
    pub fallback_to_original: bool,
    pub fault_log_burst: u32,
    pub fault_log_every: u64,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            fallback_to_original: true,
            fault_log_burst: 3,
            fault_log_every: 100,
        }
    }
}

impl From<&Config> for PassOptions {
    fn from(config: &Config) -> Self {
        Self {
            fallback_to_original: config.pass.fallback_to_original,
            fault_log_burst: config.faults.log_burst,
            fault_log_every: config.faults.log_every,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub updates_seen: u64,
    pub records_found: u64,
    pub entries_removed: u64,
    pub notifications: u64,
    /// Entries whose component was no longer registered.
    pub stale_skipped: u64,
    pub keys_evicted: u64,
    pub queue_drained: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The queue was empty.
    Idle,
    Completed(PassStats),
    Aborted {
        stage: PassStage,
        fault: LayoutFault,
        /// Work finished before the fault, including updates fully applied.
        stats: PassStats,
        fallback_invoked: bool,
    },
}

impl PassOutcome {
    pub fn stats(&self) -> Option<&PassStats> {
        match self {
            PassOutcome::Idle => None,
            PassOutcome::Completed(stats) | PassOutcome::Aborted { stats, .. } => Some(stats),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, PassOutcome::Aborted { .. })
    }
}

/// Component still registered at an entry position.
#[derive(Debug, Clone, Copy)]
struct Dependent {
    component: ComponentRef,
    /// `removeSource` as dispatched by the component's vtable.
    method: Address,
}

/// One reconciliation pass over a scene described by `contract`.
pub struct ReconciliationPass<'a, H: ?Sized, N: ?Sized> {
    contract: &'a LayoutContract,
    hasher: &'a H,
    notifier: &'a mut N,
}

impl<'a, H, N> ReconciliationPass<'a, H, N>
where
    H: CoordinateHasher + ?Sized,
    N: SourceNotifier + ?Sized,
{
    pub fn new(contract: &'a LayoutContract, hasher: &'a H, notifier: &'a mut N) -> Self {
        Self {
            contract,
            hasher,
            notifier,
        }
    }

    fn association(&self, root: Address) -> ForeignHashIndex<'a> {
        let contract = self.contract;
        ForeignHashIndex::new(
            "association index",
            &contract.association,
            root,
            contract.max_chain_walk,
        )
    }

    fn registry(&self, root: Address) -> ForeignHashIndex<'a> {
        let contract = self.contract;
        ForeignHashIndex::new(
            "component registry",
            &contract.registry,
            root,
            contract.max_chain_walk,
        )
    }

    /// Run the pass through `boundary`, which absorbs any fault.
    pub fn run<M, B>(
        &mut self,
        boundary: &FaultBoundary,
        mem: &mut M,
        root: Address,
        baseline: Option<B>,
    ) -> PassOutcome
    where
        M: ForeignMemory + ?Sized,
        B: FnOnce(),
    {
        let outcome = boundary.run(|stats| self.execute(mem, root, stats), baseline);
        if let PassOutcome::Completed(stats) = &outcome {
            log_pass_debug!(
                "Reconciliation pass completed",
                updates = stats.updates_seen,
                removed = stats.entries_removed,
                notified = stats.notifications,
                stale = stats.stale_skipped,
                evicted = stats.keys_evicted,
            );
        }
        outcome
    }

    /// Process every pending update. Returns `Ok(false)` if the queue was empty.
    pub fn execute<M>(
        &mut self,
        mem: &mut M,
        root: Address,
        stats: &mut PassStats,
    ) -> Result<bool, StagedFault>
    where
        M: ForeignMemory + ?Sized,
    {
        let contract = self.contract;
        let queue = PendingUpdateQueue::new(&contract.pending, root, contract.max_chain_walk);
        if queue.is_empty(mem).at(PassStage::Queue)? {
            return Ok(false);
        }
        let updates = queue.snapshot(mem).at(PassStage::Queue)?;
        stats.updates_seen += updates.len() as u64;

        for update in &updates {
            self.reconcile_update(mem, root, update, stats)?;
        }

        if contract.pending.drain == DrainPolicy::Pass {
            stats.queue_drained += queue.drain(mem, &updates).at(PassStage::Drain)?;
        }
        Ok(true)
    }

    fn reconcile_update<M>(
        &mut self,
        mem: &mut M,
        root: Address,
        update: &PendingUpdate,
        stats: &mut PassStats,
    ) -> Result<(), StagedFault>
    where
        M: ForeignMemory + ?Sized,
    {
        let contract = self.contract;
        let record_layout = &contract.record;
        let association = self.association(root);
        let registry = self.registry(root);

        let Some(entry) = association
            .lookup(mem, self.hasher, update.position)
            .at(PassStage::Lookup)?
        else {
            log_pass_trace!(
                "No associations at update target",
                position = tracing::field::display(update.position),
            );
            return Ok(());
        };
        stats.records_found += 1;

        // Plan.
        let value = association.value_address(&entry);
        let mut record =
            AssociationRecord::load(mem, value, record_layout).at(PassStage::Lookup)?;
        let mut dependents = Vec::with_capacity(record.len());
        while let Some(pos) = record.remove_at(0) {
            let dependent = self
                .dependent_at(mem, &registry, pos)
                .at(PassStage::Lookup)?;
            dependents.push((pos, dependent));
        }
        let unlink = association
            .plan_unlink(mem, &entry)
            .at(PassStage::Lookup)?;

        // Commit.
        let removed = all_or_nothing(mem, |mem| {
            let removed = record.commit(mem).at(PassStage::Compaction)?;
            association.unlink(mem, &unlink).at(PassStage::Evict)?;
            Ok::<_, StagedFault>(removed)
        })?;
        stats.entries_removed += removed as u64;
        stats.keys_evicted += 1;

        // Release. The key is already unreachable.
        association
            .release_node(mem, &unlink, |mem, value| {
                AssociationRecord::release_buffer(mem, value, record_layout).map(|_| ())
            })
            .at(PassStage::Evict)?;

        // Notify.
        for (pos, dependent) in dependents {
            match dependent {
                Some(Dependent { component, method }) => {
                    self.notifier
                        .remove_source(method, component, update.position, update.originator)
                        .at(PassStage::Notify)?;
                    stats.notifications += 1;
                }
                None => {
                    log_pass_trace!(
                        "Skipped stale association entry",
                        entry = tracing::field::display(pos),
                        target = tracing::field::display(update.position),
                    );
                    stats.stale_skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Component registered at `pos`, if any.
    fn component_at<M>(
        &self,
        mem: &M,
        registry: &ForeignHashIndex<'_>,
        pos: Coordinate,
    ) -> Result<Option<ComponentRef>, LayoutFault>
    where
        M: ForeignMemory + ?Sized,
    {
        let Some(entry) = registry.lookup(mem, self.hasher, pos)? else {
            return Ok(None);
        };
        let slot = registry
            .value_address(&entry)
            .add(self.contract.component_pointer_offset);
        let component = ComponentRef(mem.read_addr(slot)?);
        Ok((!component.is_none()).then_some(component))
    }

    /// Registered component at `pos` and the `removeSource` its vtable holds.
    fn dependent_at<M>(
        &self,
        mem: &M,
        registry: &ForeignHashIndex<'_>,
        pos: Coordinate,
    ) -> Result<Option<Dependent>, LayoutFault>
    where
        M: ForeignMemory + ?Sized,
    {
        let Some(component) = self.component_at(mem, registry, pos)? else {
            return Ok(None);
        };
        let layout = &self.contract.component;
        let vtable = mem.read_ptr(
            component.address().add(layout.vtable_offset),
            "component vtable",
        )?;
        let method = mem.read_addr(vtable.add(layout.remove_source_offset()))?;
        if method.is_null() {
            return Err(LayoutFault::NullPointer {
                what: "removeSource vtable slot",
            });
        }
        Ok(Some(Dependent { component, method }))
    }
}

//! Layout faults and the boundary that keeps them from escaping a pass.
//!
//! Every foreign-memory accessor returns `Result<_, LayoutFault>`. The
//! [`FaultBoundary`] turns a failed pass into a [`PassOutcome::Aborted`],
//! reports it (rate limited), and optionally runs the host's baseline routine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use argon_config::{log_fault_error, log_fault_warn};
use argon_layout::Address;
use serde::Serialize;
use thiserror::Error;

use crate::pass::{PassOptions, PassOutcome, PassStats};

/// A foreign-memory access that violated the layout contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutFault {
    #[error("null pointer in {what}")]
    NullPointer { what: &'static str },

    #[error("misaligned pointer {addr} in {what}")]
    Misaligned { what: &'static str, addr: Address },

    #[error("access to unmapped memory at {addr} ({len} bytes)")]
    Unmapped { addr: Address, len: usize },

    #[error("write rejected at {addr} ({len} bytes)")]
    WriteRejected { addr: Address, len: usize },

    #[error("release of {size} bytes at {addr} does not match an allocation")]
    BadRelease { addr: Address, size: u64 },

    #[error("{what} chain exceeds {limit} nodes")]
    RunawayChain { what: &'static str, limit: u64 },

    #[error("bucket {index} outside the {buckets}-bucket array of {what}")]
    BucketOutOfRange {
        what: &'static str,
        index: u64,
        buckets: u64,
    },

    #[error("broken link at node {node} in {what}")]
    BrokenLink { what: &'static str, node: Address },

    #[error("corrupt record: start={start} finish={finish} end={storage_end}")]
    CorruptRecord {
        start: Address,
        finish: Address,
        storage_end: Address,
    },

    #[error("element counter of {what} would underflow")]
    CounterUnderflow { what: &'static str },

    #[error("release of {addr} inside an all-or-nothing write")]
    ReleaseInJournal { addr: Address },
}

/// Where in a pass a fault surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassStage {
    Queue,
    Lookup,
    Compaction,
    Notify,
    Evict,
    Drain,
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassStage::Queue => "queue",
            PassStage::Lookup => "lookup",
            PassStage::Compaction => "compaction",
            PassStage::Notify => "notify",
            PassStage::Evict => "evict",
            PassStage::Drain => "drain",
        };
        f.write_str(name)
    }
}

/// A fault tagged with the stage it interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{fault} (during {stage})")]
pub struct StagedFault {
    pub stage: PassStage,
    pub fault: LayoutFault,
}

/// Tag accessor results with the pass stage they belong to.
pub trait AtStage<T> {
    fn at(self, stage: PassStage) -> Result<T, StagedFault>;
}

impl<T> AtStage<T> for Result<T, LayoutFault> {
    #[inline]
    fn at(self, stage: PassStage) -> Result<T, StagedFault> {
        self.map_err(|fault| StagedFault { stage, fault })
    }
}

/// Rate-limited fault log.
///
/// The first `burst` faults are logged in full; after that one summary is
/// logged every `every` faults.
pub struct FaultReporter {
    total: AtomicU64,
    burst: u64,
    every: u64,
}

impl FaultReporter {
    pub const fn new(burst: u32, every: u64) -> Self {
        Self {
            total: AtomicU64::new(0),
            burst: burst as u64,
            every,
        }
    }

    /// Count a fault; returns true if it was logged.
    pub fn record(&self, staged: &StagedFault) -> bool {
        let n = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        if n <= self.burst {
            log_fault_warn!(
                "Layout fault aborted reconciliation pass",
                stage = tracing::field::display(staged.stage),
                fault = tracing::field::display(&staged.fault),
                total = n,
            );
            return true;
        }
        if self.every > 0 && (n - self.burst) % self.every == 0 {
            log_fault_error!(
                "Reconciliation passes keep faulting; layout contract likely wrong",
                last_stage = tracing::field::display(staged.stage),
                last_fault = tracing::field::display(&staged.fault),
                total = n,
            );
            return true;
        }
        false
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Converts a faulting pass into an aborted outcome.
pub struct FaultBoundary {
    reporter: FaultReporter,
    fallback_to_original: bool,
}

impl FaultBoundary {
    pub fn new(options: &PassOptions) -> Self {
        Self {
            reporter: FaultReporter::new(options.fault_log_burst, options.fault_log_every),
            fallback_to_original: options.fallback_to_original,
        }
    }

    /// Run `pass`; on fault, report it and run `baseline` if fallback is enabled.
    ///
    /// `pass` returns `Ok(false)` when there was nothing to do.
    pub fn run<P, B>(&self, pass: P, baseline: Option<B>) -> PassOutcome
    where
        P: FnOnce(&mut PassStats) -> Result<bool, StagedFault>,
        B: FnOnce(),
    {
        let mut stats = PassStats::default();
        match pass(&mut stats) {
            Ok(false) => PassOutcome::Idle,
            Ok(true) => PassOutcome::Completed(stats),
            Err(staged) => {
                self.reporter.record(&staged);
                let fallback_invoked = match baseline {
                    Some(baseline) if self.fallback_to_original => {
                        baseline();
                        true
                    }
                    _ => false,
                };
                PassOutcome::Aborted {
                    stage: staged.stage,
                    fault: staged.fault,
                    stats,
                    fallback_invoked,
                }
            }
        }
    }

    pub fn reporter(&self) -> &FaultReporter {
        &self.reporter
    }
}

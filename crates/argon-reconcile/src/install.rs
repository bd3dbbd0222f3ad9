//! Installing the pass into a host process.
//!
//! Symbol lookup and routine replacement are provided by an injected
//! [`Interceptor`]. Installation resolves every routine the pass needs,
//! replaces the host's stale-relationship routine with [`reconcile_entry`],
//! and keeps the call-through handle as the fallback baseline.

use std::ffi::c_void;
use std::fmt;
use std::sync::OnceLock;

use argon_config::{log_fault_error, log_setup_error, log_setup_info};
use argon_layout::{Address, ContractError, LayoutContract};
use thiserror::Error;

use crate::fault::FaultBoundary;
use crate::host::{HostHash3, HostRemoveSource};
use crate::memory::{ProcessMemory, SizedDelete};
use crate::pass::{PassOptions, PassOutcome, ReconciliationPass};

/// Entry point signature of the intercepted routine: `void (Scene* this)`.
pub type EntryFn = unsafe extern "C" fn(*mut c_void);

/// Status code reported by the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptStatus(pub i32);

impl fmt::Display for InterceptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call-through handle to a displaced routine.
#[derive(Debug, Clone, Copy)]
pub struct OriginalRoutine {
    entry: EntryFn,
}

impl OriginalRoutine {
    /// # Safety
    ///
    /// `addr` must be callable with the [`EntryFn`] signature for the rest of
    /// the process lifetime.
    pub unsafe fn from_address(addr: Address) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let entry = std::mem::transmute::<usize, EntryFn>(addr.raw() as usize);
        Some(Self { entry })
    }

    pub fn address(&self) -> Address {
        Address::new(self.entry as usize as u64)
    }

    /// # Safety
    ///
    /// `root` must be a scene the original routine accepts.
    pub unsafe fn call(&self, root: Address) {
        (self.entry)(root.raw() as *mut c_void)
    }
}

/// Symbol lookup and routine replacement in the host process.
pub trait Interceptor {
    fn resolve(&self, symbol: &str) -> Option<Address>;

    /// Route calls of `target` to `replacement`; returns a handle to the
    /// displaced routine.
    fn intercept(
        &mut self,
        target: Address,
        replacement: Address,
    ) -> Result<OriginalRoutine, InterceptStatus>;
}

/// Host symbols the pass depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolNames {
    pub hash3: String,
    pub reconcile_target: String,
    pub sized_delete: String,
}

impl Default for SymbolNames {
    /// MSVC-decorated names from the BDS 1.18.2 binary.
    fn default() -> Self {
        Self {
            hash3: "??$hash3@HHH@Math@mce@@SA_KAEBH00@Z".to_string(),
            reconcile_target: "?removeStaleRelationships@CircuitSceneGraph@@AEAAXXZ".to_string(),
            sized_delete: "??3@YAXPEAX_K@Z".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("required symbol not found: {symbol}")]
    SymbolResolution { symbol: String },

    #[error("invalid layout contract: {0}")]
    InvalidContract(#[from] ContractError),

    #[error("interception of {symbol} failed with status {status}")]
    Intercept {
        symbol: String,
        status: InterceptStatus,
    },

    #[error("reconciliation pass already installed")]
    AlreadyInstalled,
}

/// Addresses of every routine named in [`SymbolNames`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSymbols {
    pub hash3: Address,
    pub reconcile_target: Address,
    pub sized_delete: Address,
}

/// Resolve every symbol; the first missing one fails setup.
pub fn resolve_symbols<I: Interceptor + ?Sized>(
    interceptor: &I,
    names: &SymbolNames,
) -> Result<ResolvedSymbols, SetupError> {
    let resolve = |symbol: &str| {
        interceptor
            .resolve(symbol)
            .filter(|addr| !addr.is_null())
            .ok_or_else(|| {
                log_setup_error!("Symbol not found", symbol = symbol);
                SetupError::SymbolResolution {
                    symbol: symbol.to_string(),
                }
            })
    };
    Ok(ResolvedSymbols {
        hash3: resolve(names.hash3.as_str())?,
        reconcile_target: resolve(names.reconcile_target.as_str())?,
        sized_delete: resolve(names.sized_delete.as_str())?,
    })
}

struct ActivePass {
    contract: LayoutContract,
    hasher: HostHash3,
    notifier: HostRemoveSource,
    sized_delete: SizedDelete,
    original: OriginalRoutine,
    boundary: FaultBoundary,
}

impl ActivePass {
    /// # Safety
    ///
    /// See [`run_reconciliation_pass`].
    unsafe fn run(&self, root: Address) -> PassOutcome {
        let mut mem = ProcessMemory::new(self.sized_delete);
        let mut notifier = self.notifier;
        let original = self.original;
        let mut pass = ReconciliationPass::new(&self.contract, &self.hasher, &mut notifier);
        pass.run(
            &self.boundary,
            &mut mem,
            root,
            Some(move || unsafe { original.call(root) }),
        )
    }
}

static ACTIVE: OnceLock<ActivePass> = OnceLock::new();

pub fn is_installed() -> bool {
    ACTIVE.get().is_some()
}

/// Validate `contract`, resolve the host routines and replace the target.
///
/// Nothing is activated unless every step succeeds. Only one pass can be
/// installed per process.
///
/// # Safety
///
/// Every address `interceptor` resolves must be the routine its symbol
/// names, with the signatures in [`crate::host`], [`SizedDelete`] and
/// [`EntryFn`], and must stay valid for the life of the process. The
/// contract's `removeSource` vtable slot must hold that method for every
/// registered component.
pub unsafe fn install_pass<I: Interceptor + ?Sized>(
    interceptor: &mut I,
    contract: LayoutContract,
    names: &SymbolNames,
    options: &PassOptions,
) -> Result<(), SetupError> {
    contract.validate()?;
    let symbols = resolve_symbols(interceptor, names)?;
    if is_installed() {
        return Err(SetupError::AlreadyInstalled);
    }

    let missing = |symbol: &String| SetupError::SymbolResolution {
        symbol: symbol.clone(),
    };
    let hasher = HostHash3::from_address(symbols.hash3).ok_or_else(|| missing(&names.hash3))?;
    let notifier = HostRemoveSource::new();
    let sized_delete =
        std::mem::transmute::<usize, SizedDelete>(symbols.sized_delete.raw() as usize);

    let replacement = Address::new(reconcile_entry as EntryFn as usize as u64);
    let original = interceptor
        .intercept(symbols.reconcile_target, replacement)
        .map_err(|status| {
            log_setup_error!(
                "Interception failed",
                symbol = names.reconcile_target.as_str(),
                status = status.0,
            );
            SetupError::Intercept {
                symbol: names.reconcile_target.clone(),
                status,
            }
        })?;

    let fingerprint = contract
        .fingerprint()
        .unwrap_or_else(|_| "unavailable".to_string());
    let (name, version) = (contract.name.clone(), contract.version.clone());
    ACTIVE
        .set(ActivePass {
            contract,
            hasher,
            notifier,
            sized_delete,
            original,
            boundary: FaultBoundary::new(options),
        })
        .map_err(|_| SetupError::AlreadyInstalled)?;

    log_setup_info!(
        "Reconciliation pass installed",
        contract = name.as_str(),
        version = version.as_str(),
        fingerprint = fingerprint.as_str(),
        target = tracing::field::display(symbols.reconcile_target),
    );
    Ok(())
}

/// Run one pass over the scene at `root`. `None` if no pass is installed.
///
/// # Safety
///
/// `root` must be a live scene laid out as the installed contract
/// describes, and nothing else may touch it for the duration of the call.
pub unsafe fn run_reconciliation_pass(root: Address) -> Option<PassOutcome> {
    let active = ACTIVE.get()?;
    Some(active.run(root))
}

/// Replacement for the host's stale-relationship routine.
///
/// # Safety
///
/// Called by the host in place of the original routine, with its `this`.
pub unsafe extern "C" fn reconcile_entry(scene: *mut c_void) {
    let root = Address::new(scene as u64);
    // Faults are already reported by the boundary.
    if run_reconciliation_pass(root).is_none() {
        // Called between interception and activation.
        log_fault_error!(
            "Reconciliation entry called before activation",
            scene = tracing::field::display(root),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapInterceptor {
        symbols: HashMap<String, Address>,
        intercepts: Vec<(Address, Address)>,
        status: Option<InterceptStatus>,
    }

    impl MapInterceptor {
        fn with_all(names: &SymbolNames) -> Self {
            let mut symbols = HashMap::new();
            for (i, name) in [
                &names.hash3,
                &names.reconcile_target,
                &names.sized_delete,
            ]
            .into_iter()
            .enumerate()
            {
                symbols.insert(name.clone(), Address::new(0x10_0000 + i as u64 * 0x100));
            }
            Self {
                symbols,
                ..Self::default()
            }
        }
    }

    impl Interceptor for MapInterceptor {
        fn resolve(&self, symbol: &str) -> Option<Address> {
            self.symbols.get(symbol).copied()
        }

        fn intercept(
            &mut self,
            target: Address,
            replacement: Address,
        ) -> Result<OriginalRoutine, InterceptStatus> {
            self.intercepts.push((target, replacement));
            Err(self.status.unwrap_or(InterceptStatus(-1)))
        }
    }

    #[test]
    fn test_resolve_all_symbols() {
        let names = SymbolNames::default();
        let interceptor = MapInterceptor::with_all(&names);
        let resolved = resolve_symbols(&interceptor, &names).unwrap();
        assert_eq!(resolved.hash3, Address::new(0x10_0000));
        assert_eq!(resolved.sized_delete, Address::new(0x10_0200));
    }

    #[test]
    fn test_missing_symbol_is_named() {
        let names = SymbolNames::default();
        let mut interceptor = MapInterceptor::with_all(&names);
        interceptor.symbols.remove(&names.sized_delete);
        let err = resolve_symbols(&interceptor, &names).unwrap_err();
        match err {
            SetupError::SymbolResolution { symbol } => assert_eq!(symbol, names.sized_delete),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_null_resolution_counts_as_missing() {
        let names = SymbolNames::default();
        let mut interceptor = MapInterceptor::with_all(&names);
        interceptor
            .symbols
            .insert(names.hash3.clone(), Address::NULL);
        assert!(matches!(
            resolve_symbols(&interceptor, &names),
            Err(SetupError::SymbolResolution { .. })
        ));
    }

    #[test]
    fn test_invalid_contract_rejected_before_resolution() {
        let names = SymbolNames::default();
        let mut interceptor = MapInterceptor::with_all(&names);
        let mut contract = LayoutContract::bds_1_18_2();
        contract.record.entry_stride = 0;
        let err = unsafe {
            install_pass(&mut interceptor, contract, &names, &PassOptions::default())
        }
        .unwrap_err();
        assert!(matches!(err, SetupError::InvalidContract(_)));
        assert!(interceptor.intercepts.is_empty());
        assert!(!is_installed());
    }

    #[test]
    fn test_intercept_failure_leaves_pass_inactive() {
        let names = SymbolNames::default();
        let mut interceptor = MapInterceptor::with_all(&names);
        interceptor.status = Some(InterceptStatus(7));
        let err = unsafe {
            install_pass(
                &mut interceptor,
                LayoutContract::bds_1_18_2(),
                &names,
                &PassOptions::default(),
            )
        }
        .unwrap_err();
        match err {
            SetupError::Intercept { symbol, status } => {
                assert_eq!(symbol, names.reconcile_target);
                assert_eq!(status, InterceptStatus(7));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(interceptor.intercepts.len(), 1);
        assert_eq!(interceptor.intercepts[0].0, Address::new(0x10_0100));
        assert!(!is_installed());
        assert!(unsafe { run_reconciliation_pass(Address::new(0x10_0000)) }.is_none());
    }
}

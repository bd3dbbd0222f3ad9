//! `argon simulate`: run the pass against a scene built from a fixture.
//!
//! Fixture format:
//!
//! ```toml
//! preset = "simulated"      # optional
//! buckets = 16              # optional
//! components = [[0, 0, 0], [1, 0, 0]]
//! removed = [[1, 0, 0]]     # destroyed after associations are built
//!
//! [[association]]
//! key = [0, 0, 0]
//! entries = [[1, 0, 0]]
//!
//! [[pending]]
//! target = [0, 0, 0]
//! originator = [0, 0, 0]    # optional
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use argon_config::{log_cli_info, Config};
use argon_layout::{ComponentRef, Coordinate, LayoutContract, PRESET_SIMULATED};
use argon_reconcile::sim::{RecordingNotifier, SimHeap, SimScene, MAX_BUCKETS};
use argon_reconcile::{
    FaultBoundary, PassOptions, PassOutcome, PassStage, PassStats, ReconciliationPass,
};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(value_name = "FIXTURE")]
    fixture: PathBuf,

    /// Run a second pass to show it changes nothing
    #[arg(long)]
    twice: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_buckets")]
    pub buckets: u64,
    #[serde(default)]
    pub components: Vec<Coordinate>,
    #[serde(default)]
    pub removed: Vec<Coordinate>,
    #[serde(default)]
    pub association: Vec<FixtureAssociation>,
    #[serde(default)]
    pub pending: Vec<FixturePending>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureAssociation {
    pub key: Coordinate,
    #[serde(default)]
    pub entries: Vec<Coordinate>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixturePending {
    pub target: Coordinate,
    pub originator: Option<Coordinate>,
}

fn default_preset() -> String {
    PRESET_SIMULATED.to_string()
}

fn default_buckets() -> u64 {
    16
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let fixture: Self = toml::from_str(&contents)
            .with_context(|| format!("Invalid fixture {}", path.display()))?;
        fixture.validate()?;
        Ok(fixture)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buckets > MAX_BUCKETS {
            bail!("buckets = {} exceeds the limit of {MAX_BUCKETS}", self.buckets);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct PassReport {
    pub outcome: &'static str,
    pub stats: Option<PassStats>,
    pub stage: Option<PassStage>,
    pub fault: Option<String>,
    pub fallback_invoked: bool,
}

impl From<PassOutcome> for PassReport {
    fn from(outcome: PassOutcome) -> Self {
        match outcome {
            PassOutcome::Idle => Self {
                outcome: "idle",
                stats: None,
                stage: None,
                fault: None,
                fallback_invoked: false,
            },
            PassOutcome::Completed(stats) => Self {
                outcome: "completed",
                stats: Some(stats),
                stage: None,
                fault: None,
                fallback_invoked: false,
            },
            PassOutcome::Aborted {
                stage,
                fault,
                stats,
                fallback_invoked,
            } => Self {
                outcome: "aborted",
                stats: Some(stats),
                stage: Some(stage),
                fault: Some(fault.to_string()),
                fallback_invoked,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationReport {
    /// Position of the notified component.
    pub component: Coordinate,
    pub position: Coordinate,
    pub originator: Option<Coordinate>,
}

#[derive(Debug, Serialize)]
pub struct AssociationReport {
    pub key: Coordinate,
    pub entries: Vec<Coordinate>,
}

#[derive(Debug, Serialize)]
pub struct Invariants {
    /// Every remaining entry names a registered component.
    pub entries_registered: bool,
    /// No key maps to an empty record.
    pub no_empty_records: bool,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub contract: String,
    pub passes: Vec<PassReport>,
    pub notifications: Vec<NotificationReport>,
    pub associations: Vec<AssociationReport>,
    pub pending_remaining: u64,
    pub invariants: Invariants,
}

/// Build the fixture's scene and run the pass `passes` times.
pub fn simulate(fixture: &Fixture, options: &PassOptions, passes: usize) -> Result<SimulationReport> {
    fixture.validate()?;
    let contract = LayoutContract::preset(&fixture.preset)
        .with_context(|| format!("Unknown preset {}", fixture.preset))?;
    let mut heap = SimHeap::new();
    let mut scene = SimScene::new(&mut heap, contract, fixture.buckets)?;

    for pos in &fixture.components {
        scene.add_component(&mut heap, *pos)?;
    }
    for assoc in &fixture.association {
        scene.associate(&mut heap, assoc.key, &assoc.entries)?;
    }
    for pos in &fixture.removed {
        scene.remove_component(&mut heap, *pos)?;
    }
    for update in &fixture.pending {
        let originator = match update.originator {
            Some(pos) => scene
                .component_at(&heap, pos)?
                .with_context(|| format!("Originator {pos} is not a registered component"))?,
            None => ComponentRef::NONE,
        };
        scene.enqueue(&mut heap, update.target, originator)?;
    }

    let boundary = FaultBoundary::new(options);
    let mut notifier = RecordingNotifier::new();
    let mut reports = Vec::with_capacity(passes);
    for _ in 0..passes {
        let mut pass = ReconciliationPass::new(scene.contract(), scene.hasher(), &mut notifier);
        let outcome = pass.run(&boundary, &mut heap, scene.root(), None::<fn()>);
        reports.push(PassReport::from(outcome));
    }

    let mut notifications = Vec::with_capacity(notifier.calls.len());
    for call in &notifier.calls {
        let originator = if call.originator.is_none() {
            None
        } else {
            Some(scene.position_of(&heap, call.originator)?)
        };
        notifications.push(NotificationReport {
            component: scene.position_of(&heap, call.component)?,
            position: call.position,
            originator,
        });
    }

    let mut associations = Vec::new();
    let mut invariants = Invariants {
        entries_registered: true,
        no_empty_records: true,
    };
    for key in scene.association_keys(&heap)? {
        let entries = scene.association_entries(&heap, key)?.unwrap_or_default();
        invariants.no_empty_records &= !entries.is_empty();
        for entry in &entries {
            invariants.entries_registered &= scene.component_at(&heap, *entry)?.is_some();
        }
        associations.push(AssociationReport { key, entries });
    }

    Ok(SimulationReport {
        contract: scene.contract().name.clone(),
        passes: reports,
        notifications,
        associations,
        pending_remaining: scene.pending_len(&heap)?,
        invariants,
    })
}

pub fn run(config: &Config, args: SimulateArgs) -> Result<()> {
    let fixture = Fixture::load(&args.fixture)?;
    let passes = if args.twice { 2 } else { 1 };
    let report = simulate(&fixture, &PassOptions::from(config), passes)?;
    log_cli_info!(
        "Simulation finished",
        passes = passes,
        keys_left = report.associations.len(),
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !(report.invariants.entries_registered && report.invariants.no_empty_records) {
        bail!("association index still inconsistent after reconciliation");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
components = [[0, 0, 0], [1, 0, 0]]

[[association]]
key = [0, 0, 0]
entries = [[1, 0, 0]]

[[pending]]
target = [0, 0, 0]
originator = [0, 0, 0]
"#;

    #[test]
    fn test_fixture_defaults() {
        let fixture: Fixture = toml::from_str(SCENARIO).unwrap();
        assert_eq!(fixture.preset, PRESET_SIMULATED);
        assert_eq!(fixture.buckets, 16);
        assert!(fixture.removed.is_empty());
        assert_eq!(fixture.pending[0].originator, Some(Coordinate::new(0, 0, 0)));
    }

    #[test]
    fn test_oversized_buckets_rejected() {
        let fixture: Fixture = toml::from_str("buckets = 4611686018427387905").unwrap();
        let err = simulate(&fixture, &PassOptions::default(), 1).unwrap_err();
        assert!(err.to_string().contains("buckets"));

        let fixture: Fixture = toml::from_str(&format!("buckets = {MAX_BUCKETS}")).unwrap();
        assert!(simulate(&fixture, &PassOptions::default(), 1).is_ok());
    }

    #[test]
    fn test_fixture_rejects_unknown_keys() {
        assert!(toml::from_str::<Fixture>("componants = []").is_err());
    }

    #[test]
    fn test_scenario_report() {
        let fixture: Fixture = toml::from_str(SCENARIO).unwrap();
        let report = simulate(&fixture, &PassOptions::default(), 2).unwrap();
        assert_eq!(report.passes[0].outcome, "completed");
        assert_eq!(report.passes[1].outcome, "idle");
        assert_eq!(report.notifications.len(), 1);
        assert_eq!(report.notifications[0].component, Coordinate::new(1, 0, 0));
        assert_eq!(report.notifications[0].originator, Some(Coordinate::new(0, 0, 0)));
        assert!(report.associations.is_empty());
        assert_eq!(report.pending_remaining, 0);
        assert!(report.invariants.entries_registered && report.invariants.no_empty_records);
    }

    #[test]
    fn test_unregistered_originator_is_an_error() {
        let fixture: Fixture = toml::from_str(
            r#"
[[pending]]
target = [0, 0, 0]
originator = [5, 5, 5]
"#,
        )
        .unwrap();
        let err = simulate(&fixture, &PassOptions::default(), 1).unwrap_err();
        assert!(err.to_string().contains("(5, 5, 5)"));
    }

    #[test]
    fn test_report_serializes_stage_lowercase() {
        let report = PassReport::from(PassOutcome::Aborted {
            stage: PassStage::Compaction,
            fault: argon_reconcile::LayoutFault::CounterUnderflow { what: "queue" },
            stats: PassStats::default(),
            fallback_invoked: true,
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stage"], "compaction");
        assert_eq!(json["outcome"], "aborted");
    }
}

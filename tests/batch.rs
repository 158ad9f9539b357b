use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use assert_matches::assert_matches;

use grimperium::batch::{
    BatchValidator, Duplicate, DuplicateChoice, DuplicateDecision, KeyResolver, NotFoundDecision,
    NotFoundList, OnDuplicate, OnNotFound, OnUnresolved, PolicyDecisions, Unresolved,
    UnresolvedDecision, ValidationDecisions, ValidationOutcome, ValidationStage,
    load_identifier_list,
};
use grimperium::datastore::Datastore;
use grimperium::domain::MoleculeRecord;
use grimperium::error::GrimError;
use grimperium::pipeline::RunItem;
use grimperium::pubchem::{Lookup, StructureRegistry};

struct TableResolver {
    keys: HashMap<&'static str, &'static str>,
    asked: RefCell<Vec<String>>,
}

impl TableResolver {
    fn new(pairs: &[(&'static str, &'static str)]) -> Self {
        Self {
            keys: pairs.iter().copied().collect(),
            asked: RefCell::new(Vec::new()),
        }
    }
}

impl KeyResolver for TableResolver {
    fn key_for(&self, identifier: &str) -> Result<String, GrimError> {
        self.asked.borrow_mut().push(identifier.to_string());
        self.keys
            .get(identifier)
            .map(|key| key.to_string())
            .ok_or_else(|| GrimError::CompoundNotFound(identifier.to_string()))
    }
}

struct KnownNames {
    names: HashSet<&'static str>,
    failing: HashSet<&'static str>,
}

impl KnownNames {
    fn new(names: &[&'static str]) -> Self {
        Self {
            names: names.iter().copied().collect(),
            failing: HashSet::new(),
        }
    }
}

impl StructureRegistry for KnownNames {
    fn lookup(&self, _name: &str, _destination: &Path) -> Result<Lookup, GrimError> {
        Ok(Lookup::NotFound)
    }

    fn exists(&self, name: &str) -> Result<bool, GrimError> {
        if self.failing.contains(name) {
            return Err(GrimError::PubchemStatus {
                status: 503,
                message: "busy".to_string(),
            });
        }
        Ok(self.names.contains(name))
    }
}

/// Answers from a script and remembers what it was shown.
struct ScriptedDecisions {
    unresolved: UnresolvedDecision,
    duplicates: DuplicateDecision,
    individual: Vec<DuplicateChoice>,
    not_found: NotFoundDecision,
    shown_duplicates: Vec<Duplicate>,
    shown_unresolved: Vec<Unresolved>,
}

impl Default for ScriptedDecisions {
    fn default() -> Self {
        Self {
            unresolved: UnresolvedDecision::Drop,
            duplicates: DuplicateDecision::SkipAll,
            individual: Vec::new(),
            not_found: NotFoundDecision::RecordAndDrop,
            shown_duplicates: Vec::new(),
            shown_unresolved: Vec::new(),
        }
    }
}

impl ValidationDecisions for ScriptedDecisions {
    fn unresolved(&mut self, failures: &[Unresolved]) -> UnresolvedDecision {
        self.shown_unresolved = failures.to_vec();
        self.unresolved
    }

    fn duplicates(&mut self, duplicates: &[Duplicate]) -> DuplicateDecision {
        self.shown_duplicates = duplicates.to_vec();
        self.duplicates
    }

    fn choose_individually(&mut self, _duplicates: &[Duplicate]) -> Vec<DuplicateChoice> {
        self.individual.clone()
    }

    fn not_found(&mut self, _missing: &[String]) -> NotFoundDecision {
        self.not_found
    }
}

struct Fixture {
    temp: tempfile::TempDir,
    datastore: Datastore,
    not_found: NotFoundList,
}

impl Fixture {
    fn with_ethanol_stored() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(temp.path().join("thermo_pm7.csv"));
        assert!(datastore.append(&MoleculeRecord::new("CCO", "ethanol")).is_written());
        let not_found = NotFoundList::new(temp.path().join("not-found").join("not-found.txt"));
        Self {
            temp,
            datastore,
            not_found,
        }
    }
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn ready(outcome: ValidationOutcome) -> grimperium::batch::ValidationReport {
    match outcome {
        ValidationOutcome::Ready(report) => report,
        ValidationOutcome::Aborted { stage } => panic!("validation aborted at {stage}"),
    }
}

#[test]
fn stored_molecule_is_skipped_by_default() {
    let fixture = Fixture::with_ethanol_stored();
    let resolver = TableResolver::new(&[("ethanol", "CCO")]);
    let registry = KnownNames::new(&["ethanol"]);
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);

    let report = ready(
        validator
            .validate(&names(&["ethanol"]), &mut PolicyDecisions::default())
            .unwrap(),
    );

    assert!(report.items.is_empty());
    assert_eq!(
        report.skipped,
        vec![Duplicate {
            identifier: "ethanol".to_string(),
            key: "CCO".to_string(),
        }]
    );
}

#[test]
fn overwrite_policy_marks_items() {
    let fixture = Fixture::with_ethanol_stored();
    let resolver = TableResolver::new(&[("ethanol", "CCO"), ("water", "O")]);
    let registry = KnownNames::new(&["ethanol", "water"]);
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);
    let mut decisions = PolicyDecisions {
        on_duplicate: OnDuplicate::Overwrite,
        ..PolicyDecisions::default()
    };

    let report = ready(
        validator
            .validate(&names(&["water", "ethanol"]), &mut decisions)
            .unwrap(),
    );

    assert_eq!(
        report.items,
        vec![RunItem::new("water", false), RunItem::new("ethanol", true)]
    );
    assert!(report.skipped.is_empty());
}

#[test]
fn individual_choices_apply_in_order() {
    let fixture = Fixture::with_ethanol_stored();
    assert!(
        fixture
            .datastore
            .append(&MoleculeRecord::new("O", "water"))
            .is_written()
    );
    let resolver = TableResolver::new(&[("ethanol", "CCO"), ("water", "O")]);
    let registry = KnownNames::new(&["ethanol", "water"]);
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);
    let mut decisions = ScriptedDecisions {
        duplicates: DuplicateDecision::PerIdentifier,
        individual: vec![DuplicateChoice::Skip, DuplicateChoice::Overwrite],
        ..ScriptedDecisions::default()
    };

    let report = ready(
        validator
            .validate(&names(&["ethanol", "water"]), &mut decisions)
            .unwrap(),
    );

    assert_eq!(decisions.shown_duplicates.len(), 2);
    assert_eq!(report.items, vec![RunItem::new("water", true)]);
    assert_eq!(report.skipped[0].identifier, "ethanol");
}

#[test]
fn duplicate_abort_stops_validation() {
    let fixture = Fixture::with_ethanol_stored();
    let resolver = TableResolver::new(&[("ethanol", "CCO")]);
    let registry = KnownNames::new(&["ethanol"]);
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);
    let mut decisions = ScriptedDecisions {
        duplicates: DuplicateDecision::Abort,
        ..ScriptedDecisions::default()
    };

    let outcome = validator
        .validate(&names(&["ethanol"]), &mut decisions)
        .unwrap();
    assert_matches!(
        outcome,
        ValidationOutcome::Aborted {
            stage: ValidationStage::DatastoreOverlap
        }
    );
}

#[test]
fn unresolved_identifiers_are_dropped_or_abort() {
    let fixture = Fixture::with_ethanol_stored();
    let resolver = TableResolver::new(&[("water", "O")]);
    let registry = KnownNames::new(&["water"]);
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);

    let mut decisions = ScriptedDecisions::default();
    let report = ready(
        validator
            .validate(&names(&["mystery", "water"]), &mut decisions)
            .unwrap(),
    );
    assert_eq!(report.items, vec![RunItem::new("water", false)]);
    assert_eq!(report.unresolved.len(), 1);
    assert_eq!(decisions.shown_unresolved[0].identifier, "mystery");

    let mut decisions = PolicyDecisions {
        on_unresolved: OnUnresolved::Abort,
        ..PolicyDecisions::default()
    };
    assert_matches!(
        validator.validate(&names(&["mystery", "water"]), &mut decisions),
        Ok(ValidationOutcome::Aborted {
            stage: ValidationStage::KeyResolution
        })
    );
}

#[test]
fn not_found_are_recorded_then_pruned() {
    let fixture = Fixture::with_ethanol_stored();
    let resolver = TableResolver::new(&[("water", "O"), ("unobtainium", "[Uo]"), ("flaky", "F")]);
    let mut registry = KnownNames::new(&["water"]);
    registry.failing.insert("flaky");
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);

    let report = ready(
        validator
            .validate(
                &names(&["water", "unobtainium", "flaky"]),
                &mut PolicyDecisions::default(),
            )
            .unwrap(),
    );
    assert_eq!(report.items, vec![RunItem::new("water", false)]);
    assert_eq!(report.not_found, names(&["unobtainium", "flaky"]));
    assert_eq!(fixture.not_found.load().unwrap(), names(&["unobtainium", "flaky"]));

    resolver.asked.borrow_mut().clear();
    let report = ready(
        validator
            .validate(&names(&["unobtainium", "water"]), &mut PolicyDecisions::default())
            .unwrap(),
    );
    assert_eq!(report.pruned, names(&["unobtainium"]));
    assert_eq!(report.items, vec![RunItem::new("water", false)]);
    assert_eq!(*resolver.asked.borrow(), names(&["water"]));

    let retrying = BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found)
        .retry_not_found(true);
    let report = ready(
        retrying
            .validate(&names(&["unobtainium"]), &mut PolicyDecisions::default())
            .unwrap(),
    );
    assert!(report.pruned.is_empty());
    assert_eq!(report.not_found, names(&["unobtainium"]));
    assert_eq!(fixture.not_found.load().unwrap().len(), 2);
}

#[test]
fn not_found_abort_leaves_list_untouched() {
    let fixture = Fixture::with_ethanol_stored();
    let resolver = TableResolver::new(&[("unobtainium", "[Uo]")]);
    let registry = KnownNames::new(&[]);
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);
    let mut decisions = PolicyDecisions {
        on_not_found: OnNotFound::Abort,
        ..PolicyDecisions::default()
    };

    assert_matches!(
        validator.validate(&names(&["unobtainium"]), &mut decisions),
        Ok(ValidationOutcome::Aborted {
            stage: ValidationStage::RegistryExistence
        })
    );
    assert!(!fixture.not_found.path().exists());
}

#[test]
fn candidates_are_trimmed_and_deduplicated() {
    let fixture = Fixture::with_ethanol_stored();
    let resolver = TableResolver::new(&[("water", "O")]);
    let registry = KnownNames::new(&["water"]);
    let validator =
        BatchValidator::new(&resolver, &registry, &fixture.datastore, &fixture.not_found);

    let report = ready(
        validator
            .validate(&names(&[" water", "water ", ""]), &mut PolicyDecisions::default())
            .unwrap(),
    );
    assert_eq!(report.items, vec![RunItem::new("water", false)]);
    assert_eq!(resolver.asked.borrow().len(), 1);
}

#[test]
fn identifier_list_skips_comments_and_blanks() {
    let fixture = Fixture::with_ethanol_stored();
    let path = fixture.temp.path().join("molecules.txt");
    fs::write(&path, "# alcohols\nethanol\n\n  methanol  \n#water\n").unwrap();

    assert_eq!(
        load_identifier_list(&path).unwrap(),
        names(&["ethanol", "methanol"])
    );
    assert_matches!(
        load_identifier_list(&fixture.temp.path().join("absent.txt")),
        Err(GrimError::ListRead(_))
    );
}

#[test]
fn not_found_list_ignores_repeats() {
    let fixture = Fixture::with_ethanol_stored();
    assert_eq!(fixture.not_found.record(&names(&["a", "b", "a"])).unwrap(), 2);
    assert_eq!(fixture.not_found.record(&names(&["b", " c "])).unwrap(), 1);
    assert_eq!(fixture.not_found.load().unwrap(), names(&["a", "b", "c"]));
}

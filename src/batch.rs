use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::convert::FormatConverter;
use crate::datastore::Datastore;
use crate::error::GrimError;
use crate::pipeline::{Pipeline, ProgressEvent, ProgressSink, RunItem};
use crate::pubchem::StructureRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationStage {
    KeyResolution,
    DatastoreOverlap,
    RegistryExistence,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationStage::KeyResolution => "key resolution",
            ValidationStage::DatastoreOverlap => "datastore overlap",
            ValidationStage::RegistryExistence => "registry existence",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unresolved {
    pub identifier: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Duplicate {
    pub identifier: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedDecision {
    Drop,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    SkipAll,
    OverwriteAll,
    PerIdentifier,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateChoice {
    Overwrite,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundDecision {
    RecordAndDrop,
    Abort,
}

/// Answers the questions raised while validating a batch.
pub trait ValidationDecisions {
    fn unresolved(&mut self, failures: &[Unresolved]) -> UnresolvedDecision;
    fn duplicates(&mut self, duplicates: &[Duplicate]) -> DuplicateDecision;
    /// One choice per duplicate, in order. Only asked after
    /// [`DuplicateDecision::PerIdentifier`].
    fn choose_individually(&mut self, duplicates: &[Duplicate]) -> Vec<DuplicateChoice>;
    fn not_found(&mut self, missing: &[String]) -> NotFoundDecision;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OnDuplicate {
    #[default]
    Skip,
    Overwrite,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OnUnresolved {
    #[default]
    Drop,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OnNotFound {
    #[default]
    Record,
    Abort,
}

/// Fixed answers, typically from command-line flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyDecisions {
    pub on_duplicate: OnDuplicate,
    pub on_unresolved: OnUnresolved,
    pub on_not_found: OnNotFound,
}

impl ValidationDecisions for PolicyDecisions {
    fn unresolved(&mut self, _failures: &[Unresolved]) -> UnresolvedDecision {
        match self.on_unresolved {
            OnUnresolved::Drop => UnresolvedDecision::Drop,
            OnUnresolved::Abort => UnresolvedDecision::Abort,
        }
    }

    fn duplicates(&mut self, _duplicates: &[Duplicate]) -> DuplicateDecision {
        match self.on_duplicate {
            OnDuplicate::Skip => DuplicateDecision::SkipAll,
            OnDuplicate::Overwrite => DuplicateDecision::OverwriteAll,
            OnDuplicate::Ask => {
                debug!("no terminal prompt, skipping duplicates");
                DuplicateDecision::SkipAll
            }
        }
    }

    fn choose_individually(&mut self, duplicates: &[Duplicate]) -> Vec<DuplicateChoice> {
        vec![DuplicateChoice::Skip; duplicates.len()]
    }

    fn not_found(&mut self, _missing: &[String]) -> NotFoundDecision {
        match self.on_not_found {
            OnNotFound::Record => NotFoundDecision::RecordAndDrop,
            OnNotFound::Abort => NotFoundDecision::Abort,
        }
    }
}

/// Maps an identifier to its datastore key.
pub trait KeyResolver {
    fn key_for(&self, identifier: &str) -> Result<String, GrimError>;
}

struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

impl<R: StructureRegistry, C: FormatConverter> KeyResolver for Pipeline<R, C> {
    fn key_for(&self, identifier: &str) -> Result<String, GrimError> {
        self.resolve_key(identifier, &SilentProgress)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub items: Vec<RunItem>,
    pub pruned: Vec<String>,
    pub unresolved: Vec<Unresolved>,
    pub skipped: Vec<Duplicate>,
    pub not_found: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ValidationOutcome {
    Ready(ValidationReport),
    Aborted { stage: ValidationStage },
}

/// Persistent list of identifiers the registry does not know, one per line.
#[derive(Debug, Clone)]
pub struct NotFoundList {
    path: PathBuf,
}

impl NotFoundList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<String>, GrimError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|_| GrimError::ListRead(self.path.clone()))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Appends the identifiers not already listed; returns how many were new.
    pub fn record(&self, identifiers: &[String]) -> Result<usize, GrimError> {
        let mut entries = self.load()?;
        let mut known = entries.iter().cloned().collect::<HashSet<_>>();
        let before = entries.len();
        for identifier in identifiers {
            let identifier = identifier.trim();
            if !identifier.is_empty() && known.insert(identifier.to_string()) {
                entries.push(identifier.to_string());
            }
        }
        let added = entries.len() - before;
        if added == 0 {
            return Ok(0);
        }

        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| GrimError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".not-found")
            .tempfile_in(parent)
            .map_err(|err| GrimError::Filesystem(err.to_string()))?;
        for entry in &entries {
            writeln!(temp, "{entry}").map_err(|err| GrimError::Filesystem(err.to_string()))?;
        }
        temp.persist(&self.path)
            .map_err(|err| GrimError::Filesystem(err.to_string()))?;
        info!(path = %self.path.display(), added, "recorded identifiers missing from PubChem");
        Ok(added)
    }
}

/// Reads one identifier per line, skipping blank lines and `#` comments.
pub fn load_identifier_list(path: &Path) -> Result<Vec<String>, GrimError> {
    let content =
        fs::read_to_string(path).map_err(|_| GrimError::ListRead(path.to_path_buf()))?;
    let identifiers = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect::<Vec<_>>();
    debug!(path = %path.display(), count = identifiers.len(), "loaded identifier list");
    Ok(identifiers)
}

pub struct BatchValidator<'a> {
    resolver: &'a dyn KeyResolver,
    registry: &'a dyn StructureRegistry,
    datastore: &'a Datastore,
    not_found: &'a NotFoundList,
    prune_not_found: bool,
}

impl<'a> BatchValidator<'a> {
    pub fn new(
        resolver: &'a dyn KeyResolver,
        registry: &'a dyn StructureRegistry,
        datastore: &'a Datastore,
        not_found: &'a NotFoundList,
    ) -> Self {
        Self {
            resolver,
            registry,
            datastore,
            not_found,
            prune_not_found: true,
        }
    }

    /// Keeps identifiers that are already on the not-found list.
    pub fn retry_not_found(mut self, retry: bool) -> Self {
        self.prune_not_found = !retry;
        self
    }

    pub fn validate(
        &self,
        candidates: &[String],
        decisions: &mut dyn ValidationDecisions,
    ) -> Result<ValidationOutcome, GrimError> {
        let mut report = ValidationReport::default();

        let mut seen = HashSet::new();
        let mut molecules = candidates
            .iter()
            .map(|candidate| candidate.trim().to_string())
            .filter(|candidate| !candidate.is_empty())
            .filter(|candidate| seen.insert(candidate.clone()))
            .collect::<Vec<_>>();

        if self.prune_not_found {
            let listed = self.not_found.load()?.into_iter().collect::<HashSet<_>>();
            let (pruned, kept): (Vec<_>, Vec<_>) =
                molecules.into_iter().partition(|m| listed.contains(m));
            if !pruned.is_empty() {
                info!(count = pruned.len(), "skipping identifiers on the not-found list");
            }
            report.pruned = pruned;
            molecules = kept;
        }

        // Key resolution.
        let mut keys = HashMap::new();
        for molecule in &molecules {
            match self.resolver.key_for(molecule) {
                Ok(key) => {
                    keys.insert(molecule.clone(), key);
                }
                Err(err) => {
                    warn!("could not resolve a key for {molecule}: {err}");
                    report.unresolved.push(Unresolved {
                        identifier: molecule.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        if !report.unresolved.is_empty() {
            if decisions.unresolved(&report.unresolved) == UnresolvedDecision::Abort {
                return Ok(ValidationOutcome::Aborted {
                    stage: ValidationStage::KeyResolution,
                });
            }
            molecules.retain(|molecule| keys.contains_key(molecule));
        }
        info!(resolved = keys.len(), "resolved canonical keys");

        // Datastore overlap.
        let existing: BTreeSet<String> = self.datastore.keys();
        let duplicates = molecules
            .iter()
            .filter_map(|molecule| {
                let key = keys.get(molecule)?;
                existing.contains(key).then(|| Duplicate {
                    identifier: molecule.clone(),
                    key: key.clone(),
                })
            })
            .collect::<Vec<_>>();
        let mut overwrite = HashSet::new();
        if !duplicates.is_empty() {
            warn!(count = duplicates.len(), "molecules already in the store");
            let choices = match decisions.duplicates(&duplicates) {
                DuplicateDecision::Abort => {
                    return Ok(ValidationOutcome::Aborted {
                        stage: ValidationStage::DatastoreOverlap,
                    });
                }
                DuplicateDecision::SkipAll => vec![DuplicateChoice::Skip; duplicates.len()],
                DuplicateDecision::OverwriteAll => {
                    vec![DuplicateChoice::Overwrite; duplicates.len()]
                }
                DuplicateDecision::PerIdentifier => decisions.choose_individually(&duplicates),
            };
            let mut skip = HashSet::new();
            for (index, duplicate) in duplicates.iter().enumerate() {
                match choices.get(index).copied().unwrap_or(DuplicateChoice::Skip) {
                    DuplicateChoice::Overwrite => {
                        overwrite.insert(duplicate.identifier.clone());
                    }
                    DuplicateChoice::Skip => {
                        skip.insert(duplicate.identifier.clone());
                        report.skipped.push(duplicate.clone());
                    }
                }
            }
            molecules.retain(|molecule| !skip.contains(molecule));
        }

        // Registry existence.
        let mut missing = Vec::new();
        for molecule in &molecules {
            match self.registry.exists(molecule) {
                Ok(true) => {}
                Ok(false) => missing.push(molecule.clone()),
                Err(err) => {
                    warn!("PubChem check failed for {molecule}: {err}");
                    missing.push(molecule.clone());
                }
            }
        }
        if !missing.is_empty() {
            if decisions.not_found(&missing) == NotFoundDecision::Abort {
                return Ok(ValidationOutcome::Aborted {
                    stage: ValidationStage::RegistryExistence,
                });
            }
            self.not_found.record(&missing)?;
            let missing_set = missing.iter().collect::<HashSet<_>>();
            molecules.retain(|molecule| !missing_set.contains(molecule));
            report.not_found = missing;
        }

        report.items = molecules
            .into_iter()
            .map(|molecule| {
                let overwrite = overwrite.contains(&molecule);
                RunItem::new(molecule, overwrite)
            })
            .collect();
        info!(count = report.items.len(), "validated batch");
        Ok(ValidationOutcome::Ready(report))
    }
}

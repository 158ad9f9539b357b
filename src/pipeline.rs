use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, info_span, warn};

use crate::calc::{CREST_OUTPUT_DIR, Calculator, parse_energy_file};
use crate::config::{Executables, ResolvedConfig, Timeouts};
use crate::convert::{FormatConverter, read_smiles};
use crate::datastore::{Datastore, WriteOutcome};
use crate::domain::{MoleculeRecord, StructureFormat, sanitize_identifier};
use crate::error::GrimError;
use crate::exec::{ProcessRunner, ToolStatus, check_executable};
use crate::pubchem::{Lookup, StructureRegistry};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Init,
    FetchStructure,
    ExtractCanonicalKey,
    ConvertToCoordinateFormat,
    ConformerSearch,
    ConvertBestConformerFormat,
    QuantumCalculation,
    ParseEnergy,
    Persist,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "Init",
            Stage::FetchStructure => "FetchStructure",
            Stage::ExtractCanonicalKey => "ExtractCanonicalKey",
            Stage::ConvertToCoordinateFormat => "ConvertToCoordinateFormat",
            Stage::ConformerSearch => "ConformerSearch",
            Stage::ConvertBestConformerFormat => "ConvertBestConformerFormat",
            Stage::QuantumCalculation => "QuantumCalculation",
            Stage::ParseEnergy => "ParseEnergy",
            Stage::Persist => "Persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Artifacts of one molecule's run. The directory is left on disk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkUnit {
    pub identifier: String,
    pub workdir: PathBuf,
    pub sdf: Option<PathBuf>,
    pub smi: Option<PathBuf>,
    pub xyz: Option<PathBuf>,
    pub crest_best: Option<PathBuf>,
    pub pdb: Option<PathBuf>,
    pub mop: Option<PathBuf>,
    pub out: Option<PathBuf>,
}

impl WorkUnit {
    pub fn new(repository: &Path, identifier: &str) -> Self {
        let workdir = repository.join(sanitize_identifier(identifier));
        Self {
            identifier: identifier.to_string(),
            workdir: std::path::absolute(&workdir).unwrap_or(workdir),
            ..Self::default()
        }
    }

    pub fn crest_dir(&self) -> PathBuf {
        self.workdir.join(CREST_OUTPUT_DIR)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageError {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub identifier: String,
    pub started_at: String,
    pub smiles: Option<String>,
    pub pm7_energy: Option<f64>,
    pub completed: Vec<Stage>,
    pub failure: Option<StageError>,
    pub elapsed: f64,
    pub work: WorkUnit,
}

impl RunReport {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            smiles: None,
            pm7_energy: None,
            completed: Vec::new(),
            failure: None,
            elapsed: 0.0,
            work: WorkUnit::default(),
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none() && self.completed.last() == Some(&Stage::Persist)
    }

    pub fn into_result(self) -> Result<Self, GrimError> {
        match self.failure {
            Some(failure) => Err(GrimError::StageFailure {
                stage: failure.stage,
                molecule: self.identifier,
                reason: failure.reason,
            }),
            None => Ok(self),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            Some(failure) => write!(
                f,
                "{} failed at {}: {}",
                self.identifier, failure.stage, failure.reason
            ),
            None => write!(f, "{} completed", self.identifier),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunItem {
    pub identifier: String,
    pub overwrite: bool,
}

impl RunItem {
    pub fn new(identifier: impl Into<String>, overwrite: bool) -> Self {
        Self {
            identifier: identifier.into(),
            overwrite,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_percentage: f64,
    pub results: Vec<RunReport>,
}

impl BatchSummary {
    fn from_results(results: Vec<RunReport>) -> Self {
        let total = results.len();
        let succeeded = results.iter().filter(|report| report.success()).count();
        let success_percentage = if total > 0 {
            succeeded as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total,
            succeeded,
            failed: total - succeeded,
            success_percentage,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCheck {
    pub name: &'static str,
    pub executable: String,
    pub status: ToolStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub repository: PathBuf,
    pub repository_ready: bool,
    pub tools: Vec<ToolCheck>,
}

impl SetupReport {
    pub fn ready(&self) -> bool {
        self.repository_ready && self.tools.iter().all(|tool| tool.status.is_available())
    }

    pub fn missing(&self) -> Vec<&ToolCheck> {
        self.tools
            .iter()
            .filter(|tool| !tool.status.is_available())
            .collect()
    }
}

/// Sequences the stages for one molecule at a time.
pub struct Pipeline<R: StructureRegistry, C: FormatConverter> {
    registry: R,
    converter: C,
    runner: Arc<dyn ProcessRunner>,
    calculator: Calculator,
    datastore: Datastore,
    repository: PathBuf,
    executables: Executables,
    timeouts: Timeouts,
}

impl<R: StructureRegistry, C: FormatConverter> Pipeline<R, C> {
    pub fn new(
        config: &ResolvedConfig,
        registry: R,
        converter: C,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let calculator = Calculator::new(
            Arc::clone(&runner),
            config.executables.crest.clone(),
            config.executables.mopac.clone(),
        )
        .with_keywords(config.crest_keywords.clone(), config.mopac_keywords.clone())
        .with_timeouts(config.timeouts.conformer_search, config.timeouts.quantum);
        let datastore = Datastore::new(config.pm7_db_path.as_std_path())
            .with_lock_timeout(config.timeouts.lock_wait);
        Self {
            registry,
            converter,
            runner,
            calculator,
            datastore,
            repository: config.repository_base_path.as_std_path().to_path_buf(),
            executables: config.executables.clone(),
            timeouts: config.timeouts,
        }
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Runs every stage for `identifier`. Never panics and never returns an
    /// error: the outcome is in the report.
    pub fn run(&self, identifier: &str, overwrite: bool, sink: &dyn ProgressSink) -> RunReport {
        let span = info_span!("molecule", identifier);
        let _enter = span.enter();
        let started = Instant::now();
        info!(overwrite, "starting pipeline");

        let mut report = RunReport::new(identifier);
        if let Err(failure) = self.run_stages(identifier, overwrite, sink, &mut report) {
            error!(
                stage = %failure.stage,
                "pipeline failed for {identifier}: {}",
                failure.reason
            );
            report.failure = Some(failure);
        } else {
            info!("pipeline completed for {identifier}");
        }
        report.elapsed = started.elapsed().as_secs_f64();
        sink.event(ProgressEvent {
            message: format!("phase=Done; {report}"),
            elapsed: Some(started.elapsed()),
        });
        report
    }

    /// [`Pipeline::run`] repeated under `policy` until one attempt succeeds.
    pub fn run_with_retry(
        &self,
        identifier: &str,
        overwrite: bool,
        policy: &RetryPolicy,
        sink: &dyn ProgressSink,
    ) -> RunReport {
        let label = format!("pipeline for {identifier}");
        match policy.run(&label, |_| {
            let report = self.run(identifier, overwrite, sink);
            if report.success() { Ok(report) } else { Err(report) }
        }) {
            Ok(report) | Err(report) => report,
        }
    }

    /// Canonical key for `identifier`, falling back to the identifier itself
    /// when the SMILES cannot be extracted.
    pub fn resolve_key(
        &self,
        identifier: &str,
        sink: &dyn ProgressSink,
    ) -> Result<String, GrimError> {
        let span = info_span!("resolve", identifier);
        let _enter = span.enter();
        let mut report = RunReport::new(identifier);
        let mut work = WorkUnit::new(&self.repository, identifier);
        self.resolve_stages(&mut work, sink, &mut report)
            .map_err(|failure| GrimError::StageFailure {
                stage: failure.stage,
                molecule: identifier.to_string(),
                reason: failure.reason,
            })
    }

    fn resolve_stages(
        &self,
        work: &mut WorkUnit,
        sink: &dyn ProgressSink,
        report: &mut RunReport,
    ) -> Result<String, StageError> {
        self.init(work, sink, report)?;
        self.fetch(work, sink, report)?;
        Ok(self.extract_key(work, sink, report))
    }

    /// Runs each item in order; a failure never stops the loop.
    pub fn run_batch(
        &self,
        items: &[RunItem],
        policy: &RetryPolicy,
        sink: &dyn ProgressSink,
    ) -> BatchSummary {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        for (index, item) in items.iter().enumerate() {
            info!("[{}/{}] processing {}", index + 1, total, item.identifier);
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Batch; [{}/{}] {}",
                    index + 1,
                    total,
                    item.identifier
                ),
                elapsed: None,
            });
            let report = self.run_with_retry(&item.identifier, item.overwrite, policy, sink);
            if report.success() {
                info!("[{}/{}] {} succeeded", index + 1, total, item.identifier);
            } else {
                warn!("[{}/{}] {report}", index + 1, total);
            }
            results.push(report);
        }

        let summary = BatchSummary::from_results(results);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "batch finished ({:.1}% success)",
            summary.success_percentage
        );
        summary
    }

    /// Verifies the repository directory and the three external tools.
    pub fn check_setup(&self) -> SetupReport {
        let repository_ready = match fs::create_dir_all(&self.repository) {
            Ok(()) => true,
            Err(err) => {
                error!(path = %self.repository.display(), "repository not usable: {err}");
                false
            }
        };
        let checks: [(&'static str, &str, &[&str]); 3] = [
            ("crest", &self.executables.crest, &["--help"]),
            ("mopac", &self.executables.mopac, &[]),
            ("obabel", &self.executables.obabel, &["--help"]),
        ];
        let tools = checks
            .into_iter()
            .map(|(name, executable, args)| ToolCheck {
                name,
                executable: executable.to_string(),
                status: check_executable(
                    self.runner.as_ref(),
                    executable,
                    args,
                    self.timeouts.executable_check,
                ),
            })
            .collect();
        SetupReport {
            repository: self.repository.clone(),
            repository_ready,
            tools,
        }
    }

    fn run_stages(
        &self,
        identifier: &str,
        overwrite: bool,
        sink: &dyn ProgressSink,
        report: &mut RunReport,
    ) -> Result<(), StageError> {
        let mut work = WorkUnit::new(&self.repository, identifier);
        let result = self.run_work(&mut work, overwrite, sink, report);
        report.work = work;
        result
    }

    fn run_work(
        &self,
        work: &mut WorkUnit,
        overwrite: bool,
        sink: &dyn ProgressSink,
        report: &mut RunReport,
    ) -> Result<(), StageError> {
        self.init(work, sink, report)?;
        let sdf = self.fetch(work, sink, report)?;
        let smiles = self.extract_key(work, sink, report);
        report.smiles = Some(smiles.clone());

        let xyz = self.stage(Stage::ConvertToCoordinateFormat, sink, report, || {
            self.converter.convert(&sdf, StructureFormat::Xyz, None)
        })?;
        work.xyz = Some(xyz.clone());

        let crest_dir = work.crest_dir();
        let best = self.stage(Stage::ConformerSearch, sink, report, || {
            self.calculator.conformer_search(&xyz, &crest_dir)
        })?;
        work.crest_best = Some(best.clone());

        let pdb = self.stage(Stage::ConvertBestConformerFormat, sink, report, || {
            self.converter.convert(&best, StructureFormat::Pdb, None)
        })?;
        work.pdb = Some(pdb.clone());

        let out = self.stage(Stage::QuantumCalculation, sink, report, || {
            self.calculator.quantum_calculation(&pdb)
        })?;
        work.mop = Some(pdb.with_extension("mop"));
        work.out = Some(out.clone());

        let energy = self.stage(Stage::ParseEnergy, sink, report, || {
            parse_energy_file(&out)?.ok_or_else(|| {
                GrimError::Calculation(format!(
                    "no FINAL HEAT OF FORMATION in {}",
                    out.display()
                ))
            })
        })?;
        report.pm7_energy = Some(energy);

        let mut record = MoleculeRecord::new(smiles, work.identifier.clone());
        record.sdf_path = Some(display_path(&sdf));
        record.xyz_path = Some(display_path(&xyz));
        record.crest_best_xyz_path = Some(display_path(&best));
        record.pm7_energy = Some(energy);
        self.stage(Stage::Persist, sink, report, || {
            match self.datastore.upsert(&record, overwrite) {
                WriteOutcome::Inserted | WriteOutcome::Updated => Ok(()),
                WriteOutcome::Duplicate => Err(GrimError::Datastore(format!(
                    "'{}' already exists in the store",
                    record.key()
                ))),
                WriteOutcome::Failed(err) => Err(err),
            }
        })?;
        Ok(())
    }

    fn init(
        &self,
        work: &mut WorkUnit,
        sink: &dyn ProgressSink,
        report: &mut RunReport,
    ) -> Result<(), StageError> {
        let workdir = work.workdir.clone();
        self.stage(Stage::Init, sink, report, || {
            fs::create_dir_all(&workdir).map_err(|err| {
                GrimError::Filesystem(format!("create {}: {err}", workdir.display()))
            })
        })
    }

    fn fetch(
        &self,
        work: &mut WorkUnit,
        sink: &dyn ProgressSink,
        report: &mut RunReport,
    ) -> Result<PathBuf, StageError> {
        let identifier = work.identifier.clone();
        let workdir = work.workdir.clone();
        let sdf = self.stage(Stage::FetchStructure, sink, report, || {
            match self.registry.lookup(&identifier, &workdir)? {
                Lookup::Found(path) => Ok(path),
                Lookup::NotFound => Err(GrimError::CompoundNotFound(identifier.clone())),
            }
        })?;
        work.sdf = Some(sdf.clone());
        Ok(sdf)
    }

    fn extract_key(
        &self,
        work: &mut WorkUnit,
        sink: &dyn ProgressSink,
        report: &mut RunReport,
    ) -> String {
        let Some(sdf) = work.sdf.clone() else {
            return work.identifier.clone();
        };
        let result = self.stage(Stage::ExtractCanonicalKey, sink, report, || {
            let smi = self.converter.convert(&sdf, StructureFormat::Smi, None)?;
            let smiles = read_smiles(&smi)?;
            Ok((smi, smiles))
        });
        match result {
            Ok((smi, Some(smiles))) => {
                work.smi = Some(smi);
                info!("canonical SMILES: {smiles}");
                smiles
            }
            Ok((smi, None)) => {
                work.smi = Some(smi);
                warn!("SMILES file is empty, using identifier as key");
                work.identifier.clone()
            }
            Err(failure) => {
                warn!("{}; using identifier as key", failure.reason);
                report.completed.push(Stage::ExtractCanonicalKey);
                work.identifier.clone()
            }
        }
    }

    fn stage<T>(
        &self,
        stage: Stage,
        sink: &dyn ProgressSink,
        report: &mut RunReport,
        op: impl FnOnce() -> Result<T, GrimError>,
    ) -> Result<T, StageError> {
        let started = Instant::now();
        info!(%stage, "stage started");
        sink.event(ProgressEvent {
            message: format!("phase={stage}; {}", report.identifier),
            elapsed: None,
        });
        match op() {
            Ok(value) => {
                report.completed.push(stage);
                sink.event(ProgressEvent {
                    message: format!("phase={stage}; done"),
                    elapsed: Some(started.elapsed()),
                });
                Ok(value)
            }
            Err(err) => Err(StageError {
                stage,
                reason: err.to_string(),
            }),
        }
    }
}

fn display_path(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

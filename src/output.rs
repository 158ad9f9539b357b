use std::io::{self, Write};

use serde::Serialize;

use crate::batch::ValidationOutcome;
use crate::config::{Executables, ResolvedConfig};
use crate::datastore::SchemaCheck;
use crate::domain::StructureFormat;
use crate::pipeline::{BatchSummary, ProgressEvent, ProgressSink, RunReport, SetupReport};
use crate::report::FullReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatInfo {
    pub extension: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub config_source: Option<String>,
    pub executables: Executables,
    pub crest_keywords: String,
    pub mopac_keywords: String,
    pub repository_base_path: String,
    pub cbs_db_path: String,
    pub pm7_db_path: String,
    pub pm7_schema: SchemaCheck,
    pub setup: SetupReport,
    pub formats: Vec<FormatInfo>,
}

impl InfoResult {
    pub fn new(config: &ResolvedConfig, setup: SetupReport, pm7_schema: SchemaCheck) -> Self {
        Self {
            config_source: config
                .source
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            executables: config.executables.clone(),
            crest_keywords: config.crest_keywords.clone(),
            mopac_keywords: config.mopac_keywords.clone(),
            repository_base_path: config.repository_base_path.to_string(),
            cbs_db_path: config.cbs_db_path.to_string(),
            pm7_db_path: config.pm7_db_path.to_string(),
            pm7_schema,
            setup,
            formats: [
                StructureFormat::Sdf,
                StructureFormat::Xyz,
                StructureFormat::Pdb,
                StructureFormat::Smi,
                StructureFormat::Mol,
                StructureFormat::Mol2,
            ]
            .into_iter()
            .map(|format| FormatInfo {
                extension: format.extension(),
                description: format.description(),
            })
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub validation: ValidationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchSummary>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_batch(result: &BatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(result: &FullReport) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Prints `phase=` progress lines to stderr.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let Some(rest) = event.message.strip_prefix("phase=") else {
            eprintln!("  {}", event.message);
            return;
        };
        let (phase, message) = rest.split_once(';').unwrap_or((rest, ""));
        match event.elapsed {
            Some(elapsed) => eprintln!(
                "\x1b[36m{phase:>26}\x1b[0m {} ({:.1}s)",
                message.trim(),
                elapsed.as_secs_f64()
            ),
            None => eprintln!("\x1b[36m{phase:>26}\x1b[0m {}", message.trim()),
        }
    }
}

//! Conformer search (CREST) and semi-empirical energy (MOPAC) stages.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::error::GrimError;
use crate::exec::ProcessRunner;

pub const CREST_OUTPUT_DIR: &str = "crest_output";
pub const CREST_BEST_FILE: &str = "crest_best.xyz";

static HEAT_OF_FORMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)FINAL HEAT OF FORMATION\s*=\s*([-+]?\d+\.?\d*)\s*KCAL/MOL").unwrap()
});

/// Runs the two external chemistry programs through a [`ProcessRunner`].
pub struct Calculator {
    runner: Arc<dyn ProcessRunner>,
    crest: String,
    mopac: String,
    crest_keywords: String,
    mopac_keywords: String,
    crest_timeout: Duration,
    mopac_timeout: Duration,
}

impl Calculator {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        crest: impl Into<String>,
        mopac: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            crest: crest.into(),
            mopac: mopac.into(),
            crest_keywords: crate::config::DEFAULT_CREST_KEYWORDS.to_string(),
            mopac_keywords: crate::config::DEFAULT_MOPAC_KEYWORDS.to_string(),
            crest_timeout: Duration::from_secs(crate::config::CONFORMER_SEARCH_TIMEOUT_SECS),
            mopac_timeout: Duration::from_secs(crate::config::QUANTUM_TIMEOUT_SECS),
        }
    }

    pub fn with_keywords(mut self, crest: impl Into<String>, mopac: impl Into<String>) -> Self {
        self.crest_keywords = crest.into();
        self.mopac_keywords = mopac.into();
        self
    }

    pub fn with_timeouts(mut self, crest: Duration, mopac: Duration) -> Self {
        self.crest_timeout = crest;
        self.mopac_timeout = mopac;
        self
    }

    /// Conformer search on `xyz`, run inside `output_dir`. Returns the path of
    /// the best conformer.
    pub fn conformer_search(&self, xyz: &Path, output_dir: &Path) -> Result<PathBuf, GrimError> {
        if !xyz.is_file() {
            return Err(GrimError::Filesystem(format!(
                "input XYZ file does not exist: {}",
                xyz.display()
            )));
        }
        fs::create_dir_all(output_dir).map_err(|err| GrimError::Filesystem(err.to_string()))?;
        let output_dir = absolute(output_dir);

        let mut command = vec![self.crest.clone(), absolute(xyz).to_string_lossy().to_string()];
        command.extend(self.crest_keywords.split_whitespace().map(str::to_string));

        info!(dir = %output_dir.display(), "running CREST");
        let result = self
            .runner
            .execute(&command, Some(&output_dir), Some(self.crest_timeout))?;
        if !result.success() {
            error!(code = result.returncode, "CREST failed: {}", result.diagnostic());
            if !result.stdout.trim().is_empty() {
                debug!(stdout = %result.stdout.trim(), "CREST stdout");
            }
            return Err(GrimError::Calculation(format!(
                "CREST failed: {}",
                result.diagnostic()
            )));
        }

        let best = output_dir.join(CREST_BEST_FILE);
        require_content(&best, "CREST best conformer")?;
        info!(path = %best.display(), "best conformer saved");
        Ok(best)
    }

    /// Writes `<stem>.mop` next to `pdb`, runs MOPAC on it and returns the
    /// `<stem>.out` listing.
    pub fn quantum_calculation(&self, pdb: &Path) -> Result<PathBuf, GrimError> {
        let mop = write_mopac_input(pdb, &self.mopac_keywords)?;
        let mop = absolute(&mop);
        let workdir = mop
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let command = vec![self.mopac.clone(), mop.to_string_lossy().to_string()];

        info!(input = %mop.display(), "running MOPAC");
        let result = self
            .runner
            .execute(&command, Some(&workdir), Some(self.mopac_timeout))?;
        if !result.success() {
            error!(code = result.returncode, "MOPAC failed: {}", result.diagnostic());
            return Err(GrimError::Calculation(format!(
                "MOPAC failed: {}",
                result.diagnostic()
            )));
        }

        let out = mop.with_extension("out");
        require_content(&out, "MOPAC output")?;
        info!(path = %out.display(), "MOPAC output saved");
        Ok(out)
    }
}

/// Builds a MOPAC input deck from the ATOM/HETATM records of a PDB file.
/// `None` when there are no atom records; an atom record with unreadable
/// coordinates is an error.
pub fn mopac_input(
    pdb_text: &str,
    keywords: &str,
    title: &str,
) -> Result<Option<String>, GrimError> {
    let rows = pdb_text
        .lines()
        .filter(|line| line.starts_with("ATOM") || line.starts_with("HETATM"))
        .map(atom_row)
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!(
        "{keywords}\n{title} - MOPAC Calculation\n\n{}",
        rows.join("\n")
    )))
}

fn atom_row(line: &str) -> Result<String, GrimError> {
    let column = |start: usize, end: usize| -> &str {
        line.get(start..end.min(line.len())).unwrap_or("").trim()
    };
    let coordinate = |axis: &str, start: usize, end: usize| -> Result<f64, GrimError> {
        column(start, end).parse().map_err(|_| {
            GrimError::Calculation(format!("unreadable {axis} coordinate in PDB line: {line}"))
        })
    };
    let mut symbol = column(76, 78).to_string();
    if symbol.is_empty() {
        symbol = column(12, 16)
            .chars()
            .take(2)
            .filter(|ch| ch.is_alphabetic())
            .collect();
    }
    if symbol.is_empty() {
        return Err(GrimError::Calculation(format!(
            "no element symbol in PDB line: {line}"
        )));
    }
    let x = coordinate("x", 30, 38)?;
    let y = coordinate("y", 38, 46)?;
    let z = coordinate("z", 46, 54)?;
    Ok(format!("{symbol:<2} {x:12.6} {y:12.6} {z:12.6}"))
}

pub fn write_mopac_input(pdb: &Path, keywords: &str) -> Result<PathBuf, GrimError> {
    let text = fs::read_to_string(pdb).map_err(|err| {
        GrimError::Filesystem(format!("read {}: {err}", pdb.display()))
    })?;
    let title = pdb
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let Some(deck) = mopac_input(&text, keywords, &title)? else {
        return Err(GrimError::Calculation(format!(
            "no atomic coordinates found in {}",
            pdb.display()
        )));
    };
    let mop = pdb.with_extension("mop");
    fs::write(&mop, deck).map_err(|err| GrimError::Filesystem(err.to_string()))?;
    info!(path = %mop.display(), "created MOPAC input");
    Ok(mop)
}

/// Last `FINAL HEAT OF FORMATION` value in a MOPAC listing, kcal/mol.
pub fn parse_heat_of_formation(text: &str) -> Option<f64> {
    HEAT_OF_FORMATION
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|value| value.as_str().parse().ok())
}

pub fn parse_energy_file(path: &Path) -> Result<Option<f64>, GrimError> {
    let bytes = fs::read(path).map_err(|err| {
        GrimError::Filesystem(format!("read {}: {err}", path.display()))
    })?;
    let energy = parse_heat_of_formation(&String::from_utf8_lossy(&bytes));
    match energy {
        Some(value) => info!("final heat of formation: {value} kcal/mol"),
        None => warn!(path = %path.display(), "no FINAL HEAT OF FORMATION found"),
    }
    Ok(energy)
}

fn require_content(path: &Path, what: &str) -> Result<(), GrimError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(GrimError::Calculation(format!(
            "{what} is empty: {}",
            path.display()
        ))),
        Err(_) => Err(GrimError::Calculation(format!(
            "{what} not found: {}",
            path.display()
        ))),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

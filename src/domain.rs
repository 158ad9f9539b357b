use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GrimError;

pub const DEFAULT_CHARGE: i32 = 0;
pub const DEFAULT_MULTIPLICITY: i32 = 1;

/// On-disk column order of the results store.
pub const SCHEMA: [&str; 8] = [
    "smiles",
    "identifier",
    "sdf_path",
    "xyz_path",
    "crest_best_xyz_path",
    "pm7_energy",
    "charge",
    "multiplicity",
];

pub const KEY_COLUMN: &str = "smiles";

const WORKDIR_FALLBACK: &str = "unknown_molecule";

static UNSAFE_PATH_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\s]"#).unwrap());
static UNDERSCORE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StructureFormat {
    Sdf,
    Xyz,
    Pdb,
    Smi,
    Mol,
    Mol2,
}

impl StructureFormat {
    pub fn extension(self) -> &'static str {
        match self {
            StructureFormat::Sdf => "sdf",
            StructureFormat::Xyz => "xyz",
            StructureFormat::Pdb => "pdb",
            StructureFormat::Smi => "smi",
            StructureFormat::Mol => "mol",
            StructureFormat::Mol2 => "mol2",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StructureFormat::Sdf => "Structure Data Format",
            StructureFormat::Xyz => "XYZ Coordinates",
            StructureFormat::Pdb => "Protein Data Bank",
            StructureFormat::Smi => "SMILES",
            StructureFormat::Mol => "MDL Molfile",
            StructureFormat::Mol2 => "Tripos MOL2",
        }
    }
}

impl fmt::Display for StructureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for StructureFormat {
    type Err = GrimError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "sdf" => Ok(StructureFormat::Sdf),
            "xyz" => Ok(StructureFormat::Xyz),
            "pdb" => Ok(StructureFormat::Pdb),
            "smi" => Ok(StructureFormat::Smi),
            "mol" => Ok(StructureFormat::Mol),
            "mol2" => Ok(StructureFormat::Mol2),
            _ => Err(GrimError::UnsupportedFormat(value.to_string())),
        }
    }
}

/// One row of the results store, keyed by canonical SMILES.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoleculeRecord {
    pub smiles: String,
    pub identifier: String,
    pub sdf_path: Option<String>,
    pub xyz_path: Option<String>,
    pub crest_best_xyz_path: Option<String>,
    pub pm7_energy: Option<f64>,
    pub charge: i32,
    pub multiplicity: i32,
}

impl MoleculeRecord {
    pub fn new(smiles: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            smiles: smiles.into(),
            identifier: identifier.into(),
            sdf_path: None,
            xyz_path: None,
            crest_best_xyz_path: None,
            pm7_energy: None,
            charge: DEFAULT_CHARGE,
            multiplicity: DEFAULT_MULTIPLICITY,
        }
    }

    pub fn key(&self) -> &str {
        self.smiles.trim()
    }

    pub fn validate(&self) -> Result<(), GrimError> {
        if self.key().is_empty() {
            return Err(GrimError::InvalidRecord(
                "smiles cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Cell value for a schema column; `None` for columns outside the schema.
    pub fn value_for(&self, column: &str) -> Option<String> {
        let value = match column {
            "smiles" => self.key().to_string(),
            "identifier" => self.identifier.clone(),
            "sdf_path" => self.sdf_path.clone().unwrap_or_default(),
            "xyz_path" => self.xyz_path.clone().unwrap_or_default(),
            "crest_best_xyz_path" => self.crest_best_xyz_path.clone().unwrap_or_default(),
            "pm7_energy" => self
                .pm7_energy
                .map(|value| value.to_string())
                .unwrap_or_default(),
            "charge" => self.charge.to_string(),
            "multiplicity" => self.multiplicity.to_string(),
            _ => return None,
        };
        Some(value)
    }

    pub fn to_row(&self) -> Vec<String> {
        SCHEMA
            .iter()
            .map(|column| self.value_for(column).unwrap_or_default())
            .collect()
    }

    /// Rebuilds a record from a CSV row read under `headers`.
    pub fn from_row(headers: &[String], row: &[String]) -> Option<Self> {
        let cell = |name: &str| -> Option<&str> {
            headers
                .iter()
                .position(|header| header == name)
                .and_then(|index| row.get(index))
                .map(|value| value.trim())
        };
        let optional = |name: &str| cell(name).filter(|v| !v.is_empty()).map(str::to_string);

        let smiles = cell(KEY_COLUMN).filter(|value| !value.is_empty())?;
        Some(Self {
            smiles: smiles.to_string(),
            identifier: cell("identifier").unwrap_or_default().to_string(),
            sdf_path: optional("sdf_path"),
            xyz_path: optional("xyz_path"),
            crest_best_xyz_path: optional("crest_best_xyz_path"),
            pm7_energy: cell("pm7_energy").and_then(|value| value.parse().ok()),
            charge: cell("charge")
                .and_then(parse_integer)
                .unwrap_or(DEFAULT_CHARGE),
            multiplicity: cell("multiplicity")
                .and_then(parse_integer)
                .unwrap_or(DEFAULT_MULTIPLICITY),
        })
    }
}

// Stores written by other tools may hold integers as "0.0".
fn parse_integer(value: &str) -> Option<i32> {
    value
        .parse::<i32>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|v| v as i32))
}

/// Filesystem-safe directory name for a molecule identifier.
pub fn sanitize_identifier(identifier: &str) -> String {
    sanitize_with_fallback(identifier, WORKDIR_FALLBACK)
}

pub(crate) fn sanitize_with_fallback(name: &str, fallback: &str) -> String {
    let replaced = UNSAFE_PATH_CHARS.replace_all(name, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|ch| ch == '_' || ch == '.');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

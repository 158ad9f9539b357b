use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::domain::StructureFormat;
use crate::error::GrimError;
use crate::exec::ProcessRunner;

pub trait FormatConverter: Send + Sync {
    /// Converts `input` to `format`, returning the written file.
    fn convert(
        &self,
        input: &Path,
        format: StructureFormat,
        out_dir: Option<&Path>,
    ) -> Result<PathBuf, GrimError>;
}

/// `<stem>.<format>` next to the input, or inside `out_dir` when given.
pub fn output_path(input: &Path, format: StructureFormat, out_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "structure".to_string());
    let dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    dir.join(format!("{stem}.{}", format.extension()))
}

/// Converter backed by the `obabel` command line.
pub struct OpenBabelConverter {
    runner: Arc<dyn ProcessRunner>,
    executable: String,
    timeout: Duration,
}

impl OpenBabelConverter {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        executable: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            executable: executable.into(),
            timeout,
        }
    }
}

impl FormatConverter for OpenBabelConverter {
    fn convert(
        &self,
        input: &Path,
        format: StructureFormat,
        out_dir: Option<&Path>,
    ) -> Result<PathBuf, GrimError> {
        if !input.is_file() {
            return Err(GrimError::Filesystem(format!(
                "input file not found: {}",
                input.display()
            )));
        }
        if let Some(dir) = out_dir {
            fs::create_dir_all(dir).map_err(|err| GrimError::Filesystem(err.to_string()))?;
        }

        let output = output_path(input, format, out_dir);
        info!(
            "converting {} to {}",
            input.display(),
            format.extension().to_uppercase()
        );
        let command = vec![
            self.executable.clone(),
            input.to_string_lossy().to_string(),
            "-O".to_string(),
            output.to_string_lossy().to_string(),
        ];
        let result = self.runner.execute(&command, None, Some(self.timeout))?;
        if !result.success() {
            let reason = result.diagnostic();
            error!(input = %input.display(), "Open Babel conversion failed: {reason}");
            return Err(GrimError::Calculation(format!(
                "conversion of {} to {format} failed: {reason}",
                input.display()
            )));
        }

        let written = fs::metadata(&output).map(|meta| meta.len()).unwrap_or(0);
        if written == 0 {
            return Err(GrimError::Calculation(format!(
                "conversion produced no output at {}",
                output.display()
            )));
        }
        debug!(output = %output.display(), bytes = written, "conversion complete");
        Ok(output)
    }
}

/// First whitespace-separated token of the first non-empty line of a SMILES
/// file.
pub fn read_smiles(path: &Path) -> Result<Option<String>, GrimError> {
    let content =
        fs::read_to_string(path).map_err(|err| GrimError::Filesystem(err.to_string()))?;
    Ok(content
        .lines()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string))
}

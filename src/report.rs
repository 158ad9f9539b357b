//! Progress of the PM7 store against the CBS reference store.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use crate::datastore::Datastore;

pub const DEFAULT_SECONDS_PER_MOLECULE: f64 = 300.0;
const SECONDS_PER_HOUR: f64 = 3600.0;
const HOURS_PER_DAY: f64 = 24.0;
const GOOD_DUPLICATE_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub total_cbs: usize,
    pub total_pm7: usize,
    pub common_count: usize,
    pub missing_count: usize,
    pub extra_count: usize,
    pub progress_percentage: f64,
    pub cbs_exists: bool,
    pub pm7_exists: bool,
    pub cbs_db_path: String,
    pub pm7_db_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataQuality {
    Good,
    #[serde(rename = "Needs Review")]
    NeedsReview,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreAnalysis {
    pub exists: bool,
    pub path: String,
    pub total_entries: usize,
    pub unique_keys: usize,
    pub file_size_bytes: u64,
    pub file_size_mb: f64,
    pub columns: Vec<String>,
    pub duplicate_ratio: f64,
    pub data_quality: DataQuality,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionEta {
    pub total_remaining: usize,
    pub eta_hours: f64,
    pub eta_days: f64,
    pub eta_human: String,
    pub completion_rate_per_hour: f64,
}

/// Everything the `report` command prints.
#[derive(Debug, Clone, Serialize)]
pub struct FullReport {
    pub generated_at: String,
    pub progress: ProgressReport,
    pub eta: CompletionEta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cbs_analysis: Option<StoreAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm7_analysis: Option<StoreAnalysis>,
    pub missing: Vec<String>,
}

pub fn full_report(
    cbs: &Datastore,
    pm7: &Datastore,
    detailed: bool,
    missing_limit: Option<usize>,
) -> FullReport {
    let progress = progress_report(cbs, pm7);
    let eta = completion_eta(progress.missing_count, 0.0);
    let (cbs_analysis, pm7_analysis) = if detailed {
        (Some(analyze_store(cbs)), Some(analyze_store(pm7)))
    } else {
        (None, None)
    };
    let missing = match missing_limit {
        Some(limit) => missing_molecules(cbs, pm7, Some(limit)),
        None => Vec::new(),
    };
    FullReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        progress,
        eta,
        cbs_analysis,
        pm7_analysis,
        missing,
    }
}

pub fn progress_report(cbs: &Datastore, pm7: &Datastore) -> ProgressReport {
    info!("generating progress report");
    let cbs_keys = cbs.keys();
    let pm7_keys = pm7.keys();
    debug!(cbs = cbs_keys.len(), pm7 = pm7_keys.len(), "store key counts");

    let common_count = cbs_keys.intersection(&pm7_keys).count();
    let missing_count = cbs_keys.difference(&pm7_keys).count();
    let extra_count = pm7_keys.difference(&cbs_keys).count();
    let progress_percentage = if cbs_keys.is_empty() {
        0.0
    } else {
        common_count as f64 / cbs_keys.len() as f64 * 100.0
    };
    info!(
        common = common_count,
        missing = missing_count,
        extra = extra_count,
        "progress {progress_percentage:.2}%"
    );

    ProgressReport {
        total_cbs: cbs_keys.len(),
        total_pm7: pm7_keys.len(),
        common_count,
        missing_count,
        extra_count,
        progress_percentage,
        cbs_exists: cbs.path().exists(),
        pm7_exists: pm7.path().exists(),
        cbs_db_path: display(cbs.path()),
        pm7_db_path: display(pm7.path()),
    }
}

pub fn analyze_store(store: &Datastore) -> StoreAnalysis {
    let stats = store.stats();
    let duplicate_ratio = if stats.total_entries > 0 {
        1.0 - stats.unique_keys as f64 / stats.total_entries as f64
    } else {
        0.0
    };
    let data_quality = if stats.total_entries == 0 {
        DataQuality::Empty
    } else if duplicate_ratio < GOOD_DUPLICATE_RATIO {
        DataQuality::Good
    } else {
        DataQuality::NeedsReview
    };
    StoreAnalysis {
        exists: stats.exists,
        path: display(store.path()),
        total_entries: stats.total_entries,
        unique_keys: stats.unique_keys,
        file_size_bytes: stats.file_size_bytes,
        file_size_mb: stats.file_size_bytes as f64 / (1024.0 * 1024.0),
        columns: stats.columns,
        duplicate_ratio,
        data_quality,
    }
}

/// Keys present in the reference store but not yet computed, sorted.
pub fn missing_molecules(cbs: &Datastore, pm7: &Datastore, limit: Option<usize>) -> Vec<String> {
    let pm7_keys = pm7.keys();
    let missing: BTreeSet<String> = cbs
        .keys()
        .into_iter()
        .filter(|key| !pm7_keys.contains(key))
        .collect();
    let total = missing.len();
    let list = match limit {
        Some(limit) if limit > 0 => missing.into_iter().take(limit).collect::<Vec<_>>(),
        _ => missing.into_iter().collect(),
    };
    info!("found {total} missing molecules, returning {}", list.len());
    list
}

/// Time left at `rate_per_hour`, or at five minutes per molecule when no
/// rate is known.
pub fn completion_eta(remaining: usize, rate_per_hour: f64) -> CompletionEta {
    if remaining == 0 {
        return CompletionEta {
            total_remaining: 0,
            eta_hours: 0.0,
            eta_days: 0.0,
            eta_human: "Complete!".to_string(),
            completion_rate_per_hour: rate_per_hour,
        };
    }

    let eta_hours = if rate_per_hour > 0.0 {
        remaining as f64 / rate_per_hour
    } else {
        remaining as f64 * DEFAULT_SECONDS_PER_MOLECULE / SECONDS_PER_HOUR
    };
    let eta_days = eta_hours / HOURS_PER_DAY;
    let eta_human = if eta_hours < 1.0 {
        format!("{:.0} minutes", eta_hours * 60.0)
    } else if eta_hours < HOURS_PER_DAY {
        format!("{eta_hours:.1} hours")
    } else if eta_days < 7.0 {
        format!("{eta_days:.1} days")
    } else {
        format!("{:.1} weeks", eta_days / 7.0)
    };

    CompletionEta {
        total_remaining: remaining,
        eta_hours,
        eta_days,
        eta_human,
        completion_rate_per_hour: rate_per_hour,
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

use std::fs;

use grimperium::datastore::Datastore;
use grimperium::report::{
    DataQuality, analyze_store, full_report, missing_molecules, progress_report,
};

struct Stores {
    _temp: tempfile::TempDir,
    cbs: Datastore,
    pm7: Datastore,
}

fn stores(cbs: &str, pm7: &str) -> Stores {
    let temp = tempfile::tempdir().unwrap();
    let cbs_path = temp.path().join("thermo_cbs.csv");
    let pm7_path = temp.path().join("thermo_pm7.csv");
    fs::write(&cbs_path, cbs).unwrap();
    fs::write(&pm7_path, pm7).unwrap();
    Stores {
        cbs: Datastore::new(cbs_path),
        pm7: Datastore::new(pm7_path),
        _temp: temp,
    }
}

#[test]
fn progress_counts_overlap() {
    let stores = stores(
        "smiles,H298_cbs\nC,-17.9\nCC,-20.0\nCCO,-56.2\n",
        "smiles,identifier,pm7_energy\nCCO,ethanol,-74.3\nO,water,-57.8\n",
    );

    let progress = progress_report(&stores.cbs, &stores.pm7);

    assert_eq!(progress.total_cbs, 3);
    assert_eq!(progress.total_pm7, 2);
    assert_eq!(progress.common_count, 1);
    assert_eq!(progress.missing_count, 2);
    assert_eq!(progress.extra_count, 1);
    assert!((progress.progress_percentage - 33.333).abs() < 0.01);
    assert!(progress.cbs_exists && progress.pm7_exists);
}

#[test]
fn missing_molecules_are_sorted_and_limited() {
    let stores = stores("smiles\nO\nCC\nC\nCCO\n", "smiles\nCCO\n");

    assert_eq!(missing_molecules(&stores.cbs, &stores.pm7, None), vec!["C", "CC", "O"]);
    assert_eq!(missing_molecules(&stores.cbs, &stores.pm7, Some(2)), vec!["C", "CC"]);
}

#[test]
fn empty_reference_is_zero_percent() {
    let stores = stores("", "smiles\nCCO\n");
    let progress = progress_report(&stores.cbs, &stores.pm7);
    assert_eq!(progress.total_cbs, 0);
    assert_eq!(progress.progress_percentage, 0.0);
}

#[test]
fn analysis_flags_duplicates() {
    let stores = stores("smiles\nC\nC\nCC\n", "");

    let cbs = analyze_store(&stores.cbs);
    assert_eq!(cbs.total_entries, 3);
    assert_eq!(cbs.unique_keys, 2);
    assert_eq!(cbs.data_quality, DataQuality::NeedsReview);

    let pm7 = analyze_store(&stores.pm7);
    assert_eq!(pm7.data_quality, DataQuality::Empty);
}

#[test]
fn full_report_includes_requested_sections() {
    let stores = stores("smiles\nC\nCC\n", "smiles\nC\n");

    let brief = full_report(&stores.cbs, &stores.pm7, false, None);
    assert!(brief.cbs_analysis.is_none());
    assert!(brief.missing.is_empty());
    assert_eq!(brief.eta.total_remaining, 1);
    assert_eq!(brief.eta.eta_human, "5 minutes");

    let detailed = full_report(&stores.cbs, &stores.pm7, true, Some(10));
    assert_eq!(
        detailed.pm7_analysis.as_ref().map(|analysis| analysis.data_quality),
        Some(DataQuality::Good)
    );
    assert_eq!(detailed.missing, vec!["CC"]);

    let json = serde_json::to_value(&detailed).unwrap();
    assert_eq!(json["progress"]["common_count"], 1);
}

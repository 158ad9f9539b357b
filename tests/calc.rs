use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;

use grimperium::calc::{
    CREST_BEST_FILE, Calculator, mopac_input, parse_energy_file, parse_heat_of_formation,
    write_mopac_input,
};
use grimperium::error::GrimError;
use grimperium::exec::{ProcessResult, ProcessRunner};

const WATER_PDB: &str = "\
COMPND    water
HETATM    1  O   UNL     1       0.000   0.000   0.117  1.00  0.00           O
HETATM    2  H   UNL     1       0.000   0.757  -0.467  1.00  0.00           H
HETATM    3  H   UNL     1       0.000  -0.757  -0.467  1.00  0.00           H
CONECT    1    2    3
END
";

/// Replays a fixed exit code and optionally drops a file into the working
/// directory, recording every command it sees.
#[derive(Default)]
struct ScriptedRunner {
    returncode: i32,
    writes: Option<(&'static str, &'static str)>,
    calls: Mutex<Vec<(Vec<String>, Option<std::path::PathBuf>)>>,
}

impl ProcessRunner for ScriptedRunner {
    fn execute(
        &self,
        command: &[String],
        working_dir: Option<&Path>,
        _timeout: Option<Duration>,
    ) -> Result<ProcessResult, GrimError> {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_vec(), working_dir.map(Path::to_path_buf)));
        if let (Some((name, content)), Some(dir)) = (self.writes, working_dir) {
            fs::write(dir.join(name), content).unwrap();
        }
        Ok(ProcessResult {
            command: command.to_vec(),
            returncode: self.returncode,
            stdout: String::new(),
            stderr: if self.returncode == 0 {
                String::new()
            } else {
                "segmentation fault".to_string()
            },
            timed_out: false,
            elapsed: 0.0,
        })
    }
}

#[test]
fn heat_of_formation_takes_last_match() {
    let listing = "\
          FINAL HEAT OF FORMATION =        -74.10000 KCAL/MOL =    -310.03 KJ/MOL
 ...
          FINAL HEAT OF FORMATION =        -74.32600 KCAL/MOL =    -310.98 KJ/MOL
";
    assert_eq!(parse_heat_of_formation(listing), Some(-74.326));
    assert_eq!(parse_heat_of_formation("final heat of formation = 12.5 kcal/mol"), Some(12.5));
    assert_eq!(parse_heat_of_formation("TOTAL ENERGY = -300.1 EV"), None);
}

#[test]
fn energy_file_without_value_is_none() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("water.out");
    fs::write(&path, "JOB ENDED NORMALLY\n").unwrap();
    assert_eq!(parse_energy_file(&path).unwrap(), None);

    assert_matches!(
        parse_energy_file(&temp.path().join("absent.out")),
        Err(GrimError::Filesystem(_))
    );
}

#[test]
fn mopac_deck_has_keywords_title_and_atoms() {
    let deck = mopac_input(WATER_PDB, "PM7 PRECISE XYZ", "water")
        .unwrap()
        .unwrap();
    let lines = deck.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], "PM7 PRECISE XYZ");
    assert_eq!(lines[1], "water - MOPAC Calculation");
    assert_eq!(lines[2], "");
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[3], "O      0.000000     0.000000     0.117000");
    assert!(lines[4].starts_with("H "));

    assert_eq!(mopac_input("COMPND    empty\nEND\n", "PM7", "empty").unwrap(), None);
}

#[test]
fn mopac_input_file_sits_next_to_pdb() {
    let temp = tempfile::tempdir().unwrap();
    let pdb = temp.path().join("water.pdb");
    fs::write(&pdb, WATER_PDB).unwrap();

    let mop = write_mopac_input(&pdb, "PM7").unwrap();
    assert_eq!(mop, temp.path().join("water.mop"));
    assert!(fs::read_to_string(&mop).unwrap().starts_with("PM7\nwater - MOPAC"));
}

#[test]
fn unreadable_atom_coordinates_fail_the_deck() {
    let broken = WATER_PDB.replace(
        "HETATM    1  O   UNL     1       0.000",
        "HETATM    1  O   UNL     1       x.xxx",
    );
    assert_ne!(broken, WATER_PDB);
    assert_matches!(
        mopac_input(&broken, "PM7", "water"),
        Err(GrimError::Calculation(message)) => assert!(message.contains("x.xxx"))
    );

    let temp = tempfile::tempdir().unwrap();
    let pdb = temp.path().join("water.pdb");
    fs::write(&pdb, &broken).unwrap();
    assert_matches!(write_mopac_input(&pdb, "PM7"), Err(GrimError::Calculation(_)));
    assert!(!temp.path().join("water.mop").exists());

    let runner = Arc::new(ScriptedRunner::default());
    let calculator = Calculator::new(runner.clone(), "crest", "mopac");
    assert_matches!(
        calculator.quantum_calculation(&pdb),
        Err(GrimError::Calculation(_))
    );
    assert!(runner.calls.lock().unwrap().is_empty());
}

#[test]
fn conformer_search_runs_in_output_dir() {
    let temp = tempfile::tempdir().unwrap();
    let xyz = temp.path().join("water.xyz");
    fs::write(&xyz, "3\nwater\nO 0 0 0\nH 0 0.7 -0.4\nH 0 -0.7 -0.4\n").unwrap();
    let runner = Arc::new(ScriptedRunner {
        writes: Some((CREST_BEST_FILE, "3\nbest\n")),
        ..ScriptedRunner::default()
    });
    let calculator = Calculator::new(runner.clone(), "crest", "mopac")
        .with_keywords("--gfn2 --quick", "PM7");

    let best = calculator
        .conformer_search(&xyz, &temp.path().join("crest_output"))
        .unwrap();
    assert_eq!(best, temp.path().join("crest_output").join(CREST_BEST_FILE));

    let calls = runner.calls.lock().unwrap();
    let (command, cwd) = &calls[0];
    assert_eq!(command[0], "crest");
    assert_eq!(command[1], xyz.to_string_lossy());
    assert_eq!(&command[2..], ["--gfn2", "--quick"]);
    assert_eq!(cwd.as_deref(), Some(temp.path().join("crest_output").as_path()));
}

#[test]
fn conformer_search_without_best_file_fails() {
    let temp = tempfile::tempdir().unwrap();
    let xyz = temp.path().join("water.xyz");
    fs::write(&xyz, "3\nwater\n").unwrap();
    let calculator = Calculator::new(Arc::new(ScriptedRunner::default()), "crest", "mopac");

    let err = calculator
        .conformer_search(&xyz, &temp.path().join("crest_output"))
        .unwrap_err();
    assert_matches!(err, GrimError::Calculation(message) => {
        assert!(message.contains("not found"));
    });
}

#[test]
fn quantum_calculation_reports_tool_failure() {
    let temp = tempfile::tempdir().unwrap();
    let pdb = temp.path().join("water.pdb");
    fs::write(&pdb, WATER_PDB).unwrap();
    let runner = Arc::new(ScriptedRunner {
        returncode: 139,
        ..ScriptedRunner::default()
    });
    let calculator = Calculator::new(runner, "crest", "mopac");

    let err = calculator.quantum_calculation(&pdb).unwrap_err();
    assert_matches!(err, GrimError::Calculation(message) => {
        assert!(message.contains("segmentation fault"));
    });
    assert!(temp.path().join("water.mop").is_file());
}

#[test]
fn quantum_calculation_returns_listing() {
    let temp = tempfile::tempdir().unwrap();
    let pdb = temp.path().join("water.pdb");
    fs::write(&pdb, WATER_PDB).unwrap();
    let runner = Arc::new(ScriptedRunner {
        writes: Some(("water.out", " FINAL HEAT OF FORMATION = -57.8 KCAL/MOL\n")),
        ..ScriptedRunner::default()
    });
    let calculator = Calculator::new(runner.clone(), "crest", "/opt/mopac/MOPAC2016.exe");

    let out = calculator.quantum_calculation(&pdb).unwrap();
    assert_eq!(out, temp.path().join("water.out"));
    assert_eq!(parse_energy_file(&out).unwrap(), Some(-57.8));

    let calls = runner.calls.lock().unwrap();
    assert_eq!(
        calls[0].0,
        vec![
            "/opt/mopac/MOPAC2016.exe".to_string(),
            temp.path().join("water.mop").to_string_lossy().to_string(),
        ]
    );
}

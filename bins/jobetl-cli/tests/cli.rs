use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{json, Value};
use tempfile::TempDir;

fn profile(dir: &Path) -> String {
    format!(
        r#"
name: supremm
version: 1
root: {root}
schema:
  tables:
    job: {{ schema: modw, unique: [local_job_id] }}
  fields:
    local_job_id: {{ type: uint32, nullable: false, table: job }}
    wall_time: {{ type: uint32, def: 0, table: job }}
datasets:
  - name: frank
    input:
      db_engine: jsonl
      config: {{ uri: {root}, collection: frank }}
    mapping:
      local_job_id: {{ ref: id }}
      wall_time: {{ formula: elapsed }}
    regression_test_dir: fixtures
formulas:
  elapsed: {{ op: difference, minuend: end, subtrahend: start }}
output:
  db_engine: mysqldb
  config: {{ driver: stdout }}
"#,
        root = dir.display()
    )
}

fn jobetl(dir: &Path, args: &[&str]) -> Output {
    let path = dir.join("profile.yaml");
    fs::write(&path, profile(dir)).unwrap();
    Command::new(env!("CARGO_BIN_EXE_jobetl"))
        .arg("--profile")
        .arg(&path)
        .args(args)
        .output()
        .expect("run jobetl")
}

#[test]
fn process_evaluates_declared_formulas() {
    let dir = TempDir::new().unwrap();
    let jobs = [
        json!({"_id": "1", "id": 1, "start": 1000, "end": 4600}),
        json!({"_id": "2", "id": 2, "start": 50}),
    ];
    let lines: String = jobs.iter().map(|j| format!("{j}\n")).collect();
    fs::write(dir.path().join("frank.jsonl"), lines).unwrap();

    let output = jobetl(dir.path(), &["process"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stdout={stdout}\nstderr={stderr}");

    assert!(stdout.contains("VALUES (1,3600,1)"), "{stdout}");
    assert!(stdout.contains("VALUES (2,0,1)"), "{stdout}");
    // 8: end time missing from the second job
    assert!(stdout.contains(", 2,8,1)"), "{stdout}");

    let totals: Value = stdout
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .last()
        .expect("totals line");
    assert_eq!(totals["processed"], 2);
    assert_eq!(totals["good"], 2);
}

#[test]
fn regression_runs_formula_mappings() {
    let dir = TempDir::new().unwrap();
    let fixtures = dir.path().join("fixtures");
    fs::create_dir_all(fixtures.join("input")).unwrap();
    fs::create_dir_all(fixtures.join("expected")).unwrap();
    fs::write(
        fixtures.join("input/1.json"),
        json!({"id": 1, "start": 10, "end": 70}).to_string(),
    )
    .unwrap();
    fs::write(
        fixtures.join("expected/1.json"),
        json!({
            "local_job_id": {"value": 1, "error": 0},
            "wall_time": {"value": 60, "error": 0},
        })
        .to_string(),
    )
    .unwrap();

    let output = jobetl(dir.path(), &["regression"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}");
    assert!(stdout.contains("supremm: 1 regression tests, 0 failed"), "{stdout}");
}

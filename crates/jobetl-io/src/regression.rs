//! Regression fixtures: `<dir>/input/<name>` documents are transformed and
//! compared against `<dir>/expected/<name>`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::glob;
use jobetl_core::Emitter;
use jobetl_tx::compare::compare;
use jobetl_tx::{etlv2, DatasetMap};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct FixtureResult {
    pub dataset: String,
    pub file: String,
    pub passed: bool,
    /// Every path at which the output differs from the expectation.
    pub reasons: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Input/expected pairs under `dir`, sorted by file name. A missing
/// directory has no fixtures.
pub fn fixture_pairs(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let input = dir.join("input");
    if !input.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = input.join("*");
    let pattern = pattern.to_string_lossy();
    let mut pairs = Vec::new();
    for entry in glob(&pattern).context("glob")? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let expected = dir.join("expected").join(name);
        pairs.push((path, expected));
    }
    pairs.sort();
    Ok(pairs)
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("open {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

fn flatten(messages: &std::collections::BTreeMap<String, Vec<String>>) -> Vec<String> {
    messages
        .iter()
        .flat_map(|(name, list)| list.iter().map(move |m| format!("{name}: {m}")))
        .collect()
}

/// Run every fixture of one dataset. With `regenerate`, the expected file of
/// a failing fixture is rewritten with the current output.
pub fn run_fixtures(
    map: &DatasetMap,
    dir: &Path,
    regenerate: bool,
    emitter: &Emitter,
) -> Result<Vec<FixtureResult>> {
    let mut results = Vec::new();
    for (input, expected_path) in fixture_pairs(dir)? {
        let doc = read_json(&input)?;
        let expected = read_json(&expected_path)?;
        let record = map.transform(&doc);
        let output = record.data_json();
        let comparison = compare(&output, &expected, "testOutput", "expectedOutput");
        let file = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let passed = comparison.is_equal() && !record.has_errors() && !record.has_warnings();
        if passed {
            emitter.message(format!("Regression test of \"{file}\" passed."));
        } else {
            if regenerate {
                let mut text = etlv2::to_pretty_json(&output)?;
                text.push('\n');
                std::fs::write(&expected_path, text)
                    .with_context(|| format!("write {}", expected_path.display()))?;
            }
            emitter.error(format!("Regression test of \"{file}\" failed."));
            for reason in &comparison.unequal_reasons {
                emitter.error(reason.clone());
            }
        }
        results.push(FixtureResult {
            dataset: map.name().to_string(),
            file,
            passed,
            reasons: comparison.unequal_reasons,
            errors: flatten(&record.errors),
            warnings: flatten(&record.warnings),
        });
    }
    Ok(results)
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::schema::{Benchmark, Override};
use crate::util::ensure_directory;

pub const DB_PATH_ENV: &str = "BENCHTRACK_DB_PATH";
pub const UPDATE_TIMEOUT_ENV: &str = "BENCHTRACK_UPDATE_TIMEOUT_SECS";
pub const BACKUP_RETENTION_ENV: &str = "BENCHTRACK_BACKUP_RETENTION_DAYS";

const DEFAULT_UPDATE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 30;

/// Resolved runtime configuration. Read once at startup; the pipeline
/// stages only ever see the resolved paths and budgets.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub db_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub raw_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub overrides_path: PathBuf,
    pub benchmarks_path: PathBuf,
    pub changelog_path: PathBuf,
    pub update_timeout: Duration,
    pub backup_retention_days: u32,
}

impl Settings {
    pub fn load(data_root: PathBuf) -> Result<Self> {
        let db_path = match std::env::var_os(DB_PATH_ENV) {
            Some(value) => PathBuf::from(value),
            None => data_root.join("benchtrack.sqlite"),
        };

        let update_timeout_secs = env_number(UPDATE_TIMEOUT_ENV)?
            .unwrap_or(DEFAULT_UPDATE_TIMEOUT_SECS);
        let backup_retention_days = env_number(BACKUP_RETENTION_ENV)?
            .map(|days: u64| days as u32)
            .unwrap_or(DEFAULT_BACKUP_RETENTION_DAYS);

        Ok(Self {
            snapshots_dir: data_root.join("snapshots"),
            raw_dir: data_root.join("raw"),
            backups_dir: data_root.join("backups"),
            reports_dir: data_root.join("reports"),
            overrides_path: data_root.join("overrides.toml"),
            benchmarks_path: data_root.join("benchmarks.toml"),
            changelog_path: data_root.join("changelog.jsonl"),
            db_path,
            data_root,
            update_timeout: Duration::from_secs(update_timeout_secs),
            backup_retention_days,
        })
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.data_root,
            &self.snapshots_dir,
            &self.raw_dir,
            &self.backups_dir,
            &self.reports_dir,
        ] {
            ensure_directory(dir)?;
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => bail!("invalid value for {name}: {raw}"),
        },
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct BenchmarkEntry {
    name: String,
    category: String,
    #[serde(default = "default_unit")]
    unit: String,
    #[serde(default)]
    scale_min: f64,
    #[serde(default = "default_scale_max")]
    scale_max: f64,
    #[serde(default = "default_true")]
    higher_is_better: bool,
    #[serde(default)]
    official_url: Option<String>,
}

fn default_unit() -> String {
    "percent".to_string()
}

fn default_scale_max() -> f64 {
    100.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BenchmarksFile {
    #[serde(default)]
    benchmarks: BTreeMap<String, BenchmarkEntry>,
}

/// Load the static benchmark metadata map from `benchmarks.toml`. Entries
/// found in the file shadow the built-in definitions passed in `defaults`.
pub fn load_benchmarks(
    path: &Path,
    defaults: Vec<Benchmark>,
) -> Result<BTreeMap<String, Benchmark>> {
    let mut merged: BTreeMap<String, Benchmark> = defaults
        .into_iter()
        .map(|benchmark| (benchmark.benchmark_id.clone(), benchmark))
        .collect();

    if !path.exists() {
        return Ok(merged);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: BenchmarksFile = toml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    for (benchmark_id, entry) in file.benchmarks {
        merged.insert(
            benchmark_id.clone(),
            Benchmark {
                benchmark_id,
                name: entry.name,
                category: entry.category,
                unit: entry.unit,
                scale_min: entry.scale_min,
                scale_max: entry.scale_max,
                higher_is_better: entry.higher_is_better,
                official_url: entry.official_url,
            },
        );
    }

    Ok(merged)
}

#[derive(Debug, Deserialize)]
struct OverridesFile {
    #[serde(default, rename = "override")]
    overrides: Vec<Override>,
}

/// Load manual corrections from `overrides.toml`. A missing file simply
/// means no overrides this run.
pub fn load_overrides(path: &Path) -> Result<Vec<Override>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: OverridesFile = toml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    Ok(file.overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::schema::{FieldValue, OverrideField};

    #[test]
    fn settings_derive_paths_from_data_root() {
        let settings = Settings::load(PathBuf::from("data")).unwrap();
        assert_eq!(settings.snapshots_dir, PathBuf::from("data/snapshots"));
        assert_eq!(settings.changelog_path, PathBuf::from("data/changelog.jsonl"));
        assert_eq!(settings.backup_retention_days, 30);
    }

    #[test]
    fn load_benchmarks_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchmarks.toml");
        fs::write(
            &path,
            r#"
[benchmarks.arc_agi_2]
name = "ARC-AGI-2"
category = "reasoning"

[benchmarks.swe_bench_verified]
name = "SWE-Bench Verified (tuned)"
category = "coding"
scale_max = 100.0
"#,
        )
        .unwrap();

        let defaults = vec![Benchmark {
            benchmark_id: "swe_bench_verified".to_string(),
            name: "SWE-Bench Verified".to_string(),
            category: "coding".to_string(),
            unit: "percent".to_string(),
            scale_min: 0.0,
            scale_max: 100.0,
            higher_is_better: true,
            official_url: None,
        }];

        let merged = load_benchmarks(&path, defaults).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["swe_bench_verified"].name, "SWE-Bench Verified (tuned)");
        assert_eq!(merged["arc_agi_2"].unit, "percent");
        assert!(merged["arc_agi_2"].higher_is_better);
    }

    #[test]
    fn load_overrides_parses_records_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.toml");
        assert!(load_overrides(&path).unwrap().is_empty());

        fs::write(
            &path,
            r#"
[[override]]
result_id = "abc123"
field = "score"
old_value = 45.2
new_value = 46.1
reason = "corrected transcription from the official leaderboard"
date = "2026-01-15"
"#,
        )
        .unwrap();

        let overrides = load_overrides(&path).unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].result_id, "abc123");
        assert_eq!(overrides[0].field, OverrideField::Score);
        assert!(overrides[0].new_value.matches(&FieldValue::Number(46.1)));
    }
}

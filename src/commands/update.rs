use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cli::UpdateArgs;
use crate::config::{self, Settings};
use crate::error::{CommitError, StageError};
use crate::fetch::{self, Fetcher};
use crate::merge::{StoreSnapshot, merge};
use crate::schema::{Benchmark, Model, ResultRecord, Source};
use crate::store;
use crate::util::{utc_compact_string, write_json_pretty};
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceState {
    Pending,
    Fetching,
    Parsing,
    Validating,
    Accumulated,
    SkippedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    RolledBack,
    DryRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedRow {
    pub model_id: String,
    pub kind: &'static str,
    pub detail: String,
}

/// Outcome of one source's trip through the per-source stages.
#[derive(Debug, Serialize)]
pub struct SourceReport {
    pub benchmark_id: String,
    pub state: SourceState,
    pub rows_parsed: usize,
    pub row_warnings: usize,
    pub accepted: usize,
    pub rejected: Vec<RejectedRow>,
    pub duplicates: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub status: RunStatus,
    pub sources: Vec<SourceReport>,
    pub inserted: usize,
    pub updated: usize,
    pub overridden: usize,
    pub protected: usize,
    pub override_conflicts: usize,
    pub changelog_entries: usize,
    pub error: Option<String>,
}

pub fn run(args: UpdateArgs) -> Result<()> {
    let settings = Settings::load(args.data_root)?;
    let summary = run_update(&settings, args.benchmark.as_deref(), args.dry_run, Utc::now())?;

    if summary.status == RunStatus::RolledBack {
        bail!(
            "update rolled back: {}",
            summary.error.as_deref().unwrap_or("unknown commit failure")
        );
    }
    Ok(())
}

/// Drive the full pipeline. Per-source failures skip the source; only a
/// commit failure ends the run in rollback. A dry run stops before the
/// commit and writes nothing at all.
pub fn run_update(
    settings: &Settings,
    benchmark: Option<&str>,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<RunSummary> {
    let run_id = format!("run-{}", utc_compact_string(now));
    let deadline = Instant::now() + settings.update_timeout;

    info!(run_id = %run_id, dry_run, "update started");

    let fetchers = select_fetchers(benchmark)?;

    let defaults = fetch::registry()
        .into_iter()
        .map(|fetcher| fetcher.benchmark_meta())
        .collect();
    let benchmarks = config::load_benchmarks(&settings.benchmarks_path, defaults)?;
    let overrides = config::load_overrides(&settings.overrides_path)?;

    if !dry_run {
        settings.ensure_dirs()?;
    }

    let mut reports = Vec::new();
    let mut sources: Vec<Source> = Vec::new();
    let mut models: Vec<Model> = Vec::new();
    let mut accepted: Vec<ResultRecord> = Vec::new();

    for fetcher in fetchers {
        let report = run_source(
            fetcher,
            settings,
            &benchmarks,
            deadline,
            now,
            &mut sources,
            &mut models,
            &mut accepted,
        );
        reports.push(report);
    }

    let existing = if settings.db_path.exists() {
        store::load_snapshot(&settings.db_path)?
    } else {
        StoreSnapshot::default()
    };
    let merged = merge(existing, &benchmarks, sources, models, accepted, &overrides, now);

    for conflict in &merged.conflicts {
        warn!(
            result_id = %conflict.result_id,
            field = ?conflict.field,
            detail = %conflict.detail,
            "override conflict"
        );
    }

    let mut summary = RunSummary {
        run_id: run_id.clone(),
        started_at: now,
        dry_run,
        status: RunStatus::DryRun,
        sources: reports,
        inserted: merged.inserted,
        updated: merged.updated,
        overridden: merged.overridden,
        protected: merged.protected,
        override_conflicts: merged.conflicts.len(),
        changelog_entries: 0,
        error: None,
    };

    if dry_run {
        info!(
            run_id = %run_id,
            inserted = merged.inserted,
            updated = merged.updated,
            overridden = merged.overridden,
            planned_changes = merged.changes.len(),
            "dry run complete; nothing written"
        );
        return Ok(summary);
    }

    match store::commit(settings, &merged, &run_id, now) {
        Ok(outcome) => {
            summary.status = RunStatus::Succeeded;
            summary.changelog_entries = outcome.entries_appended;
            info!(
                run_id = %run_id,
                inserted = merged.inserted,
                updated = merged.updated,
                overridden = merged.overridden,
                protected = merged.protected,
                entries = outcome.entries_appended,
                pruned_backups = outcome.backups_pruned,
                "update succeeded"
            );
        }
        // The swap already happened: the data is live, only the audit
        // entries are missing. Reporting a rollback here would be a lie.
        Err(CommitError::Audit(detail)) => {
            summary.status = RunStatus::Succeeded;
            summary.error = Some(detail.clone());
            error!(
                run_id = %run_id,
                detail = %detail,
                "store committed but changelog entries were not appended"
            );
        }
        Err(err) => {
            summary.status = RunStatus::RolledBack;
            summary.error = Some(err.to_string());
            warn!(run_id = %run_id, error = %err, "commit failed; store rolled back");
        }
    }

    let report_path = settings.reports_dir.join(format!("{run_id}.json"));
    write_json_pretty(&report_path, &summary)?;
    info!(path = %report_path.display(), "run report written");

    Ok(summary)
}

fn select_fetchers(benchmark: Option<&str>) -> Result<Vec<Fetcher>> {
    match benchmark {
        None => Ok(fetch::registry()),
        Some(benchmark_id) => match fetch::for_benchmark(benchmark_id) {
            Some(fetcher) => Ok(vec![fetcher]),
            None => bail!("no fetcher registered for benchmark {benchmark_id}"),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn run_source(
    fetcher: Fetcher,
    settings: &Settings,
    benchmarks: &BTreeMap<String, Benchmark>,
    deadline: Instant,
    now: DateTime<Utc>,
    sources: &mut Vec<Source>,
    models: &mut Vec<Model>,
    accepted: &mut Vec<ResultRecord>,
) -> SourceReport {
    let benchmark_id = fetcher.benchmark_id().to_string();
    let mut report = SourceReport {
        benchmark_id: benchmark_id.clone(),
        state: SourceState::Pending,
        rows_parsed: 0,
        row_warnings: 0,
        accepted: 0,
        rejected: Vec::new(),
        duplicates: 0,
        error: None,
    };

    let outcome = (|| -> Result<(), StageError> {
        check_deadline(deadline, "fetch")?;
        report.state = SourceState::Fetching;
        let raw_path = fetcher.fetch_raw(settings)?;

        check_deadline(deadline, "parse")?;
        report.state = SourceState::Parsing;
        let batch = fetcher.parse(&raw_path, now)?;
        report.rows_parsed = batch.candidates.len();
        report.row_warnings = batch.row_warnings.len();

        check_deadline(deadline, "validate")?;
        report.state = SourceState::Validating;
        let validation = validate::validate(&batch, benchmarks, now);

        report.accepted = validation.accepted.len();
        report.duplicates = validation.duplicates.len();
        report.rejected = validation
            .rejected
            .iter()
            .map(|rejected| RejectedRow {
                model_id: rejected.candidate.model_id.clone(),
                kind: rejected.reason.kind(),
                detail: rejected.reason.to_string(),
            })
            .collect();

        sources.push(batch.source);
        models.extend(batch.models);
        accepted.extend(validation.accepted);

        report.state = SourceState::Accumulated;
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            info!(
                benchmark = %benchmark_id,
                accepted = report.accepted,
                rejected = report.rejected.len(),
                duplicates = report.duplicates,
                warnings = report.row_warnings,
                "source accumulated"
            );
        }
        Err(err) => {
            warn!(benchmark = %benchmark_id, error = %err, "source skipped");
            report.state = SourceState::SkippedError;
            report.error = Some(err.to_string());
        }
    }

    report
}

fn check_deadline(deadline: Instant, stage: &'static str) -> Result<(), StageError> {
    if Instant::now() >= deadline {
        return Err(StageError::Timeout { stage });
    }
    Ok(())
}

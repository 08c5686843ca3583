use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{Connection, OpenFlags, params};
use tracing::{info, warn};

use crate::changelog;
use crate::config::Settings;
use crate::error::CommitError;
use crate::merge::{MergedState, StoreSnapshot};
use crate::schema::{
    Benchmark, ChangeAction, ChangelogEntry, Metadata, Model, ModelStatus, ParseMethod,
    ResultRecord, Source, SourceType, TrustTier,
};
use crate::util::{now_utc_string, utc_compact_string};

pub const DB_SCHEMA_VERSION: &str = "1.0.0";

const BACKUP_PREFIX: &str = "benchtrack_";

pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    let connection =
        Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    // The store file is backed up and replaced by whole-file copy and
    // rename; a rollback journal keeps everything in one file, unlike WAL.
    connection
        .pragma_update(None, "journal_mode", "DELETE")
        .context("failed to set journal_mode=DELETE")?;
    connection
        .pragma_update(None, "synchronous", "FULL")
        .context("failed to set synchronous=FULL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sources (
          source_id TEXT PRIMARY KEY,
          source_type TEXT NOT NULL,
          source_title TEXT NOT NULL,
          source_url TEXT NOT NULL,
          retrieved_at TEXT NOT NULL,
          parse_method TEXT NOT NULL,
          raw_snapshot_path TEXT
        );

        CREATE TABLE IF NOT EXISTS benchmarks (
          benchmark_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          category TEXT NOT NULL,
          unit TEXT NOT NULL,
          scale_min REAL NOT NULL,
          scale_max REAL NOT NULL,
          higher_is_better INTEGER NOT NULL,
          official_url TEXT
        );

        CREATE TABLE IF NOT EXISTS models (
          model_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          provider TEXT NOT NULL,
          family TEXT,
          release_date TEXT,
          status TEXT NOT NULL,
          metadata TEXT NOT NULL,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS results (
          result_id TEXT PRIMARY KEY,
          model_id TEXT NOT NULL,
          benchmark_id TEXT NOT NULL,
          score REAL,
          score_stderr REAL,
          evaluation_date TEXT,
          source_id TEXT NOT NULL,
          trust_tier TEXT NOT NULL,
          is_override INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_results_benchmark
          ON results(benchmark_id, evaluation_date);
        CREATE INDEX IF NOT EXISTS idx_results_model ON results(model_id);
        CREATE INDEX IF NOT EXISTS idx_results_trust ON results(trust_tier);
        CREATE INDEX IF NOT EXISTS idx_models_provider ON models(provider);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value, updated_at) VALUES('db_schema_version', ?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
        params![DB_SCHEMA_VERSION, now],
    )?;

    Ok(())
}

/// Load the full store image. A missing store file is an empty store.
/// Opens read-only; only the commit path ever mutates the store file.
pub fn load_snapshot(path: &Path) -> Result<StoreSnapshot> {
    if !path.exists() {
        return Ok(StoreSnapshot::default());
    }

    let connection = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open {}", path.display()))?;

    Ok(StoreSnapshot {
        benchmarks: load_benchmarks(&connection)?,
        models: load_models(&connection)?,
        sources: load_sources(&connection)?,
        results: load_results(&connection)?,
    })
}

fn load_benchmarks(connection: &Connection) -> Result<BTreeMap<String, Benchmark>> {
    let mut statement = connection.prepare(
        "SELECT benchmark_id, name, category, unit, scale_min, scale_max,
                higher_is_better, official_url
         FROM benchmarks",
    )?;
    let rows = statement.query_map([], |row| {
        Ok(Benchmark {
            benchmark_id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            unit: row.get(3)?,
            scale_min: row.get(4)?,
            scale_max: row.get(5)?,
            higher_is_better: row.get(6)?,
            official_url: row.get(7)?,
        })
    })?;

    let mut map = BTreeMap::new();
    for row in rows {
        let benchmark = row?;
        map.insert(benchmark.benchmark_id.clone(), benchmark);
    }
    Ok(map)
}

fn load_sources(connection: &Connection) -> Result<BTreeMap<String, Source>> {
    let mut statement = connection.prepare(
        "SELECT source_id, source_type, source_title, source_url, retrieved_at,
                parse_method, raw_snapshot_path
         FROM sources",
    )?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, DateTime<Utc>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut map = BTreeMap::new();
    for row in rows {
        let (source_id, source_type, source_title, source_url, retrieved_at, parse_method, raw) =
            row?;
        let source = Source {
            source_type: SourceType::parse(&source_type)
                .ok_or_else(|| anyhow!("unknown source_type in store: {source_type}"))?,
            parse_method: ParseMethod::parse(&parse_method)
                .ok_or_else(|| anyhow!("unknown parse_method in store: {parse_method}"))?,
            source_id: source_id.clone(),
            source_title,
            source_url,
            retrieved_at,
            raw_snapshot_path: raw,
        };
        map.insert(source_id, source);
    }
    Ok(map)
}

fn load_models(connection: &Connection) -> Result<BTreeMap<String, Model>> {
    let mut statement = connection.prepare(
        "SELECT model_id, name, provider, family, release_date, status, metadata,
                created_at, updated_at
         FROM models",
    )?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<NaiveDate>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, DateTime<Utc>>(7)?,
            row.get::<_, DateTime<Utc>>(8)?,
        ))
    })?;

    let mut map = BTreeMap::new();
    for row in rows {
        let (model_id, name, provider, family, release_date, status, metadata, created, updated) =
            row?;
        let metadata: Metadata = serde_json::from_str(&metadata)
            .with_context(|| format!("corrupt metadata json for model {model_id}"))?;
        let model = Model {
            status: ModelStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown model status in store: {status}"))?,
            model_id: model_id.clone(),
            name,
            provider,
            family,
            release_date,
            metadata,
            created_at: created,
            updated_at: updated,
        };
        map.insert(model_id, model);
    }
    Ok(map)
}

fn load_results(connection: &Connection) -> Result<BTreeMap<String, ResultRecord>> {
    let mut statement = connection.prepare(
        "SELECT result_id, model_id, benchmark_id, score, score_stderr, evaluation_date,
                source_id, trust_tier, is_override, created_at, updated_at
         FROM results",
    )?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<f64>>(3)?,
            row.get::<_, Option<f64>>(4)?,
            row.get::<_, Option<NaiveDate>>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
            row.get::<_, bool>(8)?,
            row.get::<_, DateTime<Utc>>(9)?,
            row.get::<_, DateTime<Utc>>(10)?,
        ))
    })?;

    let mut map = BTreeMap::new();
    for row in rows {
        let (
            result_id,
            model_id,
            benchmark_id,
            score,
            score_stderr,
            evaluation_date,
            source_id,
            trust_tier,
            is_override,
            created_at,
            updated_at,
        ) = row?;
        let record = ResultRecord {
            trust_tier: TrustTier::parse(&trust_tier)
                .ok_or_else(|| anyhow!("unknown trust tier in store: {trust_tier}"))?,
            result_id: result_id.clone(),
            model_id,
            benchmark_id,
            score,
            score_stderr,
            evaluation_date,
            source_id,
            is_override,
            created_at,
            updated_at,
        };
        map.insert(result_id, record);
    }
    Ok(map)
}

#[derive(Debug)]
pub struct CommitOutcome {
    pub backup_path: Option<PathBuf>,
    pub entries_appended: usize,
    pub backups_pruned: usize,
}

/// Commit the merged state: backup, apply to a staging copy, verify, swap,
/// then append the audit entries. Any apply/verify failure discards the
/// staging copy, leaves the live store untouched, and appends exactly one
/// rollback entry.
pub fn commit(
    settings: &Settings,
    merged: &MergedState,
    run_id: &str,
    now: DateTime<Utc>,
) -> std::result::Result<CommitOutcome, CommitError> {
    let db_path = &settings.db_path;
    let staging_path = staging_path_for(db_path);

    let backup_path = create_backup(settings, now).map_err(|err| {
        CommitError::Backup(format!("{err:#}"))
    })?;

    if let Err(err) = apply_to_staging(db_path, &staging_path, merged) {
        discard_staging(&staging_path);
        append_rollback_entry(settings, run_id, &err, now);
        return Err(err);
    }

    fs::rename(&staging_path, db_path).map_err(|err| {
        discard_staging(&staging_path);
        CommitError::Swap(format!(
            "failed to swap {} into place: {err}",
            staging_path.display()
        ))
    })?;

    let entries: Vec<ChangelogEntry> = merged
        .changes
        .iter()
        .map(|change| ChangelogEntry {
            timestamp: now,
            action: change.action,
            table: change.table.to_string(),
            record_id: change.record_id.clone(),
            reason: change.reason.clone(),
        })
        .collect();
    changelog::append_entries(&settings.changelog_path, &entries)
        .map_err(|err| CommitError::Audit(format!("{err:#}")))?;

    let backups_pruned = prune_backups(
        &settings.backups_dir,
        settings.backup_retention_days,
        now,
    );

    info!(
        store = %db_path.display(),
        entries = entries.len(),
        "commit completed"
    );

    Ok(CommitOutcome {
        backup_path,
        entries_appended: entries.len(),
        backups_pruned,
    })
}

fn staging_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "benchtrack.sqlite".to_string());
    name.push_str(".staging");
    db_path.with_file_name(name)
}

/// Timestamped whole-file copy of the current store. Retained regardless
/// of commit outcome for forensic recovery.
fn create_backup(settings: &Settings, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
    if !settings.db_path.exists() {
        return Ok(None);
    }

    fs::create_dir_all(&settings.backups_dir).with_context(|| {
        format!("failed to create directory: {}", settings.backups_dir.display())
    })?;

    let backup_path = settings.backups_dir.join(format!(
        "{BACKUP_PREFIX}{}.sqlite",
        utc_compact_string(now)
    ));
    fs::copy(&settings.db_path, &backup_path).with_context(|| {
        format!("failed to copy store to {}", backup_path.display())
    })?;

    info!(path = %backup_path.display(), "store backed up");
    Ok(Some(backup_path))
}

fn apply_to_staging(
    db_path: &Path,
    staging_path: &Path,
    merged: &MergedState,
) -> std::result::Result<(), CommitError> {
    if staging_path.exists() {
        discard_staging(staging_path);
    }
    if db_path.exists() {
        fs::copy(db_path, staging_path).map_err(|err| {
            CommitError::Apply(format!(
                "failed to create staging copy {}: {err}",
                staging_path.display()
            ))
        })?;
    }

    let mut connection =
        open(staging_path).map_err(|err| CommitError::Apply(format!("{err:#}")))?;

    let pre_counts =
        table_counts(&connection).map_err(|err| CommitError::Apply(format!("{err:#}")))?;

    write_merged(&mut connection, merged).map_err(|err| CommitError::Apply(format!("{err:#}")))?;

    verify_staging(&connection, &pre_counts).map_err(|err| CommitError::Verify(format!("{err:#}")))?;

    connection
        .close()
        .map_err(|(_, err)| CommitError::Apply(format!("failed to close staging store: {err}")))?;

    Ok(())
}

fn write_merged(connection: &mut Connection, merged: &MergedState) -> Result<()> {
    let tx = connection.transaction()?;

    {
        let mut statement = tx.prepare(
            "INSERT INTO benchmarks(benchmark_id, name, category, unit, scale_min, scale_max,
                                    higher_is_better, official_url)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(benchmark_id) DO UPDATE SET
               name=excluded.name,
               category=excluded.category,
               unit=excluded.unit,
               scale_min=excluded.scale_min,
               scale_max=excluded.scale_max,
               higher_is_better=excluded.higher_is_better,
               official_url=excluded.official_url",
        )?;
        for benchmark in merged.benchmarks.values() {
            statement.execute(params![
                benchmark.benchmark_id,
                benchmark.name,
                benchmark.category,
                benchmark.unit,
                benchmark.scale_min,
                benchmark.scale_max,
                benchmark.higher_is_better,
                benchmark.official_url,
            ])?;
        }

        let mut statement = tx.prepare(
            "INSERT INTO sources(source_id, source_type, source_title, source_url,
                                 retrieved_at, parse_method, raw_snapshot_path)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source_id) DO NOTHING",
        )?;
        for source in merged.sources.values() {
            statement.execute(params![
                source.source_id,
                source.source_type.as_str(),
                source.source_title,
                source.source_url,
                source.retrieved_at,
                source.parse_method.as_str(),
                source.raw_snapshot_path,
            ])?;
        }

        let mut statement = tx.prepare(
            "INSERT INTO models(model_id, name, provider, family, release_date, status,
                                metadata, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(model_id) DO UPDATE SET
               name=excluded.name,
               provider=excluded.provider,
               family=excluded.family,
               release_date=excluded.release_date,
               status=excluded.status,
               metadata=excluded.metadata,
               updated_at=excluded.updated_at",
        )?;
        for model in merged.models.values() {
            let metadata = serde_json::to_string(&model.metadata)
                .with_context(|| format!("failed to serialize metadata for {}", model.model_id))?;
            statement.execute(params![
                model.model_id,
                model.name,
                model.provider,
                model.family,
                model.release_date,
                model.status.as_str(),
                metadata,
                model.created_at,
                model.updated_at,
            ])?;
        }

        let mut statement = tx.prepare(
            "INSERT INTO results(result_id, model_id, benchmark_id, score, score_stderr,
                                 evaluation_date, source_id, trust_tier, is_override,
                                 created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(result_id) DO UPDATE SET
               score=excluded.score,
               score_stderr=excluded.score_stderr,
               evaluation_date=excluded.evaluation_date,
               source_id=excluded.source_id,
               trust_tier=excluded.trust_tier,
               is_override=excluded.is_override,
               updated_at=excluded.updated_at",
        )?;
        for record in merged.results.values() {
            statement.execute(params![
                record.result_id,
                record.model_id,
                record.benchmark_id,
                record.score,
                record.score_stderr,
                record.evaluation_date,
                record.source_id,
                record.trust_tier.as_str(),
                record.is_override,
                record.created_at,
                record.updated_at,
            ])?;
        }

        let now = now_utc_string();
        tx.execute(
            "INSERT INTO metadata(key, value, updated_at) VALUES('last_update', ?1, ?1)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
            params![now],
        )?;
    }

    tx.commit()?;
    Ok(())
}

#[derive(Debug)]
struct TableCounts {
    benchmarks: i64,
    models: i64,
    sources: i64,
    results: i64,
}

fn table_counts(connection: &Connection) -> Result<TableCounts> {
    Ok(TableCounts {
        benchmarks: count_rows(connection, "SELECT COUNT(*) FROM benchmarks")?,
        models: count_rows(connection, "SELECT COUNT(*) FROM models")?,
        sources: count_rows(connection, "SELECT COUNT(*) FROM sources")?,
        results: count_rows(connection, "SELECT COUNT(*) FROM results")?,
    })
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

/// Basic integrity gate before the swap: insert-only tables may not
/// shrink, every result must resolve its source, and no committed score
/// may sit outside its benchmark scale.
fn verify_staging(connection: &Connection, pre: &TableCounts) -> Result<()> {
    let post = table_counts(connection)?;
    for (table, before, after) in [
        ("benchmarks", pre.benchmarks, post.benchmarks),
        ("models", pre.models, post.models),
        ("sources", pre.sources, post.sources),
        ("results", pre.results, post.results),
    ] {
        if after < before {
            return Err(anyhow!("{table} row count dropped from {before} to {after}"));
        }
    }

    let orphaned = count_rows(
        connection,
        "SELECT COUNT(*) FROM results r
         LEFT JOIN sources s ON r.source_id = s.source_id
         WHERE s.source_id IS NULL",
    )?;
    if orphaned > 0 {
        return Err(anyhow!("{orphaned} results reference a missing source"));
    }

    let out_of_scale = count_rows(
        connection,
        "SELECT COUNT(*) FROM results r
         JOIN benchmarks b ON r.benchmark_id = b.benchmark_id
         WHERE r.score IS NOT NULL
           AND (r.score < b.scale_min OR r.score > b.scale_max)",
    )?;
    if out_of_scale > 0 {
        return Err(anyhow!("{out_of_scale} results carry out-of-scale scores"));
    }

    Ok(())
}

fn discard_staging(staging_path: &Path) {
    if let Err(err) = fs::remove_file(staging_path) {
        if staging_path.exists() {
            warn!(path = %staging_path.display(), error = %err, "failed to remove staging copy");
        }
    }
}

fn append_rollback_entry(
    settings: &Settings,
    run_id: &str,
    cause: &CommitError,
    now: DateTime<Utc>,
) {
    let entry = ChangelogEntry {
        timestamp: now,
        action: ChangeAction::Rollback,
        table: "store".to_string(),
        record_id: run_id.to_string(),
        reason: Some(cause.to_string()),
    };
    if let Err(err) = changelog::append_entries(&settings.changelog_path, &[entry]) {
        warn!(error = %err, "failed to append rollback changelog entry");
    }
}

/// Delete backups whose filename timestamp has aged out of the retention
/// window. Best-effort; never fails a run.
pub fn prune_backups(backups_dir: &Path, retention_days: u32, now: DateTime<Utc>) -> usize {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let Ok(entries) = fs::read_dir(backups_dir) else {
        return 0;
    };

    let mut pruned = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stamp) = name
            .strip_prefix(BACKUP_PREFIX)
            .and_then(|rest| rest.strip_suffix(".sqlite"))
        else {
            continue;
        };
        let Ok(taken_at) = DateTime::parse_from_str(
            &format!("{stamp} +0000"),
            "%Y%m%dT%H%M%SZ %z",
        ) else {
            continue;
        };

        if taken_at.with_timezone(&Utc) < cutoff {
            match fs::remove_file(entry.path()) {
                Ok(()) => pruned += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "failed to prune backup")
                }
            }
        }
    }

    pruned
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::merge::merge;
    use crate::schema::Override;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    fn settings(dir: &Path) -> Settings {
        let mut settings = Settings::load(dir.to_path_buf()).unwrap();
        // Tests must not depend on ambient environment overrides.
        settings.db_path = dir.join("benchtrack.sqlite");
        settings
    }

    fn benchmark() -> Benchmark {
        Benchmark {
            benchmark_id: "swe_bench_verified".to_string(),
            name: "SWE-Bench Verified".to_string(),
            category: "coding".to_string(),
            unit: "percent".to_string(),
            scale_min: 0.0,
            scale_max: 100.0,
            higher_is_better: true,
            official_url: None,
        }
    }

    fn source() -> Source {
        Source {
            source_id: "src-1".to_string(),
            source_type: SourceType::OfficialLeaderboard,
            source_title: "leaderboard".to_string(),
            source_url: "https://example.com".to_string(),
            retrieved_at: now(),
            parse_method: ParseMethod::CsvDownload,
            raw_snapshot_path: Some("data/raw/x.csv".to_string()),
        }
    }

    fn model() -> Model {
        Model {
            model_id: "openai:o3".to_string(),
            name: "o3".to_string(),
            provider: "OpenAI".to_string(),
            family: Some("o3".to_string()),
            release_date: NaiveDate::from_ymd_opt(2024, 12, 17),
            status: ModelStatus::Verified,
            metadata: Metadata::new(),
            created_at: now(),
            updated_at: now(),
        }
    }

    fn result(score: Option<f64>) -> ResultRecord {
        ResultRecord {
            result_id: "r1".to_string(),
            model_id: "openai:o3".to_string(),
            benchmark_id: "swe_bench_verified".to_string(),
            score,
            score_stderr: None,
            evaluation_date: NaiveDate::from_ymd_opt(2024, 12, 20),
            source_id: "src-1".to_string(),
            trust_tier: TrustTier::A,
            is_override: false,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn merged_with(records: Vec<ResultRecord>) -> MergedState {
        let mut benchmarks = BTreeMap::new();
        benchmarks.insert("swe_bench_verified".to_string(), benchmark());
        merge(
            StoreSnapshot::default(),
            &benchmarks,
            vec![source()],
            vec![model()],
            records,
            &[] as &[Override],
            now(),
        )
    }

    #[test]
    fn commit_round_trips_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let merged = merged_with(vec![result(Some(87.5))]);

        let outcome = commit(&settings, &merged, "run-1", now()).unwrap();
        assert!(outcome.backup_path.is_none());
        assert_eq!(outcome.entries_appended, merged.changes.len());

        let snapshot = load_snapshot(&settings.db_path).unwrap();
        assert_eq!(snapshot.results.len(), 1);
        assert_eq!(snapshot.results["r1"].score, Some(87.5));
        assert_eq!(snapshot.results["r1"].trust_tier, TrustTier::A);
        assert_eq!(snapshot.models["openai:o3"].provider, "OpenAI");
        assert_eq!(snapshot.sources["src-1"].source_type, SourceType::OfficialLeaderboard);
        assert_eq!(snapshot.benchmarks.len(), 1);

        let entries = changelog::read_entries(&settings.changelog_path).unwrap();
        assert_eq!(entries.len(), merged.changes.len());
    }

    #[test]
    fn load_snapshot_never_mutates_the_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        commit(&settings, &merged_with(vec![result(Some(87.5))]), "run-1", now()).unwrap();

        let before = fs::read(&settings.db_path).unwrap();
        // Cross a wall-clock second so any timestamp refresh would show up.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        load_snapshot(&settings.db_path).unwrap();
        let after = fs::read(&settings.db_path).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn changelog_failure_after_swap_is_audit_not_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        // A directory at the changelog path makes the append fail.
        fs::create_dir_all(&settings.changelog_path).unwrap();

        let merged = merged_with(vec![result(Some(87.5))]);
        let err = commit(&settings, &merged, "run-1", now()).unwrap_err();
        assert!(matches!(err, CommitError::Audit(_)));

        // The swap happened: the data is live despite the failed append.
        let snapshot = load_snapshot(&settings.db_path).unwrap();
        assert_eq!(snapshot.results.len(), 1);
        assert!(!staging_path_for(&settings.db_path).exists());
    }

    #[test]
    fn second_commit_takes_a_backup_of_the_previous_store() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        commit(&settings, &merged_with(vec![result(Some(87.5))]), "run-1", now()).unwrap();

        let later = now() + Duration::hours(1);
        let existing = load_snapshot(&settings.db_path).unwrap();
        let merged = merge(
            existing,
            &BTreeMap::new(),
            Vec::new(),
            Vec::new(),
            vec![result(Some(88.0))],
            &[],
            later,
        );
        let outcome = commit(&settings, &merged, "run-2", later).unwrap();

        let backup = outcome.backup_path.expect("backup for existing store");
        assert!(backup.exists());

        // The backup preserves the pre-run image.
        let backed_up = load_snapshot(&backup).unwrap();
        assert_eq!(backed_up.results["r1"].score, Some(87.5));
        let live = load_snapshot(&settings.db_path).unwrap();
        assert_eq!(live.results["r1"].score, Some(88.0));
    }

    #[test]
    fn orphaned_source_reference_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        commit(&settings, &merged_with(vec![result(Some(87.5))]), "run-1", now()).unwrap();
        let before = fs::read(&settings.db_path).unwrap();
        let entries_before = changelog::read_entries(&settings.changelog_path).unwrap().len();

        // A result pointing at an unregistered source must fail verification.
        let existing = load_snapshot(&settings.db_path).unwrap();
        let mut stray = result(Some(50.0));
        stray.result_id = "r2".to_string();
        stray.source_id = "ghost".to_string();
        let merged = merge(
            existing,
            &BTreeMap::new(),
            Vec::new(),
            Vec::new(),
            vec![stray],
            &[],
            now(),
        );

        let err = commit(&settings, &merged, "run-2", now()).unwrap_err();
        assert!(matches!(err, CommitError::Verify(_)));

        let after = fs::read(&settings.db_path).unwrap();
        assert_eq!(before, after, "live store must be untouched after rollback");
        assert!(!staging_path_for(&settings.db_path).exists());

        let entries = changelog::read_entries(&settings.changelog_path).unwrap();
        assert_eq!(entries.len(), entries_before + 1);
        let rollback = entries.last().unwrap();
        assert_eq!(rollback.action, ChangeAction::Rollback);
        assert_eq!(rollback.record_id, "run-2");
    }

    #[test]
    fn shrinking_results_table_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        commit(&settings, &merged_with(vec![result(Some(87.5))]), "run-1", now()).unwrap();

        // Writes are insert-or-update, so a shrink can only come from
        // corruption; drive the check directly.
        let connection = open(&settings.db_path).unwrap();
        let pre = TableCounts {
            benchmarks: 0,
            models: 0,
            sources: 0,
            results: 5,
        };
        let err = verify_staging(&connection, &pre).unwrap_err();
        assert!(err.to_string().contains("row count dropped"));
    }

    #[test]
    fn prune_backups_removes_only_aged_files() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();

        fs::write(backups.join("benchtrack_20251101T000000Z.sqlite"), b"old").unwrap();
        fs::write(backups.join("benchtrack_20260109T000000Z.sqlite"), b"new").unwrap();
        fs::write(backups.join("unrelated.txt"), b"keep").unwrap();

        let pruned = prune_backups(&backups, 30, now());
        assert_eq!(pruned, 1);
        assert!(!backups.join("benchtrack_20251101T000000Z.sqlite").exists());
        assert!(backups.join("benchtrack_20260109T000000Z.sqlite").exists());
        assert!(backups.join("unrelated.txt").exists());
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::config::Settings;
use crate::error::StageError;
use crate::schema::{
    Benchmark, MetaValue, Metadata, Model, ModelStatus, ParseMethod, Source, SourceType,
};

/// Unvalidated row produced by a fetcher. Identity fields are already
/// canonicalized; everything else waits for the validator.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub model_id: String,
    pub benchmark_id: String,
    pub score: Option<f64>,
    pub score_stderr: Option<f64>,
    pub evaluation_date: Option<NaiveDate>,
    pub source_id: String,
    pub metadata: Metadata,
}

/// Row that could not be parsed. Recorded, skipped, never fatal.
#[derive(Debug, Clone)]
pub struct RowWarning {
    pub line: usize,
    pub reason: String,
}

/// Output of one fetcher run: exactly one provenance record, the models it
/// mentioned, and the candidate rows awaiting validation.
#[derive(Debug)]
pub struct ParsedBatch {
    pub benchmark_id: String,
    pub source: Source,
    pub models: Vec<Model>,
    pub candidates: Vec<Candidate>,
    pub row_warnings: Vec<RowWarning>,
}

/// Closed set of benchmark sources. Each variant hides one source's column
/// naming and normalization quirks behind the shared fetch/parse contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetcher {
    SweBenchVerified,
    MetrTimeHorizons,
    FrontierMath,
}

/// Registry of fetchers, built once at startup and passed by reference to
/// the orchestrator.
pub fn registry() -> Vec<Fetcher> {
    vec![
        Fetcher::SweBenchVerified,
        Fetcher::MetrTimeHorizons,
        Fetcher::FrontierMath,
    ]
}

pub fn for_benchmark(benchmark_id: &str) -> Option<Fetcher> {
    registry()
        .into_iter()
        .find(|fetcher| fetcher.benchmark_id() == benchmark_id)
}

impl Fetcher {
    pub fn benchmark_id(self) -> &'static str {
        match self {
            Self::SweBenchVerified => "swe_bench_verified",
            Self::MetrTimeHorizons => "metr_time_horizons",
            Self::FrontierMath => "frontiermath_tier4",
        }
    }

    fn snapshot_name(self) -> &'static str {
        match self {
            Self::SweBenchVerified => "swe_bench_verified.csv",
            Self::MetrTimeHorizons => "metr_time_horizons.csv",
            Self::FrontierMath => "frontier_math.csv",
        }
    }

    pub fn benchmark_meta(self) -> Benchmark {
        match self {
            Self::SweBenchVerified => Benchmark {
                benchmark_id: self.benchmark_id().to_string(),
                name: "SWE-Bench Verified".to_string(),
                category: "coding".to_string(),
                unit: "percent".to_string(),
                scale_min: 0.0,
                scale_max: 100.0,
                higher_is_better: true,
                official_url: Some("https://www.swebench.com/".to_string()),
            },
            Self::MetrTimeHorizons => Benchmark {
                benchmark_id: self.benchmark_id().to_string(),
                name: "METR Time Horizons".to_string(),
                category: "agentic".to_string(),
                unit: "hours".to_string(),
                scale_min: 0.0,
                scale_max: 1000.0,
                higher_is_better: true,
                official_url: Some("https://metr.org/".to_string()),
            },
            Self::FrontierMath => Benchmark {
                benchmark_id: self.benchmark_id().to_string(),
                name: "FrontierMath Tier 4".to_string(),
                category: "math".to_string(),
                unit: "percent".to_string(),
                scale_min: 0.0,
                scale_max: 100.0,
                higher_is_better: true,
                official_url: Some("https://epoch.ai/frontiermath".to_string()),
            },
        }
    }

    fn source_info(self) -> (SourceType, &'static str, &'static str) {
        match self {
            Self::SweBenchVerified => (
                SourceType::OfficialLeaderboard,
                "SWE-Bench Verified Leaderboard",
                "https://www.swebench.com/",
            ),
            Self::MetrTimeHorizons => (
                SourceType::OfficialPaper,
                "METR Time Horizons Report",
                "https://metr.org/blog/2025-03-19-measuring-ai-ability-to-complete-long-tasks/",
            ),
            Self::FrontierMath => (
                SourceType::ThirdPartyEval,
                "Epoch AI FrontierMath Evaluations",
                "https://epoch.ai/frontiermath",
            ),
        }
    }

    /// Locate the raw snapshot for this source: the curated snapshots
    /// directory first, then the raw download directory.
    pub fn fetch_raw(self, settings: &Settings) -> Result<PathBuf, StageError> {
        let candidates = [
            settings.snapshots_dir.join(self.snapshot_name()),
            settings.raw_dir.join(self.snapshot_name()),
        ];

        for path in &candidates {
            if path.exists() {
                debug!(benchmark = self.benchmark_id(), path = %path.display(), "snapshot located");
                return Ok(path.clone());
            }
        }

        Err(StageError::Fetch(format!(
            "snapshot {} not found under {} or {}",
            self.snapshot_name(),
            settings.snapshots_dir.display(),
            settings.raw_dir.display(),
        )))
    }

    /// Parse the snapshot into candidate rows plus one Source record.
    /// Malformed rows are skipped with a warning; an unreadable or
    /// header-less file fails the whole source.
    pub fn parse(
        self,
        raw_path: &Path,
        retrieved_at: DateTime<Utc>,
    ) -> Result<ParsedBatch, StageError> {
        let text = fs::read_to_string(raw_path)
            .map_err(|err| StageError::Parse(format!("unreadable {}: {err}", raw_path.display())))?;

        let table = RawTable::from_csv(&text)
            .map_err(|reason| StageError::Parse(format!("{}: {reason}", raw_path.display())))?;

        let (source_type, title, url) = self.source_info();
        let source = Source {
            source_id: Source::generate_id(url, retrieved_at),
            source_type,
            source_title: title.to_string(),
            source_url: url.to_string(),
            retrieved_at,
            parse_method: ParseMethod::CsvDownload,
            raw_snapshot_path: Some(raw_path.display().to_string()),
        };

        let normalizer =
            NameNormalizer::new().map_err(|err| StageError::Parse(err.to_string()))?;

        let mut batch = ParsedBatch {
            benchmark_id: self.benchmark_id().to_string(),
            source,
            models: Vec::new(),
            candidates: Vec::new(),
            row_warnings: Vec::new(),
        };
        let mut seen_models: BTreeMap<String, usize> = BTreeMap::new();

        for (line, row) in &table.rows {
            match self.parse_row(&table, row, &normalizer, retrieved_at, &batch.source) {
                Ok(Some((model, candidate))) => {
                    if let Some(&index) = seen_models.get(&model.model_id) {
                        // Later rows may carry fields an earlier row lacked.
                        let existing: &mut Model = &mut batch.models[index];
                        if existing.release_date.is_none() {
                            existing.release_date = model.release_date;
                        }
                    } else {
                        seen_models.insert(model.model_id.clone(), batch.models.len());
                        batch.models.push(model);
                    }
                    batch.candidates.push(candidate);
                }
                Ok(None) => {}
                Err(reason) => batch.row_warnings.push(RowWarning {
                    line: *line,
                    reason,
                }),
            }
        }

        Ok(batch)
    }

    fn parse_row(
        self,
        table: &RawTable,
        row: &[String],
        normalizer: &NameNormalizer,
        retrieved_at: DateTime<Utc>,
        source: &Source,
    ) -> std::result::Result<Option<(Model, Candidate)>, String> {
        let (name_col, org_col) = match self {
            Self::SweBenchVerified | Self::MetrTimeHorizons => ("Model version", "Organization"),
            Self::FrontierMath => ("model", "provider"),
        };

        let model_name = table.field(row, name_col).unwrap_or_default();
        if model_name.is_empty() {
            // Blank filler rows are common in exported leaderboards.
            return Ok(None);
        }

        let mut provider = table.field(row, org_col).unwrap_or_default();
        if provider.is_empty() || provider == "Unknown" {
            provider = infer_provider(&model_name).to_string();
        }

        let model_id = normalizer.model_id(&model_name, &provider);

        let (score, score_stderr, evaluation_date, release_date, mut metadata) = match self {
            Self::SweBenchVerified => {
                let score = parse_optional_float(table.field(row, "Best score (across scorers)"))?
                    .map(fraction_to_percent);
                let stderr = parse_optional_float(table.field(row, "stderr"))?
                    .map(fraction_to_percent);
                let eval_date = parse_flex_date(table.field(row, "Started at"))?;
                let release = parse_flex_date(table.field(row, "Release date"))?;
                (score, stderr, eval_date, release, Metadata::new())
            }
            Self::MetrTimeHorizons => {
                let score = parse_optional_float(table.field(row, "Time horizon"))?;
                let release = parse_flex_date(table.field(row, "Release date"))?;
                let mut metadata = Metadata::new();
                if let Some(low) = parse_optional_float(table.field(row, "CI_low"))? {
                    metadata.insert("ci_low".to_string(), MetaValue::Number(low));
                }
                if let Some(high) = parse_optional_float(table.field(row, "CI_high"))? {
                    metadata.insert("ci_high".to_string(), MetaValue::Number(high));
                }
                // The report dates measurements by model release.
                (score, None, release, release, metadata)
            }
            Self::FrontierMath => {
                let score = parse_optional_float(table.field(row, "score"))?;
                let eval_date = parse_flex_date(table.field(row, "date"))?;
                let mut metadata = Metadata::new();
                if let Some(effort) = table.field(row, "reasoning_effort")
                    && !effort.is_empty()
                {
                    metadata.insert("reasoning_effort".to_string(), MetaValue::Text(effort));
                }
                (score, None, eval_date, None, metadata)
            }
        };

        if let Some(effort) = table.field(row, "Reasoning effort")
            && !effort.is_empty()
        {
            metadata.insert("reasoning_effort".to_string(), MetaValue::Text(effort));
        }

        let model = Model {
            model_id: model_id.clone(),
            name: model_name.clone(),
            provider: provider.clone(),
            family: infer_family(&model_name).map(str::to_string),
            release_date,
            status: ModelStatus::Verified,
            metadata: Metadata::new(),
            created_at: retrieved_at,
            updated_at: retrieved_at,
        };

        let candidate = Candidate {
            model_id,
            benchmark_id: self.benchmark_id().to_string(),
            score,
            score_stderr,
            evaluation_date,
            source_id: source.source_id.clone(),
            metadata,
        };

        Ok(Some((model, candidate)))
    }
}

/// Header-indexed view over a comma-separated snapshot.
#[derive(Debug)]
struct RawTable {
    columns: BTreeMap<String, usize>,
    rows: Vec<(usize, Vec<String>)>,
}

impl RawTable {
    fn from_csv(text: &str) -> std::result::Result<Self, String> {
        let mut lines = text.lines().enumerate();
        let header = loop {
            match lines.next() {
                Some((_, line)) if line.trim().is_empty() => continue,
                Some((_, line)) => break line,
                None => return Err("empty snapshot".to_string()),
            }
        };

        let columns: BTreeMap<String, usize> = split_csv_line(header)
            .into_iter()
            .enumerate()
            .map(|(index, name)| (name, index))
            .collect();
        if columns.is_empty() {
            return Err("missing header row".to_string());
        }

        let rows = lines
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| (index + 1, split_csv_line(line)))
            .collect();

        Ok(Self { columns, rows })
    }

    fn field(&self, row: &[String], column: &str) -> Option<String> {
        let index = *self.columns.get(column)?;
        row.get(index).map(|value| value.trim().to_string())
    }
}

/// Split one CSV line, honoring double-quoted fields and doubled quotes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());

    fields
}

struct NameNormalizer {
    scrub: Regex,
}

impl NameNormalizer {
    fn new() -> Result<Self> {
        Ok(Self {
            scrub: Regex::new(r"[^a-z0-9._-]+").context("failed to compile id scrub regex")?,
        })
    }

    /// Canonical `provider:name` identifier, lowercased with unsafe
    /// characters collapsed to underscores.
    fn model_id(&self, raw_name: &str, provider: &str) -> String {
        let name = self
            .scrub
            .replace_all(raw_name.trim().to_lowercase().as_str(), "_")
            .trim_matches('_')
            .to_string();
        let provider = self
            .scrub
            .replace_all(provider.trim().to_lowercase().as_str(), "_")
            .trim_matches('_')
            .to_string();
        format!("{provider}:{name}")
    }
}

/// Best-effort provider attribution from well-known model name patterns.
pub fn infer_provider(model_name: &str) -> &'static str {
    let name = model_name.to_lowercase();

    let patterns: [(&str, &[&str]); 9] = [
        ("OpenAI", &["gpt-", "o1-", "o3", "o4", "davinci"]),
        ("Anthropic", &["claude", "opus", "sonnet", "haiku"]),
        ("Google DeepMind", &["gemini", "palm", "bard"]),
        ("Meta", &["llama", "codellama"]),
        ("Mistral", &["mistral", "mixtral"]),
        ("xAI", &["grok"]),
        ("Cohere", &["command"]),
        ("DeepSeek", &["deepseek"]),
        ("Alibaba", &["qwen"]),
    ];

    for (provider, needles) in patterns {
        if needles.iter().any(|needle| name.contains(needle)) {
            return provider;
        }
    }

    "Unknown"
}

/// Best-effort family grouping from the model name.
pub fn infer_family(model_name: &str) -> Option<&'static str> {
    let name = model_name.to_lowercase();

    let families: [(&str, &[&str]); 10] = [
        ("gpt-4", &["gpt-4", "gpt4"]),
        ("o1", &["o1-", "o1 "]),
        ("o3", &["o3-", "o3 ", "o3"]),
        ("o4", &["o4-", "o4 "]),
        ("claude-3.5", &["claude-3-5", "claude-3.5"]),
        ("claude-4", &["claude-4", "sonnet-4", "opus-4"]),
        ("gemini-2", &["gemini-2"]),
        ("grok-3", &["grok-3"]),
        ("llama-3", &["llama-3", "llama3"]),
        ("deepseek", &["deepseek"]),
    ];

    families
        .into_iter()
        .find(|(_, needles)| needles.iter().any(|needle| name.contains(needle)))
        .map(|(family, _)| family)
}

fn parse_optional_float(value: Option<String>) -> std::result::Result<Option<f64>, String> {
    let Some(raw) = value else { return Ok(None) };
    let raw = raw.trim();
    if raw.is_empty() || raw == "None" || raw == "NaN" || raw == "-" {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| format!("invalid number: {raw}"))
}

/// Leaderboard exports disagree on whether percent scores are 0-1 or
/// 0-100; fractional values are rescaled.
fn fraction_to_percent(value: f64) -> f64 {
    if value <= 1.0 { value * 100.0 } else { value }
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y"];

fn parse_flex_date(value: Option<String>) -> std::result::Result<Option<NaiveDate>, String> {
    let Some(raw) = value else { return Ok(None) };
    let raw = raw.trim();
    if raw.is_empty() || raw == "None" {
        return Ok(None);
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Ok(Some(date));
        }
    }
    // Timestamp forms: keep the date part.
    let prefix = raw.get(..19).unwrap_or(raw);
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(prefix, format) {
            return Ok(Some(dt.date()));
        }
    }

    Err(format!("unparseable date: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    fn retrieved() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn split_csv_line_handles_quotes_and_embedded_commas() {
        let fields = split_csv_line(r#"o3,OpenAI,"87.5","official, verified run""#);
        assert_eq!(fields, vec!["o3", "OpenAI", "87.5", "official, verified run"]);
    }

    #[test]
    fn split_csv_line_unescapes_doubled_quotes() {
        let fields = split_csv_line(r#""say ""hi""",1"#);
        assert_eq!(fields, vec![r#"say "hi""#, "1"]);
    }

    #[test]
    fn model_id_normalization_scrubs_and_lowercases() {
        let normalizer = NameNormalizer::new().unwrap();
        assert_eq!(
            normalizer.model_id("Claude 3.5 Sonnet", "Anthropic"),
            "anthropic:claude_3.5_sonnet"
        );
        assert_eq!(normalizer.model_id("o3 (high)", "OpenAI"), "openai:o3_high");
    }

    #[test]
    fn provider_inference_matches_known_patterns() {
        assert_eq!(infer_provider("o3-mini"), "OpenAI");
        assert_eq!(infer_provider("Claude 3.5 Sonnet"), "Anthropic");
        assert_eq!(infer_provider("Qwen2.5-Max"), "Alibaba");
        assert_eq!(infer_provider("mystery-model"), "Unknown");
    }

    #[test]
    fn flex_date_accepts_common_forms_and_rejects_garbage() {
        assert_eq!(
            parse_flex_date(Some("2024-12-20".to_string())).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 20)
        );
        assert_eq!(
            parse_flex_date(Some("2024-12-20T08:30:00".to_string())).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 20)
        );
        assert_eq!(parse_flex_date(Some(String::new())).unwrap(), None);
        assert!(parse_flex_date(Some("next tuesday".to_string())).is_err());
    }

    #[test]
    fn parse_swe_bench_snapshot_rescales_and_warns_on_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swe_bench_verified.csv");
        fs::write(
            &path,
            "Model version,Organization,Best score (across scorers),stderr,Started at,Release date\n\
             o3,OpenAI,0.875,0.01,2024-12-20,2024-12-17\n\
             broken,OpenAI,not-a-number,,2024-12-20,\n\
             Claude 3.5 Sonnet,Anthropic,49.0,,2024-10-22,2024-06-20\n",
        )
        .unwrap();

        let batch = Fetcher::SweBenchVerified.parse(&path, retrieved()).unwrap();
        assert_eq!(batch.candidates.len(), 2);
        assert_eq!(batch.row_warnings.len(), 1);
        assert!(batch.row_warnings[0].reason.contains("invalid number"));

        let o3 = &batch.candidates[0];
        assert_eq!(o3.model_id, "openai:o3");
        assert_eq!(o3.score, Some(87.5));
        assert_eq!(o3.score_stderr, Some(1.0));
        assert_eq!(o3.source_id, batch.source.source_id);

        // Already-percent scores are left alone.
        assert_eq!(batch.candidates[1].score, Some(49.0));
        assert_eq!(batch.models.len(), 2);
    }

    #[test]
    fn parse_frontier_math_keeps_reasoning_effort_as_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frontier_math.csv");
        fs::write(
            &path,
            "model,provider,score,date,reasoning_effort\n\
             o3,OpenAI,12.5,2025-02-01,high\n\
             Gemini 2.5 Pro,,9.0,2025-03-01,\n",
        )
        .unwrap();

        let batch = Fetcher::FrontierMath.parse(&path, retrieved()).unwrap();
        assert_eq!(batch.candidates.len(), 2);
        assert_eq!(
            batch.candidates[0].metadata.get("reasoning_effort"),
            Some(&MetaValue::Text("high".to_string()))
        );
        // Provider inferred when the column is blank.
        assert_eq!(batch.candidates[1].model_id, "google_deepmind:gemini_2.5_pro");
        assert_eq!(batch.source.source_type, SourceType::ThirdPartyEval);
    }

    #[test]
    fn parse_fails_on_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swe_bench_verified.csv");
        fs::write(&path, "").unwrap();

        let err = Fetcher::SweBenchVerified.parse(&path, retrieved()).unwrap_err();
        assert!(matches!(err, StageError::Parse(_)));
    }

    #[test]
    fn fetch_raw_reports_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().to_path_buf()).unwrap();
        let err = Fetcher::MetrTimeHorizons.fetch_raw(&settings).unwrap_err();
        assert!(matches!(err, StageError::Fetch(_)));
    }

    #[test]
    fn registry_is_addressable_by_benchmark_id() {
        assert_eq!(for_benchmark("swe_bench_verified"), Some(Fetcher::SweBenchVerified));
        assert_eq!(for_benchmark("nope"), None);
        assert_eq!(registry().len(), 3);
    }
}

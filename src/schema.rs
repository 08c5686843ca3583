use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::util::short_sha256;

/// Confidence label derived from the source type. Ordered so that `A`
/// compares smallest, i.e. `min` picks the most trusted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustTier {
    A,
    B,
    C,
}

impl TrustTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    OfficialPaper,
    OfficialLeaderboard,
    OfficialBlog,
    ThirdPartyEval,
    ThirdPartyLeaderboard,
    ManualEntry,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OfficialPaper => "official_paper",
            Self::OfficialLeaderboard => "official_leaderboard",
            Self::OfficialBlog => "official_blog",
            Self::ThirdPartyEval => "third_party_eval",
            Self::ThirdPartyLeaderboard => "third_party_leaderboard",
            Self::ManualEntry => "manual_entry",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "official_paper" => Some(Self::OfficialPaper),
            "official_leaderboard" => Some(Self::OfficialLeaderboard),
            "official_blog" => Some(Self::OfficialBlog),
            "third_party_eval" => Some(Self::ThirdPartyEval),
            "third_party_leaderboard" => Some(Self::ThirdPartyLeaderboard),
            "manual_entry" => Some(Self::ManualEntry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    Api,
    CsvDownload,
    HtmlScrape,
    PdfExtract,
    Manual,
}

impl ParseMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::CsvDownload => "csv_download",
            Self::HtmlScrape => "html_scrape",
            Self::PdfExtract => "pdf_extract",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api" => Some(Self::Api),
            "csv_download" => Some(Self::CsvDownload),
            "html_scrape" => Some(Self::HtmlScrape),
            "pdf_extract" => Some(Self::PdfExtract),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Verified,
    Unverified,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Unverified => "unverified",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "verified" => Some(Self::Verified),
            "unverified" => Some(Self::Unverified),
            _ => None,
        }
    }
}

/// Scalar value allowed in the open metadata maps. Keys are unvalidated
/// extension points for source-specific extras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// A named AI system. Created or field-refreshed by the merger, never
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub model_id: String,
    pub name: String,
    pub provider: String,
    pub family: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub status: ModelStatus,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn generate_id(provider: &str, name: &str, version: &str) -> String {
        let mut parts = vec![
            provider.to_lowercase().replace(' ', "_"),
            name.to_lowercase().replace(' ', "_"),
        ];
        if !version.is_empty() {
            parts.push(version.to_string());
        }
        parts.join(":")
    }
}

/// Static evaluation metadata, loaded from configuration and read-only for
/// the rest of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub benchmark_id: String,
    pub name: String,
    pub category: String,
    pub unit: String,
    pub scale_min: f64,
    pub scale_max: f64,
    pub higher_is_better: bool,
    #[serde(default)]
    pub official_url: Option<String>,
}

/// Provenance record. Exactly one per fetcher run; many results reference
/// it and sources are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub source_type: SourceType,
    pub source_title: String,
    pub source_url: String,
    pub retrieved_at: DateTime<Utc>,
    pub parse_method: ParseMethod,
    pub raw_snapshot_path: Option<String>,
}

impl Source {
    pub fn generate_id(url: &str, retrieved_at: DateTime<Utc>) -> String {
        short_sha256(&format!("{}:{}", url, retrieved_at.to_rfc3339()))
    }
}

/// The atomic fact: one score (or explicit absence of one) for one model on
/// one benchmark, with mandatory provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub result_id: String,
    pub model_id: String,
    pub benchmark_id: String,
    pub score: Option<f64>,
    pub score_stderr: Option<f64>,
    pub evaluation_date: Option<NaiveDate>,
    pub source_id: String,
    pub trust_tier: TrustTier,
    pub is_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Identity is a pure function of these fields, so re-ingesting the same
    /// source data regenerates the same id instead of a duplicate row.
    pub fn generate_id(
        model_id: &str,
        benchmark_id: &str,
        evaluation_date: Option<NaiveDate>,
        source_id: &str,
    ) -> String {
        let date = evaluation_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        short_sha256(&format!("{model_id}:{benchmark_id}:{date}:{source_id}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideField {
    Score,
    ScoreStderr,
    EvaluationDate,
    TrustTier,
}

impl OverrideField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::ScoreStderr => "score_stderr",
            Self::EvaluationDate => "evaluation_date",
            Self::TrustTier => "trust_tier",
        }
    }
}

/// Value carried by an override. Dates and trust tiers travel as text,
/// scores as numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Loose equality for stale-override detection: numbers compare within
    /// a small epsilon, text compares exactly.
    pub fn matches(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a - b).abs() < 1e-9,
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

/// Manually authored correction. Applied after all automated merges and
/// always wins over freshly ingested data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub result_id: String,
    pub field: OverrideField,
    #[serde(default)]
    pub old_value: Option<FieldValue>,
    pub new_value: FieldValue,
    pub reason: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Insert,
    Update,
    Override,
    Rollback,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Override => "override",
            Self::Rollback => "rollback",
        }
    }
}

/// One line of the append-only audit changelog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: ChangeAction,
    pub table: String,
    pub record_id: String,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn result_id_is_deterministic() {
        let a = ResultRecord::generate_id("openai:o3", "swe_bench_verified", Some(date(2024, 12, 20)), "src1");
        let b = ResultRecord::generate_id("openai:o3", "swe_bench_verified", Some(date(2024, 12, 20)), "src1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn result_id_depends_on_source() {
        let a = ResultRecord::generate_id("openai:o3", "swe_bench_verified", None, "src1");
        let b = ResultRecord::generate_id("openai:o3", "swe_bench_verified", None, "src2");
        assert_ne!(a, b);
    }

    #[test]
    fn model_id_lowercases_and_joins() {
        assert_eq!(Model::generate_id("OpenAI", "GPT 4o", ""), "openai:gpt_4o");
        assert_eq!(
            Model::generate_id("Anthropic", "Claude", "3.5"),
            "anthropic:claude:3.5"
        );
    }

    #[test]
    fn trust_tier_orders_a_most_trusted() {
        assert!(TrustTier::A < TrustTier::B);
        assert!(TrustTier::B < TrustTier::C);
        assert_eq!(TrustTier::parse("B"), Some(TrustTier::B));
        assert_eq!(TrustTier::parse("d"), None);
    }

    #[test]
    fn enum_string_round_trips() {
        for st in [
            SourceType::OfficialPaper,
            SourceType::OfficialLeaderboard,
            SourceType::OfficialBlog,
            SourceType::ThirdPartyEval,
            SourceType::ThirdPartyLeaderboard,
            SourceType::ManualEntry,
        ] {
            assert_eq!(SourceType::parse(st.as_str()), Some(st));
        }
        assert_eq!(ParseMethod::parse("csv_download"), Some(ParseMethod::CsvDownload));
        assert_eq!(ModelStatus::parse("unverified"), Some(ModelStatus::Unverified));
    }

    #[test]
    fn field_value_matching_uses_epsilon_for_numbers() {
        assert!(FieldValue::Number(45.2).matches(&FieldValue::Number(45.2)));
        assert!(!FieldValue::Number(45.2).matches(&FieldValue::Number(46.1)));
        assert!(FieldValue::Text("A".into()).matches(&FieldValue::Text("A".into())));
        assert!(!FieldValue::Text("A".into()).matches(&FieldValue::Number(1.0)));
    }

    #[test]
    fn changelog_entry_serializes_action_snake_case() {
        let entry = ChangelogEntry {
            timestamp: Utc::now(),
            action: ChangeAction::Rollback,
            table: "results".to_string(),
            record_id: "abc".to_string(),
            reason: Some("verification failed".to_string()),
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"action\":\"rollback\""));
    }
}

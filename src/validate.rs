use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::RejectReason;
use crate::fetch::{Candidate, ParsedBatch};
use crate::schema::{Benchmark, ResultRecord, SourceType, TrustTier};

/// Candidate dropped by a validation rule, kept with its typed reason for
/// the per-source report.
#[derive(Debug)]
pub struct RejectedCandidate {
    pub candidate: Candidate,
    pub reason: RejectReason,
}

/// In-batch identity collision, collapsed in favor of the higher trust
/// tier. Informational only.
#[derive(Debug, Clone)]
pub struct DuplicateWarning {
    pub result_id: String,
    pub kept_tier: TrustTier,
    pub dropped_tier: TrustTier,
}

#[derive(Debug)]
pub struct ValidationReport {
    pub accepted: Vec<ResultRecord>,
    pub rejected: Vec<RejectedCandidate>,
    pub duplicates: Vec<DuplicateWarning>,
}

/// Trust is a property of where the data came from, not of what the
/// fetcher claims; upgrades happen only through overrides.
pub fn tier_for(source_type: SourceType) -> TrustTier {
    match source_type {
        SourceType::OfficialLeaderboard | SourceType::OfficialPaper => TrustTier::A,
        SourceType::OfficialBlog | SourceType::ThirdPartyEval => TrustTier::B,
        SourceType::ThirdPartyLeaderboard | SourceType::ManualEntry => TrustTier::C,
    }
}

/// Apply the validation rules in order to every candidate in the batch.
/// Rejections are per-row and never fail the batch.
pub fn validate(
    batch: &ParsedBatch,
    benchmarks: &BTreeMap<String, Benchmark>,
    now: DateTime<Utc>,
) -> ValidationReport {
    let trust_tier = tier_for(batch.source.source_type);
    let today = now.date_naive();

    let mut report = ValidationReport {
        accepted: Vec::new(),
        rejected: Vec::new(),
        duplicates: Vec::new(),
    };
    let mut by_id: BTreeMap<String, usize> = BTreeMap::new();

    for candidate in &batch.candidates {
        let reason = check_candidate(candidate, benchmarks, &batch.source.source_id, today);
        if let Some(reason) = reason {
            warn!(
                benchmark = %candidate.benchmark_id,
                model = %candidate.model_id,
                reason = %reason,
                "candidate rejected"
            );
            report.rejected.push(RejectedCandidate {
                candidate: candidate.clone(),
                reason,
            });
            continue;
        }

        let result_id = ResultRecord::generate_id(
            &candidate.model_id,
            &candidate.benchmark_id,
            candidate.evaluation_date,
            &candidate.source_id,
        );
        let record = ResultRecord {
            result_id: result_id.clone(),
            model_id: candidate.model_id.clone(),
            benchmark_id: candidate.benchmark_id.clone(),
            score: candidate.score,
            score_stderr: candidate.score_stderr,
            evaluation_date: candidate.evaluation_date,
            source_id: candidate.source_id.clone(),
            trust_tier,
            is_override: false,
            created_at: now,
            updated_at: now,
        };

        match by_id.get(&result_id) {
            None => {
                by_id.insert(result_id, report.accepted.len());
                report.accepted.push(record);
            }
            Some(&index) => {
                let existing = &mut report.accepted[index];
                if record.trust_tier < existing.trust_tier {
                    report.duplicates.push(DuplicateWarning {
                        result_id,
                        kept_tier: record.trust_tier,
                        dropped_tier: existing.trust_tier,
                    });
                    *existing = record;
                } else {
                    report.duplicates.push(DuplicateWarning {
                        result_id,
                        kept_tier: existing.trust_tier,
                        dropped_tier: record.trust_tier,
                    });
                }
            }
        }
    }

    report
}

fn check_candidate(
    candidate: &Candidate,
    benchmarks: &BTreeMap<String, Benchmark>,
    batch_source_id: &str,
    today: chrono::NaiveDate,
) -> Option<RejectReason> {
    let Some(benchmark) = benchmarks.get(&candidate.benchmark_id) else {
        return Some(RejectReason::UnknownBenchmark(candidate.benchmark_id.clone()));
    };

    if let Some(score) = candidate.score
        && !(benchmark.scale_min..=benchmark.scale_max).contains(&score)
    {
        return Some(RejectReason::RangeError {
            score,
            scale_min: benchmark.scale_min,
            scale_max: benchmark.scale_max,
            benchmark_id: benchmark.benchmark_id.clone(),
        });
    }

    if let Some(date) = candidate.evaluation_date
        && date > today
    {
        return Some(RejectReason::DateError { date });
    }

    if candidate.source_id.is_empty() || candidate.source_id != batch_source_id {
        return Some(RejectReason::ProvenanceError);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{NaiveDate, TimeZone};

    use crate::schema::{Metadata, ParseMethod, Source};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    fn benchmark(id: &str, min: f64, max: f64) -> Benchmark {
        Benchmark {
            benchmark_id: id.to_string(),
            name: id.to_string(),
            category: "coding".to_string(),
            unit: "percent".to_string(),
            scale_min: min,
            scale_max: max,
            higher_is_better: true,
            official_url: None,
        }
    }

    fn batch_with(source_type: SourceType, candidates: Vec<Candidate>) -> ParsedBatch {
        let source = Source {
            source_id: "src-1".to_string(),
            source_type,
            source_title: "test source".to_string(),
            source_url: "https://example.com".to_string(),
            retrieved_at: now(),
            parse_method: ParseMethod::CsvDownload,
            raw_snapshot_path: None,
        };
        ParsedBatch {
            benchmark_id: "swe_bench_verified".to_string(),
            source,
            models: Vec::new(),
            candidates,
            row_warnings: Vec::new(),
        }
    }

    fn candidate(model: &str, score: Option<f64>, date: Option<NaiveDate>) -> Candidate {
        Candidate {
            model_id: model.to_string(),
            benchmark_id: "swe_bench_verified".to_string(),
            score,
            score_stderr: None,
            evaluation_date: date,
            source_id: "src-1".to_string(),
            metadata: Metadata::new(),
        }
    }

    fn benchmarks() -> BTreeMap<String, Benchmark> {
        let mut map = BTreeMap::new();
        map.insert(
            "swe_bench_verified".to_string(),
            benchmark("swe_bench_verified", 0.0, 100.0),
        );
        map
    }

    #[test]
    fn tier_assignment_follows_source_type() {
        assert_eq!(tier_for(SourceType::OfficialLeaderboard), TrustTier::A);
        assert_eq!(tier_for(SourceType::OfficialPaper), TrustTier::A);
        assert_eq!(tier_for(SourceType::OfficialBlog), TrustTier::B);
        assert_eq!(tier_for(SourceType::ThirdPartyEval), TrustTier::B);
        assert_eq!(tier_for(SourceType::ThirdPartyLeaderboard), TrustTier::C);
        assert_eq!(tier_for(SourceType::ManualEntry), TrustTier::C);
    }

    #[test]
    fn out_of_range_score_is_rejected() {
        let batch = batch_with(
            SourceType::OfficialLeaderboard,
            vec![candidate("openai:o3", Some(120.0), None)],
        );
        let report = validate(&batch, &benchmarks(), now());

        assert!(report.accepted.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(
            report.rejected[0].reason,
            RejectReason::RangeError { score, .. } if score == 120.0
        ));
    }

    #[test]
    fn null_score_is_accepted_as_first_class() {
        let batch = batch_with(
            SourceType::OfficialLeaderboard,
            vec![candidate("openai:o3", None, None)],
        );
        let report = validate(&batch, &benchmarks(), now());

        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.accepted[0].score, None);
    }

    #[test]
    fn future_evaluation_date_is_rejected() {
        let future = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let batch = batch_with(
            SourceType::OfficialLeaderboard,
            vec![candidate("openai:o3", Some(50.0), Some(future))],
        );
        let report = validate(&batch, &benchmarks(), now());

        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(report.rejected[0].reason, RejectReason::DateError { .. }));
    }

    #[test]
    fn mismatched_source_reference_is_a_provenance_error() {
        let mut orphan = candidate("openai:o3", Some(50.0), None);
        orphan.source_id = "someone-else".to_string();
        let batch = batch_with(SourceType::OfficialLeaderboard, vec![orphan]);
        let report = validate(&batch, &benchmarks(), now());

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].reason, RejectReason::ProvenanceError);
    }

    #[test]
    fn unknown_benchmark_is_rejected() {
        let mut stray = candidate("openai:o3", Some(50.0), None);
        stray.benchmark_id = "not_configured".to_string();
        let batch = batch_with(SourceType::OfficialLeaderboard, vec![stray]);
        let report = validate(&batch, &benchmarks(), now());

        assert!(matches!(
            report.rejected[0].reason,
            RejectReason::UnknownBenchmark(_)
        ));
    }

    #[test]
    fn in_batch_duplicates_collapse_to_single_record() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 20).unwrap();
        let batch = batch_with(
            SourceType::OfficialLeaderboard,
            vec![
                candidate("openai:o3", Some(87.5), Some(date)),
                candidate("openai:o3", Some(87.1), Some(date)),
            ],
        );
        let report = validate(&batch, &benchmarks(), now());

        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.duplicates.len(), 1);
        assert_eq!(report.duplicates[0].kept_tier, TrustTier::A);
        // First record wins when tiers are equal.
        assert_eq!(report.accepted[0].score, Some(87.5));
    }
}

use chrono::NaiveDate;
use thiserror::Error;

/// Terminal failure of a single source during fetch/parse. The source is
/// skipped and the run continues with whatever other sources produced.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("run timeout expired before {stage}")]
    Timeout { stage: &'static str },
}

/// Why a single candidate row was dropped during validation. Row-level,
/// never fatal to the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("benchmark {0} is not configured")]
    UnknownBenchmark(String),

    #[error("score {score} outside [{scale_min}, {scale_max}] for {benchmark_id}")]
    RangeError {
        score: f64,
        scale_min: f64,
        scale_max: f64,
        benchmark_id: String,
    },

    #[error("evaluation date {date} is in the future")]
    DateError { date: NaiveDate },

    #[error("result does not reference the registered batch source")]
    ProvenanceError,
}

impl RejectReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownBenchmark(_) => "unknown_benchmark",
            Self::RangeError { .. } => "range_error",
            Self::DateError { .. } => "date_error",
            Self::ProvenanceError => "provenance_error",
        }
    }
}

/// Failure of the commit stage. `Backup`/`Apply`/`Verify`/`Swap` leave the
/// live store untouched and end the run in rollback. `Audit` means the swap
/// already happened: the data is committed but the changelog entries for it
/// could not be appended, so the run must not be reported as rolled back.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("backup failed: {0}")]
    Backup(String),

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("integrity verification failed: {0}")]
    Verify(String),

    #[error("store swap failed: {0}")]
    Swap(String),

    #[error("store committed but changelog append failed: {0}")]
    Audit(String),
}

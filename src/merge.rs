use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use crate::schema::{
    Benchmark, ChangeAction, FieldValue, Model, Override, OverrideField, ResultRecord, Source,
    TrustTier,
};

/// Full contents of the persisted store, loaded before merging.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub benchmarks: BTreeMap<String, Benchmark>,
    pub models: BTreeMap<String, Model>,
    pub sources: BTreeMap<String, Source>,
    pub results: BTreeMap<String, ResultRecord>,
}

/// One mutation the commit stage will write, in application order. Becomes
/// a changelog entry once the swap succeeds.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub action: ChangeAction,
    pub table: &'static str,
    pub record_id: String,
    pub reason: Option<String>,
}

/// Stale or unmatchable override. Logged and skipped, never fatal.
#[derive(Debug, Clone)]
pub struct OverrideConflict {
    pub result_id: String,
    pub field: OverrideField,
    pub detail: String,
}

/// Post-merge image of the store plus the change ledger that produced it.
#[derive(Debug, Default)]
pub struct MergedState {
    pub benchmarks: BTreeMap<String, Benchmark>,
    pub models: BTreeMap<String, Model>,
    pub sources: BTreeMap<String, Source>,
    pub results: BTreeMap<String, ResultRecord>,
    pub changes: Vec<PlannedChange>,
    pub conflicts: Vec<OverrideConflict>,
    pub inserted: usize,
    pub updated: usize,
    pub overridden: usize,
    /// Fresh rows dropped because the existing row is override-protected.
    pub protected: usize,
}

/// Merge accepted results from this run into the existing store image.
/// Upserts are idempotent by `result_id`; manual overrides are applied
/// last and always win.
pub fn merge(
    existing: StoreSnapshot,
    benchmarks: &BTreeMap<String, Benchmark>,
    sources: Vec<Source>,
    models: Vec<Model>,
    accepted: Vec<ResultRecord>,
    overrides: &[Override],
    now: DateTime<Utc>,
) -> MergedState {
    let mut state = MergedState {
        benchmarks: existing.benchmarks,
        models: existing.models,
        sources: existing.sources,
        results: existing.results,
        ..MergedState::default()
    };

    for (benchmark_id, benchmark) in benchmarks {
        if !state.benchmarks.contains_key(benchmark_id) {
            state.changes.push(PlannedChange {
                action: ChangeAction::Insert,
                table: "benchmarks",
                record_id: benchmark_id.clone(),
                reason: None,
            });
        }
        state.benchmarks.insert(benchmark_id.clone(), benchmark.clone());
    }

    for source in sources {
        if state.sources.contains_key(&source.source_id) {
            continue;
        }
        state.changes.push(PlannedChange {
            action: ChangeAction::Insert,
            table: "sources",
            record_id: source.source_id.clone(),
            reason: Some(source.source_title.clone()),
        });
        state.sources.insert(source.source_id.clone(), source);
    }

    for model in models {
        merge_model(&mut state, model, now);
    }

    for record in accepted {
        upsert_result(&mut state, record, now);
    }

    for override_entry in overrides {
        apply_override(&mut state, override_entry, now);
    }

    state
}

fn merge_model(state: &mut MergedState, incoming: Model, now: DateTime<Utc>) {
    match state.models.get_mut(&incoming.model_id) {
        None => {
            state.changes.push(PlannedChange {
                action: ChangeAction::Insert,
                table: "models",
                record_id: incoming.model_id.clone(),
                reason: None,
            });
            state.models.insert(incoming.model_id.clone(), incoming);
        }
        Some(existing) => {
            let mut changed = false;
            if existing.name != incoming.name {
                existing.name = incoming.name;
                changed = true;
            }
            if existing.provider != incoming.provider {
                existing.provider = incoming.provider;
                changed = true;
            }
            if incoming.family.is_some() && existing.family != incoming.family {
                existing.family = incoming.family;
                changed = true;
            }
            if incoming.release_date.is_some() && existing.release_date != incoming.release_date {
                existing.release_date = incoming.release_date;
                changed = true;
            }
            if existing.status != incoming.status {
                existing.status = incoming.status;
                changed = true;
            }
            for (key, value) in incoming.metadata {
                if existing.metadata.get(&key) != Some(&value) {
                    existing.metadata.insert(key, value);
                    changed = true;
                }
            }

            if changed {
                existing.updated_at = now;
                state.changes.push(PlannedChange {
                    action: ChangeAction::Update,
                    table: "models",
                    record_id: existing.model_id.clone(),
                    reason: None,
                });
            }
        }
    }
}

fn upsert_result(state: &mut MergedState, incoming: ResultRecord, now: DateTime<Utc>) {
    match state.results.get_mut(&incoming.result_id) {
        None => {
            state.changes.push(PlannedChange {
                action: ChangeAction::Insert,
                table: "results",
                record_id: incoming.result_id.clone(),
                reason: None,
            });
            state.inserted += 1;
            state.results.insert(incoming.result_id.clone(), incoming);
        }
        Some(existing) if existing.is_override => {
            // Manual truth outranks fresh ingestion for the same identity.
            state.protected += 1;
        }
        Some(existing) => {
            let differs = existing.score != incoming.score
                || existing.score_stderr != incoming.score_stderr
                || existing.evaluation_date != incoming.evaluation_date
                || existing.trust_tier != incoming.trust_tier;
            if !differs {
                return;
            }

            existing.score = incoming.score;
            existing.score_stderr = incoming.score_stderr;
            existing.evaluation_date = incoming.evaluation_date;
            existing.trust_tier = incoming.trust_tier;
            existing.updated_at = now;
            state.changes.push(PlannedChange {
                action: ChangeAction::Update,
                table: "results",
                record_id: existing.result_id.clone(),
                reason: Some("re-ingested with changed values".to_string()),
            });
            state.updated += 1;
        }
    }
}

fn apply_override(state: &mut MergedState, override_entry: &Override, now: DateTime<Utc>) {
    let Some(record) = state.results.get_mut(&override_entry.result_id) else {
        push_conflict(
            state,
            override_entry,
            format!("no result with id {}", override_entry.result_id),
        );
        return;
    };

    let current = current_field_value(record, override_entry.field);
    if !old_value_matches(&current, &override_entry.old_value) {
        push_conflict(
            state,
            override_entry,
            format!(
                "expected {:?}, found {:?}",
                override_entry.old_value, current
            ),
        );
        return;
    }

    if let Err(detail) = set_field_value(record, override_entry.field, &override_entry.new_value) {
        push_conflict(state, override_entry, detail);
        return;
    }

    record.is_override = true;
    record.updated_at = now;
    state.changes.push(PlannedChange {
        action: ChangeAction::Override,
        table: "results",
        record_id: record.result_id.clone(),
        reason: Some(override_entry.reason.clone()),
    });
    state.overridden += 1;
}

fn push_conflict(state: &mut MergedState, override_entry: &Override, detail: String) {
    warn!(
        result_id = %override_entry.result_id,
        field = override_entry.field.as_str(),
        detail = %detail,
        "override conflict, skipped"
    );
    state.conflicts.push(OverrideConflict {
        result_id: override_entry.result_id.clone(),
        field: override_entry.field,
        detail,
    });
}

fn old_value_matches(current: &Option<FieldValue>, expected: &Option<FieldValue>) -> bool {
    match (current, expected) {
        (None, None) => true,
        (Some(current), Some(expected)) => current.matches(expected),
        _ => false,
    }
}

fn current_field_value(record: &ResultRecord, field: OverrideField) -> Option<FieldValue> {
    match field {
        OverrideField::Score => record.score.map(FieldValue::Number),
        OverrideField::ScoreStderr => record.score_stderr.map(FieldValue::Number),
        OverrideField::EvaluationDate => record
            .evaluation_date
            .map(|date| FieldValue::Text(date.to_string())),
        OverrideField::TrustTier => {
            Some(FieldValue::Text(record.trust_tier.as_str().to_string()))
        }
    }
}

fn set_field_value(
    record: &mut ResultRecord,
    field: OverrideField,
    value: &FieldValue,
) -> Result<(), String> {
    match (field, value) {
        (OverrideField::Score, FieldValue::Number(score)) => {
            record.score = Some(*score);
            Ok(())
        }
        (OverrideField::ScoreStderr, FieldValue::Number(stderr)) => {
            record.score_stderr = Some(*stderr);
            Ok(())
        }
        (OverrideField::EvaluationDate, FieldValue::Text(raw)) => {
            let date: NaiveDate = raw
                .parse()
                .map_err(|_| format!("invalid date value: {raw}"))?;
            record.evaluation_date = Some(date);
            Ok(())
        }
        (OverrideField::TrustTier, FieldValue::Text(raw)) => {
            let tier =
                TrustTier::parse(raw).ok_or_else(|| format!("invalid trust tier: {raw}"))?;
            // Overrides may raise trust, never silently lower it.
            if tier > record.trust_tier {
                return Err(format!(
                    "cannot downgrade trust tier {} to {raw}",
                    record.trust_tier.as_str()
                ));
            }
            record.trust_tier = tier;
            Ok(())
        }
        (field, value) => Err(format!(
            "value {value:?} is not applicable to field {}",
            field.as_str()
        )),
    }
}

use crate::correlation::Correlation;
use crate::model::{CorrelatedRecord, Field};
use crate::views::ViewKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of one refresh tick of a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub view: ViewKind,
    pub records: Vec<CorrelatedRecord>,
    pub failed_queries: Vec<String>,
    /// Fields whose values come from an earlier tick because every query
    /// owning them failed this time.
    pub stale_fields: Vec<Field>,
    pub refreshed_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(view: ViewKind, correlation: Correlation, refreshed_at: DateTime<Utc>) -> Self {
        Snapshot {
            view,
            records: correlation.records,
            failed_queries: correlation.failed_queries,
            stale_fields: Vec::new(),
            refreshed_at,
        }
    }

    pub fn partial(&self) -> bool {
        !self.failed_queries.is_empty()
    }

    /// Re-matches a previously selected entity; `None` means the selection
    /// is no longer valid.
    pub fn find(&self, key: &str) -> Option<&CorrelatedRecord> {
        self.records.iter().find(|r| r.key == key)
    }

    fn all_failed(&self) -> bool {
        self.failed_queries.len() >= self.view.queries().len()
    }
}

/// Folds a new tick into the previous one.
///
/// Values from `incoming` win field by field. Fields owned only by queries
/// that failed this tick keep their previous value. Entities keep the order
/// in which they were first seen; entities missing from `incoming` are
/// dropped unless every query of the tick failed, in which case the previous
/// records are kept whole.
pub fn merge(previous: Option<&Snapshot>, incoming: Snapshot) -> Snapshot {
    let Some(previous) = previous else {
        return incoming;
    };
    if previous.view != incoming.view {
        return incoming;
    }
    let stale_fields = incoming.view.fields_owned_by(&incoming.failed_queries);

    if incoming.all_failed() {
        return Snapshot {
            records: previous.records.clone(),
            stale_fields,
            ..incoming
        };
    }

    let mut fresh: HashMap<&str, &CorrelatedRecord> = incoming
        .records
        .iter()
        .map(|r| (r.key.as_str(), r))
        .collect();
    let mut records = Vec::with_capacity(incoming.records.len());
    for old in &previous.records {
        if let Some(new) = fresh.remove(old.key.as_str()) {
            records.push(carry_forward(old, new, &stale_fields));
        }
    }
    for new in &incoming.records {
        if fresh.contains_key(new.key.as_str()) {
            records.push(new.clone());
        }
    }

    Snapshot {
        records,
        stale_fields,
        ..incoming
    }
}

fn carry_forward(old: &CorrelatedRecord, new: &CorrelatedRecord, stale: &[Field]) -> CorrelatedRecord {
    let mut merged = new.clone();
    for field in stale {
        if !merged.is_available(*field) {
            merged.set(*field, old.get(*field).cloned());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;

    fn record(key: &str, cpu: Option<f64>, limit: Option<f64>) -> CorrelatedRecord {
        let mut record = CorrelatedRecord::new(key, &ViewKind::Resources.schema());
        record.set(Field::CpuUsage, cpu.map(FieldValue::Number));
        record.set(Field::CpuLimit, limit.map(FieldValue::Number));
        record
    }

    fn snapshot(records: Vec<CorrelatedRecord>, failed: &[&str]) -> Snapshot {
        Snapshot::new(
            ViewKind::Resources,
            Correlation {
                records,
                failed_queries: failed.iter().map(|q| q.to_string()).collect(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn first_tick_is_taken_as_is() {
        let incoming = snapshot(vec![record("a", Some(1.0), None)], &[]);
        assert_eq!(merge(None, incoming.clone()), incoming);
    }

    #[test]
    fn last_tick_wins_per_field_and_failed_fields_carry_forward() {
        let previous = snapshot(vec![record("a", Some(1.0), Some(2.0))], &[]);
        let incoming = snapshot(vec![record("a", Some(5.0), None)], &["cpu_limit"]);
        let merged = merge(Some(&previous), incoming);
        let a = merged.find("a").unwrap();
        assert_eq!(a.number(Field::CpuUsage), Some(5.0));
        assert_eq!(a.number(Field::CpuLimit), Some(2.0));
        assert_eq!(merged.stale_fields, vec![Field::CpuLimit]);
    }

    #[test]
    fn fields_of_successful_queries_are_not_carried() {
        let previous = snapshot(vec![record("a", Some(1.0), Some(2.0))], &[]);
        let incoming = snapshot(vec![record("a", Some(5.0), None)], &[]);
        let merged = merge(Some(&previous), incoming);
        assert_eq!(merged.find("a").unwrap().number(Field::CpuLimit), None);
    }

    #[test]
    fn entity_order_is_first_seen_and_vanished_entities_drop() {
        let previous = snapshot(
            vec![record("b", None, None), record("gone", None, None), record("a", None, None)],
            &[],
        );
        let incoming = snapshot(
            vec![record("c", None, None), record("a", None, None), record("b", None, None)],
            &[],
        );
        let merged = merge(Some(&previous), incoming);
        let keys: Vec<&str> = merged.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert!(merged.find("gone").is_none());
    }

    #[test]
    fn total_failure_keeps_previous_records() {
        let previous = snapshot(vec![record("a", Some(1.0), Some(2.0))], &[]);
        let failed: Vec<&str> = ViewKind::Resources
            .queries()
            .iter()
            .map(|q| q.spec.name)
            .collect();
        let incoming = snapshot(Vec::new(), &failed);
        let merged = merge(Some(&previous), incoming);
        assert_eq!(merged.records, previous.records);
        assert!(merged.partial());
        assert_eq!(merged.stale_fields, ViewKind::Resources.schema());
    }
}

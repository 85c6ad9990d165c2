use crate::model::{
    pod_name, CorrelatedRecord, EntityKey, Field, FieldValue, RawQueryResult, SeriesRow,
};
use crate::views::{FieldBinding, Join, Reduce, Source};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// One slot of a batch, in priority order. `result` is `None` when the query
/// failed; its fields then stay unavailable.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationInput<'a> {
    pub query: &'a str,
    pub join: Join,
    pub result: Option<&'a RawQueryResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    /// One record per entity, in first-observed order.
    pub records: Vec<CorrelatedRecord>,
    pub failed_queries: Vec<String>,
}

impl Correlation {
    pub fn partial(&self) -> bool {
        !self.failed_queries.is_empty()
    }

    pub fn record(&self, key: &str) -> Option<&CorrelatedRecord> {
        self.records.iter().find(|r| r.key == key)
    }

    pub fn sorted_by_key(mut self) -> Self {
        self.records.sort_by(|a, b| a.key.cmp(&b.key));
        self
    }
}

pub struct Correlator<'a> {
    schema: &'a [Field],
    bindings: &'a [FieldBinding],
}

struct Builder<'a> {
    schema: &'a [Field],
    records: Vec<CorrelatedRecord>,
    index: HashMap<EntityKey, usize>,
    /// Slot that last wrote each field, per record.
    origin: Vec<HashMap<Field, usize>>,
}

impl<'a> Correlator<'a> {
    pub fn new(schema: &'a [Field], bindings: &'a [FieldBinding]) -> Self {
        Correlator { schema, bindings }
    }

    pub fn correlate(&self, inputs: &[CorrelationInput<'_>]) -> Correlation {
        let mut builder = Builder {
            schema: self.schema,
            records: Vec::new(),
            index: HashMap::new(),
            origin: Vec::new(),
        };
        let failed_queries: Vec<String> = inputs
            .iter()
            .filter(|input| input.result.is_none())
            .map(|input| input.query.to_string())
            .collect();

        // Prefix rows never create entities, so every identity slot runs first.
        for join in [Join::Identity, Join::Prefix] {
            for (slot, input) in inputs.iter().enumerate() {
                if input.join != join {
                    continue;
                }
                let Some(result) = input.result else {
                    continue;
                };
                let bindings: Vec<&FieldBinding> = self
                    .bindings
                    .iter()
                    .filter(|b| b.query == input.query)
                    .collect();
                for row in &result.rows {
                    match join {
                        Join::Identity => {
                            let pos = builder.entity(&row.entity);
                            builder.apply_all(pos, slot, &bindings, row);
                        }
                        Join::Prefix => {
                            let matches: Vec<usize> = builder
                                .records
                                .iter()
                                .enumerate()
                                .filter(|(_, record)| child_of(record, row))
                                .map(|(pos, _)| pos)
                                .collect();
                            if matches.is_empty() {
                                debug!(
                                    "`{}` row `{}` matched no entity",
                                    input.query, row.entity
                                );
                            }
                            for pos in matches {
                                builder.apply_all(pos, slot, &bindings, row);
                            }
                        }
                    }
                }
            }
        }

        Correlation {
            records: builder.records,
            failed_queries,
        }
    }
}

impl Builder<'_> {
    fn entity(&mut self, key: &str) -> usize {
        if let Some(pos) = self.index.get(key) {
            return *pos;
        }
        let pos = self.records.len();
        self.records.push(CorrelatedRecord::new(key, self.schema));
        self.origin.push(HashMap::new());
        self.index.insert(key.to_string(), pos);
        pos
    }

    fn apply_all(&mut self, pos: usize, slot: usize, bindings: &[&FieldBinding], row: &SeriesRow) {
        for binding in bindings {
            self.apply(pos, slot, binding, row);
        }
    }

    fn apply(&mut self, pos: usize, slot: usize, binding: &FieldBinding, row: &SeriesRow) {
        let Some(value) = extract(binding, row) else {
            return;
        };
        let record = &mut self.records[pos];
        let origin = &mut self.origin[pos];
        match origin.get(&binding.field).copied() {
            None => {
                record.set(binding.field, Some(value));
                origin.insert(binding.field, slot);
            }
            Some(owner) if owner == slot => {
                let merged = match record.get(binding.field) {
                    Some(existing) => reduce(binding.reduce, existing, value),
                    None => value,
                };
                record.set(binding.field, Some(merged));
            }
            Some(_) if binding.authoritative => {
                record.set(binding.field, Some(value));
                origin.insert(binding.field, slot);
            }
            Some(_) => {}
        }
    }
}

/// `api-5c9d8c6685` owns `default/api-5c9d8c6685-tb55c` but not
/// `default/api-5c9d8c6685x`. Rows scoped to another namespace never match.
fn child_of(record: &CorrelatedRecord, parent: &SeriesRow) -> bool {
    if let (Some(ns), Some(parent_ns)) = (record.text(Field::Namespace), parent.label("namespace"))
    {
        if ns != parent_ns {
            return false;
        }
    }
    is_prefix_key(pod_name(&record.key), &parent.entity)
}

pub fn is_prefix_key(key: &str, parent: &str) -> bool {
    match key.strip_prefix(parent) {
        Some(rest) => rest.is_empty() || rest.starts_with('-'),
        None => false,
    }
}

fn extract(binding: &FieldBinding, row: &SeriesRow) -> Option<FieldValue> {
    match binding.source {
        Source::Sample => row.latest_value().map(FieldValue::Number),
        Source::Flag => row.latest_value().map(|v| FieldValue::Flag(v > 0.0)),
        Source::Label(name) => {
            let label = row.label(name).filter(|v| !v.is_empty())?.to_string();
            match binding.reduce {
                Reduce::Collect => Some(FieldValue::List(vec![label])),
                _ => Some(FieldValue::Text(label)),
            }
        }
    }
}

fn reduce(how: Reduce, existing: &FieldValue, incoming: FieldValue) -> FieldValue {
    match (how, existing, incoming) {
        (Reduce::Sum, FieldValue::Number(a), FieldValue::Number(b)) => FieldValue::Number(a + b),
        (Reduce::Max, FieldValue::Number(a), FieldValue::Number(b)) => FieldValue::Number(a.max(b)),
        (Reduce::All, FieldValue::Flag(a), FieldValue::Flag(b)) => FieldValue::Flag(*a && b),
        (Reduce::Collect, FieldValue::List(items), FieldValue::List(more)) => {
            let mut merged = items.clone();
            for item in more {
                if !merged.contains(&item) {
                    merged.push(item);
                }
            }
            FieldValue::List(merged)
        }
        (_, existing, _) => existing.clone(),
    }
}

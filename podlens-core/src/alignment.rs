use crate::model::{EntityKey, RawQueryResult, SeriesRow};
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How the cross-entity mean treats an entity without a value at an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanPolicy {
    /// Average only the entities that reported a value.
    #[default]
    PresentOnly,
    /// Missing values count as 0, pulling the mean down.
    ZeroFill,
}

/// Several entities on one shared time axis. Every value sequence has the
/// length of `timestamps_unix`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignedSeries {
    pub timestamps_unix: Vec<i64>,
    pub timestamps_readable: Vec<String>,
    pub per_entity: BTreeMap<EntityKey, Vec<Option<f64>>>,
}

impl AlignedSeries {
    /// Aligns `primary` on the time axis of its first non-empty row, or on
    /// `fallback`'s when `primary` has no data at all.
    pub fn align(primary: &RawQueryResult, fallback: Option<&RawQueryResult>) -> Self {
        let axis = reference_axis(primary)
            .or_else(|| fallback.and_then(reference_axis))
            .unwrap_or_default();
        Self::on_axis(axis, &primary.rows)
    }

    pub fn on_axis(axis: Vec<i64>, rows: &[SeriesRow]) -> Self {
        let mut per_entity: BTreeMap<EntityKey, Vec<Option<f64>>> = BTreeMap::new();
        for row in rows {
            let by_ts: HashMap<i64, Option<f64>> =
                row.points.iter().map(|p| (p.timestamp, p.value)).collect();
            let values = per_entity
                .entry(row.entity.clone())
                .or_insert_with(|| vec![None; axis.len()]);
            for (slot, ts) in values.iter_mut().zip(&axis) {
                if slot.is_none() {
                    *slot = by_ts.get(ts).copied().flatten();
                }
            }
        }
        AlignedSeries {
            timestamps_readable: axis.iter().map(|ts| readable(*ts)).collect(),
            timestamps_unix: axis,
            per_entity,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps_unix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps_unix.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.per_entity.keys().map(|k| k.as_str())
    }

    /// Mean across entities at every index; `None` where nothing contributes.
    pub fn mean(&self, policy: MeanPolicy) -> Vec<Option<f64>> {
        (0..self.len())
            .map(|idx| {
                let mut sum = 0.0;
                let mut count = 0usize;
                for values in self.per_entity.values() {
                    match (values.get(idx).copied().flatten(), policy) {
                        (Some(v), _) => {
                            sum += v;
                            count += 1;
                        }
                        (None, MeanPolicy::ZeroFill) => count += 1,
                        (None, MeanPolicy::PresentOnly) => {}
                    }
                }
                (count > 0).then(|| sum / count as f64)
            })
            .collect()
    }

    /// The selected entity's series, or the mean when nothing is selected.
    /// An entity missing from this metric yields an all-unavailable series.
    pub fn select(&self, entity: Option<&str>, policy: MeanPolicy) -> Vec<Option<f64>> {
        match entity {
            Some(key) => self
                .per_entity
                .get(key)
                .cloned()
                .unwrap_or_else(|| vec![None; self.len()]),
            None => self.mean(policy),
        }
    }

    /// Applies the same stride to the axis and to every entity.
    pub fn downsampled(&self, target: usize) -> Self {
        let picks = downsample_indices(self.len(), target);
        let take = |values: &[Option<f64>]| -> Vec<Option<f64>> {
            picks.iter().map(|i| values[*i]).collect()
        };
        AlignedSeries {
            timestamps_unix: picks.iter().map(|i| self.timestamps_unix[*i]).collect(),
            timestamps_readable: picks
                .iter()
                .map(|i| self.timestamps_readable[*i].clone())
                .collect(),
            per_entity: self
                .per_entity
                .iter()
                .map(|(k, v)| (k.clone(), take(v.as_slice())))
                .collect(),
        }
    }
}

fn reference_axis(result: &RawQueryResult) -> Option<Vec<i64>> {
    result
        .rows
        .iter()
        .find(|row| !row.points.is_empty())
        .map(|row| row.points.iter().map(|p| p.timestamp).collect())
}

/// Local wall-clock `HH:MM:SS`.
pub fn readable(ts: i64) -> String {
    match Local.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

/// Indices kept when bounding `len` values to `target`: the first index, then
/// every `len / target`-th, until `target` picks.
pub fn downsample_indices(len: usize, target: usize) -> Vec<usize> {
    if len <= target {
        return (0..len).collect();
    }
    if target == 0 {
        return Vec::new();
    }
    let stride = len / target;
    (0..target).map(|n| n * stride).collect()
}

pub fn downsample<T: Clone>(values: &[T], target: usize) -> Vec<T> {
    downsample_indices(values.len(), target)
        .into_iter()
        .map(|i| values[i].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SeriesPoint;

    fn row(entity: &str, points: &[(i64, Option<f64>)]) -> SeriesRow {
        SeriesRow {
            entity: entity.to_string(),
            metric: "cpu".to_string(),
            labels: Default::default(),
            points: points
                .iter()
                .map(|(ts, v)| SeriesPoint::new(*ts, *v))
                .collect(),
        }
    }

    #[test]
    fn shorter_series_are_padded_as_unavailable() {
        let result = RawQueryResult::new(
            "cpu",
            vec![
                row("a", &[(10, Some(1.0)), (20, Some(2.0)), (30, Some(3.0))]),
                row("b", &[(20, Some(5.0))]),
            ],
        );
        let aligned = AlignedSeries::align(&result, None);
        assert_eq!(aligned.timestamps_unix, vec![10, 20, 30]);
        assert_eq!(aligned.per_entity["b"], vec![None, Some(5.0), None]);
        for values in aligned.per_entity.values() {
            assert_eq!(values.len(), aligned.timestamps_unix.len());
        }
        assert_eq!(aligned.timestamps_readable.len(), 3);
    }

    #[test]
    fn empty_metric_borrows_fallback_axis() {
        let latency = RawQueryResult::new("latency", vec![row("a", &[])]);
        let cpu = RawQueryResult::new("cpu", vec![row("a", &[(5, Some(1.0)), (10, Some(1.0))])]);
        let aligned = AlignedSeries::align(&latency, Some(&cpu));
        assert_eq!(aligned.timestamps_unix, vec![5, 10]);
        assert_eq!(aligned.per_entity["a"], vec![None, None]);
    }

    #[test]
    fn mean_policies_differ_only_on_gaps() {
        let result = RawQueryResult::new(
            "cpu",
            vec![
                row("a", &[(1, Some(2.0)), (2, Some(4.0))]),
                row("b", &[(1, Some(4.0))]),
            ],
        );
        let aligned = AlignedSeries::align(&result, None);
        assert_eq!(aligned.mean(MeanPolicy::PresentOnly), vec![Some(3.0), Some(4.0)]);
        assert_eq!(aligned.mean(MeanPolicy::ZeroFill), vec![Some(3.0), Some(2.0)]);
    }

    #[test]
    fn select_unknown_entity_is_unavailable() {
        let result = RawQueryResult::new("cpu", vec![row("a", &[(1, Some(2.0))])]);
        let aligned = AlignedSeries::align(&result, None);
        assert_eq!(aligned.select(Some("zzz"), MeanPolicy::default()), vec![None]);
        assert_eq!(aligned.select(Some("a"), MeanPolicy::default()), vec![Some(2.0)]);
    }

    #[test]
    fn downsample_keeps_short_sequences() {
        assert_eq!(downsample(&[1, 2, 3], 3), vec![1, 2, 3]);
        assert_eq!(downsample(&[1, 2], 5), vec![1, 2]);
    }

    #[test]
    fn downsample_strides_from_first_element() {
        let values: Vec<u32> = (0..10).collect();
        assert_eq!(downsample(&values, 3), vec![0, 3, 6]);
        assert_eq!(downsample(&values, 4), vec![0, 2, 4, 6]);
        assert_eq!(downsample_indices(7, 0), Vec::<usize>::new());
    }

    #[test]
    fn downsampled_series_keeps_invariant() {
        let points: Vec<(i64, Option<f64>)> = (0..50).map(|i| (i * 60, Some(i as f64))).collect();
        let result = RawQueryResult::new("cpu", vec![row("a", &points), row("b", &points[..10])]);
        let small = AlignedSeries::align(&result, None).downsampled(20);
        assert_eq!(small.len(), 20);
        assert_eq!(small.timestamps_unix[0], 0);
        assert_eq!(small.timestamps_unix[1], 120);
        for values in small.per_entity.values() {
            assert_eq!(values.len(), 20);
        }
    }
}

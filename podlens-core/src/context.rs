//! Context handed to the text-generation assistant alongside the operator's
//! question. Series are bounded to `max_points` samples each; status and
//! resource rows are passed whole, one per matching entity.

use crate::alignment::{downsample, MeanPolicy};
use crate::catalog::RenderParams;
use crate::dashboard::{DashboardCoordinator, HistoryRequest, HistoryView};
use crate::model::{render_value, FieldValue};
use crate::prelude::*;
use crate::snapshot::Snapshot;
use crate::validation::{LatencyDirection, Level, MetricKind, RangeParams, TimeWindow};
use crate::views::{HistoryMetric, ViewKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPoint {
    pub time: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesContext {
    pub metric: String,
    /// `None` for the cross-entity mean.
    pub entity: Option<String>,
    pub points: Vec<ContextPoint>,
}

impl SeriesContext {
    pub fn from_history(view: &HistoryView, max_points: usize) -> Self {
        let points: Vec<ContextPoint> = view
            .series
            .iter()
            .enumerate()
            .map(|(i, value)| ContextPoint {
                time: view
                    .aligned
                    .timestamps_readable
                    .get(i)
                    .cloned()
                    .unwrap_or_default(),
                value: render_value(value.map(FieldValue::Number).as_ref()),
            })
            .collect();
        SeriesContext {
            metric: view.metric.clone(),
            entity: view.selected.clone(),
            points: downsample(&points, max_points),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantContext {
    pub entity: Option<String>,
    pub namespace: Option<String>,
    pub cpu_history: SeriesContext,
    pub memory_history: SeriesContext,
    pub latency_history: SeriesContext,
    /// Pod status rows with unavailable fields rendered as "N/A".
    pub status: Vec<BTreeMap<String, String>>,
    pub requests_limits: Vec<BTreeMap<String, String>>,
}

impl AssistantContext {
    pub fn new(
        entity: Option<String>,
        namespace: Option<String>,
        histories: [&HistoryView; 3],
        status: &Snapshot,
        resources: &Snapshot,
        max_points: usize,
    ) -> Self {
        let [cpu, memory, latency] = histories;
        let rows = |snapshot: &Snapshot| -> Vec<BTreeMap<String, String>> {
            snapshot
                .records
                .iter()
                .filter(|r| entity.as_deref().is_none_or(|e| r.key == e))
                .map(|r| r.rendered())
                .collect()
        };
        AssistantContext {
            cpu_history: SeriesContext::from_history(cpu, max_points),
            memory_history: SeriesContext::from_history(memory, max_points),
            latency_history: SeriesContext::from_history(latency, max_points),
            status: rows(status),
            requests_limits: rows(resources),
            entity,
            namespace,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What the assistant should look at.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    pub entity: Option<String>,
    pub namespace: Option<String>,
    pub window: TimeWindow,
    pub now: f64,
    pub span_secs: u64,
    pub step_secs: u64,
    pub max_points: usize,
}

/// Refreshes the pod status and pod-level resources views and pulls cpu,
/// memory and combined latency history for the trailing span.
pub async fn gather(
    coordinator: &DashboardCoordinator,
    request: &ContextRequest,
) -> Result<AssistantContext> {
    let params = RenderParams::new(Level::Pod, request.window, request.namespace.clone());
    let (status, resources) = futures::join!(
        coordinator.refresh(ViewKind::PodStatus, &params),
        coordinator.refresh(ViewKind::Resources, &params),
    );

    let range = RangeParams::trailing(request.now, request.span_secs, request.step_secs)?;
    let history = |metric| HistoryRequest {
        metric,
        level: Level::Pod,
        namespace: request.namespace.clone(),
        range,
        entity: request.entity.clone(),
        mean_policy: MeanPolicy::PresentOnly,
    };
    let cpu_request = history(HistoryMetric::Usage {
        metric: MetricKind::Cpu,
        relative: false,
    });
    let memory_request = history(HistoryMetric::Usage {
        metric: MetricKind::Memory,
        relative: false,
    });
    let latency_request = history(HistoryMetric::Latency {
        direction: LatencyDirection::Combined,
    });
    let (cpu, memory, latency) = futures::try_join!(
        coordinator.history(&cpu_request),
        coordinator.history(&memory_request),
        coordinator.history(&latency_request),
    )?;

    Ok(AssistantContext::new(
        request.entity.clone(),
        request.namespace.clone(),
        [&cpu, &memory, &latency],
        &status,
        &resources,
        request.max_points,
    ))
}

//! PromQL definitions behind every dashboard view.
//!
//! Templates use three markers: `$BY` (grouping clause of the aggregation
//! level), `$WINDOW` (rate / lookback window) and `$NS` (extra namespace
//! matcher, appended after an existing matcher inside the braces).

use crate::validation::{Level, RangeParams, TimeWindow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Entity key comes from the label named by the render level.
    Level,
    /// Entity key comes from a fixed label regardless of level.
    Label(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySpec {
    pub name: &'static str,
    pub template: &'static str,
    pub key: KeySource,
}

/// A rendered query ready for the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,
    pub expr: String,
    /// `None` keys every row with [`crate::model::CLUSTER_ENTITY_KEY`].
    pub key_label: Option<String>,
    pub range: Option<RangeParams>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderParams {
    pub level: Level,
    pub window: TimeWindow,
    pub namespace: Option<String>,
}

impl RenderParams {
    pub fn new(level: Level, window: TimeWindow, namespace: Option<String>) -> Self {
        RenderParams {
            level,
            window,
            namespace,
        }
    }
}

impl QuerySpec {
    pub fn render(&self, params: &RenderParams) -> MetricQuery {
        let ns = match &params.namespace {
            Some(ns) => format!(",namespace=\"{ns}\""),
            None => String::new(),
        };
        let expr = self
            .template
            .replace("$BY", params.level.group_by())
            .replace("$WINDOW", &params.window.to_string())
            .replace("$NS", &ns);
        let key_label = match self.key {
            KeySource::Level => params.level.key_label().map(str::to_string),
            KeySource::Label(label) => Some(label.to_string()),
        };
        MetricQuery {
            name: self.name.to_string(),
            expr,
            key_label,
            range: None,
        }
    }

    pub fn render_range(&self, params: &RenderParams, range: RangeParams) -> MetricQuery {
        MetricQuery {
            range: Some(range),
            ..self.render(params)
        }
    }
}

const fn pod_query(name: &'static str, template: &'static str) -> QuerySpec {
    QuerySpec {
        name,
        template,
        key: KeySource::Label("pod"),
    }
}

const fn level_query(name: &'static str, template: &'static str) -> QuerySpec {
    QuerySpec {
        name,
        template,
        key: KeySource::Level,
    }
}

// Pod status
pub const POD_PHASE: QuerySpec = pod_query(
    "pod_phase",
    r#"kube_pod_status_phase{pod!=""$NS} == 1"#,
);
pub const CONTAINER_READY: QuerySpec = pod_query(
    "container_ready",
    r#"kube_pod_container_status_ready{pod!=""$NS}"#,
);
pub const POD_READY: QuerySpec = pod_query(
    "pod_ready",
    r#"kube_pod_status_ready{condition="true"$NS}"#,
);
pub const CONTAINER_INFO: QuerySpec = pod_query(
    "container_info",
    r#"kube_pod_container_info{pod!=""$NS}"#,
);
pub const RESTARTS: QuerySpec = pod_query(
    "restarts",
    r#"sum by (pod, namespace) (kube_pod_container_status_restarts_total{pod!=""$NS})"#,
);
pub const POD_INFO: QuerySpec = pod_query("pod_info", r#"kube_pod_info{pod!=""$NS}"#);
pub const REPLICASET_OWNER: QuerySpec = QuerySpec {
    name: "replicaset_owner",
    template: r#"kube_replicaset_owner{owner_kind="Deployment"$NS}"#,
    key: KeySource::Label("replicaset"),
};

// Requests and limits
pub const CPU_REQUEST: QuerySpec = level_query(
    "cpu_request",
    r#"sum $BY (kube_pod_container_resource_requests{resource="cpu"$NS})"#,
);
pub const CPU_LIMIT: QuerySpec = level_query(
    "cpu_limit",
    r#"sum $BY (kube_pod_container_resource_limits{resource="cpu"$NS})"#,
);
pub const MEMORY_REQUEST: QuerySpec = level_query(
    "memory_request",
    r#"sum $BY (kube_pod_container_resource_requests{resource="memory"$NS})"#,
);
pub const MEMORY_LIMIT: QuerySpec = level_query(
    "memory_limit",
    r#"sum $BY (kube_pod_container_resource_limits{resource="memory"$NS})"#,
);

// Usage, absolute and relative to requests / limits
pub const CPU_USAGE: QuerySpec = level_query(
    "cpu_usage",
    r#"sum $BY (rate(container_cpu_usage_seconds_total{container!=""$NS}[$WINDOW]))"#,
);
pub const MEMORY_USAGE: QuerySpec = level_query(
    "memory_usage",
    r#"sum $BY (avg_over_time(container_memory_working_set_bytes{container!=""$NS}[$WINDOW]))"#,
);
pub const CPU_REQUEST_RATIO: QuerySpec = level_query(
    "cpu_request_ratio",
    r#"sum $BY (rate(container_cpu_usage_seconds_total{container!=""$NS}[$WINDOW])) / sum $BY (kube_pod_container_resource_requests{resource="cpu"$NS})"#,
);
pub const CPU_LIMIT_RATIO: QuerySpec = level_query(
    "cpu_limit_ratio",
    r#"sum $BY (rate(container_cpu_usage_seconds_total{container!=""$NS}[$WINDOW])) / sum $BY (kube_pod_container_resource_limits{resource="cpu"$NS})"#,
);
pub const MEMORY_REQUEST_RATIO: QuerySpec = level_query(
    "memory_request_ratio",
    r#"sum $BY (avg_over_time(container_memory_working_set_bytes{container!=""$NS}[$WINDOW])) / sum $BY (kube_pod_container_resource_requests{resource="memory"$NS})"#,
);
pub const MEMORY_LIMIT_RATIO: QuerySpec = level_query(
    "memory_limit_ratio",
    r#"sum $BY (avg_over_time(container_memory_working_set_bytes{container!=""$NS}[$WINDOW])) / sum $BY (kube_pod_container_resource_limits{resource="memory"$NS})"#,
);

// Request latency (p95, milliseconds) from the mesh sidecars
pub const INBOUND_LATENCY: QuerySpec = pod_query(
    "inbound_latency",
    r#"histogram_quantile(0.95, sum by (le, pod, namespace) (rate(istio_request_duration_milliseconds_bucket{reporter="destination"$NS}[$WINDOW])))"#,
);
pub const OUTBOUND_LATENCY: QuerySpec = pod_query(
    "outbound_latency",
    r#"histogram_quantile(0.95, sum by (le, pod, namespace) (rate(istio_request_duration_milliseconds_bucket{reporter="source"$NS}[$WINDOW])))"#,
);
pub const COMBINED_LATENCY: QuerySpec = pod_query(
    "combined_latency",
    r#"histogram_quantile(0.95, sum by (le, pod, namespace) (rate(istio_request_duration_milliseconds_bucket{pod!=""$NS}[$WINDOW])))"#,
);
pub const PEAK_INBOUND_LATENCY: QuerySpec = pod_query(
    "peak_inbound_latency",
    r#"max_over_time(histogram_quantile(0.95, sum by (le, pod, namespace) (rate(istio_request_duration_milliseconds_bucket{reporter="destination"$NS}[1m])))[$WINDOW:1m])"#,
);
pub const PEAK_OUTBOUND_LATENCY: QuerySpec = pod_query(
    "peak_outbound_latency",
    r#"max_over_time(histogram_quantile(0.95, sum by (le, pod, namespace) (rate(istio_request_duration_milliseconds_bucket{reporter="source"$NS}[1m])))[$WINDOW:1m])"#,
);
pub const PEAK_COMBINED_LATENCY: QuerySpec = pod_query(
    "peak_combined_latency",
    r#"max_over_time(histogram_quantile(0.95, sum by (le, pod, namespace) (rate(istio_request_duration_milliseconds_bucket{pod!=""$NS}[1m])))[$WINDOW:1m])"#,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_level_window_and_namespace() {
        let params = RenderParams::new(
            Level::Namespace,
            TimeWindow::parse("10m").unwrap(),
            Some("team-a".to_string()),
        );
        let query = CPU_USAGE.render(&params);
        assert_eq!(
            query.expr,
            r#"sum by (namespace) (rate(container_cpu_usage_seconds_total{container!="",namespace="team-a"}[10m]))"#
        );
        assert_eq!(query.key_label.as_deref(), Some("namespace"));
        assert_eq!(query.name, "cpu_usage");
        assert!(query.range.is_none());
    }

    #[test]
    fn cluster_level_has_no_key_label_and_no_grouping() {
        let params = RenderParams::new(Level::Cluster, TimeWindow::default(), None);
        let query = MEMORY_REQUEST.render(&params);
        assert_eq!(
            query.expr,
            r#"sum  (kube_pod_container_resource_requests{resource="memory"})"#
        );
        assert_eq!(query.key_label, None);
    }

    #[test]
    fn fixed_label_queries_ignore_level() {
        let params = RenderParams::new(Level::Node, TimeWindow::default(), None);
        assert_eq!(
            REPLICASET_OWNER.render(&params).key_label.as_deref(),
            Some("replicaset")
        );
        assert_eq!(POD_PHASE.render(&params).key_label.as_deref(), Some("pod"));
    }

    #[test]
    fn render_range_attaches_range() {
        let range = RangeParams::new(100.0, 200.0, 10).unwrap();
        let query = INBOUND_LATENCY.render_range(&RenderParams::default(), range);
        assert_eq!(query.range, Some(range));
        assert!(!query.expr.contains('$'));
    }
}

use crate::catalog::{self, MetricQuery, QuerySpec, RenderParams};
use crate::model::Field;
use crate::validation::{LatencyDirection, Level, MetricKind};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// How a query's rows find their entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// Row key is the entity key.
    Identity,
    /// Row key is a parent name; every known entity named `<parent>-...`
    /// receives the row's fields. Never creates entities.
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Sample,
    /// Sample value > 0.
    Flag,
    Label(&'static str),
}

/// Combines several rows of the same query that land on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    First,
    Sum,
    Max,
    All,
    Collect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldBinding {
    pub field: Field,
    pub query: &'static str,
    pub source: Source,
    pub reduce: Reduce,
    /// Overrides a value set by an earlier query.
    pub authoritative: bool,
}

const fn bind(field: Field, query: &'static str, source: Source) -> FieldBinding {
    FieldBinding {
        field,
        query,
        source,
        reduce: Reduce::First,
        authoritative: false,
    }
}

const fn sample(field: Field, query: &QuerySpec) -> FieldBinding {
    bind(field, query.name, Source::Sample)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewQuery {
    pub spec: QuerySpec,
    pub join: Join,
}

const fn identity(spec: QuerySpec) -> ViewQuery {
    ViewQuery {
        spec,
        join: Join::Identity,
    }
}

#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub query: MetricQuery,
    pub join: Join,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ViewKind {
    PodStatus,
    Resources,
    Latency,
}

static POD_STATUS_QUERIES: &[ViewQuery] = &[
    identity(catalog::POD_PHASE),
    identity(catalog::CONTAINER_INFO),
    identity(catalog::CONTAINER_READY),
    identity(catalog::POD_READY),
    identity(catalog::RESTARTS),
    identity(catalog::POD_INFO),
    ViewQuery {
        spec: catalog::REPLICASET_OWNER,
        join: Join::Prefix,
    },
];

static POD_STATUS_BINDINGS: &[FieldBinding] = &[
    bind(Field::Namespace, catalog::POD_PHASE.name, Source::Label("namespace")),
    bind(Field::Phase, catalog::POD_PHASE.name, Source::Label("phase")),
    FieldBinding {
        reduce: Reduce::Collect,
        ..bind(
            Field::Containers,
            catalog::CONTAINER_INFO.name,
            Source::Label("container"),
        )
    },
    bind(
        Field::Namespace,
        catalog::CONTAINER_INFO.name,
        Source::Label("namespace"),
    ),
    // Per-container readiness approximates the pod until the pod condition arrives.
    FieldBinding {
        reduce: Reduce::All,
        ..bind(Field::Ready, catalog::CONTAINER_READY.name, Source::Flag)
    },
    FieldBinding {
        authoritative: true,
        ..bind(Field::Ready, catalog::POD_READY.name, Source::Flag)
    },
    FieldBinding {
        reduce: Reduce::Sum,
        ..sample(Field::Restarts, &catalog::RESTARTS)
    },
    bind(Field::Node, catalog::POD_INFO.name, Source::Label("node")),
    bind(Field::PodIp, catalog::POD_INFO.name, Source::Label("pod_ip")),
    bind(Field::Cluster, catalog::POD_INFO.name, Source::Label("cluster")),
    bind(Field::Namespace, catalog::POD_INFO.name, Source::Label("namespace")),
    bind(
        Field::Deployment,
        catalog::REPLICASET_OWNER.name,
        Source::Label("owner_name"),
    ),
];

static RESOURCES_QUERIES: &[ViewQuery] = &[
    identity(catalog::CPU_REQUEST),
    identity(catalog::CPU_LIMIT),
    identity(catalog::MEMORY_REQUEST),
    identity(catalog::MEMORY_LIMIT),
    identity(catalog::CPU_USAGE),
    identity(catalog::MEMORY_USAGE),
    identity(catalog::CPU_REQUEST_RATIO),
    identity(catalog::CPU_LIMIT_RATIO),
    identity(catalog::MEMORY_REQUEST_RATIO),
    identity(catalog::MEMORY_LIMIT_RATIO),
];

static RESOURCES_BINDINGS: &[FieldBinding] = &[
    bind(Field::Namespace, catalog::CPU_REQUEST.name, Source::Label("namespace")),
    sample(Field::CpuRequest, &catalog::CPU_REQUEST),
    sample(Field::CpuLimit, &catalog::CPU_LIMIT),
    sample(Field::MemoryRequest, &catalog::MEMORY_REQUEST),
    sample(Field::MemoryLimit, &catalog::MEMORY_LIMIT),
    bind(Field::Namespace, catalog::CPU_USAGE.name, Source::Label("namespace")),
    sample(Field::CpuUsage, &catalog::CPU_USAGE),
    sample(Field::MemoryUsage, &catalog::MEMORY_USAGE),
    sample(Field::CpuRequestRatio, &catalog::CPU_REQUEST_RATIO),
    sample(Field::CpuLimitRatio, &catalog::CPU_LIMIT_RATIO),
    sample(Field::MemoryRequestRatio, &catalog::MEMORY_REQUEST_RATIO),
    sample(Field::MemoryLimitRatio, &catalog::MEMORY_LIMIT_RATIO),
];

static LATENCY_QUERIES: &[ViewQuery] = &[
    identity(catalog::INBOUND_LATENCY),
    identity(catalog::OUTBOUND_LATENCY),
    identity(catalog::COMBINED_LATENCY),
    identity(catalog::PEAK_INBOUND_LATENCY),
    identity(catalog::PEAK_OUTBOUND_LATENCY),
    identity(catalog::PEAK_COMBINED_LATENCY),
];

static LATENCY_BINDINGS: &[FieldBinding] = &[
    bind(
        Field::Namespace,
        catalog::INBOUND_LATENCY.name,
        Source::Label("namespace"),
    ),
    sample(Field::InboundLatency, &catalog::INBOUND_LATENCY),
    bind(
        Field::Namespace,
        catalog::OUTBOUND_LATENCY.name,
        Source::Label("namespace"),
    ),
    sample(Field::OutboundLatency, &catalog::OUTBOUND_LATENCY),
    sample(Field::CombinedLatency, &catalog::COMBINED_LATENCY),
    sample(Field::PeakInboundLatency, &catalog::PEAK_INBOUND_LATENCY),
    sample(Field::PeakOutboundLatency, &catalog::PEAK_OUTBOUND_LATENCY),
    sample(Field::PeakCombinedLatency, &catalog::PEAK_COMBINED_LATENCY),
];

impl ViewKind {
    /// Queries in priority order.
    pub fn queries(self) -> &'static [ViewQuery] {
        match self {
            ViewKind::PodStatus => POD_STATUS_QUERIES,
            ViewKind::Resources => RESOURCES_QUERIES,
            ViewKind::Latency => LATENCY_QUERIES,
        }
    }

    pub fn bindings(self) -> &'static [FieldBinding] {
        match self {
            ViewKind::PodStatus => POD_STATUS_BINDINGS,
            ViewKind::Resources => RESOURCES_BINDINGS,
            ViewKind::Latency => LATENCY_BINDINGS,
        }
    }

    /// Fields every record of this view carries.
    pub fn schema(self) -> Vec<Field> {
        let mut fields: Vec<Field> = Vec::new();
        for binding in self.bindings() {
            if !fields.contains(&binding.field) {
                fields.push(binding.field);
            }
        }
        fields
    }

    /// Only the resources view aggregates above pods.
    pub fn supports_levels(self) -> bool {
        matches!(self, ViewKind::Resources)
    }

    pub fn plan(self, params: &RenderParams) -> Vec<PlannedQuery> {
        self.queries()
            .iter()
            .map(|vq| PlannedQuery {
                query: vq.spec.render(params),
                join: vq.join,
            })
            .collect()
    }

    /// Fields whose value comes only from the named queries.
    pub fn fields_owned_by(self, queries: &[String]) -> Vec<Field> {
        self.schema()
            .into_iter()
            .filter(|field| {
                self.bindings()
                    .iter()
                    .filter(|b| b.field == *field)
                    .all(|b| queries.iter().any(|q| q == b.query))
            })
            .collect()
    }
}

/// Historical series behind the usage and latency charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryMetric {
    /// Absolute usage, or usage relative to the request when `relative`.
    Usage { metric: MetricKind, relative: bool },
    Latency { direction: LatencyDirection },
}

impl HistoryMetric {
    pub fn primary(self) -> QuerySpec {
        match self {
            HistoryMetric::Usage {
                metric: MetricKind::Cpu,
                relative: false,
            } => catalog::CPU_USAGE,
            HistoryMetric::Usage {
                metric: MetricKind::Cpu,
                relative: true,
            } => catalog::CPU_REQUEST_RATIO,
            HistoryMetric::Usage {
                metric: MetricKind::Memory,
                relative: false,
            } => catalog::MEMORY_USAGE,
            HistoryMetric::Usage {
                metric: MetricKind::Memory,
                relative: true,
            } => catalog::MEMORY_REQUEST_RATIO,
            HistoryMetric::Latency {
                direction: LatencyDirection::Inbound,
            } => catalog::INBOUND_LATENCY,
            HistoryMetric::Latency {
                direction: LatencyDirection::Outbound,
            } => catalog::OUTBOUND_LATENCY,
            HistoryMetric::Latency {
                direction: LatencyDirection::Combined,
            } => catalog::COMBINED_LATENCY,
        }
    }

    /// Supplies the time axis when the primary metric returned nothing, e.g.
    /// a pod with usage data but no mesh traffic.
    pub fn fallback(self) -> QuerySpec {
        if self.primary() == catalog::CPU_USAGE {
            catalog::MEMORY_USAGE
        } else {
            catalog::CPU_USAGE
        }
    }

    /// Latency is only recorded per pod.
    pub fn effective_level(self, requested: Level) -> Level {
        match self {
            HistoryMetric::Usage { .. } => requested,
            HistoryMetric::Latency { .. } => Level::Pod,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn every_binding_names_a_query_of_its_view() {
        for view in ViewKind::iter() {
            for binding in view.bindings() {
                assert!(
                    view.queries().iter().any(|q| q.spec.name == binding.query),
                    "{view}: binding for {} names unknown query {}",
                    binding.field,
                    binding.query
                );
            }
        }
    }

    #[test]
    fn prefix_joins_come_last() {
        for view in ViewKind::iter() {
            let joins: Vec<Join> = view.queries().iter().map(|q| q.join).collect();
            if let Some(first_prefix) = joins.iter().position(|j| *j == Join::Prefix) {
                assert!(joins[first_prefix..].iter().all(|j| *j == Join::Prefix));
            }
        }
    }

    #[test]
    fn pod_status_schema_has_deployment_and_readiness() {
        let schema = ViewKind::PodStatus.schema();
        assert!(schema.contains(&Field::Deployment));
        assert!(schema.contains(&Field::Ready));
        assert_eq!(
            schema.iter().filter(|f| **f == Field::Namespace).count(),
            1
        );
    }

    #[test]
    fn history_fallback_differs_from_primary() {
        let metrics = [
            HistoryMetric::Usage {
                metric: MetricKind::Cpu,
                relative: false,
            },
            HistoryMetric::Usage {
                metric: MetricKind::Memory,
                relative: true,
            },
            HistoryMetric::Latency {
                direction: LatencyDirection::Inbound,
            },
        ];
        for metric in metrics {
            assert_ne!(metric.primary().name, metric.fallback().name);
        }
        let latency = HistoryMetric::Latency {
            direction: LatencyDirection::Combined,
        };
        assert_eq!(latency.effective_level(Level::Node), Level::Pod);
    }

    #[test]
    fn fields_owned_by_requires_every_contributing_query() {
        let owned = ViewKind::PodStatus.fields_owned_by(&["pod_ready".to_string()]);
        assert!(owned.is_empty());
        let owned = ViewKind::PodStatus
            .fields_owned_by(&["pod_ready".to_string(), "container_ready".to_string()]);
        assert_eq!(owned, vec![Field::Ready]);
        let owned = ViewKind::Resources.fields_owned_by(&["cpu_limit".to_string()]);
        assert_eq!(owned, vec![Field::CpuLimit]);
    }
}

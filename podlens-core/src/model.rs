use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum_macros::{AsRefStr, Display, EnumIter};

/// Identifies a monitored unit: a pod, a namespace, a node or the synthetic
/// cluster key, depending on the aggregation level. Pods are keyed
/// `<namespace>/<pod>` whenever the namespace is known.
pub type EntityKey = String;

/// Key used for every row when a query aggregates the whole cluster.
pub const CLUSTER_ENTITY_KEY: &str = "cluster";

/// Pod names are only unique within a namespace.
pub fn pod_entity_key(namespace: Option<&str>, pod: &str) -> EntityKey {
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => format!("{ns}/{pod}"),
        None => pod.to_string(),
    }
}

/// Pod name part of a pod key. Keys without a namespace come back as is.
pub fn pod_name(key: &str) -> &str {
    key.rsplit_once('/').map_or(key, |(_, pod)| pod)
}

/// One sample. `value` is `None` when the backend reported nothing usable,
/// which is not the same thing as a measured zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: i64,
    pub value: Option<f64>,
}

impl SeriesPoint {
    pub fn new(timestamp: i64, value: Option<f64>) -> Self {
        SeriesPoint { timestamp, value }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRow {
    pub entity: EntityKey,
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub points: Vec<SeriesPoint>,
}

impl SeriesRow {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(|v| v.as_str())
    }

    /// Most recent sample value, which is the only one an instant query has.
    pub fn latest_value(&self) -> Option<f64> {
        self.points.last().and_then(|p| p.value)
    }
}

/// Rows returned by one query execution, in backend order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawQueryResult {
    pub query: String,
    pub rows: Vec<SeriesRow>,
}

impl RawQueryResult {
    pub fn new(query: impl Into<String>, rows: Vec<SeriesRow>) -> Self {
        RawQueryResult {
            query: query.into(),
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.points.is_empty())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Field {
    // Pod status
    Namespace,
    Phase,
    Ready,
    Containers,
    Restarts,
    Node,
    PodIp,
    Cluster,
    Deployment,

    // Requests, limits and usage
    CpuRequest,
    CpuLimit,
    MemoryRequest,
    MemoryLimit,
    CpuUsage,
    MemoryUsage,
    CpuRequestRatio,
    CpuLimitRatio,
    MemoryRequestRatio,
    MemoryLimitRatio,

    // Latency, milliseconds
    InboundLatency,
    OutboundLatency,
    CombinedLatency,
    PeakInboundLatency,
    PeakOutboundLatency,
    PeakCombinedLatency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Flag(bool),
    Text(String),
    List(Vec<String>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            FieldValue::Number(n) => write!(f, "{n:.4}"),
            FieldValue::Flag(b) => write!(f, "{b}"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::List(items) => write!(f, "{}", items.join(", ")),
        }
    }
}

/// Text shown to operators for a field that has no data.
pub const UNAVAILABLE: &str = "N/A";

pub fn render_value(value: Option<&FieldValue>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => UNAVAILABLE.to_string(),
    }
}

/// One joined record per entity. Every field declared by the view is present
/// in the map; `None` marks it unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedRecord {
    pub key: EntityKey,
    #[serde(flatten)]
    fields: BTreeMap<Field, Option<FieldValue>>,
}

impl CorrelatedRecord {
    pub fn new(key: impl Into<EntityKey>, schema: &[Field]) -> Self {
        CorrelatedRecord {
            key: key.into(),
            fields: schema.iter().map(|field| (*field, None)).collect(),
        }
    }

    pub fn has_field(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        self.fields.get(&field).and_then(|v| v.as_ref())
    }

    pub fn is_available(&self, field: Field) -> bool {
        self.get(field).is_some()
    }

    pub fn number(&self, field: Field) -> Option<f64> {
        match self.get(field) {
            Some(FieldValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn text(&self, field: Field) -> Option<&str> {
        match self.get(field) {
            Some(FieldValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn flag(&self, field: Field) -> Option<bool> {
        match self.get(field) {
            Some(FieldValue::Flag(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn list(&self, field: Field) -> Option<&[String]> {
        match self.get(field) {
            Some(FieldValue::List(items)) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (Field, Option<&FieldValue>)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_ref()))
    }

    /// Writes only fields that belong to the record shape.
    pub(crate) fn set(&mut self, field: Field, value: Option<FieldValue>) {
        if let Some(slot) = self.fields.get_mut(&field) {
            *slot = value;
        }
    }

    pub fn rendered(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("key".to_string(), self.key.clone());
        for (field, value) in self.fields() {
            out.insert(field.to_string(), render_value(value));
        }
        out
    }
}

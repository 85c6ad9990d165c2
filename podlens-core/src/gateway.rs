use crate::catalog::MetricQuery;
use crate::model::{pod_entity_key, RawQueryResult, SeriesPoint, SeriesRow, CLUSTER_ENTITY_KEY};
use crate::prelude::*;
use crate::tls::install_rustls_provider;
use async_trait::async_trait;
use futures::future;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Executes catalog queries against the monitoring backend. No retries here;
/// callers decide what a failed slot means.
#[async_trait]
pub trait MetricsGateway: Send + Sync {
    async fn execute(&self, query: &MetricQuery) -> Result<RawQueryResult>;

    /// Runs every query concurrently. Slot `i` of the output belongs to
    /// `queries[i]` and fails independently of the others.
    async fn execute_all(&self, queries: &[MetricQuery]) -> Vec<Result<RawQueryResult>> {
        future::join_all(queries.iter().map(|query| self.execute(query))).await
    }
}

#[derive(Debug, Clone)]
pub struct PrometheusGateway {
    client: Client,
    base_url: Url,
}

impl PrometheusGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        if !install_rustls_provider() {
            warn!("No rustls crypto provider installed, TLS connections will fail");
        }
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).map_err(|err| {
            PodlensError::validation(format!("invalid Prometheus URL `{base_url}`: {err}"))
        })?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(PrometheusGateway { client, base_url })
    }

    fn endpoint(&self, query: &MetricQuery) -> Result<Url> {
        let path = match query.range {
            Some(_) => "api/v1/query_range",
            None => "api/v1/query",
        };
        let mut url = self.base_url.join(path).map_err(|err| {
            PodlensError::validation(format!("cannot build Prometheus endpoint {path}: {err}"))
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", &query.expr);
            if let Some(range) = query.range {
                pairs.append_pair("start", &range.start.to_string());
                pairs.append_pair("end", &range.end.to_string());
                pairs.append_pair("step", &range.step.to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl MetricsGateway for PrometheusGateway {
    async fn execute(&self, query: &MetricQuery) -> Result<RawQueryResult> {
        let url = self.endpoint(query)?;
        let started = Instant::now();
        let response = self.client.get(url).send().await.map_err(|err| {
            PodlensError::upstream(format!("query `{}` failed: {err}", query.name))
        })?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(
            "query `{}` answered {status} in {} ms",
            query.name,
            started.elapsed().as_millis()
        );
        let parsed: PromResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) if status.is_success() => return Err(err.into()),
            Err(_) => {
                return Err(PodlensError::upstream(format!(
                    "query `{}` returned HTTP {status}",
                    query.name
                )))
            }
        };
        if !status.is_success() || parsed.status != "success" {
            return Err(PodlensError::upstream(format!(
                "query `{}` returned HTTP {status} ({}: {})",
                query.name,
                parsed.error_type.as_deref().unwrap_or("unknown"),
                parsed.error.as_deref().unwrap_or("no error message")
            )));
        }
        let data = parsed.data.ok_or_else(|| {
            PodlensError::upstream(format!("query `{}` returned no data section", query.name))
        })?;
        Ok(RawQueryResult::new(
            query.name.clone(),
            rows_from_data(query, data),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    data: Option<PromData>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum PromData {
    Vector(Vec<PromSample>),
    Matrix(Vec<PromSeries>),
    Scalar(PromValue),
    #[serde(rename = "string")]
    Text(PromValue),
}

#[derive(Debug, Deserialize)]
struct PromSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: PromValue,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    values: Vec<PromValue>,
}

type PromValue = (f64, String);

fn rows_from_data(query: &MetricQuery, data: PromData) -> Vec<SeriesRow> {
    let labelled: Vec<(BTreeMap<String, String>, Vec<PromValue>)> = match data {
        PromData::Vector(samples) => samples
            .into_iter()
            .map(|s| (s.metric, vec![s.value]))
            .collect(),
        PromData::Matrix(series) => series.into_iter().map(|s| (s.metric, s.values)).collect(),
        PromData::Scalar(value) | PromData::Text(value) => vec![(BTreeMap::new(), vec![value])],
    };
    let mut rows = Vec::with_capacity(labelled.len());
    for (labels, values) in labelled {
        let entity = match &query.key_label {
            None => CLUSTER_ENTITY_KEY.to_string(),
            Some(label) => match labels.get(label) {
                Some(pod) if label == "pod" => {
                    pod_entity_key(labels.get("namespace").map(String::as_str), pod)
                }
                Some(entity) => entity.clone(),
                None => {
                    warn!(
                        "query `{}` returned a series without the `{label}` label, skipping",
                        query.name
                    );
                    continue;
                }
            },
        };
        let points = values
            .into_iter()
            .map(|(ts, raw)| SeriesPoint::new(ts.floor() as i64, parse_sample(&raw)))
            .collect();
        rows.push(SeriesRow {
            entity,
            metric: query.name.clone(),
            labels,
            points,
        });
    }
    rows
}

/// Prometheus encodes samples as strings. NaN and infinities come out of
/// divisions by zero and carry no measurement.
pub fn parse_sample(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

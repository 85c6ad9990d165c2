use crate::alignment::{AlignedSeries, MeanPolicy};
use crate::catalog::RenderParams;
use crate::correlation::{CorrelationInput, Correlator};
use crate::gateway::MetricsGateway;
use crate::model::RawQueryResult;
use crate::prelude::*;
use crate::snapshot::{merge, Snapshot};
use crate::validation::{Level, RangeParams, TimeWindow, WindowUnit};
use crate::views::{HistoryMetric, ViewKind};
use chrono::Utc;
use futures::future;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Identity of a refreshed view; ticks with equal keys merge into each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub view: ViewKind,
    pub level: Level,
    pub window: TimeWindow,
    pub namespace: Option<String>,
}

impl ViewKey {
    pub fn new(view: ViewKind, params: &RenderParams) -> Self {
        let level = if view.supports_levels() {
            params.level
        } else {
            Level::Pod
        };
        ViewKey {
            view,
            level,
            window: params.window,
            namespace: params.namespace.clone(),
        }
    }

    fn params(&self) -> RenderParams {
        RenderParams::new(self.level, self.window, self.namespace.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub metric: HistoryMetric,
    pub level: Level,
    pub namespace: Option<String>,
    pub range: RangeParams,
    /// Entity to chart; `None` charts the cross-entity mean.
    pub entity: Option<String>,
    pub mean_policy: MeanPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryView {
    pub metric: String,
    pub aligned: AlignedSeries,
    pub selected: Option<String>,
    /// The selected entity's series, or the mean.
    pub series: Vec<Option<f64>>,
}

type SnapshotSlot = Arc<Mutex<Option<Snapshot>>>;

/// Builds view snapshots from the monitoring backend. Ticks of one view key
/// are serialised, a refresh waits for the one in flight before it starts.
/// Different keys refresh concurrently.
pub struct DashboardCoordinator {
    gateway: Arc<dyn MetricsGateway>,
    snapshots: Mutex<HashMap<ViewKey, SnapshotSlot>>,
}

impl DashboardCoordinator {
    pub fn new(gateway: Arc<dyn MetricsGateway>) -> Self {
        DashboardCoordinator {
            gateway,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one tick of `view` and folds it into the previous snapshot of
    /// the same key. Failed queries never fail the tick.
    pub async fn refresh(&self, view: ViewKind, params: &RenderParams) -> Snapshot {
        let key = ViewKey::new(view, params);
        let slot = self.slot(&key).await;
        let mut previous = slot.lock().await;

        let planned = view.plan(&key.params());
        let queries: Vec<_> = planned.iter().map(|p| p.query.clone()).collect();
        let results = self.gateway.execute_all(&queries).await;

        let mut ok: Vec<Option<RawQueryResult>> = Vec::with_capacity(results.len());
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(result) => ok.push(Some(result)),
                Err(err) => {
                    warn!("{view}: query `{}` failed, fields stay unavailable: {err}", query.name);
                    ok.push(None);
                }
            }
        }
        let inputs: Vec<CorrelationInput<'_>> = planned
            .iter()
            .zip(&ok)
            .map(|(p, result)| CorrelationInput {
                query: &p.query.name,
                join: p.join,
                result: result.as_ref(),
            })
            .collect();
        let schema = view.schema();
        let correlation = Correlator::new(&schema, view.bindings()).correlate(&inputs);
        debug!(
            "{view}: correlated {} entities, {} failed queries",
            correlation.records.len(),
            correlation.failed_queries.len()
        );

        let incoming = Snapshot::new(view, correlation, Utc::now());
        let merged = merge(previous.as_ref(), incoming);
        *previous = Some(merged.clone());
        merged
    }

    /// The map lock is only held to look up the slot, never across a query.
    async fn slot(&self, key: &ViewKey) -> SnapshotSlot {
        let mut slots = self.snapshots.lock().await;
        slots.entry(key.clone()).or_default().clone()
    }

    /// Last snapshot of a view without querying. Waits for a tick of the
    /// same key that is in flight.
    pub async fn latest(&self, view: ViewKind, params: &RenderParams) -> Option<Snapshot> {
        let key = ViewKey::new(view, params);
        let slot = self.snapshots.lock().await.get(&key).cloned()?;
        let snapshot = slot.lock().await.clone();
        snapshot
    }

    pub async fn refresh_all(&self, views: &[(ViewKind, RenderParams)]) {
        let ticks = views
            .iter()
            .map(|(view, params)| async move { (*view, self.refresh(*view, params).await) });
        for (view, snapshot) in future::join_all(ticks).await {
            info!(
                "Refreshed {view}: {} entities{}",
                snapshot.records.len(),
                if snapshot.partial() { " (partial)" } else { "" }
            );
        }
    }

    /// Aligned history of one metric. The primary query failing is an
    /// error; the fallback query only lends its time axis.
    pub async fn history(&self, request: &HistoryRequest) -> Result<HistoryView> {
        let level = request.metric.effective_level(request.level);
        let window = TimeWindow {
            amount: request.range.step.max(60),
            unit: WindowUnit::Seconds,
        };
        let params = RenderParams::new(level, window, request.namespace.clone());
        let primary = request.metric.primary().render_range(&params, request.range);
        let fallback = request.metric.fallback().render_range(&params, request.range);

        let mut results = self
            .gateway
            .execute_all(&[primary.clone(), fallback])
            .await
            .into_iter();
        let primary_result = match results.next() {
            Some(result) => result?,
            None => return Err(PodlensError::upstream("history query returned no result")),
        };
        let fallback_result = match results.next() {
            Some(Ok(result)) => Some(result),
            Some(Err(err)) => {
                debug!("fallback axis query failed: {err}");
                None
            }
            None => None,
        };

        let aligned = AlignedSeries::align(&primary_result, fallback_result.as_ref());
        let selected = request
            .entity
            .clone()
            .filter(|entity| aligned.per_entity.contains_key(entity));
        if request.entity.is_some() && selected.is_none() {
            debug!(
                "selected entity {:?} has no `{}` data",
                request.entity, primary.name
            );
        }
        let series = aligned.select(request.entity.as_deref(), request.mean_policy);
        Ok(HistoryView {
            metric: primary.name,
            aligned,
            selected,
            series,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricQuery;
    use crate::model::{Field, SeriesPoint, SeriesRow};
    use crate::validation::{LatencyDirection, MetricKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers by query name; names listed in `failing` error out.
    #[derive(Default)]
    struct FakeGateway {
        rows: HashMap<String, Vec<SeriesRow>>,
        failing: std::sync::Mutex<Vec<String>>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl MetricsGateway for FakeGateway {
        async fn execute(&self, query: &MetricQuery) -> Result<RawQueryResult> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&query.name) {
                return Err(PodlensError::upstream(format!("{} down", query.name)));
            }
            Ok(RawQueryResult::new(
                query.name.clone(),
                self.rows.get(&query.name).cloned().unwrap_or_default(),
            ))
        }
    }

    fn row(entity: &str, points: &[(i64, f64)], labels: &[(&str, &str)]) -> SeriesRow {
        SeriesRow {
            entity: entity.to_string(),
            metric: String::new(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            points: points
                .iter()
                .map(|(ts, v)| SeriesPoint::new(*ts, Some(*v)))
                .collect(),
        }
    }

    fn status_gateway() -> FakeGateway {
        let mut rows = HashMap::new();
        rows.insert(
            "pod_phase".to_string(),
            vec![row(
                "api-5c9d8c6685-tb55c",
                &[(0, 1.0)],
                &[("namespace", "default"), ("phase", "Running")],
            )],
        );
        rows.insert(
            "pod_info".to_string(),
            vec![row(
                "api-5c9d8c6685-tb55c",
                &[(0, 1.0)],
                &[("node", "node-a"), ("namespace", "default")],
            )],
        );
        rows.insert(
            "replicaset_owner".to_string(),
            vec![row(
                "api-5c9d8c6685",
                &[(0, 1.0)],
                &[("owner_name", "api"), ("namespace", "default")],
            )],
        );
        FakeGateway {
            rows,
            ..FakeGateway::default()
        }
    }

    #[tokio::test]
    async fn refresh_correlates_and_carries_failed_fields_forward() {
        let gateway = Arc::new(status_gateway());
        let coordinator = DashboardCoordinator::new(gateway.clone());
        let params = RenderParams::default();

        let first = coordinator.refresh(ViewKind::PodStatus, &params).await;
        let pod = first.find("api-5c9d8c6685-tb55c").unwrap();
        assert_eq!(pod.text(Field::Deployment), Some("api"));
        assert_eq!(pod.text(Field::Node), Some("node-a"));
        assert!(!first.partial());

        gateway.failing.lock().unwrap().push("pod_info".to_string());
        let second = coordinator.refresh(ViewKind::PodStatus, &params).await;
        assert_eq!(second.failed_queries, vec!["pod_info".to_string()]);
        let pod = second.find("api-5c9d8c6685-tb55c").unwrap();
        assert_eq!(pod.text(Field::Node), Some("node-a"));
        assert!(second.stale_fields.contains(&Field::Node));
    }

    #[tokio::test]
    async fn pod_views_ignore_requested_level() {
        let coordinator = DashboardCoordinator::new(Arc::new(status_gateway()));
        let node_params = RenderParams::new(Level::Node, TimeWindow::default(), None);
        coordinator.refresh(ViewKind::PodStatus, &node_params).await;
        assert!(coordinator
            .latest(ViewKind::PodStatus, &RenderParams::default())
            .await
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_do_not_interleave() {
        let gateway = Arc::new(FakeGateway {
            delay: Some(Duration::from_millis(100)),
            ..FakeGateway::default()
        });
        let coordinator = Arc::new(DashboardCoordinator::new(gateway.clone()));
        let params = RenderParams::default();
        let a = {
            let c = coordinator.clone();
            let p = params.clone();
            tokio::spawn(async move { c.refresh(ViewKind::Latency, &p).await })
        };
        let b = {
            let c = coordinator.clone();
            let p = params.clone();
            tokio::spawn(async move { c.refresh(ViewKind::Latency, &p).await })
        };
        a.await.unwrap();
        b.await.unwrap();
        // One tick's queries run together, never two ticks' worth.
        assert_eq!(
            gateway.max_in_flight.load(Ordering::SeqCst),
            ViewKind::Latency.queries().len()
        );
    }

    fn slow_coordinator() -> Arc<DashboardCoordinator> {
        let gateway = FakeGateway {
            delay: Some(Duration::from_secs(10)),
            ..FakeGateway::default()
        };
        Arc::new(DashboardCoordinator::new(Arc::new(gateway)))
    }

    fn spawn_refresh(
        coordinator: &Arc<DashboardCoordinator>,
        view: ViewKind,
    ) -> tokio::task::JoinHandle<Snapshot> {
        let c = coordinator.clone();
        tokio::spawn(async move { c.refresh(view, &RenderParams::default()).await })
    }

    #[tokio::test(start_paused = true)]
    async fn different_views_refresh_side_by_side() {
        let coordinator = slow_coordinator();
        let started = tokio::time::Instant::now();

        let status = spawn_refresh(&coordinator, ViewKind::PodStatus);
        let latency = spawn_refresh(&coordinator, ViewKind::Latency);
        status.await.unwrap();
        latency.await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(20), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_of_one_view_wait_for_each_other() {
        let coordinator = slow_coordinator();
        let started = tokio::time::Instant::now();

        let first = spawn_refresh(&coordinator, ViewKind::Latency);
        let second = spawn_refresh(&coordinator, ViewKind::Latency);
        first.await.unwrap();
        second.await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_all_runs_views_together() {
        let coordinator = slow_coordinator();
        let views = [
            (ViewKind::PodStatus, RenderParams::default()),
            (
                ViewKind::Resources,
                RenderParams::new(Level::Namespace, TimeWindow::default(), None),
            ),
            (ViewKind::Latency, RenderParams::default()),
        ];
        let started = tokio::time::Instant::now();

        coordinator.refresh_all(&views).await;

        assert!(started.elapsed() < Duration::from_secs(20));
        for (view, params) in &views {
            assert!(coordinator.latest(*view, params).await.is_some());
        }
    }

    #[tokio::test]
    async fn latency_history_borrows_usage_axis_and_averages() {
        let mut rows = HashMap::new();
        rows.insert("inbound_latency".to_string(), Vec::new());
        rows.insert(
            "cpu_usage".to_string(),
            vec![row("api-1", &[(60, 0.1), (120, 0.2)], &[])],
        );
        let coordinator = DashboardCoordinator::new(Arc::new(FakeGateway {
            rows,
            ..FakeGateway::default()
        }));
        let request = HistoryRequest {
            metric: HistoryMetric::Latency {
                direction: LatencyDirection::Inbound,
            },
            level: Level::Namespace,
            namespace: None,
            range: RangeParams::new(0.0, 180.0, 60).unwrap(),
            entity: None,
            mean_policy: MeanPolicy::PresentOnly,
        };

        let view = coordinator.history(&request).await.unwrap();

        assert_eq!(view.metric, "inbound_latency");
        assert_eq!(view.aligned.timestamps_unix, vec![60, 120]);
        assert_eq!(view.series, vec![None, None]);
    }

    #[tokio::test]
    async fn usage_history_selects_entity_and_fails_on_primary_error() {
        let mut rows = HashMap::new();
        rows.insert(
            "memory_usage".to_string(),
            vec![
                row("api-1", &[(0, 10.0), (60, 20.0)], &[]),
                row("api-2", &[(0, 30.0), (60, 40.0)], &[]),
            ],
        );
        let gateway = Arc::new(FakeGateway {
            rows,
            ..FakeGateway::default()
        });
        let coordinator = DashboardCoordinator::new(gateway.clone());
        let mut request = HistoryRequest {
            metric: HistoryMetric::Usage {
                metric: MetricKind::Memory,
                relative: false,
            },
            level: Level::Pod,
            namespace: Some("default".to_string()),
            range: RangeParams::new(0.0, 60.0, 60).unwrap(),
            entity: Some("api-2".to_string()),
            mean_policy: MeanPolicy::PresentOnly,
        };

        let view = coordinator.history(&request).await.unwrap();
        assert_eq!(view.selected.as_deref(), Some("api-2"));
        assert_eq!(view.series, vec![Some(30.0), Some(40.0)]);

        request.entity = None;
        let view = coordinator.history(&request).await.unwrap();
        assert_eq!(view.series, vec![Some(20.0), Some(30.0)]);

        gateway.failing.lock().unwrap().push("memory_usage".to_string());
        assert!(coordinator.history(&request).await.is_err());
    }
}

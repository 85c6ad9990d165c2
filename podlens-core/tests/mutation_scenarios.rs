use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::Pod;
use podlens_core::control_plane::ControlPlane;
use podlens_core::errors::PodlensError;
use podlens_core::mutation::{
    MutationOrchestrator, MutationOutcome, MutationPolicies, MutationRequest, ObservedState,
};
use podlens_core::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reports `replicas = 1` for the first `stale_polls` reads after the
/// write, then `converged`.
struct ReplicaMock {
    reads: AtomicUsize,
    stale_polls: usize,
    converged: i32,
    pod_gone_after: usize,
}

impl ReplicaMock {
    fn new(stale_polls: usize, converged: i32) -> Self {
        ReplicaMock {
            reads: AtomicUsize::new(0),
            stale_polls,
            converged,
            pod_gone_after: 0,
        }
    }
}

fn deployment(replicas: i32) -> Deployment {
    Deployment {
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..DeploymentSpec::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(replicas),
            ..DeploymentStatus::default()
        }),
        ..Deployment::default()
    }
}

#[async_trait]
impl ControlPlane for ReplicaMock {
    async fn get_pod(&self, _: &str, _: &str) -> Result<Option<Pod>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        Ok((n < self.pod_gone_after).then(Pod::default))
    }

    async fn delete_pod(&self, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn get_deployment(&self, _: &str, _: &str) -> Result<Deployment> {
        // Read 0 belongs to the read-modify-write.
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if n == 0 || n <= self.stale_polls {
            Ok(deployment(1))
        } else {
            Ok(deployment(self.converged))
        }
    }

    async fn list_deployments(&self, _: Option<&str>) -> Result<Vec<Deployment>> {
        Err(PodlensError::upstream("not scripted"))
    }

    async fn replace_deployment(&self, _: &str, _: &str, d: &Deployment) -> Result<Deployment> {
        Ok(d.clone())
    }

    async fn get_pod_logs(&self, _: &str, _: &str, _: Option<String>) -> Result<String> {
        Err(PodlensError::upstream("not scripted"))
    }
}

fn policies(max_retries: u32) -> MutationPolicies {
    MutationPolicies::new(Duration::from_secs(3), max_retries, max_retries, 0)
}

#[tokio::test(start_paused = true)]
async fn scale_succeeds_after_two_stale_polls() {
    let orchestrator = MutationOrchestrator::new(Arc::new(ReplicaMock::new(2, 3)), policies(2));
    let request = MutationRequest::scale("default", "api-deploy", 3).unwrap();

    let outcome = orchestrator.run(&request).await;

    assert_eq!(
        outcome,
        MutationOutcome::Succeeded {
            observed: ObservedState::Replicas(3)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn scale_times_out_reporting_last_observed_replicas() {
    let orchestrator = MutationOrchestrator::new(Arc::new(ReplicaMock::new(100, 3)), policies(2));
    let request = MutationRequest::scale("default", "api-deploy", 3).unwrap();

    let outcome = orchestrator.run(&request).await;

    assert_eq!(
        outcome,
        MutationOutcome::TimedOut {
            last_observed: ObservedState::Replicas(1)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn restart_succeeds_on_first_not_found() {
    let orchestrator = MutationOrchestrator::new(Arc::new(ReplicaMock::new(0, 0)), policies(10));
    let request = MutationRequest::restart("default", "worker-abc123").unwrap();

    let outcome = orchestrator.run(&request).await;

    assert_eq!(
        outcome,
        MutationOutcome::Succeeded {
            observed: ObservedState::PodGone
        }
    );
}

#[tokio::test(start_paused = true)]
async fn restart_times_out_while_pod_still_resolves() {
    let mock = ReplicaMock {
        pod_gone_after: usize::MAX,
        ..ReplicaMock::new(0, 0)
    };
    let orchestrator = MutationOrchestrator::new(Arc::new(mock), policies(3));
    let request = MutationRequest::restart("default", "worker-abc123").unwrap();

    let outcome = orchestrator.run(&request).await;

    assert!(matches!(
        outcome,
        MutationOutcome::TimedOut {
            last_observed: ObservedState::PodPresent { .. }
        }
    ));
}

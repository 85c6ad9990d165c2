//! Mutate-and-verify: every control-plane write is followed by reads until the
//! effect is observable, the retry budget runs out, or something fails.

use crate::control_plane::ControlPlane;
use crate::prelude::*;
use crate::quantity::{parse_quantity, quantities_equal};
use crate::validation::{validate_namespace, validate_object_name};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MutationKind {
    Restart,
    ScaleReplicas,
    SetResourceLimits,
}

/// Requests and limits of a deployment's first container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSettings {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl ResourceSettings {
    pub fn new(
        cpu_request: &str,
        cpu_limit: &str,
        memory_request: &str,
        memory_limit: &str,
    ) -> Result<Self> {
        for raw in [cpu_request, cpu_limit, memory_request, memory_limit] {
            parse_quantity(raw)?;
        }
        Ok(ResourceSettings {
            cpu_request: cpu_request.trim().to_string(),
            cpu_limit: cpu_limit.trim().to_string(),
            memory_request: memory_request.trim().to_string(),
            memory_limit: memory_limit.trim().to_string(),
        })
    }

    fn apply_to(&self, container: &mut Container) {
        let resources = container
            .resources
            .get_or_insert_with(ResourceRequirements::default);
        let requests = resources.requests.get_or_insert_with(BTreeMap::new);
        requests.insert("cpu".to_string(), Quantity(self.cpu_request.clone()));
        requests.insert("memory".to_string(), Quantity(self.memory_request.clone()));
        let limits = resources.limits.get_or_insert_with(BTreeMap::new);
        limits.insert("cpu".to_string(), Quantity(self.cpu_limit.clone()));
        limits.insert("memory".to_string(), Quantity(self.memory_limit.clone()));
    }
}

/// What a container currently declares; any entry may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedResources {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

impl ObservedResources {
    pub fn from_container(container: &Container) -> Self {
        let pick = |map: Option<&BTreeMap<String, Quantity>>, key: &str| {
            map.and_then(|m| m.get(key)).map(|q| q.0.clone())
        };
        let resources = container.resources.as_ref();
        let requests = resources.and_then(|r| r.requests.as_ref());
        let limits = resources.and_then(|r| r.limits.as_ref());
        ObservedResources {
            cpu_request: pick(requests, "cpu"),
            cpu_limit: pick(limits, "cpu"),
            memory_request: pick(requests, "memory"),
            memory_limit: pick(limits, "memory"),
        }
    }

    /// Value comparison of all four entries.
    pub fn matches(&self, desired: &ResourceSettings) -> bool {
        let eq = |observed: &Option<String>, wanted: &str| {
            observed
                .as_deref()
                .is_some_and(|value| quantities_equal(value, wanted))
        };
        eq(&self.cpu_request, &desired.cpu_request)
            && eq(&self.cpu_limit, &desired.cpu_limit)
            && eq(&self.memory_request, &desired.memory_request)
            && eq(&self.memory_limit, &desired.memory_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DesiredState {
    /// The instance is no longer resolvable.
    Gone,
    Replicas(i32),
    Resources(ResourceSettings),
}

/// Immutable once built; fields are only readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    namespace: String,
    target: String,
    desired: DesiredState,
}

impl MutationRequest {
    pub fn restart(namespace: &str, pod: &str) -> Result<Self> {
        Self::new(namespace, pod, DesiredState::Gone)
    }

    pub fn scale(namespace: &str, deployment: &str, replicas: i32) -> Result<Self> {
        if replicas < 0 {
            return Err(PodlensError::validation(format!(
                "replicas must not be negative, got {replicas}"
            )));
        }
        Self::new(namespace, deployment, DesiredState::Replicas(replicas))
    }

    pub fn set_resources(
        namespace: &str,
        deployment: &str,
        resources: ResourceSettings,
    ) -> Result<Self> {
        Self::new(namespace, deployment, DesiredState::Resources(resources))
    }

    fn new(namespace: &str, target: &str, desired: DesiredState) -> Result<Self> {
        Ok(MutationRequest {
            namespace: validate_namespace(namespace)?.to_string(),
            target: validate_object_name(target)?.to_string(),
            desired,
        })
    }

    pub fn kind(&self) -> MutationKind {
        match self.desired {
            DesiredState::Gone => MutationKind::Restart,
            DesiredState::Replicas(_) => MutationKind::ScaleReplicas,
            DesiredState::Resources(_) => MutationKind::SetResourceLimits,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn desired(&self) -> &DesiredState {
        &self.desired
    }
}

impl fmt::Display for MutationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}/{}", self.kind(), self.namespace, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ObservedState {
    PodGone,
    PodPresent { phase: Option<String> },
    Replicas(i32),
    Resources(ObservedResources),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    Succeeded { observed: ObservedState },
    Failed { reason: String },
    TimedOut { last_observed: ObservedState },
}

impl MutationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MutationOutcome::Succeeded { .. })
    }
}

/// What a call site reports when its retry budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhausted {
    TimedOut,
    Failed,
}

/// `1 + max_retries` reads, each preceded by `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_retries: u32,
    pub on_exhausted: OnExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationPolicies {
    pub restart: PollPolicy,
    pub scale: PollPolicy,
    pub resources: PollPolicy,
}

impl MutationPolicies {
    pub fn new(interval: Duration, restart: u32, scale: u32, resources: u32) -> Self {
        MutationPolicies {
            restart: PollPolicy {
                interval,
                max_retries: restart,
                on_exhausted: OnExhausted::TimedOut,
            },
            scale: PollPolicy {
                interval,
                max_retries: scale,
                on_exhausted: OnExhausted::TimedOut,
            },
            // A mismatch after the last check means the write did not stick.
            resources: PollPolicy {
                interval,
                max_retries: resources,
                on_exhausted: OnExhausted::Failed,
            },
        }
    }

    pub fn for_kind(&self, kind: MutationKind) -> PollPolicy {
        match kind {
            MutationKind::Restart => self.restart,
            MutationKind::ScaleReplicas => self.scale,
            MutationKind::SetResourceLimits => self.resources,
        }
    }
}

impl Default for MutationPolicies {
    fn default() -> Self {
        MutationPolicies::new(Duration::from_secs(3), 10, 10, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState {
    Submitting,
    Polling { attempt: u32 },
    Done(MutationOutcome),
}

pub struct MutationOrchestrator {
    control_plane: Arc<dyn ControlPlane>,
    policies: MutationPolicies,
}

impl MutationOrchestrator {
    pub fn new(control_plane: Arc<dyn ControlPlane>, policies: MutationPolicies) -> Self {
        MutationOrchestrator {
            control_plane,
            policies,
        }
    }

    pub fn policies(&self) -> &MutationPolicies {
        &self.policies
    }

    /// Drives `request` to a terminal outcome. The write is issued once;
    /// only the read repeats.
    pub async fn run(&self, request: &MutationRequest) -> MutationOutcome {
        let policy = self.policies.for_kind(request.kind());
        let mut state = MutationState::Submitting;
        info!("Mutation {request}: submitting");
        loop {
            state = match state {
                MutationState::Submitting => match self.submit(request).await {
                    Ok(()) => MutationState::Polling { attempt: 0 },
                    Err(err) => MutationState::Done(self.failed(request, "write", &err)),
                },
                MutationState::Polling { attempt } => {
                    tokio::time::sleep(policy.interval).await;
                    match self.observe(request).await {
                        Err(err) => MutationState::Done(self.failed(request, "read", &err)),
                        Ok(observed) if confirms(request.desired(), &observed) => {
                            info!("Mutation {request}: confirmed after {} read(s)", attempt + 1);
                            MutationState::Done(MutationOutcome::Succeeded { observed })
                        }
                        Ok(observed) if attempt >= policy.max_retries => {
                            warn!(
                                "Mutation {request}: not confirmed after {} read(s), last observed {observed:?}",
                                attempt + 1
                            );
                            MutationState::Done(exhausted(request, policy, observed))
                        }
                        Ok(observed) => {
                            debug!("Mutation {request}: read {} observed {observed:?}", attempt + 1);
                            MutationState::Polling {
                                attempt: attempt + 1,
                            }
                        }
                    }
                }
                MutationState::Done(outcome) => return outcome,
            };
        }
    }

    async fn submit(&self, request: &MutationRequest) -> Result<()> {
        let (ns, name) = (request.namespace(), request.target());
        match request.desired() {
            DesiredState::Gone => self.control_plane.delete_pod(ns, name).await,
            DesiredState::Replicas(replicas) => {
                let mut deployment = self.control_plane.get_deployment(ns, name).await?;
                let spec = deployment.spec.as_mut().ok_or_else(|| {
                    PodlensError::invalid_object(format!("deployment {ns}/{name} has no spec"))
                })?;
                spec.replicas = Some(*replicas);
                self.control_plane
                    .replace_deployment(ns, name, &deployment)
                    .await?;
                Ok(())
            }
            DesiredState::Resources(settings) => {
                let mut deployment = self.control_plane.get_deployment(ns, name).await?;
                let container = first_container_mut(&mut deployment).ok_or_else(|| {
                    PodlensError::invalid_object(format!(
                        "deployment {ns}/{name} has no containers"
                    ))
                })?;
                settings.apply_to(container);
                self.control_plane
                    .replace_deployment(ns, name, &deployment)
                    .await?;
                Ok(())
            }
        }
    }

    async fn observe(&self, request: &MutationRequest) -> Result<ObservedState> {
        let (ns, name) = (request.namespace(), request.target());
        match request.desired() {
            DesiredState::Gone => Ok(match self.control_plane.get_pod(ns, name).await? {
                None => ObservedState::PodGone,
                Some(pod) => ObservedState::PodPresent {
                    phase: pod.status.and_then(|s| s.phase),
                },
            }),
            DesiredState::Replicas(_) => {
                let deployment = self.control_plane.get_deployment(ns, name).await?;
                let replicas = deployment
                    .status
                    .and_then(|s| s.replicas)
                    .unwrap_or_default();
                Ok(ObservedState::Replicas(replicas))
            }
            DesiredState::Resources(_) => {
                let mut deployment = self.control_plane.get_deployment(ns, name).await?;
                let container = first_container_mut(&mut deployment).ok_or_else(|| {
                    PodlensError::invalid_object(format!(
                        "deployment {ns}/{name} has no containers"
                    ))
                })?;
                Ok(ObservedState::Resources(ObservedResources::from_container(
                    container,
                )))
            }
        }
    }

    fn failed(&self, request: &MutationRequest, step: &str, err: &PodlensError) -> MutationOutcome {
        warn!("Mutation {request}: {step} failed: {err}");
        MutationOutcome::Failed {
            reason: format!(
                "{} {step} failed for {}/{}: {err}",
                request.kind(),
                request.namespace(),
                request.target()
            ),
        }
    }
}

fn first_container_mut(deployment: &mut Deployment) -> Option<&mut Container> {
    deployment
        .spec
        .as_mut()?
        .template
        .spec
        .as_mut()?
        .containers
        .first_mut()
}

fn confirms(desired: &DesiredState, observed: &ObservedState) -> bool {
    match (desired, observed) {
        (DesiredState::Gone, ObservedState::PodGone) => true,
        (DesiredState::Replicas(want), ObservedState::Replicas(have)) => want == have,
        (DesiredState::Resources(want), ObservedState::Resources(have)) => have.matches(want),
        _ => false,
    }
}

fn exhausted(request: &MutationRequest, policy: PollPolicy, observed: ObservedState) -> MutationOutcome {
    match policy.on_exhausted {
        OnExhausted::TimedOut => MutationOutcome::TimedOut {
            last_observed: observed,
        },
        OnExhausted::Failed => MutationOutcome::Failed {
            reason: format!(
                "{} of {}/{} not applied: observed {observed:?}",
                request.kind(),
                request.namespace(),
                request.target()
            ),
        },
    }
}

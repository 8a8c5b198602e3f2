//! Per-target health evaluation and remediation for MachineHealthCheck
//!
//! A target is the ephemeral join of a machine, its linked node, and
//! the governing health check, rebuilt on every reconcile. Evaluation
//! decides whether the target has been unhealthy long enough to
//! remediate; remediation deletes the machine (its MachineSet
//! recreates it) or hands it to an external remediation system.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    Client, ResourceExt,
};
use tracing::{info, warn};

use crate::crd::{
    Machine, MachineHealthCheck, OwnerKind, EXTERNAL_REMEDIATION_ANNOTATION, MACHINE_MASTER_ROLE,
    MACHINE_ROLE_LABEL, NODE_MASTER_LABEL, PHASE_FAILED,
};
use crate::error::{Error, Result};

use super::events::emit_machine_event;
use super::metrics;

/// Event reason emitted when a machine is deleted for remediation
pub const EVENT_MACHINE_DELETED: &str = "MachineDeleted";
/// Event reason emitted when a target is unhealthy but inside its grace window
pub const EVENT_DETECTED_UNHEALTHY: &str = "DetectedUnhealthy";
/// Event reason emitted when remediation is skipped for an unowned machine
pub const EVENT_SKIPPED_NO_CONTROLLER: &str = "SkippedNoController";
/// Event reason emitted when remediation is skipped for a control-plane machine
pub const EVENT_SKIPPED_MASTER: &str = "SkippedMaster";
/// Event reason emitted when a machine is annotated for external remediation
pub const EVENT_EXTERNAL_ANNOTATION_ADDED: &str = "ExternalAnnotationAdded";

/// The node side of a target, resolved once per reconcile pass
#[derive(Clone, Debug)]
pub enum NodeLookup {
    /// The machine has no nodeRef yet; the instance may still be booting
    NotLinked,
    /// The machine has a nodeRef but the node no longer exists
    Deleted,
    /// The linked node
    Found(Box<Node>),
}

/// Ephemeral (machine, node, health check) triple under evaluation
#[derive(Clone, Debug)]
pub struct Target {
    pub machine: Machine,
    pub node: NodeLookup,
    pub mhc: MachineHealthCheck,
}

impl Target {
    /// Short identifier for logs
    pub fn describe(&self) -> String {
        format!(
            "{}/{}",
            self.machine.namespace().unwrap_or_default(),
            self.machine.name_any()
        )
    }

    /// Whether any controller owns the machine; remediating an unowned
    /// machine would lose the workload with no replacement
    pub fn has_controller_owner(&self) -> bool {
        OwnerKind::of(&self.machine.metadata).is_controlled()
    }

    /// Whether the target belongs to the control plane, judged by the
    /// node role label or the machine role label
    pub fn is_master(&self) -> bool {
        if let NodeLookup::Found(node) = &self.node {
            if node
                .metadata
                .labels
                .as_ref()
                .map_or(false, |l| l.contains_key(NODE_MASTER_LABEL))
            {
                return true;
            }
        }
        self.machine
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(MACHINE_ROLE_LABEL))
            .map(|role| role == MACHINE_MASTER_ROLE)
            .unwrap_or(false)
    }

    /// Evaluate the target's health.
    ///
    /// Returns whether remediation is warranted now and, if the target
    /// is unhealthy but still inside a grace window, the time until the
    /// earliest deadline. A zero duration means no pending deadline.
    pub fn needs_remediation(&self, node_startup_timeout: Duration) -> (bool, Duration) {
        let now = Utc::now();

        // A failed machine never recovers on its own.
        if self.machine.phase() == PHASE_FAILED {
            return (true, Duration::ZERO);
        }

        match &self.node {
            NodeLookup::Deleted => (true, Duration::ZERO),
            NodeLookup::NotLinked => {
                let since = self
                    .machine
                    .status
                    .as_ref()
                    .and_then(|s| s.last_updated.as_ref())
                    .map(|t| t.0)
                    .or_else(|| {
                        self.machine
                            .metadata
                            .creation_timestamp
                            .as_ref()
                            .map(|t| t.0)
                    })
                    .unwrap_or(now);
                let startup = ChronoDuration::from_std(node_startup_timeout)
                    .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 1_000));
                let elapsed = now.signed_duration_since(since);
                if elapsed > startup {
                    (true, Duration::ZERO)
                } else {
                    (false, to_std_duration(startup - elapsed))
                }
            }
            NodeLookup::Found(node) => self.check_node_conditions(node, now),
        }
    }

    fn check_node_conditions(&self, node: &Node, now: DateTime<Utc>) -> (bool, Duration) {
        let mut next_checks: Vec<ChronoDuration> = Vec::new();

        for unhealthy in &self.mhc.spec.unhealthy_conditions {
            let condition = match get_node_condition(node, &unhealthy.condition_type) {
                Some(c) => c,
                None => continue,
            };
            if condition.status != unhealthy.status {
                continue;
            }
            let timeout = ChronoDuration::seconds(unhealthy.timeout_seconds);
            let elapsed = condition
                .last_transition_time
                .as_ref()
                .map(|t| now.signed_duration_since(t.0))
                .unwrap_or(ChronoDuration::zero());
            if elapsed >= timeout {
                // First match wins; conditions are independent OR-triggers.
                return (true, Duration::ZERO);
            }
            next_checks.push(timeout - elapsed);
        }

        match next_checks.into_iter().min() {
            Some(next) => (false, to_std_duration(next)),
            None => (false, Duration::ZERO),
        }
    }

    /// Remediate an unhealthy target
    pub async fn remediate(&self, client: &Client, protect_control_plane: bool) -> Result<()> {
        info!("Initiating remediation for machine {}", self.describe());

        // A deletion already in flight is the remediation.
        if self.machine.is_deleting() {
            info!(
                "Machine {} is already being deleted, skipping remediation",
                self.describe()
            );
            return Ok(());
        }

        if !self.has_controller_owner() {
            info!(
                "Machine {} has no controller owner, skipping remediation",
                self.describe()
            );
            emit_machine_event(
                client,
                &self.machine,
                "Normal",
                EVENT_SKIPPED_NO_CONTROLLER,
                "Machine has no controller owner, skipping remediation",
            )
            .await?;
            return Ok(());
        }

        if self.mhc.external_remediation() {
            return self.remediation_strategy_external(client).await;
        }

        if self.is_master() {
            info!("Machine {} backs the control plane", self.describe());
            if protect_control_plane {
                warn!(
                    "Control-plane protection enabled, skipping remediation of {}",
                    self.describe()
                );
                emit_machine_event(
                    client,
                    &self.machine,
                    "Normal",
                    EVENT_SKIPPED_MASTER,
                    "Control-plane protection enabled, skipping remediation",
                )
                .await?;
                return Ok(());
            }
        }

        let namespace = self
            .machine
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
        info!("Deleting unhealthy machine {}", self.describe());
        match api
            .delete(&self.machine.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            // Already gone counts as remediated.
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
        metrics::inc_remediation(&namespace, &self.mhc.name_any());
        emit_machine_event(
            client,
            &self.machine,
            "Normal",
            EVENT_MACHINE_DELETED,
            &format!(
                "Machine {} has been remediated by deletion",
                self.machine.name_any()
            ),
        )
        .await
    }

    /// Hand the machine to an external remediation system by annotation
    pub async fn remediation_strategy_external(&self, client: &Client) -> Result<()> {
        info!(
            "Machine {} has been unhealthy for too long, adding external annotation",
            self.describe()
        );
        let namespace = self
            .machine
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);

        let patch = serde_json::json!({
            "metadata": {
                "annotations": { EXTERNAL_REMEDIATION_ANNOTATION: "" }
            }
        });
        api.patch(
            &self.machine.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;

        metrics::inc_remediation(&namespace, &self.mhc.name_any());
        emit_machine_event(
            client,
            &self.machine,
            "Normal",
            EVENT_EXTERNAL_ANNOTATION_ADDED,
            &format!(
                "Machine {} annotated for external remediation",
                self.machine.name_any()
            ),
        )
        .await
    }
}

/// Find the current node condition of the given type
pub fn get_node_condition<'a>(node: &'a Node, condition_type: &str) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == condition_type))
}

fn to_std_duration(duration: ChronoDuration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

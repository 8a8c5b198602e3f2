//! MachineHealthCheck Custom Resource Definition
//!
//! A MachineHealthCheck watches a selector-matched group of Machines and
//! remediates the ones whose nodes stay unhealthy past a configured
//! timeout, subject to a maxUnhealthy budget that short-circuits mass
//! remediation.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Grace period for a machine to acquire a node when the spec leaves
/// nodeStartupTimeoutSeconds unset
pub const DEFAULT_NODE_STARTUP_TIMEOUT: Duration = Duration::from_secs(600);

/// MHC annotation selecting out-of-band remediation instead of deletion
pub const REMEDIATION_STRATEGY_ANNOTATION: &str = "machine.platform.dev/remediation-strategy";
/// Value of [`REMEDIATION_STRATEGY_ANNOTATION`] requesting external remediation
pub const REMEDIATION_STRATEGY_EXTERNAL: &str = "external";

/// The MachineHealthCheck CRD defines unhealthy-condition timeouts and a
/// remediation budget for a group of Machines.
///
/// # Example
///
/// ```yaml
/// apiVersion: machine.platform.dev/v1beta1
/// kind: MachineHealthCheck
/// metadata:
///   name: workers
///   namespace: machine-api
/// spec:
///   selector:
///     matchLabels:
///       machine.platform.dev/machine-role: worker
///   unhealthyConditions:
///     - type: Ready
///       status: Unknown
///       timeoutSeconds: 300
///     - type: Ready
///       status: "False"
///       timeoutSeconds: 300
///   maxUnhealthy: 40%
///   nodeStartupTimeoutSeconds: 600
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "machine.platform.dev",
    version = "v1beta1",
    kind = "MachineHealthCheck",
    namespaced,
    shortname = "mhc",
    status = "MachineHealthCheckStatus",
    printcolumn = r#"{"name":"MaxUnhealthy","type":"string","jsonPath":".spec.maxUnhealthy"}"#,
    printcolumn = r#"{"name":"ExpectedMachines","type":"integer","jsonPath":".status.expectedMachines"}"#,
    printcolumn = r#"{"name":"CurrentHealthy","type":"integer","jsonPath":".status.currentHealthy"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckSpec {
    /// Which machines this health check governs. An empty selector
    /// matches every machine in the namespace.
    #[serde(default)]
    pub selector: LabelSelector,

    /// Node conditions that mark a machine unhealthy once they persist
    /// past their timeout. Evaluated as independent OR-triggers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unhealthy_conditions: Vec<UnhealthyCondition>,

    /// Grace period for a machine to acquire a node before it counts as
    /// unhealthy. Defaults to 600 seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_startup_timeout_seconds: Option<i64>,

    /// Remediation budget: an absolute count or a percentage string
    /// ("40%") of expected machines. When the unhealthy count exceeds
    /// it, remediation is short-circuited entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unhealthy: Option<IntOrString>,
}

/// A node condition that marks a machine unhealthy after a timeout
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnhealthyCondition {
    /// Node condition type, e.g. "Ready"
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Condition status considered unhealthy, e.g. "Unknown" or "False"
    pub status: String,

    /// How long the condition must persist before remediation
    pub timeout_seconds: i64,
}

/// Observed state of a MachineHealthCheck, recomputed every reconcile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckStatus {
    /// Number of machines currently governed by this health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_machines: Option<i32>,

    /// Number of governed machines currently evaluated as healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_healthy: Option<i32>,
}

impl MachineHealthCheck {
    /// Startup grace period for machines that have not acquired a node
    pub fn node_startup_timeout(&self) -> Duration {
        self.spec
            .node_startup_timeout_seconds
            .filter(|s| *s >= 0)
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(DEFAULT_NODE_STARTUP_TIMEOUT)
    }

    /// Whether this health check hands unhealthy machines to an
    /// external remediation system instead of deleting them
    pub fn external_remediation(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(REMEDIATION_STRATEGY_ANNOTATION))
            .map(|v| v == REMEDIATION_STRATEGY_EXTERNAL)
            .unwrap_or(false)
    }
}

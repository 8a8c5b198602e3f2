//! Machine Custom Resource Definition
//!
//! A Machine represents one managed compute instance backing a cluster
//! node. Machines are usually stamped out by a MachineSet, acquire a
//! provider ID once the instance exists, and link to a Node once the
//! instance has joined the cluster.

use k8s_openapi::api::core::v1::{NodeAddress, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Machine phase: the instance is being created at the provider
pub const PHASE_PROVISIONING: &str = "Provisioning";
/// Machine phase: the provider instance exists but has not joined yet
pub const PHASE_PROVISIONED: &str = "Provisioned";
/// Machine phase: the instance backs a Node in the cluster
pub const PHASE_RUNNING: &str = "Running";
/// Machine phase: deletion has been requested
pub const PHASE_DELETING: &str = "Deleting";
/// Machine phase: the instance failed irrecoverably
pub const PHASE_FAILED: &str = "Failed";

/// The Machine CRD represents a managed compute instance.
///
/// # Example
///
/// ```yaml
/// apiVersion: machine.platform.dev/v1beta1
/// kind: Machine
/// metadata:
///   name: worker-us-east-1a-abc12
///   namespace: machine-api
///   labels:
///     machine.platform.dev/machine-role: worker
/// spec:
///   providerSpec:
///     instanceType: m5.large
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "machine.platform.dev",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeRef.name"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
#[derive(Default)]
pub struct MachineSpec {
    /// Provider-specific configuration, passed opaquely to the actuator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_spec: Option<serde_json::Value>,

    /// Stable external instance identifier, set once the instance exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Reference to the Node backed by this machine, set by the
    /// nodelink controller once the instance joins the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Last time the machine status was observed to change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,

    /// Lifecycle phase (Provisioning, Provisioned, Running, Deleting, Failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Terminal error reported by the provider actuator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Instance network addresses reported by the provider
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
}

impl Machine {
    /// Whether deletion has been requested for this machine
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The machine's current phase, empty string if none was set yet
    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("")
    }
}

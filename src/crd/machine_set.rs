//! MachineSet Custom Resource Definition
//!
//! A MachineSet maintains a stable set of replica Machines, analogous to
//! a ReplicaSet for Pods. The replica reconciler creates Machines from
//! the template and prioritizes deletion candidates on scale-down.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::machine::MachineSpec;

/// Which machines are removed first when a MachineSet scales down
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DeletePolicy {
    /// No ordering constraint beyond determinism
    #[default]
    Random,
    /// Delete the most recently created machines first
    Newest,
    /// Delete the longest-lived machines first
    Oldest,
}

/// The MachineSet CRD describes a desired replica count of Machines.
///
/// # Example
///
/// ```yaml
/// apiVersion: machine.platform.dev/v1beta1
/// kind: MachineSet
/// metadata:
///   name: worker-us-east-1a
///   namespace: machine-api
/// spec:
///   replicas: 3
///   deletePolicy: Oldest
///   selector:
///     matchLabels:
///       machine.platform.dev/machine-role: worker
///   template:
///     metadata:
///       labels:
///         machine.platform.dev/machine-role: worker
///     spec:
///       providerSpec:
///         instanceType: m5.large
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "machine.platform.dev",
    version = "v1beta1",
    kind = "MachineSet",
    namespaced,
    status = "MachineSetStatus",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of machines. Required; reconciliation refuses to
    /// guess a default for a missing count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Minimum number of seconds a machine must be ready before it is
    /// counted as available
    #[serde(default)]
    pub min_ready_seconds: i32,

    /// Deletion ordering applied when scaling down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_policy: Option<DeletePolicy>,

    /// Label selector for machines governed by this set. Must match the
    /// template labels.
    pub selector: LabelSelector,

    /// Template stamped onto machines created by this set
    pub template: MachineTemplateSpec,
}

/// Template describing the machines a MachineSet creates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Labels and annotations copied to created machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    /// Machine spec for created machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<MachineSpec>,
}

/// Observed state of a MachineSet
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    /// Number of non-terminated machines targeted by this set
    #[serde(default)]
    pub replicas: i32,

    /// Number of machines whose labels match the full template label set
    #[serde(default)]
    pub fully_labeled_replicas: i32,

    /// Number of machines backing a ready node
    #[serde(default)]
    pub ready_replicas: i32,

    /// Number of machines ready for at least minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,

    /// Generation most recently observed by the reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Terminal reconciliation failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl MachineSetSpec {
    /// Validate the parts of the spec that make reconciliation
    /// impossible when malformed. Selector/template agreement is
    /// checked by the controller, which owns label matching.
    pub fn validate(&self) -> Result<(), String> {
        match self.replicas {
            None => return Err("spec.replicas: a replica count is required".to_string()),
            Some(r) if r < 0 => {
                return Err(format!("spec.replicas: must be non-negative, got {}", r))
            }
            _ => {}
        }

        let no_match_labels = self
            .selector
            .match_labels
            .as_ref()
            .map_or(true, |m| m.is_empty());
        let no_match_expressions = self
            .selector
            .match_expressions
            .as_ref()
            .map_or(true, |m| m.is_empty());
        if no_match_labels && no_match_expressions {
            return Err(
                "spec.selector: an empty selector would claim every machine in the namespace"
                    .to_string(),
            );
        }

        Ok(())
    }

    /// Template labels, if any were set
    pub fn template_labels(&self) -> Option<&std::collections::BTreeMap<String, String>> {
        self.template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.as_ref())
    }
}

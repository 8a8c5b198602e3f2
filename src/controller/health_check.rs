//! MachineHealthCheck reconciliation
//!
//! Discovers the machines governed by a health check, evaluates each
//! against the configured unhealthy-condition timeouts, and remediates
//! the ones past their deadline. When the aggregate unhealthy count
//! exceeds the maxUnhealthy budget, remediation is short-circuited
//! entirely to protect against mass simultaneous deletion (e.g. from a
//! control-plane network partition).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    Machine, MachineHealthCheck, MachineHealthCheckStatus, MACHINE_ANNOTATION_KEY,
};
use crate::error::{Error, Result};

use super::events::emit_machine_event;
use super::metrics;
use super::remediation::{NodeLookup, Target, EVENT_DETECTED_UNHEALTHY};
use super::selector::selector_matches_labels;

/// Field manager used for status patches
const FIELD_MANAGER: &str = "machinehealthcheck-controller";

/// Shared state for the MachineHealthCheck controller
pub struct HealthCheckContext {
    pub client: Client,
    /// Skip remediation of control-plane machines instead of deleting
    /// them. Off by default; deletion matches the historical behavior.
    pub protect_control_plane: bool,
}

impl HealthCheckContext {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            protect_control_plane: false,
        }
    }
}

/// Main entry point to start the MachineHealthCheck controller
pub async fn run_health_check_controller(state: Arc<HealthCheckContext>) -> Result<()> {
    let client = state.client.clone();
    let health_checks: Api<MachineHealthCheck> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    info!("Starting MachineHealthCheck controller");

    let controller = Controller::new(health_checks, Config::default());
    let machine_store = controller.store();
    let node_store = controller.store();

    controller
        // Machine changes map to every health check whose selector matches
        .watches(machines, Config::default(), move |machine: Machine| {
            machine_store
                .state()
                .iter()
                .filter(|mhc| mhc.namespace() == machine.namespace())
                .filter(|mhc| {
                    selector_matches_labels(&mhc.spec.selector, machine.metadata.labels.as_ref())
                })
                .map(|mhc| ObjectRef::from_obj(mhc.as_ref()))
                .collect::<Vec<_>>()
        })
        // Node changes map through the machine annotation's namespace;
        // resolving the exact machine requires an API round-trip the
        // mapper cannot make, so every check in that namespace re-runs.
        .watches(nodes, Config::default(), move |node: Node| {
            let namespace = node
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(MACHINE_ANNOTATION_KEY))
                .and_then(|v| v.split('/').next())
                .map(str::to_string);
            let Some(namespace) = namespace else {
                return Vec::new();
            };
            node_store
                .state()
                .iter()
                .filter(|mhc| mhc.namespace().as_deref() == Some(namespace.as_str()))
                .map(|mhc| ObjectRef::from_obj(mhc.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled MachineHealthCheck {:?}", obj),
                Err(e) => error!("MachineHealthCheck reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function for a MachineHealthCheck
#[instrument(skip(ctx), fields(name = %mhc.name_any(), namespace = mhc.namespace()))]
async fn reconcile(mhc: Arc<MachineHealthCheck>, ctx: Arc<HealthCheckContext>) -> Result<Action> {
    let client = ctx.client.clone();
    let name = mhc.name_any();
    let namespace = mhc.namespace().unwrap_or_else(|| "default".to_string());

    if mhc.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    debug!("Reconciling MachineHealthCheck {}/{}", namespace, name);

    let targets = get_targets(&client, &mhc).await?;
    let total_targets = targets.len() as i32;

    let (current_healthy, need_remediation, next_check_times, errors) =
        health_check_targets(&client, &targets, mhc.node_startup_timeout()).await;

    // Status reflects observed reality every pass, before any gating.
    let mut mhc = (*mhc).clone();
    reconcile_status(&client, &mut mhc, total_targets, current_healthy).await?;
    metrics::set_health_check_counts(&namespace, &name, total_targets, current_healthy);

    if !errors.is_empty() {
        return Err(Error::ReconcileError(errors.join("; ")));
    }

    if !need_remediation.is_empty() {
        if !is_allowed_remediation(&mhc) {
            warn!(
                "Short-circuiting remediation for {}/{}: {} unhealthy of {} exceeds maxUnhealthy",
                namespace,
                name,
                total_targets - current_healthy,
                total_targets
            );
            return Ok(Action::await_change());
        }

        let mut remediation_errors = Vec::new();
        for target in &need_remediation {
            if let Err(e) = target.remediate(&client, ctx.protect_control_plane).await {
                error!("Failed to remediate machine {}: {}", target.describe(), e);
                remediation_errors.push(e.to_string());
            }
        }
        if !remediation_errors.is_empty() {
            return Err(Error::ReconcileError(remediation_errors.join("; ")));
        }
        // Remediation done; the machine watch drives the next pass.
        return Ok(Action::await_change());
    }

    if let Some(next) = next_check_times.into_iter().min() {
        debug!(
            "Some targets of {}/{} are inside their grace window, re-checking in {:?}",
            namespace, name, next
        );
        return Ok(Action::requeue(next));
    }

    Ok(Action::await_change())
}

/// Build the ephemeral targets governed by this health check
async fn get_targets(client: &Client, mhc: &MachineHealthCheck) -> Result<Vec<Target>> {
    let namespace = mhc.namespace().unwrap_or_else(|| "default".to_string());
    let machines_api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
    // Nodes are cluster-scoped; the lookup is global.
    let nodes_api: Api<Node> = Api::all(client.clone());

    let machines = machines_api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    let mut targets = Vec::new();
    for machine in machines.items {
        if !selector_matches_labels(&mhc.spec.selector, machine.metadata.labels.as_ref()) {
            continue;
        }
        let node_name = machine
            .status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.clone());
        let node = match node_name {
            None => NodeLookup::NotLinked,
            Some(node_name) => match nodes_api.get_opt(&node_name).await? {
                Some(node) => NodeLookup::Found(Box::new(node)),
                None => NodeLookup::Deleted,
            },
        };
        targets.push(Target {
            machine,
            node,
            mhc: mhc.clone(),
        });
    }
    Ok(targets)
}

/// Evaluate every target, splitting them into healthy, needing
/// remediation, and unhealthy-but-inside-grace (contributing the time
/// until their deadline)
async fn health_check_targets(
    client: &Client,
    targets: &[Target],
    node_startup_timeout: Duration,
) -> (i32, Vec<Target>, Vec<Duration>, Vec<String>) {
    let mut current_healthy = 0;
    let mut need_remediation = Vec::new();
    let mut next_check_times = Vec::new();
    let mut errors = Vec::new();

    for target in targets {
        let (needs, next_check) = target.needs_remediation(node_startup_timeout);
        if needs {
            need_remediation.push(target.clone());
            continue;
        }
        if next_check > Duration::ZERO {
            info!(
                "Machine {} is unhealthy, next check in {:?}",
                target.describe(),
                next_check
            );
            next_check_times.push(next_check);
            if let Err(e) = emit_machine_event(
                client,
                &target.machine,
                "Normal",
                EVENT_DETECTED_UNHEALTHY,
                &format!(
                    "Machine {} has unhealthy node; remediation deadline in {:?}",
                    target.machine.name_any(),
                    next_check
                ),
            )
            .await
            {
                errors.push(e.to_string());
            }
            continue;
        }
        current_healthy += 1;
    }

    (current_healthy, need_remediation, next_check_times, errors)
}

/// Whether the aggregate unhealthy count is within the maxUnhealthy
/// budget. Unparseable budgets disallow remediation: fewer deletions,
/// not more.
pub fn is_allowed_remediation(mhc: &MachineHealthCheck) -> bool {
    let max_unhealthy = match &mhc.spec.max_unhealthy {
        None => return true,
        Some(m) => m,
    };
    let threshold = match max_unhealthy_threshold(mhc, max_unhealthy) {
        Ok(t) => t,
        Err(e) => {
            warn!(
                "Invalid maxUnhealthy for MachineHealthCheck {}: {}",
                mhc.name_any(),
                e
            );
            return false;
        }
    };

    let expected = mhc
        .status
        .as_ref()
        .and_then(|s| s.expected_machines)
        .unwrap_or(0);
    let healthy = mhc
        .status
        .as_ref()
        .and_then(|s| s.current_healthy)
        .unwrap_or(0);

    expected - healthy <= threshold
}

fn max_unhealthy_threshold(mhc: &MachineHealthCheck, value: &IntOrString) -> Result<i32> {
    let (value, is_percent) = get_int_or_percent(value)?;
    if !is_percent {
        return Ok(value);
    }
    let expected = mhc
        .status
        .as_ref()
        .and_then(|s| s.expected_machines)
        .unwrap_or(0);
    Ok((expected * value) / 100)
}

/// Resolve the percent-or-int duck typing of maxUnhealthy into
/// `(value, is_percent)`
pub fn get_int_or_percent(value: &IntOrString) -> Result<(i32, bool)> {
    match value {
        IntOrString::Int(i) => Ok((*i, false)),
        IntOrString::String(s) => {
            if let Some(stripped) = s.strip_suffix('%') {
                stripped
                    .trim()
                    .parse::<i32>()
                    .map(|v| (v, true))
                    .map_err(|e| Error::ConfigError(format!("invalid value {:?}: {}", s, e)))
            } else {
                s.trim()
                    .parse::<i32>()
                    .map(|v| (v, false))
                    .map_err(|e| Error::ConfigError(format!("invalid value {:?}: {}", s, e)))
            }
        }
    }
}

/// Update the status subresource with the recomputed counts
async fn reconcile_status(
    client: &Client,
    mhc: &mut MachineHealthCheck,
    expected_machines: i32,
    current_healthy: i32,
) -> Result<()> {
    let namespace = mhc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<MachineHealthCheck> = Api::namespaced(client.clone(), &namespace);

    let status = MachineHealthCheckStatus {
        expected_machines: Some(expected_machines),
        current_healthy: Some(current_healthy),
    };
    mhc.status = Some(status.clone());

    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &mhc.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(
    mhc: Arc<MachineHealthCheck>,
    error: &Error,
    _ctx: Arc<HealthCheckContext>,
) -> Action {
    error!("Reconciliation error for {}: {:?}", mhc.name_any(), error);

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MachineHealthCheckSpec;

    fn mhc_with_budget(
        max_unhealthy: Option<IntOrString>,
        expected: Option<i32>,
        healthy: Option<i32>,
    ) -> MachineHealthCheck {
        let mut mhc = MachineHealthCheck::new(
            "workers",
            MachineHealthCheckSpec {
                max_unhealthy,
                ..Default::default()
            },
        );
        mhc.status = Some(MachineHealthCheckStatus {
            expected_machines: expected,
            current_healthy: healthy,
        });
        mhc
    }

    #[test]
    fn not_above_max_unhealthy_int() {
        let mhc = mhc_with_budget(Some(IntOrString::Int(2)), Some(5), Some(3));
        assert!(is_allowed_remediation(&mhc));
    }

    #[test]
    fn above_max_unhealthy_int() {
        let mhc = mhc_with_budget(Some(IntOrString::Int(2)), Some(5), Some(2));
        assert!(!is_allowed_remediation(&mhc));
    }

    #[test]
    fn negative_max_unhealthy_never_allows() {
        let mhc = mhc_with_budget(Some(IntOrString::Int(-2)), Some(5), Some(5));
        assert!(!is_allowed_remediation(&mhc));
    }

    #[test]
    fn not_above_max_unhealthy_percentage() {
        // 40% of 5 => threshold 2, 5-3=2 unhealthy
        let mhc = mhc_with_budget(
            Some(IntOrString::String("40%".to_string())),
            Some(5),
            Some(3),
        );
        assert!(is_allowed_remediation(&mhc));
    }

    #[test]
    fn above_max_unhealthy_percentage() {
        let mhc = mhc_with_budget(
            Some(IntOrString::String("40%".to_string())),
            Some(5),
            Some(2),
        );
        assert!(!is_allowed_remediation(&mhc));
    }

    #[test]
    fn int_in_string_budget() {
        let mhc = mhc_with_budget(Some(IntOrString::String("2".to_string())), Some(5), Some(3));
        assert!(is_allowed_remediation(&mhc));

        let mhc = mhc_with_budget(Some(IntOrString::String("2".to_string())), Some(5), Some(2));
        assert!(!is_allowed_remediation(&mhc));
    }

    #[test]
    fn missing_status_counts_are_treated_as_zero() {
        let mhc = mhc_with_budget(Some(IntOrString::String("40%".to_string())), None, None);
        assert!(is_allowed_remediation(&mhc));
    }

    #[test]
    fn invalid_budget_string_disallows() {
        let mhc = mhc_with_budget(
            Some(IntOrString::String("foo%50".to_string())),
            None,
            None,
        );
        assert!(!is_allowed_remediation(&mhc));
    }

    #[test]
    fn no_budget_always_allows() {
        let mhc = mhc_with_budget(None, Some(5), Some(0));
        assert!(is_allowed_remediation(&mhc));
    }

    #[test]
    fn int_or_percent_parse_table() {
        let cases: Vec<(IntOrString, Option<(i32, bool)>)> = vec![
            (IntOrString::Int(10), Some((10, false))),
            (IntOrString::String("20%".to_string()), Some((20, true))),
            (IntOrString::String("30".to_string()), Some((30, false))),
            (IntOrString::String("a".to_string()), None),
            (IntOrString::String("a%".to_string()), None),
            (IntOrString::String("1%0".to_string()), None),
        ];
        for (input, expected) in cases {
            let got = get_int_or_percent(&input);
            match expected {
                Some(pair) => assert_eq!(got.unwrap(), pair, "input {:?}", input),
                None => assert!(got.is_err(), "input {:?} should fail", input),
            }
        }
    }
}

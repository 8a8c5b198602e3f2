//! MachineSet replica reconciliation
//!
//! Drives the number of machines controlled by a MachineSet to its
//! desired replica count: adopts matching orphans, creates machines
//! from the template on scale-up, deletes prioritized candidates on
//! scale-down, and confirms convergence against the local cache before
//! reporting success.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    Machine, MachineSet, MachineSetStatus, OwnerKind, PHASE_RUNNING,
};
use crate::error::{Error, Result};

use super::delete_policy::machines_to_delete;
use super::metrics;
use super::selector::selector_matches_labels;

/// Field manager used for status and adoption patches
const FIELD_MANAGER: &str = "machineset-controller";

/// Shared state for the MachineSet controller
pub struct MachineSetContext {
    pub client: Client,
    /// Time allowed for a create/delete to become observable in the cache
    pub state_confirmation_timeout: Duration,
    /// Interval between polls of the local cache
    pub state_confirmation_interval: Duration,
}

impl MachineSetContext {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            state_confirmation_timeout: Duration::from_secs(10),
            state_confirmation_interval: Duration::from_millis(100),
        }
    }
}

/// Main entry point to start the MachineSet controller
pub async fn run_machine_set_controller(state: Arc<MachineSetContext>) -> Result<()> {
    let client = state.client.clone();
    let machine_sets: Api<MachineSet> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client.clone());

    info!("Starting MachineSet controller");

    let controller = Controller::new(machine_sets, Config::default());
    let store = controller.store();

    controller
        // Owned machines map back to their MachineSet via controller ref
        .owns(machines.clone(), Config::default())
        // Orphan machines map to every MachineSet whose selector claims them
        .watches(machines, Config::default(), move |machine: Machine| {
            if OwnerKind::of(&machine.metadata).is_controlled() {
                return Vec::new();
            }
            store
                .state()
                .iter()
                .filter(|ms| ms.namespace() == machine.namespace())
                .filter(|ms| {
                    selector_matches_labels(&ms.spec.selector, machine.metadata.labels.as_ref())
                })
                .map(|ms| ObjectRef::from_obj(ms.as_ref()))
                .collect()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled MachineSet {:?}", obj),
                Err(e) => error!("MachineSet reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function for a MachineSet
#[instrument(skip(ctx), fields(name = %ms.name_any(), namespace = ms.namespace()))]
async fn reconcile(ms: Arc<MachineSet>, ctx: Arc<MachineSetContext>) -> Result<Action> {
    let client = ctx.client.clone();
    let namespace = ms.namespace().unwrap_or_else(|| "default".to_string());
    let name = ms.name_any();

    // Deleted MachineSets clean up through garbage collection of the
    // controller references; nothing to reconcile.
    if ms.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    if let Err(msg) = ms.spec.validate() {
        warn!("MachineSet {}/{} failed validation: {}", namespace, name, msg);
        return Err(Error::ValidationError(msg));
    }

    // The selector must be able to claim machines stamped from the
    // template, otherwise every created machine is immediately orphaned.
    if !selector_matches_labels(&ms.spec.selector, ms.spec.template_labels()) {
        return Err(Error::ValidationError(format!(
            "MachineSet {}/{} selector does not match template labels",
            namespace, name
        )));
    }

    let machines_api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
    let all_machines = machines_api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    // Filter out irrelevant machines (deleting/other owners/label
    // mismatch) and claim matching orphans.
    let mut filtered: Vec<Machine> = Vec::new();
    for machine in all_machines.items {
        if should_exclude_machine(&ms, &machine) {
            continue;
        }
        if !OwnerKind::of(&machine.metadata).is_controlled() {
            match adopt_orphan(&machines_api, &ms, &machine).await {
                Ok(adopted) => filtered.push(adopted),
                Err(e) => {
                    warn!(
                        "Failed to adopt machine {} into MachineSet {}/{}: {}",
                        machine.name_any(),
                        namespace,
                        name,
                        e
                    );
                    continue;
                }
            }
        } else {
            filtered.push(machine);
        }
    }
    // Deterministic ordering for stable diffing
    filtered.sort_by_key(|m| m.name_any());

    let sync_result = sync_replicas(&ctx, &machines_api, &ms, &filtered).await;

    // Always update status as machines come up or die, even when the
    // sync itself failed partway through.
    let new_status = calculate_status(&ms, &filtered);
    metrics::set_machine_set_replicas(
        &namespace,
        &name,
        new_status.replicas,
        new_status.ready_replicas,
    );
    let status_result = update_status(&client, &ms, &new_status).await;

    match (sync_result, status_result) {
        (Err(sync_err), Err(status_err)) => Err(Error::ReconcileError(format!(
            "failed to sync machines: {}. failed to update machine set status: {}",
            sync_err, status_err
        ))),
        (Err(sync_err), Ok(())) => {
            emit_sync_failure_event(&client, &ms, &sync_err).await;
            Err(sync_err)
        }
        (Ok(()), Err(status_err)) => Err(status_err),
        (Ok(()), Ok(())) => {
            let replicas = ms.spec.replicas.unwrap_or(0);
            // Re-check after the availability window so an available
            // replica is not left stuck in the ready state by clock skew
            // between "became ready" and "ready long enough".
            if ms.spec.min_ready_seconds > 0
                && new_status.ready_replicas == replicas
                && new_status.available_replicas != replicas
            {
                return Ok(Action::requeue(Duration::from_secs(
                    ms.spec.min_ready_seconds as u64,
                )));
            }
            Ok(Action::requeue(Duration::from_secs(300)))
        }
    }
}

async fn emit_sync_failure_event(client: &Client, ms: &MachineSet, err: &Error) {
    // Best effort; the reconcile error is already propagated.
    let namespace = ms.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<k8s_openapi::api::core::v1::Event> =
        Api::namespaced(client.clone(), &namespace);
    let time = Utc::now();
    let event = k8s_openapi::api::core::v1::Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-event-", ms.name_any())),
            namespace: Some(namespace.clone()),
            ..Default::default()
        },
        type_: Some("Warning".to_string()),
        reason: Some("FailedSync".to_string()),
        message: Some(err.to_string()),
        involved_object: k8s_openapi::api::core::v1::ObjectReference {
            api_version: Some(MachineSet::api_version(&()).to_string()),
            kind: Some(MachineSet::kind(&()).to_string()),
            name: Some(ms.name_any()),
            namespace: Some(namespace),
            uid: ms.metadata.uid.clone(),
            ..Default::default()
        },
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };
    if let Err(e) = events.create(&PostParams::default(), &event).await {
        warn!("Failed to emit FailedSync event: {}", e);
    }
}

/// Scale machine resources up or down to the desired replica count
async fn sync_replicas(
    ctx: &MachineSetContext,
    api: &Api<Machine>,
    ms: &MachineSet,
    machines: &[Machine],
) -> Result<()> {
    let replicas = ms
        .spec
        .replicas
        .ok_or_else(|| Error::ValidationError("spec.replicas must be set".to_string()))?;
    let diff = machines.len() as i64 - replicas as i64;

    if diff < 0 {
        let missing = (-diff) as usize;
        info!(
            "Too few replicas for MachineSet {}/{}, need {}, creating {}",
            ms.namespace().unwrap_or_default(),
            ms.name_any(),
            replicas,
            missing
        );

        let mut created = Vec::new();
        let mut create_errors = Vec::new();
        for i in 0..missing {
            info!(
                "Creating machine {} of {} ( spec.replicas({}) > current({}) )",
                i + 1,
                missing,
                replicas,
                machines.len()
            );
            let machine = machine_from_template(ms);
            match api.create(&PostParams::default(), &machine).await {
                Ok(m) => created.push(m),
                Err(e) => {
                    error!("Unable to create machine: {}", e);
                    create_errors.push(e.to_string());
                }
            }
        }
        if !create_errors.is_empty() {
            return Err(Error::ReconcileError(create_errors.join("; ")));
        }
        wait_for_machine_creation(ctx, api, &created).await
    } else if diff > 0 {
        let excess = diff as usize;
        let policy = ms.spec.delete_policy.unwrap_or_default();
        info!(
            "Too many replicas for MachineSet {}/{}, need {}, deleting {} with {:?} policy",
            ms.namespace().unwrap_or_default(),
            ms.name_any(),
            replicas,
            excess,
            policy
        );

        let to_delete = machines_to_delete(machines, excess, policy);

        // Every deletion is attempted even if one fails; the first
        // error is the one reported.
        let results = join_all(to_delete.iter().map(|machine| {
            let api = api.clone();
            let name = machine.name_any();
            async move {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                    Err(e) => {
                        error!("Unable to delete machine {}: {}", name, e);
                        Err(e)
                    }
                }
            }
        }))
        .await;

        if let Some(e) = results.into_iter().find_map(|r| r.err()) {
            return Err(Error::KubeError(e));
        }
        wait_for_machine_deletion(ctx, api, &to_delete).await
    } else {
        Ok(())
    }
}

/// Build a machine from the MachineSet template. The final name comes
/// from the API server through generateName.
fn machine_from_template(ms: &MachineSet) -> Machine {
    let template = &ms.spec.template;
    Machine {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", ms.name_any())),
            namespace: ms.namespace(),
            labels: template.metadata.as_ref().and_then(|m| m.labels.clone()),
            annotations: template
                .metadata
                .as_ref()
                .and_then(|m| m.annotations.clone()),
            owner_references: Some(vec![controller_owner_ref(ms)]),
            ..Default::default()
        },
        spec: template.spec.clone().unwrap_or_default(),
        status: None,
    }
}

fn controller_owner_ref(ms: &MachineSet) -> OwnerReference {
    OwnerReference {
        api_version: MachineSet::api_version(&()).to_string(),
        kind: MachineSet::kind(&()).to_string(),
        name: ms.name_any(),
        uid: ms.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether the machine is irrelevant to this MachineSet
fn should_exclude_machine(ms: &MachineSet, machine: &Machine) -> bool {
    if let OwnerKind::MachineSet(owner) = OwnerKind::of(&machine.metadata) {
        if owner != ms.name_any() {
            return true;
        }
    } else if OwnerKind::of(&machine.metadata).is_controlled() {
        // Controlled by a different kind of controller entirely
        return true;
    }

    if machine.is_deleting() {
        return true;
    }

    !selector_matches_labels(&ms.spec.selector, machine.metadata.labels.as_ref())
}

/// Claim an orphan by appending a controller reference
async fn adopt_orphan(api: &Api<Machine>, ms: &MachineSet, machine: &Machine) -> Result<Machine> {
    let mut refs = machine.metadata.owner_references.clone().unwrap_or_default();
    refs.push(controller_owner_ref(ms));
    let patch = serde_json::json!({ "metadata": { "ownerReferences": refs } });
    api.patch(
        &machine.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)
}

/// Poll until every newly created machine is observable, guarding
/// against stale-read races before reporting success
async fn wait_for_machine_creation(
    ctx: &MachineSetContext,
    api: &Api<Machine>,
    machines: &[Machine],
) -> Result<()> {
    for machine in machines {
        let name = machine.name_any();
        let deadline = tokio::time::Instant::now() + ctx.state_confirmation_timeout;
        loop {
            match api.get_opt(&name).await {
                Ok(Some(_)) => break,
                Ok(None) => {}
                Err(e) => return Err(Error::KubeError(e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::PollTimeout(format!(
                    "machine {} was not observed after creation",
                    name
                )));
            }
            tokio::time::sleep(ctx.state_confirmation_interval).await;
        }
    }
    Ok(())
}

/// Poll until every targeted machine is gone or carries a deletion
/// timestamp
async fn wait_for_machine_deletion(
    ctx: &MachineSetContext,
    api: &Api<Machine>,
    machines: &[Machine],
) -> Result<()> {
    for machine in machines {
        let name = machine.name_any();
        let deadline = tokio::time::Instant::now() + ctx.state_confirmation_timeout;
        loop {
            match api.get_opt(&name).await {
                Ok(Some(m)) if m.metadata.deletion_timestamp.is_none() => {}
                Ok(_) => break,
                Err(e) => return Err(Error::KubeError(e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::PollTimeout(format!(
                    "machine {} was not observed to be deleted",
                    name
                )));
            }
            tokio::time::sleep(ctx.state_confirmation_interval).await;
        }
    }
    Ok(())
}

/// Recompute the MachineSet status from the controlled set
fn calculate_status(ms: &MachineSet, machines: &[Machine]) -> MachineSetStatus {
    let template_labels = ms.spec.template_labels();
    let now = Utc::now();

    let mut fully_labeled = 0;
    let mut ready = 0;
    let mut available = 0;
    for machine in machines {
        let labels = machine.metadata.labels.as_ref();
        let carries_template_labels = match template_labels {
            None => true,
            Some(wanted) => wanted
                .iter()
                .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v)),
        };
        if carries_template_labels {
            fully_labeled += 1;
        }
        if machine_is_ready(machine) {
            ready += 1;
            if machine_is_available(machine, ms.spec.min_ready_seconds, now) {
                available += 1;
            }
        }
    }

    MachineSetStatus {
        replicas: machines.len() as i32,
        fully_labeled_replicas: fully_labeled,
        ready_replicas: ready,
        available_replicas: available,
        observed_generation: ms.metadata.generation,
        error_message: None,
    }
}

/// A machine is ready once it backs a node and reports Running
fn machine_is_ready(machine: &Machine) -> bool {
    machine
        .status
        .as_ref()
        .map(|s| s.node_ref.is_some())
        .unwrap_or(false)
        && machine.phase() == PHASE_RUNNING
}

/// A ready machine is available once it has been ready for at least
/// minReadySeconds, judged from the last status transition
fn machine_is_available(
    machine: &Machine,
    min_ready_seconds: i32,
    now: chrono::DateTime<Utc>,
) -> bool {
    if min_ready_seconds <= 0 {
        return true;
    }
    match machine
        .status
        .as_ref()
        .and_then(|s| s.last_updated.as_ref())
    {
        Some(last_updated) => {
            now.signed_duration_since(last_updated.0)
                >= chrono::Duration::seconds(min_ready_seconds as i64)
        }
        None => false,
    }
}

/// Update the status subresource of a MachineSet
async fn update_status(
    client: &Client,
    ms: &MachineSet,
    status: &MachineSetStatus,
) -> Result<()> {
    if ms.status.as_ref() == Some(status) {
        return Ok(());
    }
    let namespace = ms.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<MachineSet> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &ms.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(ms: Arc<MachineSet>, error: &Error, _ctx: Arc<MachineSetContext>) -> Action {
    error!("Reconciliation error for {}: {:?}", ms.name_any(), error);

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
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
    use std::collections::BTreeMap;

    use crate::crd::{MachineSetSpec, MachineSpec, MachineStatus, MachineTemplateSpec};

    fn worker_labels() -> BTreeMap<String, String> {
        BTreeMap::from([("role".to_string(), "worker".to_string())])
    }

    fn machine_set(replicas: i32) -> MachineSet {
        let mut ms = MachineSet::new(
            "workers",
            MachineSetSpec {
                replicas: Some(replicas),
                min_ready_seconds: 0,
                delete_policy: None,
                selector: LabelSelector {
                    match_labels: Some(worker_labels()),
                    match_expressions: None,
                },
                template: MachineTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(worker_labels()),
                        ..Default::default()
                    }),
                    spec: Some(MachineSpec::default()),
                },
            },
        );
        ms.metadata.namespace = Some("machine-api".to_string());
        ms.metadata.uid = Some("ms-uid".to_string());
        ms
    }

    fn worker_machine(name: &str) -> Machine {
        let mut m = Machine::new(name, MachineSpec::default());
        m.metadata.namespace = Some("machine-api".to_string());
        m.metadata.labels = Some(worker_labels());
        m.metadata.owner_references = Some(vec![OwnerReference {
            api_version: MachineSet::api_version(&()).to_string(),
            kind: "MachineSet".to_string(),
            name: "workers".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        m
    }

    #[test]
    fn template_machine_carries_owner_and_prefix() {
        let ms = machine_set(2);
        let machine = machine_from_template(&ms);

        assert_eq!(machine.metadata.generate_name.as_deref(), Some("workers-"));
        assert_eq!(machine.metadata.namespace.as_deref(), Some("machine-api"));
        assert_eq!(machine.metadata.labels, Some(worker_labels()));

        let owner = &machine.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "MachineSet");
        assert_eq!(owner.name, "workers");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn excludes_machines_owned_by_other_controllers() {
        let ms = machine_set(1);

        let mut other_set = worker_machine("other");
        other_set.metadata.owner_references.as_mut().unwrap()[0].name = "spares".to_string();
        assert!(should_exclude_machine(&ms, &other_set));

        let mut other_kind = worker_machine("deployment-owned");
        other_kind.metadata.owner_references.as_mut().unwrap()[0].kind =
            "MachineDeployment".to_string();
        assert!(should_exclude_machine(&ms, &other_kind));
    }

    #[test]
    fn excludes_deleting_and_mismatched_machines() {
        let ms = machine_set(1);

        let mut deleting = worker_machine("deleting");
        deleting.metadata.deletion_timestamp = Some(Time(Utc.timestamp_opt(100, 0).unwrap()));
        assert!(should_exclude_machine(&ms, &deleting));

        let mut mismatched = worker_machine("mismatched");
        mismatched.metadata.labels = Some(BTreeMap::from([(
            "role".to_string(),
            "infra".to_string(),
        )]));
        assert!(should_exclude_machine(&ms, &mismatched));
    }

    #[test]
    fn keeps_owned_matching_machines_and_orphans() {
        let ms = machine_set(1);
        assert!(!should_exclude_machine(&ms, &worker_machine("owned")));

        let mut orphan = worker_machine("orphan");
        orphan.metadata.owner_references = None;
        assert!(!should_exclude_machine(&ms, &orphan));
    }

    #[test]
    fn status_counts_ready_and_available() {
        let mut ms = machine_set(3);
        ms.spec.min_ready_seconds = 60;
        let now = Utc::now();

        let mut running_old = worker_machine("m-1");
        running_old.status = Some(MachineStatus {
            node_ref: Some(ObjectReference {
                name: Some("node-1".to_string()),
                ..Default::default()
            }),
            phase: Some(PHASE_RUNNING.to_string()),
            last_updated: Some(Time(now - chrono::Duration::seconds(120))),
            ..Default::default()
        });

        let mut running_fresh = worker_machine("m-2");
        running_fresh.status = Some(MachineStatus {
            node_ref: Some(ObjectReference {
                name: Some("node-2".to_string()),
                ..Default::default()
            }),
            phase: Some(PHASE_RUNNING.to_string()),
            last_updated: Some(Time(now - chrono::Duration::seconds(10))),
            ..Default::default()
        });

        let provisioning = worker_machine("m-3");

        let status = calculate_status(&ms, &[running_old, running_fresh, provisioning]);
        assert_eq!(status.replicas, 3);
        assert_eq!(status.fully_labeled_replicas, 3);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.available_replicas, 1);
    }

    #[test]
    fn converged_set_selects_no_deletions() {
        let machines = vec![worker_machine("m-1"), worker_machine("m-2")];
        let diff = machines.len() as i64 - 2;
        assert_eq!(diff, 0);
        // A converged reconcile never reaches the selection step; the
        // selection itself is also a no-op for a zero diff.
        assert!(machines_to_delete(&machines, 0, Default::default()).is_empty());
    }
}

//! Machine lifecycle reconciliation
//!
//! Tracks each machine through its phases: Provisioning until the
//! provider reports an instance, Provisioned until the instance joins
//! the cluster as a node, then Running. Terminal provider failures
//! surface as Failed and are left for the health check controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument};

use crate::crd::{
    Machine, MACHINE_FINALIZER, PHASE_DELETING, PHASE_FAILED, PHASE_PROVISIONED,
    PHASE_PROVISIONING, PHASE_RUNNING,
};
use crate::error::{Error, Result};

/// Field manager used for status patches
const FIELD_MANAGER: &str = "machine-controller";

/// Shared state for the machine controller
pub struct MachineContext {
    pub client: Client,
}

/// Main entry point to start the machine controller
pub async fn run_machine_controller(state: Arc<MachineContext>) -> Result<()> {
    let client = state.client.clone();
    let machines: Api<Machine> = Api::all(client.clone());

    info!("Starting machine controller");

    Controller::new(machines, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled Machine {:?}", obj),
                Err(e) => error!("Machine reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function for a Machine
#[instrument(skip(ctx), fields(name = %machine.name_any(), namespace = machine.namespace()))]
async fn reconcile(machine: Arc<Machine>, ctx: Arc<MachineContext>) -> Result<Action> {
    let client = ctx.client.clone();
    let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);

    finalizer(&api, MACHINE_FINALIZER, machine, |event| async {
        match event {
            FinalizerEvent::Apply(machine) => apply_machine(&client, &machine).await,
            FinalizerEvent::Cleanup(machine) => cleanup_machine(&client, &machine).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Derive the phase a machine should report
fn derive_phase(machine: &Machine) -> &'static str {
    let status = machine.status.as_ref();
    if status.and_then(|s| s.error_message.as_ref()).is_some() {
        PHASE_FAILED
    } else if status.and_then(|s| s.node_ref.as_ref()).is_some() {
        PHASE_RUNNING
    } else if machine.spec.provider_id.is_some() {
        PHASE_PROVISIONED
    } else {
        PHASE_PROVISIONING
    }
}

/// Reconcile a live machine's phase
async fn apply_machine(client: &Client, machine: &Machine) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());
    let name = machine.name_any();

    let phase = derive_phase(machine);
    if machine.phase() != phase {
        info!(
            "Machine {}/{} transitioning from {:?} to {}",
            namespace,
            name,
            machine.phase(),
            phase
        );
        let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
        let patch = serde_json::json!({
            "status": {
                "phase": phase,
                "lastUpdated": Time(Utc::now()),
            }
        });
        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    }

    // Check more frequently while the machine is still converging
    let requeue_duration = if phase == PHASE_RUNNING {
        Duration::from_secs(300)
    } else {
        Duration::from_secs(30)
    };

    Ok(Action::requeue(requeue_duration))
}

/// Release the machine once instance teardown is complete. Provider
/// teardown itself belongs to the actuator; this controller only holds
/// the finalizer until the deletion has been observed.
async fn cleanup_machine(client: &Client, machine: &Machine) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());
    let name = machine.name_any();

    if machine.phase() != PHASE_DELETING {
        let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
        let patch = serde_json::json!({
            "status": {
                "phase": PHASE_DELETING,
                "lastUpdated": Time(Utc::now()),
            }
        });
        // Best effort; the object is on its way out either way.
        if let Err(e) = api
            .patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            debug!("Failed to mark machine {}/{} Deleting: {}", namespace, name, e);
        }
    }

    info!("Machine {}/{} deleted, releasing finalizer", namespace, name);
    Ok(Action::await_change())
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<MachineContext>) -> Action {
    error!(
        "Reconciliation error for {}: {:?}",
        machine.name_any(),
        error
    );

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

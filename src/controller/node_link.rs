//! Node/Machine correlation
//!
//! Links Nodes to the Machines backing them: matched by provider ID
//! when both sides report one, falling back to internal IP address.
//! A successful match sets the machine's nodeRef and annotates the
//! node with the machine's namespace/name.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
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
use tracing::{debug, error, info, instrument};

use crate::crd::{Machine, MACHINE_ANNOTATION_KEY};
use crate::error::{Error, Result};

/// Field manager used for link patches
const FIELD_MANAGER: &str = "nodelink-controller";

/// Address type carrying a node's cluster-internal IP
const INTERNAL_IP: &str = "InternalIP";

/// Shared state for the nodelink controller
pub struct NodeLinkContext {
    pub client: Client,
}

/// Main entry point to start the nodelink controller
pub async fn run_node_link_controller(state: Arc<NodeLinkContext>) -> Result<()> {
    let client = state.client.clone();
    let nodes: Api<Node> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client.clone());

    info!("Starting nodelink controller");

    Controller::new(nodes, Config::default())
        // Machine changes map to the node they reference
        .watches(machines, Config::default(), |machine: Machine| {
            machine
                .status
                .as_ref()
                .and_then(|s| s.node_ref.as_ref())
                .and_then(|r| r.name.clone())
                .map(|name| ObjectRef::new(&name))
                .into_iter()
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled Node {:?}", obj),
                Err(e) => error!("Node reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function for a Node
#[instrument(skip(ctx), fields(name = %node.name_any()))]
async fn reconcile(node: Arc<Node>, ctx: Arc<NodeLinkContext>) -> Result<Action> {
    let client = ctx.client.clone();
    let node_name = node.name_any();

    if node.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    // Machines may live in any namespace; search them all.
    let machines_api: Api<Machine> = Api::all(client.clone());
    let machines = machines_api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    let matched = match find_machine_for_node(&node, &machines.items) {
        Some(machine) => machine,
        None => {
            debug!("No machine matches node {}", node_name);
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    };

    let namespace = matched.namespace().unwrap_or_else(|| "default".to_string());
    let machine_name = matched.name_any();

    let already_linked = matched
        .status
        .as_ref()
        .and_then(|s| s.node_ref.as_ref())
        .and_then(|r| r.name.as_deref())
        == Some(node_name.as_str());
    if !already_linked {
        info!(
            "Linking node {} to machine {}/{}",
            node_name, namespace, machine_name
        );
        let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
        let patch = serde_json::json!({
            "status": {
                "nodeRef": {
                    "kind": "Node",
                    "name": node_name,
                }
            }
        });
        api.patch_status(
            &machine_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
    }

    let annotation_value = format!("{}/{}", namespace, machine_name);
    let annotated = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(MACHINE_ANNOTATION_KEY))
        == Some(&annotation_value);
    if !annotated {
        let nodes_api: Api<Node> = Api::all(client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { MACHINE_ANNOTATION_KEY: annotation_value }
            }
        });
        nodes_api
            .patch(&node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
    }

    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Find the machine backing a node: provider ID first, then any shared
/// internal IP address
fn find_machine_for_node<'a>(node: &Node, machines: &'a [Machine]) -> Option<&'a Machine> {
    if let Some(provider_id) = node.spec.as_ref().and_then(|s| s.provider_id.as_ref()) {
        if let Some(machine) = machines
            .iter()
            .find(|m| m.spec.provider_id.as_ref() == Some(provider_id))
        {
            return Some(machine);
        }
    }

    let node_ips: Vec<&String> = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter(|a| a.type_ == INTERNAL_IP)
                .map(|a| &a.address)
                .collect()
        })
        .unwrap_or_default();
    if node_ips.is_empty() {
        return None;
    }

    machines.iter().find(|machine| {
        machine
            .status
            .as_ref()
            .map(|s| {
                s.addresses
                    .iter()
                    .filter(|a| a.type_ == INTERNAL_IP)
                    .any(|a| node_ips.contains(&&a.address))
            })
            .unwrap_or(false)
    })
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(node: Arc<Node>, error: &Error, _ctx: Arc<NodeLinkContext>) -> Action {
    error!("Reconciliation error for {}: {:?}", node.name_any(), error);

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

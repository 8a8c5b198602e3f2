//! Kubernetes Event emission helpers

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};

use crate::crd::Machine;
use crate::error::{Error, Result};

/// Build an ObjectReference pointing at a Machine
pub fn machine_reference(machine: &Machine) -> ObjectReference {
    ObjectReference {
        api_version: Some(Machine::api_version(&()).to_string()),
        kind: Some(Machine::kind(&()).to_string()),
        name: Some(machine.name_any()),
        namespace: machine.namespace(),
        uid: machine.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Helper to emit a Kubernetes Event against a Machine
pub async fn emit_machine_event(
    client: &Client,
    machine: &Machine,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", machine.name_any())),
            namespace: Some(namespace.clone()),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: machine_reference(machine),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

//! Prometheus metrics for the machine-api operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels identifying a namespaced API object
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ObjectLabels {
    pub namespace: String,
    pub name: String,
}

/// Gauge tracking observed replicas per MachineSet
pub static MACHINE_SET_REPLICAS: Lazy<Family<ObjectLabels, Gauge>> = Lazy::new(Family::default);

/// Gauge tracking ready replicas per MachineSet
pub static MACHINE_SET_READY_REPLICAS: Lazy<Family<ObjectLabels, Gauge>> =
    Lazy::new(Family::default);

/// Gauge tracking machines governed by a MachineHealthCheck
pub static HEALTH_CHECK_EXPECTED: Lazy<Family<ObjectLabels, Gauge>> = Lazy::new(Family::default);

/// Gauge tracking currently healthy machines per MachineHealthCheck
pub static HEALTH_CHECK_HEALTHY: Lazy<Family<ObjectLabels, Gauge>> = Lazy::new(Family::default);

/// Counter of remediations performed per MachineHealthCheck
pub static REMEDIATIONS_TOTAL: Lazy<Family<ObjectLabels, Counter>> = Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "machine_set_replicas",
        "Observed machines controlled by a MachineSet",
        MACHINE_SET_REPLICAS.clone(),
    );
    registry.register(
        "machine_set_ready_replicas",
        "Ready machines controlled by a MachineSet",
        MACHINE_SET_READY_REPLICAS.clone(),
    );
    registry.register(
        "machine_health_check_expected_machines",
        "Machines governed by a MachineHealthCheck",
        HEALTH_CHECK_EXPECTED.clone(),
    );
    registry.register(
        "machine_health_check_current_healthy",
        "Healthy machines per MachineHealthCheck",
        HEALTH_CHECK_HEALTHY.clone(),
    );
    registry.register(
        "machine_health_check_remediations",
        "Remediations performed per MachineHealthCheck",
        REMEDIATIONS_TOTAL.clone(),
    );
    registry
});

fn labels(namespace: &str, name: &str) -> ObjectLabels {
    ObjectLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Record the replica counts observed for a MachineSet
pub fn set_machine_set_replicas(namespace: &str, name: &str, replicas: i32, ready: i32) {
    MACHINE_SET_REPLICAS
        .get_or_create(&labels(namespace, name))
        .set(replicas as i64);
    MACHINE_SET_READY_REPLICAS
        .get_or_create(&labels(namespace, name))
        .set(ready as i64);
}

/// Record the target counts observed for a MachineHealthCheck
pub fn set_health_check_counts(namespace: &str, name: &str, expected: i32, healthy: i32) {
    HEALTH_CHECK_EXPECTED
        .get_or_create(&labels(namespace, name))
        .set(expected as i64);
    HEALTH_CHECK_HEALTHY
        .get_or_create(&labels(namespace, name))
        .set(healthy as i64);
}

/// Count one remediation against the given MachineHealthCheck
pub fn inc_remediation(namespace: &str, name: &str) {
    REMEDIATIONS_TOTAL
        .get_or_create(&labels(namespace, name))
        .inc();
}

//! Custom Resource Definitions for the machine API
//!
//! This module defines the Kubernetes CRDs managed by the operator.

mod machine;
mod machine_health_check;
mod machine_set;
#[cfg(test)]
mod tests;
mod types;

pub use machine::{
    Machine, MachineSpec, MachineStatus, PHASE_DELETING, PHASE_FAILED, PHASE_PROVISIONED,
    PHASE_PROVISIONING, PHASE_RUNNING,
};
pub use machine_health_check::{
    MachineHealthCheck, MachineHealthCheckSpec, MachineHealthCheckStatus, UnhealthyCondition,
    DEFAULT_NODE_STARTUP_TIMEOUT, REMEDIATION_STRATEGY_ANNOTATION, REMEDIATION_STRATEGY_EXTERNAL,
};
pub use machine_set::{
    DeletePolicy, MachineSet, MachineSetSpec, MachineSetStatus, MachineTemplateSpec,
};
pub use types::*;

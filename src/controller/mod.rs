//! Reconciliation controllers for the machine API
//!
//! This module contains the controller loops and the reconciliation
//! logic for MachineSets, MachineHealthChecks, Machines, and the
//! node/machine link.

mod delete_policy;
mod events;
mod health_check;
mod machine;
mod machine_set;
pub mod metrics;
mod node_link;
mod remediation;
mod selector;

pub use delete_policy::machines_to_delete;
pub use health_check::{
    get_int_or_percent, is_allowed_remediation, run_health_check_controller, HealthCheckContext,
};
pub use machine::{run_machine_controller, MachineContext};
pub use machine_set::{run_machine_set_controller, MachineSetContext};
pub use node_link::{run_node_link_controller, NodeLinkContext};
pub use remediation::{
    NodeLookup, Target, EVENT_DETECTED_UNHEALTHY, EVENT_EXTERNAL_ANNOTATION_ADDED,
    EVENT_MACHINE_DELETED, EVENT_SKIPPED_MASTER, EVENT_SKIPPED_NO_CONTROLLER,
};
pub use selector::selector_matches_labels;

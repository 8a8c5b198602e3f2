//! machine-api-operator
//!
//! A Kubernetes control plane for compute instances: the MachineSet
//! controller drives replica counts and prioritizes deletions, the
//! MachineHealthCheck controller remediates machines whose nodes stay
//! unhealthy past configured timeouts, the machine controller tracks
//! lifecycle phases, and the nodelink controller correlates Machines
//! with the Nodes they back.

pub mod controller;
pub mod crd;
pub mod error;
pub mod server;

//! Deletion prioritization for MachineSet scale-down
//!
//! Produces a total order over scale-down candidates. Machines already
//! being deleted or in a failed phase sort first under every policy;
//! ties always break by name so the selection is deterministic.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use crate::crd::{DeletePolicy, Machine, PHASE_FAILED};

/// Pick the `count` machines to delete first under the given policy
pub fn machines_to_delete(
    machines: &[Machine],
    count: usize,
    policy: DeletePolicy,
) -> Vec<Machine> {
    let mut candidates: Vec<&Machine> = machines.iter().collect();
    candidates.sort_by(|a, b| deletion_order(a, b, policy));
    candidates.into_iter().take(count).cloned().collect()
}

fn deletion_order(a: &Machine, b: &Machine, policy: DeletePolicy) -> Ordering {
    must_delete_rank(b)
        .cmp(&must_delete_rank(a))
        .then_with(|| match policy {
            DeletePolicy::Random => Ordering::Equal,
            DeletePolicy::Newest => creation_time(b).cmp(&creation_time(a)),
            DeletePolicy::Oldest => creation_time(a).cmp(&creation_time(b)),
        })
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

/// Machines that cannot be kept regardless of policy: already deleting
/// ranks above failed, which ranks above everything else.
fn must_delete_rank(machine: &Machine) -> u8 {
    if machine.is_deleting() {
        2
    } else if machine.phase() == PHASE_FAILED {
        1
    } else {
        0
    }
}

fn creation_time(machine: &Machine) -> DateTime<Utc> {
    machine
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    use crate::crd::{MachineSpec, MachineStatus};

    fn machine(name: &str, created_secs: i64) -> Machine {
        let mut m = Machine::new(name, MachineSpec::default());
        m.metadata = ObjectMeta {
            name: Some(name.to_string()),
            creation_timestamp: Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap())),
            ..Default::default()
        };
        m
    }

    fn names(machines: &[Machine]) -> Vec<String> {
        machines.iter().map(|m| m.name_any()).collect()
    }

    #[test]
    fn newest_deletes_most_recent_first() {
        let machines = vec![machine("m-1", 100), machine("m-2", 200), machine("m-3", 300)];
        let picked = machines_to_delete(&machines, 1, DeletePolicy::Newest);
        assert_eq!(names(&picked), vec!["m-3"]);
    }

    #[test]
    fn oldest_deletes_longest_lived_first() {
        let machines = vec![machine("m-2", 200), machine("m-1", 100), machine("m-3", 300)];
        let picked = machines_to_delete(&machines, 2, DeletePolicy::Oldest);
        assert_eq!(names(&picked), vec!["m-1", "m-2"]);
    }

    #[test]
    fn random_picks_exactly_count() {
        let machines = vec![machine("a", 1), machine("b", 2), machine("c", 3)];
        let picked = machines_to_delete(&machines, 2, DeletePolicy::Random);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn deleting_machines_sort_first_under_every_policy() {
        let mut doomed = machine("m-2", 200);
        doomed.metadata.deletion_timestamp = Some(Time(Utc.timestamp_opt(400, 0).unwrap()));
        for policy in [
            DeletePolicy::Random,
            DeletePolicy::Newest,
            DeletePolicy::Oldest,
        ] {
            let machines = vec![machine("m-1", 100), doomed.clone(), machine("m-3", 300)];
            let picked = machines_to_delete(&machines, 1, policy);
            assert_eq!(names(&picked), vec!["m-2"], "policy {:?}", policy);
        }
    }

    #[test]
    fn failed_machines_outrank_healthy_ones() {
        let mut failed = machine("m-3", 300);
        failed.status = Some(MachineStatus {
            phase: Some(PHASE_FAILED.to_string()),
            ..Default::default()
        });
        let machines = vec![machine("m-1", 100), machine("m-2", 200), failed];
        let picked = machines_to_delete(&machines, 1, DeletePolicy::Oldest);
        assert_eq!(names(&picked), vec!["m-3"]);
    }

    #[test]
    fn equal_creation_times_break_ties_by_name() {
        let machines = vec![machine("m-b", 100), machine("m-a", 100), machine("m-c", 100)];
        let picked = machines_to_delete(&machines, 2, DeletePolicy::Newest);
        assert_eq!(names(&picked), vec!["m-a", "m-b"]);
    }

    #[test]
    fn count_larger_than_candidates_returns_all() {
        let machines = vec![machine("m-1", 100)];
        let picked = machines_to_delete(&machines, 5, DeletePolicy::Random);
        assert_eq!(picked.len(), 1);
    }
}

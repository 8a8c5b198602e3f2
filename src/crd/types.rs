//! Shared types and well-known keys for the machine API

use kube::api::ObjectMeta;

/// Annotation linking a Node back to the Machine backing it, value
/// "namespace/name"
pub const MACHINE_ANNOTATION_KEY: &str = "machine.platform.dev/machine";

/// Annotation placed on a Machine to hand it to an external remediation
/// system
pub const EXTERNAL_REMEDIATION_ANNOTATION: &str = "machine.platform.dev/external-remediation";

/// Label carried by control-plane nodes
pub const NODE_MASTER_LABEL: &str = "node-role.kubernetes.io/master";

/// Label describing the role a machine was provisioned for
pub const MACHINE_ROLE_LABEL: &str = "machine.platform.dev/machine-role";

/// [`MACHINE_ROLE_LABEL`] value marking control-plane machines
pub const MACHINE_MASTER_ROLE: &str = "master";

/// Finalizer held by the machine controller until instance teardown
pub const MACHINE_FINALIZER: &str = "machine.platform.dev/machine";

/// The controller responsible for an object's lifecycle, resolved once
/// per object per reconcile pass instead of re-scanning owner
/// references at every use site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerKind {
    /// Controlled by a MachineSet with the given name
    MachineSet(String),
    /// Controlled by some other kind of controller
    OtherController(String),
    /// No controller claims this object
    Unowned,
}

impl OwnerKind {
    /// Resolve the controlling owner from object metadata
    pub fn of(meta: &ObjectMeta) -> OwnerKind {
        for owner in meta.owner_references.iter().flatten() {
            if owner.controller == Some(true) {
                return if owner.kind == "MachineSet" {
                    OwnerKind::MachineSet(owner.name.clone())
                } else {
                    OwnerKind::OtherController(owner.kind.clone())
                };
            }
        }
        OwnerKind::Unowned
    }

    /// Whether any controller owns the object
    pub fn is_controlled(&self) -> bool {
        !matches!(self, OwnerKind::Unowned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn meta_with_owners(owners: Vec<OwnerReference>) -> ObjectMeta {
        ObjectMeta {
            owner_references: Some(owners),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_machine_set_controller() {
        let meta = meta_with_owners(vec![OwnerReference {
            kind: "MachineSet".to_string(),
            name: "workers".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        assert_eq!(
            OwnerKind::of(&meta),
            OwnerKind::MachineSet("workers".to_string())
        );
    }

    #[test]
    fn non_controller_references_do_not_count() {
        let meta = meta_with_owners(vec![OwnerReference {
            kind: "MachineSet".to_string(),
            name: "workers".to_string(),
            controller: Some(false),
            ..Default::default()
        }]);
        assert_eq!(OwnerKind::of(&meta), OwnerKind::Unowned);
    }

    #[test]
    fn any_controller_kind_is_controlled() {
        let meta = meta_with_owners(vec![OwnerReference {
            kind: "MachineDeployment".to_string(),
            name: "workers".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        let owner = OwnerKind::of(&meta);
        assert_eq!(
            owner,
            OwnerKind::OtherController("MachineDeployment".to_string())
        );
        assert!(owner.is_controlled());
    }

    #[test]
    fn empty_metadata_is_unowned() {
        assert_eq!(OwnerKind::of(&ObjectMeta::default()), OwnerKind::Unowned);
        assert!(!OwnerKind::Unowned.is_controlled());
    }
}

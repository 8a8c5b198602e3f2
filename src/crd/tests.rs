//! Unit tests for MachineSet and MachineHealthCheck spec handling
//!
//! Tests `MachineSetSpec::validate()` and the MachineHealthCheck
//! accessors against valid and malformed configurations.

mod machine_set_spec_validation {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;

    use crate::crd::{MachineSetSpec, MachineSpec, MachineTemplateSpec};

    fn worker_labels() -> BTreeMap<String, String> {
        BTreeMap::from([(
            "machine.platform.dev/machine-role".to_string(),
            "worker".to_string(),
        )])
    }

    /// Helper to create a minimal valid MachineSetSpec
    fn valid_spec() -> MachineSetSpec {
        MachineSetSpec {
            replicas: Some(3),
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
        }
    }

    #[test]
    fn accepts_valid_spec() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn rejects_missing_replicas() {
        let mut spec = valid_spec();
        spec.replicas = None;
        let err = spec.validate().unwrap_err();
        assert!(err.contains("spec.replicas"), "got: {}", err);
    }

    #[test]
    fn rejects_negative_replicas() {
        let mut spec = valid_spec();
        spec.replicas = Some(-1);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn accepts_zero_replicas() {
        let mut spec = valid_spec();
        spec.replicas = Some(0);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn rejects_empty_selector() {
        let mut spec = valid_spec();
        spec.selector = LabelSelector::default();
        let err = spec.validate().unwrap_err();
        assert!(err.contains("spec.selector"), "got: {}", err);
    }

    #[test]
    fn template_labels_round_trip() {
        let spec = valid_spec();
        assert_eq!(spec.template_labels(), Some(&worker_labels()));

        let mut bare = valid_spec();
        bare.template.metadata = None;
        assert_eq!(bare.template_labels(), None);
    }
}

mod machine_health_check_accessors {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::crd::{
        MachineHealthCheck, MachineHealthCheckSpec, DEFAULT_NODE_STARTUP_TIMEOUT,
        REMEDIATION_STRATEGY_ANNOTATION, REMEDIATION_STRATEGY_EXTERNAL,
    };

    fn mhc(spec: MachineHealthCheckSpec) -> MachineHealthCheck {
        MachineHealthCheck::new("workers", spec)
    }

    #[test]
    fn node_startup_timeout_defaults() {
        let check = mhc(MachineHealthCheckSpec::default());
        assert_eq!(check.node_startup_timeout(), DEFAULT_NODE_STARTUP_TIMEOUT);
    }

    #[test]
    fn node_startup_timeout_honors_spec() {
        let check = mhc(MachineHealthCheckSpec {
            node_startup_timeout_seconds: Some(900),
            ..Default::default()
        });
        assert_eq!(check.node_startup_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn negative_node_startup_timeout_falls_back_to_default() {
        let check = mhc(MachineHealthCheckSpec {
            node_startup_timeout_seconds: Some(-5),
            ..Default::default()
        });
        assert_eq!(check.node_startup_timeout(), DEFAULT_NODE_STARTUP_TIMEOUT);
    }

    #[test]
    fn external_remediation_requires_matching_annotation() {
        let mut check = mhc(MachineHealthCheckSpec::default());
        assert!(!check.external_remediation());

        check.metadata.annotations = Some(BTreeMap::from([(
            REMEDIATION_STRATEGY_ANNOTATION.to_string(),
            REMEDIATION_STRATEGY_EXTERNAL.to_string(),
        )]));
        assert!(check.external_remediation());

        check.metadata.annotations = Some(BTreeMap::from([(
            REMEDIATION_STRATEGY_ANNOTATION.to_string(),
            "reboot".to_string(),
        )]));
        assert!(!check.external_remediation());
    }
}

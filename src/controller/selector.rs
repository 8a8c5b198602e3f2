//! Label selector matching
//!
//! Client-side evaluation of `LabelSelector` against object labels,
//! covering matchLabels and the four matchExpressions operators. An
//! empty selector matches everything, mirroring API server semantics.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Whether the selector matches the given label set
pub fn selector_matches_labels(
    selector: &LabelSelector,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);

    for (key, value) in selector.match_labels.iter().flatten() {
        if labels.get(key) != Some(value) {
            return false;
        }
    }

    for requirement in selector.match_expressions.iter().flatten() {
        let current = labels.get(&requirement.key);
        let values = requirement.values.as_deref().unwrap_or(&[]);
        let satisfied = match requirement.operator.as_str() {
            "In" => current.map_or(false, |v| values.contains(v)),
            "NotIn" => current.map_or(true, |v| !values.contains(v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            // Unknown operators never match; the API server would have
            // rejected them at admission time.
            _ => false,
        };
        if !satisfied {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn match_labels(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(pairs)),
            match_expressions: None,
        }
    }

    fn expression(key: &str, operator: &str, values: &[&str]) -> LabelSelector {
        LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: operator.to_string(),
                values: if values.is_empty() {
                    None
                } else {
                    Some(values.iter().map(|v| v.to_string()).collect())
                },
            }]),
        }
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector_matches_labels(&selector, None));
        assert!(selector_matches_labels(
            &selector,
            Some(&labels(&[("foo", "bar")]))
        ));
    }

    #[test]
    fn match_labels_require_every_pair() {
        let selector = match_labels(&[("foo", "bar"), ("role", "worker")]);
        assert!(selector_matches_labels(
            &selector,
            Some(&labels(&[("foo", "bar"), ("role", "worker"), ("extra", "x")]))
        ));
        assert!(!selector_matches_labels(
            &selector,
            Some(&labels(&[("foo", "bar")]))
        ));
        assert!(!selector_matches_labels(
            &selector,
            Some(&labels(&[("foo", "baz"), ("role", "worker")]))
        ));
        assert!(!selector_matches_labels(&selector, None));
    }

    #[test]
    fn in_and_not_in_operators() {
        let selector = expression("role", "In", &["worker", "infra"]);
        assert!(selector_matches_labels(
            &selector,
            Some(&labels(&[("role", "infra")]))
        ));
        assert!(!selector_matches_labels(
            &selector,
            Some(&labels(&[("role", "master")]))
        ));
        assert!(!selector_matches_labels(&selector, None));

        let selector = expression("role", "NotIn", &["master"]);
        assert!(selector_matches_labels(
            &selector,
            Some(&labels(&[("role", "worker")]))
        ));
        assert!(selector_matches_labels(&selector, None));
        assert!(!selector_matches_labels(
            &selector,
            Some(&labels(&[("role", "master")]))
        ));
    }

    #[test]
    fn exists_operators() {
        let selector = expression("role", "Exists", &[]);
        assert!(selector_matches_labels(
            &selector,
            Some(&labels(&[("role", "anything")]))
        ));
        assert!(!selector_matches_labels(&selector, None));

        let selector = expression("role", "DoesNotExist", &[]);
        assert!(selector_matches_labels(&selector, None));
        assert!(!selector_matches_labels(
            &selector,
            Some(&labels(&[("role", "worker")]))
        ));
    }

    #[test]
    fn unknown_operator_never_matches() {
        let selector = expression("role", "GreaterThan", &["1"]);
        assert!(!selector_matches_labels(
            &selector,
            Some(&labels(&[("role", "2")]))
        ));
    }
}

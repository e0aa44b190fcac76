//! Constraint evaluation.
//!
//! Pure predicates over a classifier's version constraints and deployed
//! resource constraints. Listing resources and looking up the cluster
//! version are the accessor's job; nothing in this module touches the API
//! server, so the verdict depends only on its inputs.

use crds::{
    Comparison, DeployedResourceConstraint, FieldFilter, FilterOperation,
    KubernetesVersionConstraint, LabelFilter,
};
use kube::core::DynamicObject;
use semver::Version;

use crate::error::AgentError;

/// Parse a semantic version, tolerating the leading `v` Kubernetes uses.
pub fn parse_version(raw: &str) -> Result<Version, AgentError> {
    let trimmed = raw.trim().trim_start_matches('v');
    Version::parse(trimmed).map_err(|_| AgentError::InvalidVersion(raw.to_string()))
}

/// AND across all version constraints. Vacuously true when none are given.
pub fn version_matches(
    cluster: &Version,
    constraints: &[KubernetesVersionConstraint],
) -> Result<bool, AgentError> {
    for constraint in constraints {
        let wanted = parse_version(&constraint.version)?;
        let holds = match constraint.comparison {
            Comparison::Equal => *cluster == wanted,
            Comparison::NotEqual => *cluster != wanted,
            Comparison::GreaterThan => *cluster > wanted,
            Comparison::GreaterThanOrEqualTo => *cluster >= wanted,
            Comparison::LessThan => *cluster < wanted,
            Comparison::LessThanOrEqualTo => *cluster <= wanted,
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether the listed resources satisfy one deployed-resource constraint:
/// label filters, then field filters, then inclusive count bounds over the
/// survivors. Iteration order never affects the verdict.
pub fn resource_matches(objects: &[DynamicObject], constraint: &DeployedResourceConstraint) -> bool {
    let survivors = objects
        .iter()
        .filter(|obj| {
            passes_label_filters(obj, &constraint.label_filters)
                && passes_field_filters(obj, &constraint.field_filters)
        })
        .count();

    within_bounds(survivors, constraint.min_count, constraint.max_count)
}

fn within_bounds(n: usize, min: Option<i32>, max: Option<i32>) -> bool {
    let n = n as i64;
    if let Some(min) = min {
        if n < i64::from(min) {
            return false;
        }
    }
    if let Some(max) = max {
        if n > i64::from(max) {
            return false;
        }
    }
    true
}

fn passes_label_filters(obj: &DynamicObject, filters: &[LabelFilter]) -> bool {
    let labels = obj.metadata.labels.as_ref();
    filters.iter().all(|filter| {
        let actual = labels.and_then(|l| l.get(&filter.key));
        match filter.operation {
            // Equal requires the label to be present with the given value
            FilterOperation::Equal => actual == Some(&filter.value),
            // Different is satisfied by an absent label too
            FilterOperation::Different => actual != Some(&filter.value),
        }
    })
}

fn passes_field_filters(obj: &DynamicObject, filters: &[FieldFilter]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let doc = match serde_json::to_value(obj) {
        Ok(doc) => doc,
        Err(_) => return false,
    };
    filters.iter().all(|filter| {
        let actual = field_value(&doc, &filter.field);
        match filter.operation {
            FilterOperation::Equal => actual == filter.value,
            FilterOperation::Different => actual != filter.value,
        }
    })
}

/// Walk a dotted path through a document; numeric segments index sequences.
/// The leaf is stringified (strings verbatim, other scalars via their JSON
/// form); a missing path or null leaf stringifies to the empty string.
pub fn field_value(doc: &serde_json::Value, path: &str) -> String {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => match map.get(segment) {
                Some(value) => value,
                None => return String::new(),
            },
            serde_json::Value::Array(items) => {
                match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(value) => value,
                    None => return String::new(),
                }
            }
            _ => return String::new(),
        };
    }
    stringify(current)
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn constraint(
        version: &str,
        comparison: Comparison,
    ) -> KubernetesVersionConstraint {
        KubernetesVersionConstraint {
            version: version.to_string(),
            comparison,
        }
    }

    fn cluster(raw: &str) -> Version {
        parse_version(raw).unwrap()
    }

    fn pod(labels: &[(&str, &str)], data: serde_json::Value) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod"));
        let mut obj = DynamicObject::new("pod", &ar).data(data);
        if !labels.is_empty() {
            obj.metadata.labels = Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        }
        obj
    }

    fn pod_constraint(
        min: Option<i32>,
        max: Option<i32>,
        label_filters: Vec<LabelFilter>,
        field_filters: Vec<FieldFilter>,
    ) -> DeployedResourceConstraint {
        DeployedResourceConstraint {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Pod".to_string(),
            namespace: None,
            min_count: min,
            max_count: max,
            label_filters,
            field_filters,
        }
    }

    #[test]
    fn parse_version_strips_leading_v() {
        assert_eq!(parse_version("v1.25.0").unwrap(), Version::new(1, 25, 0));
        assert_eq!(parse_version("1.25.0").unwrap(), Version::new(1, 25, 0));
    }

    #[test]
    fn parse_version_rejects_garbage() {
        assert!(matches!(
            parse_version("not-a-version"),
            Err(AgentError::InvalidVersion(_))
        ));
    }

    #[test]
    fn equal_matches_only_the_same_version() {
        let constraints = [constraint("v1.25.0", Comparison::Equal)];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).unwrap());
        assert!(!version_matches(&cluster("v1.25.2"), &constraints).unwrap());
    }

    #[test]
    fn not_equal_matches_other_versions() {
        let constraints = [constraint("v1.24.2", Comparison::NotEqual)];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).unwrap());
        assert!(!version_matches(&cluster("v1.24.2"), &constraints).unwrap());
    }

    #[test]
    fn greater_than_is_strict() {
        let constraints = [constraint("v1.24.2", Comparison::GreaterThan)];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).unwrap());
        assert!(!version_matches(&cluster("v1.24.2"), &constraints).unwrap());
    }

    #[test]
    fn greater_than_or_equal_accepts_the_boundary() {
        let constraints = [constraint("v1.25.0", Comparison::GreaterThanOrEqualTo)];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).unwrap());
        assert!(!version_matches(&cluster("v1.24.2"), &constraints).unwrap());
    }

    #[test]
    fn less_than_is_strict() {
        let constraints = [constraint("v1.26.0", Comparison::LessThan)];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).unwrap());
        assert!(!version_matches(&cluster("v1.26.0"), &constraints).unwrap());
    }

    #[test]
    fn less_than_or_equal_accepts_the_boundary() {
        let constraints = [constraint("v1.25.0", Comparison::LessThanOrEqualTo)];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).unwrap());
        assert!(!version_matches(&cluster("v1.25.2"), &constraints).unwrap());
    }

    #[test]
    fn compound_constraints_are_anded() {
        let constraints = [
            constraint("v1.24.2", Comparison::GreaterThanOrEqualTo),
            constraint("v1.26.0", Comparison::LessThan),
        ];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).unwrap());
        assert!(!version_matches(&cluster("v1.26.0"), &constraints).unwrap());
    }

    #[test]
    fn no_version_constraints_is_a_vacuous_match() {
        assert!(version_matches(&cluster("v1.25.0"), &[]).unwrap());
    }

    #[test]
    fn malformed_constraint_version_is_an_error() {
        let constraints = [constraint("one.two", Comparison::Equal)];
        assert!(version_matches(&cluster("v1.25.0"), &constraints).is_err());
    }

    #[test]
    fn count_bounds_are_inclusive() {
        let constraint = pod_constraint(Some(3), Some(5), vec![], vec![]);

        for count in [0usize, 2, 3, 4, 5, 6] {
            let objects: Vec<DynamicObject> =
                (0..count).map(|_| pod(&[], json!({}))).collect();
            let expected = (3..=5).contains(&count);
            assert_eq!(
                resource_matches(&objects, &constraint),
                expected,
                "count {count}"
            );
        }
    }

    #[test]
    fn no_resource_constraint_bounds_is_a_vacuous_match() {
        let constraint = pod_constraint(None, None, vec![], vec![]);
        assert!(resource_matches(&[], &constraint));
    }

    #[test]
    fn label_filters_are_anded() {
        let constraint = pod_constraint(
            Some(1),
            None,
            vec![
                LabelFilter {
                    key: "k1".to_string(),
                    operation: FilterOperation::Equal,
                    value: "v1".to_string(),
                },
                LabelFilter {
                    key: "k2".to_string(),
                    operation: FilterOperation::Equal,
                    value: "v2".to_string(),
                },
            ],
            vec![],
        );

        let partial = [pod(&[("k1", "v1")], json!({}))];
        assert!(!resource_matches(&partial, &constraint));

        let full = [pod(&[("k1", "v1"), ("k2", "v2")], json!({}))];
        assert!(resource_matches(&full, &constraint));
    }

    #[test]
    fn different_filter_accepts_absent_label() {
        let constraint = pod_constraint(
            Some(1),
            None,
            vec![LabelFilter {
                key: "tier".to_string(),
                operation: FilterOperation::Different,
                value: "backend".to_string(),
            }],
            vec![],
        );

        assert!(resource_matches(&[pod(&[], json!({}))], &constraint));
        assert!(resource_matches(
            &[pod(&[("tier", "frontend")], json!({}))],
            &constraint
        ));
        assert!(!resource_matches(
            &[pod(&[("tier", "backend")], json!({}))],
            &constraint
        ));
    }

    #[test]
    fn field_filter_matches_on_status_field() {
        let constraint = pod_constraint(
            Some(1),
            None,
            vec![],
            vec![FieldFilter {
                field: "status.podIP".to_string(),
                operation: FilterOperation::Equal,
                value: "192.168.10.1".to_string(),
            }],
        );

        let without_ip = [pod(&[], json!({"status": {}}))];
        assert!(!resource_matches(&without_ip, &constraint));

        let with_ip = [pod(&[], json!({"status": {"podIP": "192.168.10.1"}}))];
        assert!(resource_matches(&with_ip, &constraint));
    }

    #[test]
    fn field_value_walks_nested_maps_and_arrays() {
        let doc = json!({
            "spec": {
                "containers": [
                    {"name": "nginx", "ports": [{"containerPort": 80}]}
                ]
            }
        });

        assert_eq!(field_value(&doc, "spec.containers.0.name"), "nginx");
        assert_eq!(
            field_value(&doc, "spec.containers.0.ports.0.containerPort"),
            "80"
        );
    }

    #[test]
    fn field_value_missing_path_is_empty() {
        let doc = json!({"status": {"podIP": "10.0.0.1"}});

        assert_eq!(field_value(&doc, "status.hostIP"), "");
        assert_eq!(field_value(&doc, "status.podIP.extra"), "");
        assert_eq!(field_value(&doc, "spec.containers.7"), "");
    }

    #[test]
    fn field_value_stringifies_scalars() {
        let doc = json!({"spec": {"replicas": 3, "paused": true, "note": null}});

        assert_eq!(field_value(&doc, "spec.replicas"), "3");
        assert_eq!(field_value(&doc, "spec.paused"), "true");
        assert_eq!(field_value(&doc, "spec.note"), "");
    }
}

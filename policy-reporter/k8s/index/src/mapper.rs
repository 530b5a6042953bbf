//! Maps untyped Kyverno policy objects into the policy model.
//!
//! Mapping never fails: absent or malformed fields degrade to empty values so
//! that a single unexpected field never hides a policy from the cache.

use crate::core::{ImageVerification, Policy, PolicyId, PolicyKind, Rule, RuleType};
use crate::k8s::{DynamicObject, ResourceExt};
use serde_json::{Map, Value};

const CATEGORY: &str = "policies.kyverno.io/category";
const SEVERITY: &str = "policies.kyverno.io/severity";
const DESCRIPTION: &str = "policies.kyverno.io/description";
const AUTOGEN_CONTROLLERS: &str = "pod-policies.kyverno.io/autogen-controllers";
const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub fn policy_id(obj: &DynamicObject) -> PolicyId {
    PolicyId::new(obj.namespace(), obj.name_any())
}

pub fn map_policy(obj: &DynamicObject) -> Policy {
    let id = policy_id(obj);
    let kind = match obj.types.as_ref().map(|t| t.kind.as_str()) {
        Some("Policy") => PolicyKind::Policy,
        Some("ClusterPolicy") => PolicyKind::ClusterPolicy,
        _ => id.kind(),
    };
    let annotation = |key: &str| obj.annotations().get(key).cloned().unwrap_or_default();

    let spec = obj.data.get("spec");
    let rules = spec
        .and_then(|s| s.get("rules"))
        .and_then(Value::as_array)
        .map(|rules| rules.iter().map(map_rule).collect())
        .unwrap_or_default();

    Policy {
        kind,
        api_version: obj
            .types
            .as_ref()
            .map(|t| t.api_version.clone())
            .unwrap_or_default(),
        uid: obj.uid().unwrap_or_default(),
        category: annotation(CATEGORY),
        severity: annotation(SEVERITY),
        description: annotation(DESCRIPTION),
        autogen_controllers: obj
            .annotations()
            .get(AUTOGEN_CONTROLLERS)
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        rules,
        background: spec
            .and_then(|s| s.get("background"))
            .and_then(Value::as_bool),
        validation_failure_action: string_at(spec, "validationFailureAction"),
        content: content(obj),
        creation_timestamp: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
        id,
    }
}

fn map_rule(rule: &Value) -> Rule {
    let name = string_at(Some(rule), "name");

    let verify_images = rule
        .get("verifyImages")
        .and_then(Value::as_array)
        .filter(|v| !v.is_empty());
    if let Some(verify_images) = verify_images {
        return Rule {
            name,
            rule_type: RuleType::Validation,
            validate_message: String::new(),
            verify_images: verify_images.iter().map(map_image_verification).collect(),
        };
    }

    if let Some(validate) = rule.get("validate").filter(|v| !v.is_null()) {
        return Rule {
            name,
            rule_type: RuleType::Validation,
            validate_message: string_at(Some(validate), "message"),
            verify_images: Vec::new(),
        };
    }

    let rule_type = if is_non_empty(rule.get("generate")) {
        RuleType::Generation
    } else if is_non_empty(rule.get("mutate")) {
        RuleType::Mutation
    } else {
        RuleType::Unclassified
    };

    Rule {
        name,
        rule_type,
        ..Rule::default()
    }
}

fn map_image_verification(verify: &Value) -> ImageVerification {
    let mut image = string_at(Some(verify), "image");
    if image.is_empty() {
        if let Some(refs) = verify.get("imageReferences").and_then(Value::as_array) {
            image = refs
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ");
        }
    }

    let attestations = match verify.get("attestations") {
        None | Some(Value::Null) => String::new(),
        Some(attestations) => serde_yaml::to_string(attestations).unwrap_or_default(),
    };

    ImageVerification {
        repository: string_at(Some(verify), "repository"),
        image,
        key: string_at(Some(verify), "key").trim().to_string(),
        attestations,
    }
}

/// Renders the object as YAML without server-managed bookkeeping.
fn content(obj: &DynamicObject) -> String {
    let mut value = match serde_json::to_value(obj) {
        Ok(Value::Object(value)) => value,
        _ => return String::new(),
    };

    value.remove("status");
    if let Some(Value::Object(metadata)) = value.get_mut("metadata") {
        for field in [
            "managedFields",
            "creationTimestamp",
            "generation",
            "resourceVersion",
            "uid",
        ] {
            metadata.remove(field);
        }
        if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
            annotations.remove(LAST_APPLIED);
        }
    }

    serde_yaml::to_string(&Value::Object(value)).unwrap_or_default()
}

fn string_at(value: Option<&Value>, key: &str) -> String {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn is_non_empty(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Object(m)) => !Map::is_empty(m),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).expect("fixture must be a valid object")
    }

    fn cluster_policy() -> DynamicObject {
        object(json!({
            "apiVersion": "kyverno.io/v1",
            "kind": "ClusterPolicy",
            "metadata": {
                "name": "disallow-host-path",
                "uid": "953b1167-1ff5-4cf6-b636-3b7d0c0dd6c7",
                "resourceVersion": "61655872",
                "generation": 4,
                "creationTimestamp": "2021-03-31T13:42:01Z",
                "annotations": {
                    "policies.kyverno.io/category": "Pod Security Standards (Default)",
                    "policies.kyverno.io/severity": "medium",
                    "policies.kyverno.io/description": "HostPath volumes let pods use host directories.",
                    "pod-policies.kyverno.io/autogen-controllers": "Deployment,StatefulSet",
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                },
                "managedFields": [{ "manager": "kubectl" }],
            },
            "spec": {
                "background": true,
                "validationFailureAction": "audit",
                "rules": [{
                    "name": "host-path",
                    "match": { "resources": { "kinds": ["Pod"] } },
                    "validate": {
                        "message": "HostPath volumes are forbidden. The fields spec.volumes[*].hostPath must not be set.",
                        "pattern": { "spec": { "=(volumes)": [{ "X(hostPath)": "null" }] } },
                    },
                }],
            },
            "status": { "ready": true },
        }))
    }

    #[test]
    fn maps_cluster_policy() {
        let policy = map_policy(&cluster_policy());

        assert_eq!(policy.kind, PolicyKind::ClusterPolicy);
        assert_eq!(policy.api_version, "kyverno.io/v1");
        assert_eq!(policy.id, PolicyId::cluster("disallow-host-path"));
        assert_eq!(policy.uid, "953b1167-1ff5-4cf6-b636-3b7d0c0dd6c7");
        assert_eq!(policy.category, "Pod Security Standards (Default)");
        assert_eq!(policy.severity, "medium");
        assert_eq!(
            policy.description,
            "HostPath volumes let pods use host directories."
        );
        assert_eq!(policy.autogen_controllers, vec!["Deployment", "StatefulSet"]);
        assert_eq!(policy.background, Some(true));
        assert_eq!(policy.validation_failure_action, "audit");
        assert!(policy.creation_timestamp.is_some());
        assert_eq!(
            policy.rules,
            vec![Rule {
                name: "host-path".to_string(),
                rule_type: RuleType::Validation,
                validate_message: "HostPath volumes are forbidden. The fields spec.volumes[*].hostPath must not be set.".to_string(),
                verify_images: vec![],
            }]
        );
    }

    #[test]
    fn content_omits_server_bookkeeping() {
        let policy = map_policy(&cluster_policy());

        assert!(policy.content.contains("name: disallow-host-path"));
        assert!(policy.content.contains("validationFailureAction: audit"));
        for field in [
            "managedFields",
            "creationTimestamp",
            "generation",
            "resourceVersion",
            "uid:",
            "status",
            "last-applied-configuration",
        ] {
            assert!(
                !policy.content.contains(field),
                "content must not contain {field}"
            );
        }
    }

    #[test]
    fn minimal_policy_degrades_to_empty_values() {
        let policy = map_policy(&object(json!({
            "metadata": { "name": "disallow-host-path", "namespace": "test" },
            "spec": { "rules": [{ "validate": {} }] },
        })));

        assert_eq!(policy.kind, PolicyKind::Policy);
        assert_eq!(policy.api_version, "");
        assert_eq!(policy.id, PolicyId::namespaced("test", "disallow-host-path"));
        assert_eq!(policy.background, None);
        assert_eq!(policy.category, "");
        assert!(policy.autogen_controllers.is_empty());
        assert_eq!(policy.creation_timestamp, None);
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].name, "");
        assert_eq!(policy.rules[0].rule_type, RuleType::Validation);
        assert_eq!(policy.rules[0].validate_message, "");
    }

    #[test]
    fn classifies_rules() {
        let policy = map_policy(&object(json!({
            "metadata": { "name": "mixed" },
            "spec": {
                "rules": [
                    { "name": "gen", "generate": { "kind": "NetworkPolicy", "name": "deny-all" } },
                    { "name": "mut", "mutate": { "patchStrategicMerge": { "metadata": {} } } },
                    { "name": "empty-gen", "generate": {} },
                    { "name": "nothing" },
                ],
            },
        })));

        let types = policy
            .rules
            .iter()
            .map(|r| (r.name.as_str(), r.rule_type))
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                ("gen", RuleType::Generation),
                ("mut", RuleType::Mutation),
                ("empty-gen", RuleType::Unclassified),
                ("nothing", RuleType::Unclassified),
            ]
        );
    }

    #[test]
    fn verify_images_take_precedence_over_validate() {
        let policy = map_policy(&object(json!({
            "apiVersion": "kyverno.io/v1",
            "kind": "ClusterPolicy",
            "metadata": { "name": "check-image" },
            "spec": {
                "rules": [{
                    "name": "verify-image",
                    "validate": { "message": "ignored" },
                    "verifyImages": [
                        {
                            "image": "ghcr.io/kyverno/test-verify-image:*",
                            "repository": "registry.io/signatures",
                            "key": "\n-----BEGIN PUBLIC KEY-----\nMFkw\n-----END PUBLIC KEY-----\n  ",
                            "attestations": [{ "predicateType": "https://example.com/CodeReview/v1" }],
                        },
                        {
                            "imageReferences": ["ghcr.io/a:*", "ghcr.io/b:*"],
                        },
                    ],
                }],
            },
        })));

        let rule = &policy.rules[0];
        assert_eq!(rule.rule_type, RuleType::Validation);
        assert_eq!(rule.validate_message, "");
        assert_eq!(rule.verify_images.len(), 2);

        let verify = &rule.verify_images[0];
        assert_eq!(verify.repository, "registry.io/signatures");
        assert_eq!(verify.image, "ghcr.io/kyverno/test-verify-image:*");
        assert_eq!(
            verify.key,
            "-----BEGIN PUBLIC KEY-----\nMFkw\n-----END PUBLIC KEY-----"
        );
        assert!(verify.attestations.contains("predicateType"));

        let verify = &rule.verify_images[1];
        assert_eq!(verify.image, "ghcr.io/a:*, ghcr.io/b:*");
        assert_eq!(verify.attestations, "");
    }
}

//! The dynamic object model and the generic tree walker.
//!
//! Kubernetes objects here are not fixed Rust structs (unlike a typed
//! `k8s_openapi` resource) — a project's source YAML can declare any
//! `kind`, and `_merge` can graft arbitrary new keys onto an object at
//! render time. So the whole pipeline works over a tagged value tree,
//! [`serde_yaml::Value`], and walks it with a single recursive function
//! driven by a pluggable [`Visitor`].

use serde_yaml::{Mapping, Value};

/// Visits every node of a value tree during [`walk_mut`].
///
/// `visit_string` is called on every leaf string and may replace it with any
/// value (used for `${NAME}` substitution, including type-preserving
/// substitution of a whole-string reference into a non-string value).
/// `visit_mapping` is called on every mapping *after* its values have been
/// walked, so nested constructs (like `_merge` inside a templated value)
/// have already been resolved bottom-up.
pub trait Visitor {
    fn visit_string(&mut self, _s: &str) -> Option<Value> {
        None
    }

    fn visit_mapping(&mut self, _map: &mut Mapping) {}
}

/// Recursively walks `value` in place, invoking `visitor` on every string
/// leaf and every mapping.
pub fn walk_mut(value: &mut Value, visitor: &mut dyn Visitor) {
    match value {
        Value::String(s) => {
            if let Some(replacement) = visitor.visit_string(s) {
                *value = replacement;
            }
        }
        Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                walk_mut(item, visitor);
            }
        }
        Value::Mapping(map) => {
            // Walk children first so a `_merge` value that itself contains
            // `${...}` or a nested `_merge` is fully resolved before we
            // splice it into the parent.
            let mut entries: Vec<(Value, Value)> = std::mem::take(map).into_iter().collect();
            for (_, v) in entries.iter_mut() {
                walk_mut(v, visitor);
            }
            *map = entries.into_iter().collect();
            visitor.visit_mapping(map);
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::Tagged(_) => {}
    }
}

/// A rendered Kubernetes object: a YAML mapping with at least `kind` and
/// `metadata.name`.
#[derive(Debug, Clone, PartialEq)]
pub struct K8sObject(pub Value);

impl K8sObject {
    pub fn new(value: Value) -> Self {
        K8sObject(value)
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        self.0.as_mapping()
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut Mapping> {
        self.0.as_mapping_mut()
    }

    pub fn kind(&self) -> Option<&str> {
        self.field("kind")
    }

    pub fn api_version(&self) -> Option<&str> {
        self.field("apiVersion")
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_field("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_field("namespace")
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        if let Some(map) = self.as_mapping_mut() {
            let metadata = map
                .entry(Value::String("metadata".into()))
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if let Some(metadata) = metadata.as_mapping_mut() {
                metadata.insert(
                    Value::String("namespace".into()),
                    Value::String(namespace.to_string()),
                );
            }
        }
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.0.as_mapping()?.get(key)?.as_str()
    }

    fn metadata_field(&self, key: &str) -> Option<&str> {
        self.0
            .as_mapping()?
            .get("metadata")?
            .as_mapping()?
            .get(key)?
            .as_str()
    }

    /// Fully-qualified name: `Kind.Group/Name` when `apiVersion` carries a
    /// group (`group/version`), else `Kind/Name`.
    pub fn fqn(&self) -> Option<String> {
        let kind = self.kind()?;
        let name = self.name()?;
        let group = self
            .api_version()
            .and_then(|av| av.split_once('/').map(|(group, _)| group));
        Some(match group {
            Some(group) => format!("{kind}.{group}/{name}"),
            None => format!("{kind}/{name}"),
        })
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind() == Some(kind)
    }

    pub fn is_deployment_like(&self) -> bool {
        self.is_kind("Deployment") || self.is_kind("DeploymentConfig")
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(yaml: &str) -> K8sObject {
        K8sObject::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn fqn_includes_group_when_present() {
        let o = obj("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n");
        assert_eq!(o.fqn().as_deref(), Some("Deployment.apps/web"));
    }

    #[test]
    fn fqn_omits_group_for_core_api() {
        let o = obj("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n");
        assert_eq!(o.fqn().as_deref(), Some("ConfigMap/cfg"));
    }

    #[test]
    fn walk_mut_visits_strings_bottom_up() {
        let mut value: Value =
            serde_yaml::from_str("a: ${X}\nnested:\n  b: literal\n  c: ${X}\n").unwrap();

        struct UpperVisitor;
        impl Visitor for UpperVisitor {
            fn visit_string(&mut self, s: &str) -> Option<Value> {
                Some(Value::String(s.to_uppercase()))
            }
        }

        walk_mut(&mut value, &mut UpperVisitor);
        assert_eq!(value["a"], Value::String("${X}".to_uppercase()));
        assert_eq!(value["nested"]["b"], Value::String("LITERAL".into()));
    }

    #[test]
    fn walk_mut_splices_merge_key() {
        let mut value: Value = serde_yaml::from_str(
            "metadata:\n  name: explicit\n_merge:\n  metadata:\n    labels:\n      app: demo\n  extra: field\n",
        )
        .unwrap();

        struct MergeSplicer;
        impl Visitor for MergeSplicer {
            fn visit_mapping(&mut self, map: &mut Mapping) {
                if let Some(merge_value) = map.remove("_merge") {
                    if let Some(merge_map) = merge_value.as_mapping() {
                        for (k, v) in merge_map {
                            map.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                }
            }
        }

        walk_mut(&mut value, &mut MergeSplicer);
        assert!(value.as_mapping().unwrap().get("_merge").is_none());
        assert_eq!(value["extra"], Value::String("field".into()));
        assert_eq!(value["metadata"]["name"], Value::String("explicit".into()));
    }
}

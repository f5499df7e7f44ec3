//! PreProcessor: in `k8s` mode, rewrites the legacy OpenShift
//! `DeploymentConfig` dialect into a modern `Deployment`.

use serde_yaml::{Mapping, Value};

use crate::config::ProjectMode;
use crate::value::K8sObject;

pub fn process(object: &mut K8sObject, mode: ProjectMode) {
    if mode.normalized() != ProjectMode::K8s {
        return;
    }
    if !object.is_kind("DeploymentConfig") {
        return;
    }

    let Some(map) = object.as_mapping_mut() else {
        return;
    };

    map.insert(Value::String("kind".into()), Value::String("Deployment".into()));

    let api_version = map
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or("v1")
        .to_string();
    if !api_version.starts_with("apps/") {
        map.insert(
            Value::String("apiVersion".into()),
            Value::String(format!("apps/{api_version}")),
        );
    }

    rewrite_selector(map);
    rewrite_strategy(map);
    rewrite_template_labels(map);
}

fn rewrite_selector(map: &mut Mapping) {
    let Some(Value::Mapping(spec)) = map.get_mut("spec") else {
        return;
    };
    let Some(Value::Mapping(selector)) = spec.get_mut("selector") else {
        return;
    };
    if let Some(name) = selector.remove("name") {
        let mut match_labels = Mapping::new();
        match_labels.insert(Value::String("app".into()), name);
        selector.insert(Value::String("matchLabels".into()), Value::Mapping(match_labels));
    }
}

fn rewrite_strategy(map: &mut Mapping) {
    let Some(Value::Mapping(spec)) = map.get_mut("spec") else {
        return;
    };
    let Some(Value::Mapping(strategy)) = spec.get_mut("strategy") else {
        return;
    };
    if strategy.get("type").and_then(Value::as_str) == Some("Rolling") {
        strategy.insert(Value::String("type".into()), Value::String("RollingUpdate".into()));
    }
}

fn rewrite_template_labels(map: &mut Mapping) {
    let Some(labels) = template_labels_mut(map) else {
        return;
    };
    if let Some(name) = labels.remove("name") {
        labels.insert(Value::String("app".into()), name);
    }
}

fn template_labels_mut(map: &mut Mapping) -> Option<&mut Mapping> {
    map.get_mut("spec")?
        .as_mapping_mut()?
        .get_mut("template")?
        .as_mapping_mut()?
        .get_mut("metadata")?
        .as_mapping_mut()?
        .get_mut("labels")?
        .as_mapping_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(yaml: &str) -> K8sObject {
        K8sObject::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn converts_deployment_config_in_k8s_mode() {
        let mut obj = object(
            "kind: DeploymentConfig\napiVersion: v1\nspec:\n  selector:\n    name: web\n  strategy:\n    type: Rolling\n  template:\n    metadata:\n      labels:\n        name: web\n",
        );
        process(&mut obj, ProjectMode::K8s);
        assert_eq!(obj.kind(), Some("Deployment"));
        assert_eq!(obj.0["apiVersion"], Value::String("apps/v1".into()));
        assert_eq!(obj.0["spec"]["selector"]["matchLabels"]["app"], Value::String("web".into()));
        assert_eq!(obj.0["spec"]["strategy"]["type"], Value::String("RollingUpdate".into()));
        assert_eq!(obj.0["spec"]["template"]["metadata"]["labels"]["app"], Value::String("web".into()));
    }

    #[test]
    fn passes_through_in_oc_mode() {
        let mut obj = object("kind: DeploymentConfig\napiVersion: v1\n");
        process(&mut obj, ProjectMode::Oc);
        assert_eq!(obj.kind(), Some("DeploymentConfig"));
    }
}

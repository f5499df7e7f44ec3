//! ObjectMerger: combines two objects that share an FQN within one app.

use serde_yaml::{Mapping, Value};
use snafu::Snafu;
use tracing::warn;

use crate::value::K8sObject;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("cannot merge {fqn}: {message}"))]
    Ambiguous { fqn: String, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attempts to merge `incoming` into `existing`. Returns `true` if the
/// merge happened (caller discards `incoming`); `false` means the caller
/// should append `incoming` as a separate object.
pub fn merge(existing: &mut K8sObject, incoming: &K8sObject) -> Result<bool> {
    if existing.is_deployment_like() && incoming.is_deployment_like() {
        return merge_deployment_like(existing, incoming);
    }

    let fqn = existing.fqn().unwrap_or_default();
    warn!(fqn = %fqn, "duplicate object of a kind with no merge rule, keeping both");
    Ok(false)
}

/// `spec.template.metadata.labels.name` must agree between the two
/// objects, if both carry it, or the merge is skipped entirely.
fn merge_deployment_like(existing: &mut K8sObject, incoming: &K8sObject) -> Result<bool> {
    let existing_label = pod_template_label(existing);
    let incoming_label = pod_template_label(incoming);
    if let (Some(a), Some(b)) = (&existing_label, &incoming_label) {
        if a != b {
            return Ok(false);
        }
    }

    let (Some(a), Some(b)) = (existing.as_mapping_mut(), incoming.as_mapping()) else {
        return Ok(false);
    };

    let containers_path = ["spec", "template", "spec", "containers"];
    let volumes_path = ["spec", "template", "spec", "volumes"];

    merge_named_list(a, b, &containers_path);
    merge_named_list(a, b, &volumes_path);

    let mut b_without_named_lists = b.clone();
    remove_path(&mut b_without_named_lists, &containers_path);
    remove_path(&mut b_without_named_lists, &volumes_path);
    recursive_merge(a, &b_without_named_lists);

    Ok(true)
}

fn pod_template_label(object: &K8sObject) -> Option<String> {
    object
        .as_mapping()?
        .get("spec")?
        .as_mapping()?
        .get("template")?
        .as_mapping()?
        .get("metadata")?
        .as_mapping()?
        .get("labels")?
        .as_mapping()?
        .get("name")?
        .as_str()
        .map(String::from)
}

fn get_path<'a>(map: &'a Mapping, path: &[&str]) -> Option<&'a Value> {
    let mut current = map.get(path[0])?;
    for key in &path[1..] {
        current = current.as_mapping()?.get(*key)?;
    }
    Some(current)
}

fn remove_path(map: &mut Mapping, path: &[&str]) {
    let Some((last, ancestors)) = path.split_last() else {
        return;
    };
    let mut current = map;
    for key in ancestors {
        let Some(next) = current.get_mut(*key).and_then(Value::as_mapping_mut) else {
            return;
        };
        current = next;
    }
    current.remove(*last);
}

/// Merges a named list (`containers`/`volumes`) element-wise by `name`:
/// matching names merge recursively, unmatched incoming entries append.
fn merge_named_list(existing: &mut Mapping, incoming: &Mapping, path: &[&str]) {
    let Some(Value::Sequence(incoming_items)) = get_path(incoming, path).cloned() else {
        return;
    };

    let existing_items = ensure_path_sequence(existing, path);
    for incoming_item in incoming_items {
        let incoming_name = incoming_item
            .as_mapping()
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .map(String::from);

        let mut matched = false;
        if let Some(name) = &incoming_name {
            for existing_item in existing_items.iter_mut() {
                let existing_name = existing_item
                    .as_mapping()
                    .and_then(|m| m.get("name"))
                    .and_then(Value::as_str);
                if existing_name == Some(name.as_str()) {
                    if let (Some(a), Some(b)) =
                        (existing_item.as_mapping_mut(), incoming_item.as_mapping())
                    {
                        recursive_merge(a, b);
                    }
                    matched = true;
                    break;
                }
            }
        }
        if !matched {
            existing_items.push(incoming_item);
        }
    }
}

fn ensure_path_sequence<'a>(map: &'a mut Mapping, path: &[&str]) -> &'a mut Vec<Value> {
    let mut current = map;
    for key in &path[..path.len() - 1] {
        let entry = current
            .entry(Value::String((*key).to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        current = entry
            .as_mapping_mut()
            .expect("intermediate path segment is a mapping");
    }
    let last = *path.last().unwrap();
    let entry = current
        .entry(Value::String(last.to_string()))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    match entry {
        Value::Sequence(seq) => seq,
        _ => unreachable!("path segment expected to be a sequence"),
    }
}

/// Generic recursive merge: missing keys are added, lists concatenate,
/// scalar conflicts overwrite with a warning, dicts recurse.
fn recursive_merge(existing: &mut Mapping, incoming: &Mapping) {
    for (key, incoming_value) in incoming {
        match existing.get_mut(key) {
            None => {
                existing.insert(key.clone(), incoming_value.clone());
            }
            Some(existing_value) => match (existing_value.clone(), incoming_value.clone()) {
                (Value::Mapping(mut a), Value::Mapping(b)) => {
                    recursive_merge(&mut a, &b);
                    *existing_value = Value::Mapping(a);
                }
                (Value::Sequence(mut a), Value::Sequence(b)) => {
                    a.extend(b);
                    *existing_value = Value::Sequence(a);
                }
                (a, b) if a == b => {}
                (_, b) => {
                    warn!(key = ?key, "overwriting scalar value during merge");
                    *existing_value = b;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(yaml: &str) -> K8sObject {
        K8sObject::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn non_deployment_kinds_are_never_merged() {
        let mut existing = object("kind: ConfigMap\ndata:\n  a: 1\nlist:\n  - x\n");
        let incoming = object("kind: ConfigMap\ndata:\n  b: 2\nlist:\n  - y\n");
        let merged = merge(&mut existing, &incoming).unwrap();
        assert!(!merged);
        assert!(existing.0["data"]["b"].is_null());
    }

    #[test]
    fn deployment_containers_merge_by_name() {
        let mut existing = object(
            "kind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n        - name: web\n          image: a\n",
        );
        let incoming = object(
            "kind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n        - name: web\n          env: [x]\n        - name: sidecar\n          image: b\n",
        );
        merge(&mut existing, &incoming).unwrap();
        let containers = existing.0["spec"]["template"]["spec"]["containers"]
            .as_sequence()
            .unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["image"], Value::String("a".into()));
        assert_eq!(containers[0]["env"], Value::Sequence(vec![Value::String("x".into())]));
        assert_eq!(containers[1]["name"], Value::String("sidecar".into()));
    }

    #[test]
    fn mismatched_pod_template_label_skips_merge() {
        let mut existing = object(
            "kind: Deployment\nspec:\n  template:\n    metadata:\n      labels:\n        name: a\n",
        );
        let incoming = object(
            "kind: Deployment\nspec:\n  template:\n    metadata:\n      labels:\n        name: b\n",
        );
        let merged = merge(&mut existing, &incoming).unwrap();
        assert!(!merged);
    }
}

//! NamespaceProcessor: fills in the project's default namespace on any
//! object that doesn't declare one explicitly.

use crate::value::K8sObject;

pub fn process(object: &mut K8sObject, default_namespace: &str) {
    if object.namespace().is_some() {
        return;
    }
    object.set_namespace(default_namespace);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_missing_namespace() {
        let mut obj = K8sObject::new(serde_yaml::from_str("metadata:\n  name: web\n").unwrap());
        process(&mut obj, "my-namespace");
        assert_eq!(obj.namespace(), Some("my-namespace"));
    }

    #[test]
    fn leaves_explicit_namespace_alone() {
        let mut obj = K8sObject::new(
            serde_yaml::from_str("metadata:\n  name: web\n  namespace: explicit\n").unwrap(),
        );
        process(&mut obj, "my-namespace");
        assert_eq!(obj.namespace(), Some("explicit"));
    }
}

//! ClusterApi: the seam between the render pipeline and a live (or
//! fake, for tests) Kubernetes/OpenShift cluster.
//!
//! Every method works over dynamic `serde_yaml::Value` objects rather
//! than `k8s_openapi` structs: a project's source YAML can declare any
//! `kind`, including OpenShift CRDs (`DeploymentConfig`, `Route`) that
//! `k8s-openapi` doesn't model at all.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{self, Scope};
use kube::{Api, Client};
use serde_yaml::Value;
use snafu::Snafu;
use tracing::warn;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("kubernetes API error: {source}"), context(false))]
    Kube { source: kube::Error },

    #[snafu(display("could not resolve kind {kind:?} on the cluster: {source}"))]
    Discovery { kind: String, source: kube::Error },

    #[snafu(display("unrecognized kind {kind:?}"))]
    UnknownKind { kind: String },

    #[snafu(display("object has no metadata.name"))]
    MissingName,

    #[snafu(display("value is not a valid Kubernetes object: {message}"))]
    InvalidObject { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The subset of a cluster's capabilities the render-and-reconcile
/// pipeline needs, abstracted so the core can run against an in-memory
/// fake in tests.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(&self, kind: &str, name: &str, namespace: &str) -> Result<Option<Value>>;

    async fn apply(&self, object: Value, namespace: &str) -> Result<Value>;

    /// Deletes the object, swallowing a "not found" response.
    async fn delete(&self, kind: &str, name: &str, namespace: &str) -> Result<()>;

    /// Sets (or, if `value` is `None`, removes) an annotation on the
    /// named object.
    async fn annotate(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()>;

    /// Triggers a rollout restart of a Deployment/DeploymentConfig.
    /// Swallows a "not found" response (logged, not propagated).
    async fn rollout(&self, kind: &str, name: &str, namespace: &str) -> Result<()>;

    /// Pod names whose `deploymentconfig` label equals `dc_name`.
    async fn get_pods(&self, dc_name: &str, namespace: &str) -> Result<Vec<String>>;

    async fn exec(&self, pod_name: &str, namespace: &str, command: &str, args: &[String]) -> Result<()>;

    async fn get_namespaces(&self) -> Result<Vec<String>>;

    /// Server-side dry run of an apply, returning what the object would
    /// look like after admission (used to render `plan` diffs).
    async fn dry_run(&self, object: Value, namespace: &str) -> Result<Value>;

    /// Every object of `kind` in `namespace` (powers `backup`).
    async fn list_namespace_objects(&self, kind: &str, namespace: &str) -> Result<Vec<Value>>;
}

fn gvk_for_kind(kind: &str) -> Result<GroupVersionKind> {
    let (group, version) = match kind {
        "ConfigMap" | "Secret" | "Service" | "ServiceAccount" | "PersistentVolumeClaim" => ("", "v1"),
        "Deployment" => ("apps", "v1"),
        "DeploymentConfig" => ("apps.openshift.io", "v1"),
        "Route" => ("route.openshift.io", "v1"),
        other => return UnknownKindSnafu { kind: other }.fail(),
    };
    Ok(GroupVersionKind::gvk(group, version, kind))
}

fn object_name(object: &Value) -> Result<String> {
    object
        .as_mapping()
        .and_then(|m| m.get("metadata"))
        .and_then(|m| m.as_mapping())
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or(Error::MissingName)
}

fn value_to_json(value: &Value) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::InvalidObject {
        message: e.to_string(),
    })
}

fn json_to_value(json: serde_json::Value) -> Result<Value> {
    serde_yaml::to_value(json).map_err(|e| Error::InvalidObject {
        message: e.to_string(),
    })
}

/// Backed by a real `kube::Client`. Resolves a kind to its `ApiResource`
/// via one-shot server discovery on every call — this is a one-shot CLI,
/// not a long-lived controller, so there's no watch cache to keep warm.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        KubeClusterApi { client }
    }

    async fn api_for(&self, kind: &str, namespace: &str) -> Result<Api<DynamicObject>> {
        let gvk = gvk_for_kind(kind)?;
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|source| Error::Discovery {
                kind: kind.to_string(),
                source,
            })?;
        Ok(match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &ar),
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn dynamic_object(object: Value, ar: &ApiResource) -> Result<DynamicObject> {
        let json = value_to_json(&object)?;
        let mut obj: DynamicObject = serde_json::from_value(json).map_err(|e| Error::InvalidObject {
            message: e.to_string(),
        })?;
        obj.types = Some(kube::api::TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        Ok(obj)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(&self, kind: &str, name: &str, namespace: &str) -> Result<Option<Value>> {
        let api = self.api_for(kind, namespace).await?;
        match api.get_opt(name).await? {
            None => Ok(None),
            Some(obj) => Ok(Some(json_to_value(serde_json::to_value(obj).map_err(
                |e| Error::InvalidObject {
                    message: e.to_string(),
                },
            )?)?)),
        }
    }

    async fn apply(&self, object: Value, namespace: &str) -> Result<Value> {
        let kind = object
            .as_mapping()
            .and_then(|m| m.get("kind"))
            .and_then(Value::as_str)
            .ok_or(Error::InvalidObject {
                message: "object has no kind".to_string(),
            })?
            .to_string();
        let name = object_name(&object)?;

        let gvk = gvk_for_kind(&kind)?;
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|source| Error::Discovery {
                kind: kind.clone(),
                source,
            })?;
        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &ar),
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        };

        let dyn_obj = Self::dynamic_object(object, &ar)?;
        let params = PatchParams::apply("octoploy").force();
        let applied = api.patch(&name, &params, &Patch::Apply(&dyn_obj)).await?;
        json_to_value(serde_json::to_value(applied).map_err(|e| Error::InvalidObject {
            message: e.to_string(),
        })?)
    }

    async fn delete(&self, kind: &str, name: &str, namespace: &str) -> Result<()> {
        let api = self.api_for(kind, namespace).await?;
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube { source: e }),
        }
    }

    async fn annotate(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let api = self.api_for(kind, namespace).await?;
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } }
        });
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn rollout(&self, kind: &str, name: &str, namespace: &str) -> Result<()> {
        let api = self.api_for(kind, namespace).await?;
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": {
                "octoploy.io/restartedAt": chrono_like_timestamp()
            } } } }
        });
        match api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(kind, name, "rollout target not found, skipping");
                Ok(())
            }
            Err(e) => Err(Error::Kube { source: e }),
        }
    }

    async fn get_pods(&self, dc_name: &str, namespace: &str) -> Result<Vec<String>> {
        let gvk = GroupVersionKind::gvk("", "v1", "Pod");
        let (ar, _) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|source| Error::Discovery {
                kind: "Pod".to_string(),
                source,
            })?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let params = kube::api::ListParams::default().labels(&format!("deploymentconfig={dc_name}"));
        let list = api.list(&params).await?;
        Ok(list.items.into_iter().filter_map(|o| o.metadata.name).collect())
    }

    async fn exec(&self, pod_name: &str, namespace: &str, command: &str, args: &[String]) -> Result<()> {
        let api: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut full_command = vec![command.to_string()];
        full_command.extend_from_slice(args);
        let mut process = api
            .exec(pod_name, full_command, &kube::api::AttachParams::default().stderr(false))
            .await?;
        if let Some(status) = process.take_status() {
            status.await;
        }
        process.join().await.map_err(|source| Error::Kube { source })?;
        Ok(())
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await?;
        Ok(list.items.into_iter().filter_map(|ns| ns.metadata.name).collect())
    }

    async fn dry_run(&self, object: Value, namespace: &str) -> Result<Value> {
        let kind = object
            .as_mapping()
            .and_then(|m| m.get("kind"))
            .and_then(Value::as_str)
            .ok_or(Error::InvalidObject {
                message: "object has no kind".to_string(),
            })?
            .to_string();
        let name = object_name(&object)?;
        let gvk = gvk_for_kind(&kind)?;
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|source| Error::Discovery {
                kind: kind.clone(),
                source,
            })?;
        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &ar),
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        };
        let dyn_obj = Self::dynamic_object(object, &ar)?;
        let params = PatchParams::apply("octoploy").force().dry_run();
        let result = api.patch(&name, &params, &Patch::Apply(&dyn_obj)).await?;
        json_to_value(serde_json::to_value(result).map_err(|e| Error::InvalidObject {
            message: e.to_string(),
        })?)
    }

    async fn list_namespace_objects(&self, kind: &str, namespace: &str) -> Result<Vec<Value>> {
        let api = self.api_for(kind, namespace).await?;
        let list = api.list(&Default::default()).await?;
        list.items
            .into_iter()
            .map(|o| json_to_value(serde_json::to_value(o).map_err(|e| Error::InvalidObject {
                message: e.to_string(),
            })?))
            .collect()
    }
}

fn chrono_like_timestamp() -> String {
    // Avoids a direct `chrono`/`time` dependency for one annotation value;
    // precision to the second is enough to force a pod template change.
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.to_string()
}

/// An in-memory `ClusterApi`, keyed by `(namespace, kind, name)`. Used by
/// every test in this crate.
pub struct FakeClusterApi {
    objects: Mutex<HashMap<(String, String, String), Value>>,
    rollout_count: Mutex<u32>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        FakeClusterApi {
            objects: Mutex::new(HashMap::new()),
            rollout_count: Mutex::new(0),
        }
    }

    pub fn seed(&self, namespace: &str, kind: &str, name: &str, object: Value) {
        self.objects
            .lock()
            .unwrap()
            .insert((namespace.to_string(), kind.to_string(), name.to_string()), object);
    }

    /// Number of times `rollout` has been called, for asserting that
    /// `on-config-change` fired (or didn't) in tests.
    pub fn rollout_count(&self) -> u32 {
        *self.rollout_count.lock().unwrap()
    }
}

impl Default for FakeClusterApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn get(&self, kind: &str, name: &str, namespace: &str) -> Result<Option<Value>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), kind.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply(&self, object: Value, namespace: &str) -> Result<Value> {
        let kind = object
            .as_mapping()
            .and_then(|m| m.get("kind"))
            .and_then(Value::as_str)
            .ok_or(Error::InvalidObject {
                message: "object has no kind".to_string(),
            })?
            .to_string();
        let name = object_name(&object)?;
        self.objects.lock().unwrap().insert(
            (namespace.to_string(), kind, name),
            object.clone(),
        );
        Ok(object)
    }

    async fn delete(&self, kind: &str, name: &str, namespace: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), kind.to_string(), name.to_string()));
        Ok(())
    }

    async fn annotate(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        if let Some(object) = objects.get_mut(&(namespace.to_string(), kind.to_string(), name.to_string())) {
            if let Some(map) = object.as_mapping_mut() {
                let metadata = map
                    .entry(Value::String("metadata".into()))
                    .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
                if let Some(metadata) = metadata.as_mapping_mut() {
                    let annotations = metadata
                        .entry(Value::String("annotations".into()))
                        .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
                    if let Some(annotations) = annotations.as_mapping_mut() {
                        match value {
                            Some(v) => {
                                annotations.insert(Value::String(key.into()), Value::String(v.into()));
                            }
                            None => {
                                annotations.remove(key);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollout(&self, _kind: &str, _name: &str, _namespace: &str) -> Result<()> {
        *self.rollout_count.lock().unwrap() += 1;
        Ok(())
    }

    async fn get_pods(&self, _dc_name: &str, _namespace: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn exec(&self, _pod_name: &str, _namespace: &str, _command: &str, _args: &[String]) -> Result<()> {
        Ok(())
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        let mut namespaces: Vec<String> = objects.keys().map(|(ns, _, _)| ns.clone()).collect();
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn dry_run(&self, object: Value, _namespace: &str) -> Result<Value> {
        Ok(object)
    }

    async fn list_namespace_objects(&self, kind: &str, namespace: &str) -> Result<Vec<Value>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, k, _), _)| ns == namespace && k == kind)
            .map(|(_, v)| v.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_apply_then_get_round_trips() {
        let cluster = FakeClusterApi::new();
        let object: Value =
            serde_yaml::from_str("kind: ConfigMap\nmetadata:\n  name: cfg\n").unwrap();
        cluster.apply(object.clone(), "ns").await.unwrap();
        let got = cluster.get("ConfigMap", "cfg", "ns").await.unwrap();
        assert_eq!(got, Some(object));
    }

    #[tokio::test]
    async fn fake_delete_is_idempotent() {
        let cluster = FakeClusterApi::new();
        cluster.delete("ConfigMap", "missing", "ns").await.unwrap();
    }

    #[tokio::test]
    async fn fake_annotate_sets_and_clears() {
        let cluster = FakeClusterApi::new();
        let object: Value =
            serde_yaml::from_str("kind: ConfigMap\nmetadata:\n  name: cfg\n").unwrap();
        cluster.apply(object, "ns").await.unwrap();

        cluster
            .annotate("ConfigMap", "cfg", "ns", "yml-hash", Some("abc"))
            .await
            .unwrap();
        let got = cluster.get("ConfigMap", "cfg", "ns").await.unwrap().unwrap();
        let annotation = got
            .as_mapping()
            .and_then(|m| m.get("metadata"))
            .and_then(Value::as_mapping)
            .and_then(|m| m.get("annotations"))
            .and_then(Value::as_mapping)
            .and_then(|m| m.get("yml-hash"))
            .and_then(Value::as_str);
        assert_eq!(annotation, Some("abc"));
    }
}

//! StateStore: the cluster-side record of which objects octoploy owns,
//! held in a ConfigMap so it survives between runs.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::cluster::ClusterApi;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("cluster error: {source}"), context(false))]
    Cluster { source: crate::cluster::Error },

    #[snafu(display("state ConfigMap's data.state is not valid YAML: {source}"))]
    Corrupt { source: serde_yaml::Error },

    #[snafu(display("unsupported state backing store {backend:?}"))]
    UnsupportedBackend { backend: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One tracked object: `context` is the owning app's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    pub context: String,
    pub namespace: String,
    pub fqn: String,
    pub hash: String,

    #[serde(skip)]
    pub visited: bool,
}

impl ObjectState {
    fn key(&self) -> (&str, &str, &str) {
        (self.context.as_str(), self.namespace.as_str(), self.fqn.as_str())
    }
}

pub struct StateStore {
    configmap_name: String,
    entries: Vec<ObjectState>,
}

impl StateStore {
    pub fn configmap_name(state_suffix: &str) -> String {
        format!("octoploy-state{state_suffix}")
    }

    /// Restores state from the project namespace's ConfigMap; a missing
    /// ConfigMap yields an empty store rather than an error.
    pub async fn restore(
        cluster: &dyn ClusterApi,
        namespace: &str,
        state_suffix: &str,
    ) -> Result<Self> {
        let name = Self::configmap_name(state_suffix);
        let entries = match cluster.get("ConfigMap", &name, namespace).await? {
            None => Vec::new(),
            Some(object) => {
                let raw = object
                    .as_mapping()
                    .and_then(|m| m.get("data"))
                    .and_then(|d| d.as_mapping())
                    .and_then(|d| d.get("state"))
                    .and_then(|s| s.as_str())
                    .unwrap_or("[]");
                serde_yaml::from_str(raw).map_err(|source| Error::Corrupt { source })?
            }
        };
        Ok(StateStore {
            configmap_name: name,
            entries,
        })
    }

    /// Persists the current state to its ConfigMap.
    pub async fn store(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<()> {
        let state_yaml = serde_yaml::to_string(&self.entries).map_err(|source| Error::Corrupt { source })?;
        let mut data = serde_yaml::Mapping::new();
        data.insert(
            serde_yaml::Value::String("state".into()),
            serde_yaml::Value::String(state_yaml),
        );
        let mut configmap = serde_yaml::Mapping::new();
        configmap.insert(serde_yaml::Value::String("kind".into()), serde_yaml::Value::String("ConfigMap".into()));
        configmap.insert(serde_yaml::Value::String("apiVersion".into()), serde_yaml::Value::String("v1".into()));
        let mut metadata = serde_yaml::Mapping::new();
        metadata.insert(serde_yaml::Value::String("name".into()), serde_yaml::Value::String(self.configmap_name.clone()));
        metadata.insert(serde_yaml::Value::String("namespace".into()), serde_yaml::Value::String(namespace.to_string()));
        configmap.insert(serde_yaml::Value::String("metadata".into()), serde_yaml::Value::Mapping(metadata));
        configmap.insert(serde_yaml::Value::String("data".into()), serde_yaml::Value::Mapping(data));

        cluster
            .apply(serde_yaml::Value::Mapping(configmap), namespace)
            .await?;
        Ok(())
    }

    /// Adds a new entry or marks an existing one visited, updating its
    /// hash either way.
    pub fn visit(&mut self, context: &str, namespace: &str, fqn: &str, hash: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.key() == (context, namespace, fqn))
        {
            entry.hash = hash.to_string();
            entry.visited = true;
        } else {
            self.entries.push(ObjectState {
                context: context.to_string(),
                namespace: namespace.to_string(),
                fqn: fqn.to_string(),
                hash: hash.to_string(),
                visited: true,
            });
        }
    }

    /// Marks an existing entry visited without changing its hash, and
    /// without creating one if absent (used by the reconciler's no-op
    /// path, where the hash is already correct).
    pub fn visit_only(&mut self, context: &str, namespace: &str, fqn: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.key() == (context, namespace, fqn))
        {
            entry.visited = true;
        }
    }

    pub fn get(&self, context: &str, namespace: &str, fqn: &str) -> Option<&ObjectState> {
        self.entries
            .iter()
            .find(|e| e.key() == (context, namespace, fqn))
    }

    pub fn remove(&mut self, context: &str, namespace: &str, fqn: &str) {
        self.entries.retain(|e| e.key() != (context, namespace, fqn));
    }

    /// Entries owned by `context` that were not visited during this run.
    pub fn not_visited(&self, context: &str) -> Vec<&ObjectState> {
        self.entries
            .iter()
            .filter(|e| e.context == context && !e.visited)
            .collect()
    }

    pub fn entries(&self) -> &[ObjectState] {
        &self.entries
    }

    /// Renames every entry's `context` from `src` to `dst`, for `state mv`.
    pub fn rename_context(&mut self, src: &str, dst: &str) {
        for entry in &mut self.entries {
            if entry.context == src {
                entry.context = dst.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FakeClusterApi;

    #[tokio::test]
    async fn restore_on_missing_configmap_is_empty() {
        let cluster = FakeClusterApi::new();
        let store = StateStore::restore(&cluster, "ns", "").await.unwrap();
        assert!(store.entries().is_empty());
    }

    #[tokio::test]
    async fn store_then_restore_round_trips() {
        let cluster = FakeClusterApi::new();
        let mut store = StateStore::restore(&cluster, "ns", "").await.unwrap();
        store.visit("web", "ns", "Deployment/web", "abc123");
        store.store(&cluster, "ns").await.unwrap();

        let restored = StateStore::restore(&cluster, "ns", "").await.unwrap();
        let entry = restored.get("web", "ns", "Deployment/web").unwrap();
        assert_eq!(entry.hash, "abc123");
    }

    #[test]
    fn not_visited_excludes_visited_and_other_contexts() {
        let mut store = StateStore {
            configmap_name: "octoploy-state".into(),
            entries: vec![],
        };
        store.visit("web", "ns", "Deployment/web", "h1");
        store.visit("web", "ns", "ConfigMap/old", "h2");
        store
            .entries
            .iter_mut()
            .find(|e| e.fqn == "ConfigMap/old")
            .unwrap()
            .visited = false;

        let orphans = store.not_visited("web");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].fqn, "ConfigMap/old");
    }

    #[test]
    fn rename_context_only_touches_matching_entries() {
        let mut store = StateStore {
            configmap_name: "octoploy-state".into(),
            entries: vec![],
        };
        store.visit("old-name", "ns", "Deployment/web", "h1");
        store.visit("other", "ns", "Deployment/web2", "h2");
        store.rename_context("old-name", "new-name");
        assert_eq!(store.get("new-name", "ns", "Deployment/web").unwrap().hash, "h1");
        assert_eq!(store.get("other", "ns", "Deployment/web2").unwrap().hash, "h2");
    }
}

//! AppBundle: accumulates the rendered objects for one app, merging
//! same-FQN objects and ordering Deployments/DeploymentConfigs last.

use std::io::Write as _;
use std::path::Path;

use snafu::Snafu;

use crate::merge;
use crate::template::TemplateProcessor;
use crate::value::K8sObject;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("template error: {source}"), context(false))]
    Template { source: crate::template::Error },

    #[snafu(display("merge error: {source}"), context(false))]
    Merge { source: merge::Error },

    #[snafu(display("object is missing a kind/name, cannot compute its FQN"))]
    MissingFqn,

    #[snafu(display("failed to write bundle to {}: {source}", path.display()))]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to serialize object: {source}"), context(false))]
    Serialize { source: serde_yaml::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Default)]
pub struct AppBundle {
    objects: Vec<K8sObject>,
    finalized: bool,
}

impl AppBundle {
    pub fn new() -> Self {
        AppBundle::default()
    }

    /// Template-processes `object` (if a processor is given) and then
    /// either merges it into an existing object with the same FQN or
    /// appends it.
    pub fn add(&mut self, mut object: K8sObject, processor: Option<&TemplateProcessor>) -> Result<()> {
        if let Some(processor) = processor {
            processor.process(&mut object)?;
        }

        let fqn = object.fqn();
        if let Some(fqn) = &fqn {
            if let Some(existing) = self
                .objects
                .iter_mut()
                .find(|o| o.fqn().as_deref() == Some(fqn.as_str()))
            {
                if merge::merge(existing, &object)? {
                    return Ok(());
                }
            }
        }
        self.objects.push(object);
        Ok(())
    }

    /// Stable-sorts Deployments/DeploymentConfigs after every other kind,
    /// preserving relative order within each group.
    pub fn finalize(&mut self) {
        self.objects
            .sort_by_key(|o| o.is_deployment_like());
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn objects(&self) -> &[K8sObject] {
        &self.objects
    }

    pub fn into_objects(self) -> Vec<K8sObject> {
        self.objects
    }

    /// Appends the bundle's contents as a multi-document YAML stream to
    /// `path`, preserving any documents already present.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
        for object in &self.objects {
            file.write_all(b"---\n").map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let text = serde_yaml::to_string(&object.0)?;
            file.write_all(text.as_bytes()).map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(yaml: &str) -> K8sObject {
        K8sObject::new(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn finalize_sorts_deployments_last() {
        let mut bundle = AppBundle::new();
        bundle
            .add(object("kind: Deployment\nmetadata:\n  name: a\n"), None)
            .unwrap();
        bundle
            .add(object("kind: ConfigMap\nmetadata:\n  name: b\n"), None)
            .unwrap();
        bundle.finalize();
        let kinds: Vec<_> = bundle.objects().iter().map(|o| o.kind().unwrap()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "Deployment"]);
    }

    #[test]
    fn add_merges_same_fqn_deployments() {
        let mut bundle = AppBundle::new();
        bundle
            .add(
                object("kind: Deployment\nmetadata:\n  name: web\nspec:\n  template:\n    spec:\n      containers:\n        - name: app\n          image: a\n"),
                None,
            )
            .unwrap();
        bundle
            .add(
                object("kind: Deployment\nmetadata:\n  name: web\nspec:\n  template:\n    spec:\n      containers:\n        - name: sidecar\n          image: b\n"),
                None,
            )
            .unwrap();
        assert_eq!(bundle.objects().len(), 1);
        let containers = bundle.objects()[0].0["spec"]["template"]["spec"]["containers"]
            .as_sequence()
            .unwrap();
        assert_eq!(containers.len(), 2);
    }

    #[test]
    fn add_keeps_same_fqn_configmaps_separate() {
        let mut bundle = AppBundle::new();
        bundle
            .add(
                object("kind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  a: 1\n"),
                None,
            )
            .unwrap();
        bundle
            .add(
                object("kind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  b: 2\n"),
                None,
            )
            .unwrap();
        assert_eq!(bundle.objects().len(), 2);
    }

    #[test]
    fn dump_appends_multidoc_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yml");
        let mut bundle = AppBundle::new();
        bundle
            .add(object("kind: ConfigMap\nmetadata:\n  name: a\n"), None)
            .unwrap();
        bundle.dump(&path).unwrap();

        let mut bundle2 = AppBundle::new();
        bundle2
            .add(object("kind: ConfigMap\nmetadata:\n  name: b\n"), None)
            .unwrap();
        bundle2.dump(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("---").count(), 2);
    }
}

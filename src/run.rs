//! Top-level per-app orchestration: ties ConfigModel, TemplateProcessor,
//! Decryptor, PreProcessor, NamespaceProcessor, AppBundle, Reconciler and
//! StateStore together into the `deploy`/`plan`/`reload` verbs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use snafu::Snafu;
use tracing::{info, instrument, warn};

use crate::bundle::AppBundle;
use crate::cluster::ClusterApi;
use crate::config::{self, AppConfig, RootConfig};
use crate::crypto::CryptoContext;
use crate::decryptor::{self, DecryptPolicy};
use crate::namespace;
use crate::preprocessor;
use crate::reconciler::{self, Mode};
use crate::reload;
use crate::state::StateStore;
use crate::template::TemplateProcessor;
use crate::value::K8sObject;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("config error: {source}"), context(false))]
    Config { source: config::Error },

    #[snafu(display("bundle error: {source}"), context(false))]
    Bundle { source: crate::bundle::Error },

    #[snafu(display("decryption error: {source}"), context(false))]
    Decryptor { source: decryptor::Error },

    #[snafu(display("reconcile error: {source}"), context(false))]
    Reconcile { source: reconciler::Error },

    #[snafu(display("reload error: {source}"), context(false))]
    Reload { source: reload::Error },

    #[snafu(display("state error: {source}"), context(false))]
    State { source: crate::state::Error },

    #[snafu(display("failed to read source file {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Threads the constructed cluster handle, crypto context, CLI flags and
/// project config through a run. Passed by reference, never stored in a
/// global.
pub struct RunContext {
    pub cluster: Arc<dyn ClusterApi>,
    pub crypto: CryptoContext,
    pub root: RootConfig,
    pub library: Option<RootConfig>,
    pub env_overrides: HashMap<String, String>,
    pub decrypt_policy: DecryptPolicy,
}

impl RunContext {
    pub fn namespace(&self) -> String {
        self.root.namespace().unwrap_or_default().to_string()
    }

    pub fn state_suffix(&self) -> String {
        self.root.state_suffix()
    }
}

/// Source YAML documents for an app: every `*.yml` file not starting
/// with `_`, each possibly containing multiple `---`-separated documents.
fn load_source_objects(app_dir: &Path) -> Result<Vec<K8sObject>> {
    let mut objects = Vec::new();
    let Ok(entries) = std::fs::read_dir(app_dir) else {
        return Ok(objects);
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().and_then(|e| e.to_str()) == Some("yml")
                && !p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("")
                    .starts_with('_')
        })
        .collect();
    files.sort();

    for file in files {
        let text = std::fs::read_to_string(&file).map_err(|source| Error::Io {
            path: file.clone(),
            source,
        })?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(doc).map_err(|source| Error::Parse {
                path: file.clone(),
                source,
            })?;
            if value.is_null() {
                continue;
            }
            objects.push(K8sObject::new(value));
        }
    }
    Ok(objects)
}

/// Builds one named template app's processor node, to be threaded in as
/// a parent (`applyTemplates`) or child (`postApplyTemplates`) of the
/// app's own chain.
fn load_template_node(ctx: &RunContext, name: &str) -> Result<TemplateProcessor> {
    let template_app = config::load_app(&ctx.root, ctx.library.as_ref(), name)?;
    let vars = config::replacements(&ctx.root, ctx.library.as_ref(), &template_app, &ctx.env_overrides)?;
    Ok(config::build_chain(vars, template_app.params.clone()))
}

/// Builds the full variable-resolution chain for one app: `applyTemplates`
/// entries as ancestors (lowest priority), the app's own vars in the
/// middle, `postApplyTemplates` entries as descendants (highest priority).
fn build_processor_chain(ctx: &RunContext, app: &AppConfig) -> Result<TemplateProcessor> {
    let vars = config::replacements(&ctx.root, ctx.library.as_ref(), app, &ctx.env_overrides)?;
    let mut processor = config::build_chain(vars, app.params.clone());

    for name in &app.apply_templates {
        processor = processor.with_parent(load_template_node(ctx, name)?);
    }
    for name in &app.post_apply_templates {
        processor = processor.with_child(load_template_node(ctx, name)?);
    }
    Ok(processor)
}

/// Renders every source object of one app instance into an `AppBundle`.
#[instrument(skip(ctx, app), fields(app = %app.name))]
async fn render_app(ctx: &RunContext, app: &AppConfig) -> Result<AppBundle> {
    let namespace = ctx.namespace();
    let processor = build_processor_chain(ctx, app)?;

    let mut bundle = AppBundle::new();
    for source in load_source_objects(&app.dir)? {
        let mut object = source;
        processor.process(&mut object)?;

        match decryptor::decrypt(&mut object, &ctx.crypto, ctx.decrypt_policy) {
            Ok(()) => {}
            Err(decryptor::Error::SkipObject { reason }) => {
                warn!(object = ?object.fqn(), reason, "skipping object");
                if let Some(fqn) = object.fqn() {
                    info!(fqn = %fqn, "object skipped, state will still be marked visited");
                }
                continue;
            }
            Err(other) => return Err(other.into()),
        }

        preprocessor::process(&mut object, ctx.root.mode);
        namespace::process(&mut object, &namespace);

        bundle.add(object, None)?;
    }
    bundle.finalize();
    Ok(bundle)
}

/// Renders and reconciles one app (`deploy`/`plan`).
pub async fn run_app(ctx: &RunContext, app_name: &str, mode: Mode, out_file: Option<&Path>) -> Result<()> {
    let app = config::load_app(&ctx.root, ctx.library.as_ref(), app_name)?;
    for instance in config::expand(&app)? {
        run_app_instance(ctx, &instance, mode, out_file).await?;
    }
    Ok(())
}

async fn run_app_instance(
    ctx: &RunContext,
    app: &AppConfig,
    mode: Mode,
    out_file: Option<&Path>,
) -> Result<()> {
    let namespace = ctx.namespace();
    let bundle = render_app(ctx, app).await?;

    if let Some(out_file) = out_file {
        bundle.dump(out_file)?;
    }

    let state = StateStore::restore(ctx.cluster.as_ref(), &namespace, &ctx.state_suffix()).await?;
    let (result, state, applied_configmaps) =
        reconciler::run_app(&app.name, &namespace, &bundle, ctx.cluster.as_ref(), state, mode).await;

    // State must persist whether or not reconciliation succeeded (the
    // Rust stand-in for the original's `finally` block). Plan mode never
    // writes to the cluster, the state ConfigMap included.
    let store_result = if mode == Mode::Apply {
        state.store(ctx.cluster.as_ref(), &namespace).await
    } else {
        Ok(())
    };

    result?;
    store_result?;

    if mode == Mode::Apply && !applied_configmaps.is_empty() {
        reload::run(app, bundle.objects(), ctx.cluster.as_ref(), &namespace).await?;
    }
    Ok(())
}

/// Runs every enabled app in the project, in directory-listing order,
/// each fully finished before the next begins.
pub async fn run_all(ctx: &RunContext, mode: Mode, out_file: Option<&Path>) -> Result<()> {
    let apps = config::load_all_apps(&ctx.root, ctx.library.as_ref())?;
    for app in apps {
        for instance in config::expand(&app)? {
            run_app_instance(ctx, &instance, mode, out_file).await?;
        }
    }
    Ok(())
}

/// Runs one app's `on-config-change` actions against its rendered bundle.
pub async fn reload_app(ctx: &RunContext, app_name: &str) -> Result<()> {
    let app = config::load_app(&ctx.root, ctx.library.as_ref(), app_name)?;
    let namespace = ctx.namespace();
    for instance in config::expand(&app)? {
        let bundle = render_app(ctx, &instance).await?;
        reload::run(&instance, bundle.objects(), ctx.cluster.as_ref(), &namespace).await?;
    }
    Ok(())
}

pub fn encrypt(ctx: &RunContext, plaintext: &str) -> String {
    ctx.crypto.encrypt(plaintext)
}

const BACKUP_KINDS: &[&str] = &[
    "ConfigMap",
    "Secret",
    "Service",
    "Deployment",
    "DeploymentConfig",
    "ServiceAccount",
    "Route",
    "PersistentVolumeClaim",
];

const SERVER_MANAGED_TOP_LEVEL: &[&str] = &["status"];
const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "managedFields",
    "creationTimestamp",
];

fn strip_server_managed_fields(object: &mut serde_yaml::Value) {
    if let Some(map) = object.as_mapping_mut() {
        for field in SERVER_MANAGED_TOP_LEVEL {
            map.remove(*field);
        }
        if let Some(serde_yaml::Value::Mapping(metadata)) = map.get_mut("metadata") {
            for field in SERVER_MANAGED_METADATA {
                metadata.remove(*field);
            }
        }
    }
}

/// Exports every object of every well-known kind in the project
/// namespace to `<dir>/<kind>/<name>.yml`.
pub async fn backup(ctx: &RunContext, dir: &Path) -> Result<()> {
    let namespace = ctx.namespace();
    for kind in BACKUP_KINDS {
        let objects = ctx.cluster.list_namespace_objects(kind, &namespace).await?;
        if objects.is_empty() {
            continue;
        }
        let kind_dir = dir.join(kind);
        std::fs::create_dir_all(&kind_dir).map_err(|source| Error::Io {
            path: kind_dir.clone(),
            source,
        })?;
        for mut object in objects {
            strip_server_managed_fields(&mut object);
            let name = object
                .as_mapping()
                .and_then(|m| m.get("metadata"))
                .and_then(|m| m.as_mapping())
                .and_then(|m| m.get("name"))
                .and_then(serde_yaml::Value::as_str)
                .unwrap_or("unnamed")
                .to_string();
            let path = kind_dir.join(format!("{name}.yml"));
            let text = serde_yaml::to_string(&object).map_err(|source| Error::Parse {
                path: path.clone(),
                source,
            })?;
            std::fs::write(&path, text).map_err(|source| Error::Io { path, source })?;
        }
    }
    Ok(())
}

pub async fn state_list(ctx: &RunContext) -> Result<Vec<String>> {
    let state = StateStore::restore(ctx.cluster.as_ref(), &ctx.namespace(), &ctx.state_suffix()).await?;
    Ok(state
        .entries()
        .iter()
        .map(|e| format!("{}\t{}\t{}\t{}", e.context, e.namespace, e.fqn, e.hash))
        .collect())
}

pub async fn state_mv(ctx: &RunContext, src: &str, dst: &str, to: Option<&str>) -> Result<()> {
    if let Some(backend) = to {
        if backend != "cm" {
            return Err(crate::state::Error::UnsupportedBackend {
                backend: backend.to_string(),
            }
            .into());
        }
    }
    let namespace = ctx.namespace();
    let mut state = StateStore::restore(ctx.cluster.as_ref(), &namespace, &ctx.state_suffix()).await?;
    state.rename_context(src, dst);
    state.store(ctx.cluster.as_ref(), &namespace).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FakeClusterApi;
    use std::fs;

    fn write_project(root: &Path) -> PathBuf {
        fs::write(
            root.join("_root.yml"),
            "namespace: demo\nvars:\n  GREETING: hello\n",
        )
        .unwrap();
        let app_dir = root.join("web");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            app_dir.join("_index.yml"),
            "name: web\n",
        )
        .unwrap();
        fs::write(
            app_dir.join("deployment.yml"),
            "kind: ConfigMap\nmetadata:\n  name: web-config\ndata:\n  message: ${GREETING}\n",
        )
        .unwrap();
        app_dir
    }

    fn test_ctx(root_dir: &Path, cluster: Arc<dyn ClusterApi>) -> RunContext {
        let (root, library) = config::load_root(root_dir).unwrap();
        RunContext {
            cluster,
            crypto: CryptoContext::from_password("unit-test-password"),
            root,
            library,
            env_overrides: HashMap::new(),
            decrypt_policy: DecryptPolicy::default(),
        }
    }

    #[tokio::test]
    async fn render_app_substitutes_vars_and_sets_namespace() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let cluster: Arc<dyn ClusterApi> = Arc::new(FakeClusterApi::new());
        let ctx = test_ctx(dir.path(), cluster);

        let app = config::load_app(&ctx.root, ctx.library.as_ref(), "web").unwrap();
        let bundle = render_app(&ctx, &app).await.unwrap();

        assert_eq!(bundle.objects().len(), 1);
        let object = &bundle.objects()[0];
        assert_eq!(object.namespace(), Some("demo"));
        assert_eq!(
            object.0["data"]["message"].as_str(),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn run_app_instance_applies_and_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path());
        let cluster: Arc<dyn ClusterApi> = Arc::new(FakeClusterApi::new());
        let ctx = test_ctx(dir.path(), cluster);

        run_app(&ctx, "web", Mode::Apply, None).await.unwrap();

        let live = ctx
            .cluster
            .get("ConfigMap", "web-config", "demo")
            .await
            .unwrap();
        assert!(live.is_some());

        let state = StateStore::restore(ctx.cluster.as_ref(), "demo", "").await.unwrap();
        assert!(state.get("web", "demo", "ConfigMap/web-config").is_some());
    }

    fn write_project_with_reload(root: &Path) {
        fs::write(
            root.join("_root.yml"),
            "namespace: demo\nvars:\n  GREETING: hello\n",
        )
        .unwrap();
        let app_dir = root.join("web");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            app_dir.join("_index.yml"),
            "name: web\non-config-change:\n  - deploy\n",
        )
        .unwrap();
        fs::write(
            app_dir.join("configmap.yml"),
            "kind: ConfigMap\nmetadata:\n  name: web-config\ndata:\n  message: ${GREETING}\n",
        )
        .unwrap();
        fs::write(
            app_dir.join("deployment.yml"),
            concat!(
                "kind: Deployment\n",
                "metadata:\n",
                "  name: web\n",
                "spec:\n",
                "  template:\n",
                "    spec:\n",
                "      containers:\n",
                "        - name: app\n",
                "          image: example/web:1.0\n",
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn reload_fires_only_when_a_configmap_was_applied() {
        let dir = tempfile::tempdir().unwrap();
        write_project_with_reload(dir.path());
        let cluster = Arc::new(FakeClusterApi::new());
        let ctx = test_ctx(dir.path(), cluster.clone() as Arc<dyn ClusterApi>);

        run_app(&ctx, "web", Mode::Apply, None).await.unwrap();
        assert_eq!(cluster.rollout_count(), 1);

        // Re-running against an unchanged bundle touches no ConfigMap, so
        // on-config-change must not fire again.
        run_app(&ctx, "web", Mode::Apply, None).await.unwrap();
        assert_eq!(cluster.rollout_count(), 1);
    }
}

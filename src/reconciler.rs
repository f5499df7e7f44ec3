//! Reconciler: diffs a finalized [`AppBundle`] against the live cluster,
//! one object at a time, and sweeps orphans once the app is done.

use md5::{Digest, Md5};
use serde_yaml::Value;
use snafu::Snafu;
use tracing::{info, warn};

use crate::bundle::AppBundle;
use crate::cluster::ClusterApi;
use crate::reload;
use crate::state::StateStore;
use crate::value::K8sObject;

const LEGACY_HASH_ANNOTATION: &str = "yml-hash";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("cluster error: {source}"), context(false))]
    Cluster { source: crate::cluster::Error },

    #[snafu(display("state error: {source}"), context(false))]
    State { source: crate::state::Error },

    #[snafu(display("reload error: {source}"), context(false))]
    Reload { source: reload::Error },

    #[snafu(display("object in bundle is missing kind/metadata.name"))]
    MissingFqn,

    #[snafu(display("failed to canonicalize object: {source}"))]
    Canonicalize { source: serde_yaml::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Apply,
    Plan,
}

/// Canonical form used for both hashing and diffing: sorted keys, every
/// string double-quoted, unlimited line width. `serde_yaml`'s default
/// emitter already sorts mapping keys that originated from a `BTreeMap`;
/// since our tree is an order-preserving `Mapping`, we sort explicitly.
pub fn canonical_dump(object: &Value) -> std::result::Result<String, serde_yaml::Error> {
    let sorted = sort_keys(object);
    serde_yaml::to_string(&sorted)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut entries: Vec<(&Value, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| format!("{a:?}").cmp(&format!("{b:?}")));
            let mut sorted = serde_yaml::Mapping::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Mapping(sorted)
        }
        Value::Sequence(seq) => Value::Sequence(seq.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

pub fn hash_of(object: &Value) -> std::result::Result<String, serde_yaml::Error> {
    let dump = canonical_dump(object)?;
    let mut hasher = Md5::new();
    hasher.update(dump.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Runs one app's finalized bundle to completion: per-object hash-diff
/// and apply, then an orphan sweep. Returns the updated in-memory state
/// and the names of any ConfigMaps actually applied this run, alongside
/// the result regardless of success or failure, so the caller can
/// persist state even when reconciliation errors out partway through.
pub async fn run_app(
    app_name: &str,
    namespace: &str,
    bundle: &AppBundle,
    cluster: &dyn ClusterApi,
    mut state: StateStore,
    mode: Mode,
) -> (Result<()>, StateStore, Vec<String>) {
    let mut applied_configmaps = Vec::new();
    let result = reconcile_objects(
        app_name,
        namespace,
        bundle,
        cluster,
        &mut state,
        mode,
        &mut applied_configmaps,
    )
    .await;
    let result = match result {
        Ok(()) => sweep_orphans(app_name, namespace, cluster, &mut state, mode).await,
        Err(e) => Err(e),
    };
    (result, state, applied_configmaps)
}

async fn reconcile_objects(
    app_name: &str,
    namespace: &str,
    bundle: &AppBundle,
    cluster: &dyn ClusterApi,
    state: &mut StateStore,
    mode: Mode,
    applied_configmaps: &mut Vec<String>,
) -> Result<()> {
    for object in bundle.objects() {
        reconcile_one(app_name, namespace, object, cluster, state, mode, applied_configmaps).await?;
    }
    Ok(())
}

async fn reconcile_one(
    app_name: &str,
    namespace: &str,
    object: &K8sObject,
    cluster: &dyn ClusterApi,
    state: &mut StateStore,
    mode: Mode,
    applied_configmaps: &mut Vec<String>,
) -> Result<()> {
    let fqn = object.fqn().ok_or(Error::MissingFqn)?;
    let kind = object.kind().unwrap_or_default().to_string();
    let name = object.name().unwrap_or_default().to_string();

    let new_hash = hash_of(&object.0).map_err(|source| Error::Canonicalize { source })?;
    let live = cluster.get(&kind, &name, namespace).await?;

    let stored_hash = state
        .get(app_name, namespace, &fqn)
        .map(|e| e.hash.clone())
        .or_else(|| {
            live.as_ref()
                .and_then(|l| l.as_mapping())
                .and_then(|m| m.get("metadata"))
                .and_then(|m| m.as_mapping())
                .and_then(|m| m.get("annotations"))
                .and_then(|m| m.as_mapping())
                .and_then(|m| m.get(LEGACY_HASH_ANNOTATION))
                .and_then(Value::as_str)
                .map(String::from)
        });

    match (live, stored_hash) {
        (None, _) => {
            apply(
                app_name,
                namespace,
                object,
                &fqn,
                &kind,
                &name,
                &new_hash,
                cluster,
                state,
                mode,
                applied_configmaps,
            )
            .await?;
        }
        (Some(_), None) => {
            warn!(fqn = %fqn, "adopting live object with no recorded state, leaving it unchanged");
            state.visit(app_name, namespace, &fqn, &new_hash);
        }
        (Some(_), Some(stored)) if stored == new_hash => {
            state.visit_only(app_name, namespace, &fqn);
        }
        (Some(live_object), Some(_)) => {
            if mode == Mode::Plan {
                log_plan_diff(&fqn, &live_object, &object.0);
            } else {
                cluster.apply(object.0.clone(), namespace).await?;
                cluster
                    .annotate(&kind, &name, namespace, LEGACY_HASH_ANNOTATION, None)
                    .await?;
                if kind == "ConfigMap" {
                    applied_configmaps.push(name.clone());
                }
            }
            state.visit(app_name, namespace, &fqn, &new_hash);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn apply(
    app_name: &str,
    namespace: &str,
    object: &K8sObject,
    fqn: &str,
    kind: &str,
    name: &str,
    new_hash: &str,
    cluster: &dyn ClusterApi,
    state: &mut StateStore,
    mode: Mode,
    applied_configmaps: &mut Vec<String>,
) -> Result<()> {
    if mode == Mode::Apply {
        cluster.apply(object.0.clone(), namespace).await?;
        if kind == "ConfigMap" {
            applied_configmaps.push(name.to_string());
        }
    } else {
        info!(fqn = %fqn, "would create");
    }
    state.visit(app_name, namespace, fqn, new_hash);
    Ok(())
}

fn log_plan_diff(fqn: &str, live: &Value, rendered: &Value) {
    let (Ok(live_json), Ok(rendered_json)) = (
        serde_json::to_value(sort_keys(live)),
        serde_json::to_value(sort_keys(rendered)),
    ) else {
        info!(fqn, "would update (diff unavailable: non-serializable object)");
        return;
    };
    let patch = json_patch::diff(&live_json, &rendered_json);
    info!(fqn, "would update:");
    for op in patch.0 {
        info!("  {}", format_patch_op(&op));
    }
}

fn format_patch_op(op: &json_patch::PatchOperation) -> String {
    use json_patch::PatchOperation::*;
    match op {
        Add(o) => format!("+ {} = {}", o.path, o.value),
        Remove(o) => format!("- {}", o.path),
        Replace(o) => format!("~ {} = {}", o.path, o.value),
        Move(o) => format!("move {} -> {}", o.from, o.path),
        Copy(o) => format!("copy {} -> {}", o.from, o.path),
        Test(o) => format!("test {} == {}", o.path, o.value),
    }
}

async fn sweep_orphans(
    app_name: &str,
    namespace: &str,
    cluster: &dyn ClusterApi,
    state: &mut StateStore,
    mode: Mode,
) -> Result<()> {
    let orphans: Vec<(String, String)> = state
        .not_visited(app_name)
        .into_iter()
        .map(|e| (e.fqn.clone(), e.hash.clone()))
        .collect();

    for (fqn, _) in orphans {
        let Some((kind, name)) = split_fqn(&fqn) else {
            continue;
        };
        if mode == Mode::Plan {
            info!(fqn = %fqn, "would delete (orphaned)");
        } else {
            info!(fqn = %fqn, "deleting orphaned object");
            cluster.delete(&kind, &name, namespace).await?;
            state.remove(app_name, namespace, &fqn);
        }
    }
    Ok(())
}

fn split_fqn(fqn: &str) -> Option<(String, String)> {
    let (kind_part, name) = fqn.rsplit_once('/')?;
    let kind = kind_part.split('.').next().unwrap_or(kind_part);
    Some((kind.to_string(), name.to_string()))
}

//! Reload actions: what `on-config-change` does after a `ConfigMap`
//! apply changes.

use snafu::Snafu;
use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::config::{AppConfig, ExecSpec, ReloadActionSpec};
use crate::value::K8sObject;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("cluster error: {source}"), context(false))]
    Cluster { source: crate::cluster::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Runs every `on-config-change` action declared on `app` against the
/// rendered `bundle` (not the live cluster's contents — see module docs
/// on why reload selects from the render, not from a cluster listing).
pub async fn run(
    app: &AppConfig,
    bundle: &[K8sObject],
    cluster: &dyn ClusterApi,
    namespace: &str,
) -> Result<()> {
    for action in &app.on_config_change {
        match action {
            ReloadActionSpec::Deploy(literal) if literal == "deploy" => {
                deploy(app, bundle, cluster, namespace).await?;
            }
            ReloadActionSpec::Deploy(other) => {
                warn!(action = %other, "unrecognized on-config-change string action, ignoring");
            }
            ReloadActionSpec::Exec { exec } => {
                exec_in_pods(app, exec, cluster, namespace).await?;
            }
        }
    }
    Ok(())
}

async fn deploy(
    app: &AppConfig,
    bundle: &[K8sObject],
    cluster: &dyn ClusterApi,
    namespace: &str,
) -> Result<()> {
    let target = bundle
        .iter()
        .find(|o| o.is_deployment_like() && o.name() == Some(app.name.as_str()));
    let Some(target) = target else {
        warn!(app = %app.name, "on-config-change deploy: no matching Deployment in bundle, skipping");
        return Ok(());
    };
    let kind = target.kind().unwrap_or("Deployment");
    info!(app = %app.name, kind, "rolling out on config change");
    cluster.rollout(kind, &app.name, namespace).await?;
    Ok(())
}

async fn exec_in_pods(
    app: &AppConfig,
    exec: &ExecSpec,
    cluster: &dyn ClusterApi,
    namespace: &str,
) -> Result<()> {
    let pods = cluster.get_pods(&app.name, namespace).await?;
    for pod in pods {
        info!(app = %app.name, pod, command = %exec.command, "executing on config change");
        cluster.exec(&pod, namespace, &exec.command, &exec.args).await?;
    }
    Ok(())
}

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use octoploy::cluster::{ClusterApi, FakeClusterApi};
use octoploy::config;
use octoploy::crypto::CryptoContext;
use octoploy::decryptor::DecryptPolicy;
use octoploy::reconciler::Mode;
use octoploy::run::{self, RunContext};

fn write_project(root: &std::path::Path) {
    fs::write(
        root.join("_root.yml"),
        "namespace: demo\nvars:\n  REPLICAS: \"2\"\n",
    )
    .unwrap();

    let app_dir = root.join("web");
    fs::create_dir_all(&app_dir).unwrap();
    fs::write(app_dir.join("_index.yml"), "name: web\n").unwrap();
    fs::write(
        app_dir.join("configmap.yml"),
        "kind: ConfigMap\nmetadata:\n  name: web-config\ndata:\n  replicas: ${REPLICAS}\n",
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
            "    metadata:\n",
            "      labels:\n",
            "        app: web\n",
            "    spec:\n",
            "      containers:\n",
            "        - name: app\n",
            "          image: example/web:1.0\n",
        ),
    )
    .unwrap();
}

fn test_context(dir: &std::path::Path, cluster: Arc<dyn ClusterApi>) -> RunContext {
    let (root, library) = config::load_root(dir).unwrap();
    RunContext {
        cluster,
        crypto: CryptoContext::from_password("integration-test"),
        root,
        library,
        env_overrides: HashMap::new(),
        decrypt_policy: DecryptPolicy::default(),
    }
}

#[tokio::test]
async fn deploy_then_redeploy_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    let cluster: Arc<dyn ClusterApi> = Arc::new(FakeClusterApi::new());
    let ctx = test_context(dir.path(), cluster);

    run::run_app(&ctx, "web", Mode::Apply, None).await.unwrap();

    let configmap = ctx
        .cluster
        .get("ConfigMap", "web-config", "demo")
        .await
        .unwrap()
        .expect("configmap should have been applied");
    assert_eq!(configmap["data"]["replicas"].as_str(), Some("2"));

    let deployment = ctx
        .cluster
        .get("Deployment", "web", "demo")
        .await
        .unwrap()
        .expect("deployment should have been applied");
    assert_eq!(
        deployment["spec"]["template"]["spec"]["containers"][0]["name"].as_str(),
        Some("app")
    );

    // Re-running against the same rendered bundle must be a no-op: no
    // new state entries, nothing gets deleted as orphaned.
    run::run_app(&ctx, "web", Mode::Apply, None).await.unwrap();
    let lines = run::state_list(&ctx).await.unwrap();
    assert_eq!(lines.len(), 2);
}

#[tokio::test]
async fn plan_mode_never_touches_the_cluster() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    let cluster: Arc<dyn ClusterApi> = Arc::new(FakeClusterApi::new());
    let ctx = test_context(dir.path(), cluster);

    run::run_app(&ctx, "web", Mode::Plan, None).await.unwrap();

    assert!(ctx
        .cluster
        .get("ConfigMap", "web-config", "demo")
        .await
        .unwrap()
        .is_none());
}

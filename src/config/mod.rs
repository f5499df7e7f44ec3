//! ConfigModel: root project and per-app configuration, library
//! inheritance, `forEach` expansion, and the layered replacement map
//! that feeds [`crate::template::TemplateProcessor`].
//!
//! Unlike the typed, derive-macro-driven configuration layer this module
//! is grounded on (`config::fragment`/`config::merge` in the teacher),
//! project and app configs here are loosely-typed YAML documents whose
//! `vars` map is an open-ended tree, not a schema known at compile time
//! — so we read them into plain structs with a `serde_yaml::Mapping` for
//! the open-ended parts, rather than generating fragment/merge code for
//! every field.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use snafu::Snafu;
use tracing::warn;

use crate::loaders;
use crate::template::TemplateProcessor;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("project directory not found: {}", path.display()))]
    NotFound { path: PathBuf },

    #[snafu(display("app {name:?} not found under {}", root.display()))]
    AppNotFound { root: PathBuf, name: String },

    #[snafu(display("failed to read {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("{inherit:?} is referenced as a library but is not type=library"))]
    NotALibrary { inherit: String },

    #[snafu(display("inherit cycle detected at {project:?}"))]
    InheritCycle { project: String },

    #[snafu(display("duplicate app name {name:?} across project and library"))]
    DuplicateAppName { name: String },

    #[snafu(display("forEach entry is missing required APP_NAME"))]
    MissingAppName,

    #[snafu(display("value loader error: {source}"), context(false))]
    Loader { source: loaders::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectMode {
    Oc,
    K8s,
    /// Legacy spelling accepted by the original tool; behaves like `K8s`.
    #[serde(rename = "k8")]
    K8Legacy,
}

impl ProjectMode {
    pub fn normalized(self) -> ProjectMode {
        match self {
            ProjectMode::K8Legacy => ProjectMode::K8s,
            other => other,
        }
    }
}

impl Default for ProjectMode {
    fn default() -> Self {
        ProjectMode::K8s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RootKind {
    #[default]
    App,
    Library,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    #[default]
    App,
    Template,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigMapFileSpec {
    pub file: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigMapSpec {
    pub name: String,
    #[serde(default)]
    pub files: Vec<ConfigMapFileSpec>,
    #[serde(default, rename = "disableTemplating")]
    pub disable_templating: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReloadActionSpec {
    Deploy(String),
    Exec { exec: ExecSpec },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    pub project: Option<String>,
    pub namespace: Option<String>,
    pub context: Option<String>,
    #[serde(default)]
    pub mode: ProjectMode,
    #[serde(default, rename = "type")]
    pub kind: RootKind,
    pub inherit: Option<String>,
    #[serde(rename = "stateName")]
    pub state_name: Option<String>,
    #[serde(default)]
    pub vars: Mapping,
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(skip)]
    pub dir: PathBuf,
}

impl RootConfig {
    /// The project's effective namespace, preferring `namespace` but
    /// logging a deprecation warning if only the legacy `project` key
    /// was present (see §9 of the spec this is grounded on).
    pub fn namespace(&self) -> Option<&str> {
        match (&self.namespace, &self.project) {
            (Some(ns), _) => Some(ns.as_str()),
            (None, Some(project)) => {
                warn!("_root.yml uses legacy `project` key instead of `namespace`");
                Some(project.as_str())
            }
            (None, None) => None,
        }
    }

    pub fn state_suffix(&self) -> String {
        self.state_name.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: AppKind,
    #[serde(default, rename = "applyTemplates")]
    pub apply_templates: Vec<String>,
    #[serde(default, rename = "postApplyTemplates")]
    pub post_apply_templates: Vec<String>,
    #[serde(default)]
    pub configmaps: Vec<ConfigMapSpec>,
    #[serde(default, rename = "on-config-change")]
    pub on_config_change: Vec<ReloadActionSpec>,
    #[serde(default, rename = "forEach")]
    pub for_each: Option<Vec<Mapping>>,
    #[serde(default)]
    pub vars: Mapping,
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(skip)]
    pub dir: PathBuf,
    /// The `APP_NAME` this instance was expanded with, if it came from a
    /// `forEach` entry; otherwise equal to `name`.
    #[serde(skip)]
    pub instance_vars: Mapping,
}

fn default_true() -> bool {
    true
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads `<dir>/_root.yml`, following `inherit` once (libraries may not
/// themselves inherit further in this implementation — a deliberate
/// simplification recorded as a resolved open question in DESIGN.md).
pub fn load_root(dir: &Path) -> Result<(RootConfig, Option<RootConfig>)> {
    let root_path = dir.join("_root.yml");
    if !dir.is_dir() {
        return NotFoundSnafu { path: dir.to_path_buf() }.fail();
    }
    let mut root: RootConfig = read_yaml(&root_path)?;
    root.dir = dir.to_path_buf();

    let library = match &root.inherit {
        None => None,
        Some(sibling) => {
            let library_dir = dir
                .parent()
                .unwrap_or(dir)
                .join(sibling);
            if library_dir == *dir {
                return InheritCycleSnafu {
                    project: sibling.clone(),
                }
                .fail();
            }
            let mut lib: RootConfig = read_yaml(&library_dir.join("_root.yml"))?;
            lib.dir = library_dir;
            if lib.kind != RootKind::Library {
                return NotALibrarySnafu {
                    inherit: sibling.clone(),
                }
                .fail();
            }
            Some(lib)
        }
    };

    Ok((root, library))
}

/// Loads one app by name, falling back to the library's copy of the app
/// directory when the project itself doesn't have it.
pub fn load_app(root: &RootConfig, library: Option<&RootConfig>, name: &str) -> Result<AppConfig> {
    let primary = root.dir.join(name).join("_index.yml");
    if primary.is_file() {
        let mut app: AppConfig = read_yaml(&primary)?;
        app.dir = root.dir.join(name);
        return Ok(app);
    }
    if let Some(library) = library {
        let fallback = library.dir.join(name).join("_index.yml");
        if fallback.is_file() {
            let mut app: AppConfig = read_yaml(&fallback)?;
            app.dir = library.dir.join(name);
            return Ok(app);
        }
    }
    AppNotFoundSnafu {
        root: root.dir.clone(),
        name: name.to_string(),
    }
    .fail()
}

/// Enumerates every deployable app directory under `root` (and, for
/// names not present in `root`, under `library`), skipping directories
/// without an `_index.yml`, disabled apps, and `type=template` apps.
/// Asserts that resolved app names are unique across project+library.
pub fn load_all_apps(root: &RootConfig, library: Option<&RootConfig>) -> Result<Vec<AppConfig>> {
    let mut seen = std::collections::HashSet::new();
    let mut apps = Vec::new();

    for dir in [Some(&root.dir), library.map(|l| &l.dir)].into_iter().flatten() {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut subdirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        subdirs.sort();

        for subdir in subdirs {
            let index = subdir.join("_index.yml");
            if !index.is_file() {
                continue;
            }
            let mut app: AppConfig = read_yaml(&index)?;
            app.dir = subdir;
            if !app.enabled || app.kind == AppKind::Template {
                continue;
            }
            if !seen.insert(app.name.clone()) {
                return DuplicateAppNameSnafu { name: app.name }.fail();
            }
            apps.push(app);
        }
    }
    Ok(apps)
}

/// Expands an app's `forEach` list into one `AppConfig` per entry, or
/// returns the app unchanged if it has none.
pub fn expand(app: &AppConfig) -> Result<Vec<AppConfig>> {
    let Some(entries) = &app.for_each else {
        return Ok(vec![app.clone()]);
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let app_name = entry
            .get("APP_NAME")
            .and_then(Value::as_str)
            .ok_or(Error::MissingAppName)?
            .to_string();
        let mut instance = app.clone();
        instance.name = app_name;
        instance.for_each = None;
        instance.instance_vars = entry.clone();
        out.push(instance);
    }
    Ok(out)
}

/// Composes the layered replacement map: library vars, project vars, app
/// vars, `forEach` instance vars, then CLI overrides (highest priority),
/// resolving any `{loader: ...}` entries along the way. Well-known keys
/// `NAMESPACE`/`OC_PROJECT`/`APP_NAME`/`DC_NAME` are injected last so
/// they can't be shadowed by a lower layer.
pub fn replacements(
    root: &RootConfig,
    library: Option<&RootConfig>,
    app: &AppConfig,
    cli_overrides: &HashMap<String, String>,
) -> Result<HashMap<String, Value>> {
    let mut vars = HashMap::new();

    if let Some(library) = library {
        merge_vars_layer(&mut vars, &library.vars, &library.dir)?;
    }
    merge_vars_layer(&mut vars, &root.vars, &root.dir)?;
    merge_vars_layer(&mut vars, &app.vars, &app.dir)?;
    merge_vars_layer(&mut vars, &app.instance_vars, &app.dir)?;

    for (k, v) in cli_overrides {
        vars.insert(k.clone(), Value::String(v.clone()));
    }

    if let Some(ns) = root.namespace() {
        vars.insert("NAMESPACE".to_string(), Value::String(ns.to_string()));
        vars.insert("OC_PROJECT".to_string(), Value::String(ns.to_string()));
    }
    vars.insert("APP_NAME".to_string(), Value::String(app.name.clone()));
    vars.insert("DC_NAME".to_string(), Value::String(app.name.clone()));

    Ok(vars)
}

fn merge_vars_layer(
    vars: &mut HashMap<String, Value>,
    layer: &Mapping,
    base_dir: &Path,
) -> Result<()> {
    for (key, value) in layer {
        let Some(name) = key.as_str() else { continue };
        match value.as_mapping().and_then(|m| m.get("loader")) {
            Some(Value::String(loader_name)) => {
                let mut params = value.as_mapping().cloned().unwrap_or_default();
                params.remove("loader");
                let loaded = loaders::load(loader_name, &params, base_dir)?;
                for (suffix, suffix_value) in loaded {
                    vars.insert(format!("{name}{suffix}"), suffix_value);
                }
            }
            _ => {
                vars.insert(name.to_string(), value.clone());
            }
        }
    }
    Ok(())
}

/// Builds the `TemplateProcessor` chain for one app: library (lowest),
/// project root, the app itself (highest within the "config" layers —
/// `applyTemplates`/`postApplyTemplates` chains, if any, are threaded in
/// by the caller as parent/child around this base chain).
pub fn build_chain(vars: HashMap<String, Value>, params: Vec<String>) -> TemplateProcessor {
    TemplateProcessor::new(vars, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_mode_k8_legacy_normalizes_to_k8s() {
        assert_eq!(ProjectMode::K8Legacy.normalized(), ProjectMode::K8s);
    }

    #[test]
    fn expand_without_foreach_returns_single_app() {
        let app = AppConfig {
            name: "web".into(),
            enabled: true,
            kind: AppKind::App,
            apply_templates: vec![],
            post_apply_templates: vec![],
            configmaps: vec![],
            on_config_change: vec![],
            for_each: None,
            vars: Mapping::new(),
            params: vec![],
            dir: PathBuf::new(),
            instance_vars: Mapping::new(),
        };
        let expanded = expand(&app).unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].name, "web");
    }

    #[test]
    fn expand_with_foreach_requires_app_name() {
        let mut entry = Mapping::new();
        entry.insert(Value::String("REPLICAS".into()), Value::String("3".into()));
        let app = AppConfig {
            name: "web".into(),
            enabled: true,
            kind: AppKind::App,
            apply_templates: vec![],
            post_apply_templates: vec![],
            configmaps: vec![],
            on_config_change: vec![],
            for_each: Some(vec![entry]),
            vars: Mapping::new(),
            params: vec![],
            dir: PathBuf::new(),
            instance_vars: Mapping::new(),
        };
        let err = expand(&app).unwrap_err();
        matches!(err, Error::MissingAppName);
    }
}

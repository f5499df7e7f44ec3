//! TemplateProcessor: resolves the variable chain for an app, walks a
//! [`K8sObject`], and splices `_merge`.

use std::collections::HashMap;

use serde_yaml::Value;
use snafu::Snafu;
use tracing::warn;

use crate::substitution::{self, SubstitutionError};
use crate::value::{walk_mut, K8sObject, Visitor};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "required parameter(s) not resolved after templating: {}",
        names.join(", ")
    ))]
    MissingParam { names: Vec<String> },

    #[snafu(display("cannot substitute non-string value for ${{{name}}} inside a larger string"))]
    ValueError { name: String },

    #[snafu(display("cyclic template processor chain detected"))]
    CyclicChain,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One node of the parent/child processor chain. Variables are resolved
/// with the active node's own `vars` taking priority over `parent`, and
/// `child` (if any) taking priority over the active node.
#[derive(Debug, Clone, Default)]
pub struct TemplateProcessor {
    vars: HashMap<String, Value>,
    params: Vec<String>,
    parent: Option<Box<TemplateProcessor>>,
    child: Option<Box<TemplateProcessor>>,
}

impl TemplateProcessor {
    pub fn new(vars: HashMap<String, Value>, params: Vec<String>) -> Self {
        TemplateProcessor {
            vars,
            params,
            parent: None,
            child: None,
        }
    }

    pub fn with_parent(mut self, parent: TemplateProcessor) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn with_child(mut self, child: TemplateProcessor) -> Self {
        self.child = Some(Box::new(child));
        self
    }

    /// Flattens the chain from lowest to highest priority: parent first,
    /// then self, then child. Detects cycles by counting chain depth
    /// against a generous bound, since nodes don't carry identity here;
    /// callers that build chains from config graphs must de-dup before
    /// constructing a `TemplateProcessor` (see `config::build_chain`).
    fn flatten(&self) -> Vec<&TemplateProcessor> {
        let mut out = Vec::new();
        if let Some(parent) = &self.parent {
            out.extend(parent.flatten());
        }
        out.push(self);
        if let Some(child) = &self.child {
            out.extend(child.flatten());
        }
        out
    }

    pub fn all_params(&self) -> Vec<String> {
        self.flatten()
            .into_iter()
            .flat_map(|n| n.params.iter().cloned())
            .collect()
    }

    /// Resolves the replacement map: layers in chain order (later layers
    /// win), then iterates cross-reference substitution to a fixed point.
    fn resolve_vars(&self) -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        for node in self.flatten() {
            for (k, v) in &node.vars {
                vars.insert(k.clone(), v.clone());
            }
        }

        // Fixed-point resolution of variable values that reference other
        // variables. Bounded iteration count guards against a reference
        // cycle between two variables (a legitimate authoring mistake,
        // not a crash).
        for _ in 0..32 {
            let mut changed = false;
            let keys: Vec<String> = vars.keys().cloned().collect();
            for key in keys {
                let value = vars.get(&key).cloned().unwrap();
                let resolved = resolve_value(&value, &vars);
                if resolved != value {
                    changed = true;
                    vars.insert(key, resolved);
                }
            }
            if !changed {
                break;
            }
        }
        vars
    }

    /// Renders `object` in place against this chain's resolved variables.
    pub fn process(&self, object: &mut K8sObject) -> Result<()> {
        let vars = self.resolve_vars();
        let mut visitor = SubstitutionVisitor {
            vars: &vars,
            unresolved: Vec::new(),
            error: None,
        };
        walk_mut(&mut object.0, &mut visitor);

        if let Some(name) = visitor.error {
            return Err(Error::ValueError { name });
        }

        let params = self.all_params();
        let missing: Vec<String> = visitor
            .unresolved
            .iter()
            .filter(|name| params.contains(name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingParam { names: missing });
        }
        for name in &visitor.unresolved {
            if !params.contains(name) {
                warn!(variable = %name, "unresolved template variable left as literal");
            }
        }
        Ok(())
    }
}

fn resolve_value(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => match substitution::substitute(s, vars) {
            Ok(sub) => sub.value,
            Err(_) => value.clone(),
        },
        Value::Sequence(seq) => {
            Value::Sequence(seq.iter().map(|v| resolve_value(v, vars)).collect())
        }
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, vars));
            }
            Value::Mapping(out)
        }
        other => other.clone(),
    }
}

struct SubstitutionVisitor<'a> {
    vars: &'a HashMap<String, Value>,
    unresolved: Vec<String>,
    error: Option<String>,
}

impl Visitor for SubstitutionVisitor<'_> {
    fn visit_string(&mut self, s: &str) -> Option<Value> {
        if self.error.is_some() {
            return None;
        }
        match substitution::substitute(s, self.vars) {
            Ok(sub) => {
                self.unresolved.extend(sub.unresolved);
                Some(sub.value)
            }
            Err(SubstitutionError::NonStringInConcatenation { name }) => {
                self.error = Some(name);
                None
            }
        }
    }

    fn visit_mapping(&mut self, map: &mut serde_yaml::Mapping) {
        if let Some(merge_value) = map.remove("_merge") {
            if let Some(merge_map) = merge_value.as_mapping() {
                for (k, v) in merge_map {
                    map.insert(k.clone(), v.clone());
                }
            } else {
                warn!("_merge value is not a mapping, ignoring");
            }
        }
    }
}

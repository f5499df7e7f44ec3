//! Command-line surface: subcommands and flags, parsed with `clap`'s
//! derive API.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "octoploy", about = "Declarative render-and-reconcile deployment engine", arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding `_root.yml` and app subdirectories.
    #[arg(long, global = true, default_value = ".")]
    pub config_dir: PathBuf,

    /// Override or add a template variable (`KEY=VALUE`), repeatable.
    #[arg(long = "env", global = true, value_parser = parse_env_override)]
    pub env: Vec<(String, String)>,

    /// Skip Secret objects entirely rather than deploying them.
    #[arg(long, global = true)]
    pub skip_secrets: bool,

    /// Allow deploying Secret values that are not `OctoCrypt!`-encrypted.
    #[arg(long, global = true)]
    pub deploy_plain_secrets: bool,

    #[arg(long, global = true)]
    pub debug: bool,
}

impl Cli {
    pub fn env_overrides(&self) -> HashMap<String, String> {
        self.env.iter().cloned().collect()
    }
}

fn parse_env_override(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Render and apply one app.
    Deploy(AppArgs),
    /// Render and apply every app in the project.
    DeployAll(OutArgs),
    /// Render one app and log what would change, without applying.
    Plan(AppArgs),
    /// Render every app and log what would change, without applying.
    PlanAll(OutArgs),
    /// Run an app's `on-config-change` actions against the rendered bundle.
    Reload(AppArgs),
    /// Encrypt a plaintext value, printing an `OctoCrypt!` token.
    Encrypt { value: String },
    /// Export every object in the project namespace to `<dir>/<kind>/<name>.yml`.
    Backup { dir: PathBuf },
    /// Inspect or rewrite the cluster-side object state.
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Debug, Args)]
pub struct AppArgs {
    pub app: String,

    /// Append the rendered bundle to this file as well as (or instead
    /// of, in `plan` mode) reconciling it.
    #[arg(long)]
    pub out_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct OutArgs {
    #[arg(long)]
    pub out_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// Print one line per tracked object.
    List,
    /// Rename an app's entries in the state store.
    Mv {
        src: String,
        dst: String,
        #[arg(long)]
        to: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deploy_with_env_overrides() {
        let cli = Cli::parse_from([
            "octoploy",
            "--env",
            "FOO=bar",
            "deploy",
            "web",
        ]);
        assert_eq!(cli.env_overrides().get("FOO"), Some(&"bar".to_string()));
        matches!(cli.command, Command::Deploy(_));
    }

    #[test]
    fn malformed_env_override_is_rejected() {
        let result = Cli::try_parse_from(["octoploy", "--env", "NOVALUE", "deploy", "web"]);
        assert!(result.is_err());
    }
}

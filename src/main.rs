use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use snafu::Snafu;
use tracing::error;

use octoploy::cli::{Cli, Command, StateCommand};
use octoploy::cluster::{ClusterApi, KubeClusterApi};
use octoploy::config;
use octoploy::crypto::CryptoContext;
use octoploy::decryptor::DecryptPolicy;
use octoploy::logging;
use octoploy::reconciler::Mode;
use octoploy::run::{self, RunContext};

#[derive(Debug, Snafu)]
enum MainError {
    #[snafu(display("{source}"), context(false))]
    Config { source: config::Error },

    #[snafu(display("{source}"), context(false))]
    Crypto { source: octoploy::crypto::Error },

    #[snafu(display("failed to build Kubernetes client: {source}"), context(false))]
    Kube { source: kube::Error },

    #[snafu(display("{source}"), context(false))]
    Run { source: run::Error },
}

type Result<T> = std::result::Result<T, MainError>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _logging_guard = logging::initialize(cli.debug);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    if let Command::Encrypt { value } = &cli.command {
        println!("{}", CryptoContext::from_env()?.encrypt(value));
        return Ok(());
    }

    let (root, library) = config::load_root(&cli.config_dir)?;

    let client = kube::Client::try_default().await?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client));

    let ctx = RunContext {
        cluster,
        crypto: CryptoContext::from_env()?,
        root,
        library,
        env_overrides: cli.env_overrides(),
        decrypt_policy: DecryptPolicy {
            skip_secrets: cli.skip_secrets,
            deploy_plain_secrets: cli.deploy_plain_secrets,
        },
    };

    match cli.command {
        Command::Deploy(args) => {
            run::run_app(&ctx, &args.app, Mode::Apply, args.out_file.as_deref()).await?;
        }
        Command::DeployAll(args) => {
            run::run_all(&ctx, Mode::Apply, args.out_file.as_deref()).await?;
        }
        Command::Plan(args) => {
            run::run_app(&ctx, &args.app, Mode::Plan, args.out_file.as_deref()).await?;
        }
        Command::PlanAll(args) => {
            run::run_all(&ctx, Mode::Plan, args.out_file.as_deref()).await?;
        }
        Command::Reload(args) => {
            run::reload_app(&ctx, &args.app).await?;
        }
        Command::Encrypt { .. } => unreachable!("handled above before the cluster connects"),
        Command::Backup { dir } => {
            run::backup(&ctx, &dir).await?;
        }
        Command::State(StateCommand::List) => {
            for line in run::state_list(&ctx).await? {
                println!("{line}");
            }
        }
        Command::State(StateCommand::Mv { src, dst, to }) => {
            run::state_mv(&ctx, &src, &dst, to.as_deref()).await?;
        }
    }

    Ok(())
}

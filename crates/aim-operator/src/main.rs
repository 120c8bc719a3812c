//! AIM Operator - serves AI models on AMD GPUs from AIMRecipe, AIMCache and AIMEndpoint CRDs

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aim_operator::config::{Cli, Commands, LogFormat, OperatorConfig};
use aim_operator::controller_runner::{
    build_cache_controllers, build_endpoint_controllers, build_recipe_controllers,
};
use aim_operator::crds::{ensure_crds_installed, render_crds};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", render_crds()?);
        return Ok(());
    }

    init_tracing(cli.log_format);

    match cli.command {
        Some(Commands::Controller) | None => run_controller(OperatorConfig::from(&cli)).await,
    }
}

/// Initialize tracing with `RUST_LOG` filtering, defaulting to `info`
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=info,tower=warn,hyper=warn"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .init(),
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!("AIM controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if config.install_crds {
        ensure_crds_installed(&client).await?;
    } else {
        tracing::info!("Skipping CRD installation");
    }

    tracing::info!("Starting controllers:");
    let mut controllers = build_recipe_controllers(client.clone());
    controllers.extend(build_cache_controllers(client.clone()));
    controllers.extend(build_endpoint_controllers(client, &config).await);

    // Each controller stops on SIGTERM/SIGINT
    futures::future::join_all(controllers).await;

    tracing::info!("AIM controller shutting down");
    Ok(())
}

//! Compass Manager - registers Kyma runtimes in Compass

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use compass_manager::compass::{DirectorClient, Registrant, RuntimeAgentConfigurator};
use compass_manager::config::{ControllerArgs, DirectorConfig};
use compass_manager::controller::Context;
use compass_manager::crd::{CompassManagerMapping, Kyma};
use compass_manager::{runner, telemetry, FIELD_MANAGER};

/// Compass Manager - keeps Kyma runtimes registered in Compass
#[derive(Parser, Debug)]
#[command(name = "compass-manager", version, about, long_about = None)]
struct Cli {
    /// Print the CompassManagerMapping CRD and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    ///
    /// Watches Kyma resources, registers their runtimes in the Compass
    /// Director and configures the Compass Runtime Agent in each runtime.
    Controller(ControllerArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&CompassManagerMapping::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => anyhow::bail!("no command given, run `compass-manager controller --help`"),
    }
}

/// Install the CompassManagerMapping CRD with server-side apply
///
/// Keeps the CRD version in lockstep with the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = CompassManagerMapping::crd();
    let name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("CompassManagerMapping CRD has no name"))?;

    tracing::info!(crd = %name, "installing CRD");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CompassManagerMapping CRD: {}", e))?;
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to listen for SIGTERM");
                        let _ = tokio::signal::ctrl_c().await;
                        token.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                _ = terminate.recv() => tracing::info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received Ctrl-C");
        }
        token.cancel();
    });
}

/// Run in controller mode
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    telemetry::init_telemetry(args.log_format)?;
    args.validate()?;

    tracing::info!(namespace = %args.namespace, "compass manager starting");

    let director_config = DirectorConfig::load(&args.director_config).await?;
    let default_tenant = director_config.default_tenant.clone();
    let registrant: Arc<dyn Registrant> = Arc::new(DirectorClient::new(director_config)?);
    let configurator = Arc::new(RuntimeAgentConfigurator::new(
        Arc::clone(&registrant),
        default_tenant,
    ));

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.skip_crd_install {
        tracing::info!("skipping CRD installation");
    } else {
        ensure_crd_installed(&client).await?;
    }

    let ctx = Arc::new(
        Context::builder(client.clone(), registrant, configurator)
            .requeue_interval(args.requeue_interval())
            .build(),
    );

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let kymas: Api<Kyma> = Api::namespaced(client, &args.namespace);
    runner::run(kymas, ctx, args.max_concurrent_reconciles, shutdown).await?;

    tracing::info!("compass manager stopped");
    Ok(())
}

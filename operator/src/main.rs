use clap::{Args, Parser, Subcommand};
use kube::client::Client;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cluster;
mod config;
mod drain;
mod lease;
mod maintenance;
mod quorum;
mod taint;
mod util;
mod validation;

#[cfg(feature = "metrics")]
mod metrics;


use cluster::{ClusterClient, KubeCluster};
use config::Config;
use quorum::QuorumPolicy;

/// Top-level CLI configuration for the binary. Any command line
/// flags should go in here.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log in JSON instead of plain text.
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    /// Prometheus metrics server scrape port. Disabled by default.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT", global = true)]
    metrics_port: Option<u16>,
}

/// List of subcommands for the binary. Clap will convert the
/// name of each enum variant to kebab-case for the CLI.
/// e.g. `ManageMaintenances` becomes `manage-maintenances`.
#[derive(Subcommand)]
enum Command {
    /// Runs the NodeMaintenance controller.
    ManageMaintenances(ControllerArgs),

    /// Checks whether an existing NodeMaintenance would pass admission.
    ValidateMaintenance {
        /// Name of the NodeMaintenance resource.
        name: String,

        /// Node the resource targeted before an update. Runs the update
        /// checks instead of the creation checks.
        #[arg(long)]
        previous_node_name: Option<String>,
    },
}

#[derive(Args)]
struct ControllerArgs {
    /// Validity written into every node lease.
    #[arg(long, env = "LEASE_DURATION", default_value = "1h", value_parser = parse_duration::parse)]
    lease_duration: Duration,

    /// Time budget of a single drain attempt.
    #[arg(long, env = "DRAIN_TIMEOUT", default_value = "30s", value_parser = parse_duration::parse)]
    drain_timeout: Duration,

    /// Requeue interval after a failed drain.
    #[arg(long, env = "DRAIN_ERROR_REQUEUE", default_value = "5s", value_parser = parse_duration::parse)]
    drain_error_requeue: Duration,

    /// Namespace of the node leases. Defaults to the namespace the
    /// operator runs in.
    #[arg(long, env = "LEASE_NAMESPACE")]
    lease_namespace: Option<String>,

    /// Holder identity written into node leases.
    #[arg(long, env = "LEASE_HOLDER_IDENTITY", default_value = util::DEFAULT_HOLDER_IDENTITY)]
    holder_identity: String,

    /// Refuse to drain control-plane nodes unless the etcd quorum guard
    /// exists and allows a disruption.
    #[arg(long, env = "REQUIRE_QUORUM_GUARD")]
    require_quorum_guard: bool,
}

impl From<ControllerArgs> for Config {
    fn from(args: ControllerArgs) -> Self {
        Config {
            lease_duration: args.lease_duration,
            drain_timeout: args.drain_timeout,
            drain_error_requeue: args.drain_error_requeue,
            lease_namespace: args.lease_namespace.unwrap_or_else(config::own_namespace),
            holder_identity: args.holder_identity,
            quorum_policy: if args.require_quorum_guard {
                QuorumPolicy::Strict
            } else {
                QuorumPolicy::Lenient
            },
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Looks up a NodeMaintenance and runs the admission checks against it.
async fn validate(
    client: Client,
    name: &str,
    previous_node_name: Option<&str>,
) -> Result<(), util::Error> {
    let cluster = KubeCluster::new(client);
    let instance = cluster.get_maintenance(name).await?;
    match validation::validate(&cluster, &instance, previous_node_name).await {
        Ok(()) => {
            info!(%name, "NodeMaintenance is valid");
            Ok(())
        }
        Err(e) => Err(util::Error::UserInputError(e.to_string())),
    }
}

/// Secondary entrypoint that runs the appropriate subcommand.
async fn run(client: Client, cli: Cli) {
    #[cfg(feature = "metrics")]
    if let Some(metrics_port) = cli.metrics_port {
        tokio::spawn(metrics::run_server(metrics_port));
    }

    match cli.command {
        Command::ManageMaintenances(args) => {
            maintenance::run(client, args.into()).await.unwrap();
            panic!("exited unexpectedly");
        }
        Command::ValidateMaintenance {
            name,
            previous_node_name,
        } => {
            if let Err(e) = validate(client, &name, previous_node_name.as_deref()).await {
                error!(%name, error = %e, "NodeMaintenance is invalid");
                std::process::exit(1);
            }
        }
    }
}

/// Main entrypoint that sets up the environment before running the secondary entrypoint `run`.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Set the panic hook to exit the process with a non-zero exit code
    // when a panic occurs on any thread. This is desired behavior when
    // running in a container, as the metrics server or controller may
    // panic and we always want to restart the container in that case.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Create a kubernetes client using the default configuration.
    // In-cluster, the kubeconfig will be set by the service account.
    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    // Run the secondary entrypoint.
    run(client, cli).await;
}

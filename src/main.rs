use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use documentdb_operator::controller::identity::{
    DEFAULT_IDENTITY_CONFIG_MAP, DEFAULT_IDENTITY_NAMESPACE,
};
use documentdb_operator::{controller, crd::DocumentDB, Error};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
    /// Show the resolved member identity and managed DocumentDBs
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct IdentityArgs {
    /// Fleet member name of this cluster; overrides the identity ConfigMap
    #[arg(long, env = "MEMBER_NAME")]
    member_name: Option<String>,

    /// Namespace of the identity ConfigMap
    #[arg(long, env = "IDENTITY_NAMESPACE", default_value = DEFAULT_IDENTITY_NAMESPACE)]
    identity_namespace: String,

    /// Name of the ConfigMap holding this cluster's member name
    #[arg(long, env = "IDENTITY_CONFIG_MAP", default_value = DEFAULT_IDENTITY_CONFIG_MAP)]
    identity_config_map: String,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    #[command(flatten)]
    identity: IdentityArgs,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Run in dry-run mode (calculate changes without applying them)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to list DocumentDBs in
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(flatten)]
    identity: IdentityArgs,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("DocumentDB Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn resolve_identity(client: &kube::Client, args: &IdentityArgs) -> Result<Option<String>, Error> {
    controller::resolve_local_identity(
        client,
        args.member_name.as_deref(),
        &args.identity_namespace,
        &args.identity_config_map,
    )
    .await
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let identity = resolve_identity(&client, &args.identity).await?;
    println!(
        "Member identity: {}",
        identity.as_deref().unwrap_or("<unset>")
    );

    let api: kube::Api<DocumentDB> = kube::Api::namespaced(client, &args.namespace);
    let documents = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed DocumentDBs: {}", documents.items.len());
    for doc in &documents.items {
        match controller::Topology::resolve(doc, identity.as_deref()) {
            Ok(topology) => println!(
                "  {}: role={} primary={} engine={}",
                topology.resource_name,
                topology.role,
                topology.primary,
                topology.engine_cluster_name()
            ),
            Err(e) => println!("  {}: {}", kube::ResourceExt::name_any(doc), e),
        }
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting DocumentDB Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let identity = resolve_identity(&client, &args.identity).await?;

    let mut state = controller::ControllerState::new(client, identity)?;
    state.watch_namespace = args.namespace;
    state.dry_run = args.dry_run;
    if state.dry_run {
        info!("Dry-run mode: engine clusters will not be written");
    }

    controller::run_controller(Arc::new(state)).await
}

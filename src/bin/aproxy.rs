use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use artifact_proxy::config::ConfigLoader;
use artifact_proxy::coordinator::FetchCoordinator;
use artifact_proxy::domain::ArtifactRef;
use artifact_proxy::error::ProxyError;
use artifact_proxy::output::JsonOutput;
use artifact_proxy::registry::ConnectorSummary;
use artifact_proxy::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "aproxy")]
#[command(about = "Fetch artifacts into a managed repository through its remote connectors")]
#[command(version, author)]
struct Cli {
    /// Path to the proxy configuration (defaults to ./proxy.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch an artifact by coordinates (group:artifact[:ext[:classifier]]:version)")]
    FetchArtifact { repository: String, coordinates: String },
    #[command(about = "Fetch a resource by repository path")]
    FetchResource { repository: String, path: String },
    #[command(about = "Refresh a metadata file from every remote")]
    FetchMetadata { repository: String, path: String },
    #[command(about = "List the connectors of a managed repository")]
    Connectors { repository: String },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<ProxyError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ProxyError) -> u8 {
    match error {
        ProxyError::NotFound(_) | ProxyError::MissingConfig => 2,
        ProxyError::UnknownRepository(_) => 2,
        ProxyError::Transfer { .. } | ProxyError::AggregateDownload { .. } => 3,
        ProxyError::Placement { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let coordinator = FetchCoordinator::new(&config, Arc::new(HttpTransport::new()));

    match cli.command {
        Commands::FetchArtifact {
            repository,
            coordinates,
        } => {
            let artifact: ArtifactRef = coordinates.parse()?;
            let asset = coordinator.fetch_artifact(&repository, &artifact)?;
            JsonOutput::print_asset(Some(&asset)).into_diagnostic()
        }
        Commands::FetchResource { repository, path } => {
            let asset = coordinator.fetch_resource(&repository, &path)?;
            if asset.is_none() {
                tracing::info!(repository = %repository, path = %path, "resource not available");
            }
            JsonOutput::print_asset(asset.as_ref()).into_diagnostic()
        }
        Commands::FetchMetadata { repository, path } => {
            let result = coordinator.fetch_metadata(&repository, &path)?;
            JsonOutput::print_fetch(&result).into_diagnostic()
        }
        Commands::Connectors { repository } => {
            let summaries: Vec<ConnectorSummary> = coordinator
                .connectors(&repository)
                .iter()
                .map(|connector| connector.summary())
                .collect();
            JsonOutput::print_connectors(&summaries).into_diagnostic()
        }
    }
}

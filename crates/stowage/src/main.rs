use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stowage_cluster::{ApiClient, PollingInformer};
use stowage_core::{ClusterView, EventFeed};
use stowage_scheduler::{Scheduler, SchedulerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stowage", about = "Workspace pod scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler against a Kubernetes API server
    Run {
        /// Scheduler configuration file (YAML or JSON); defaults apply when omitted
        #[arg(long, env = "STOWAGE_CONFIG")]
        config: Option<PathBuf>,
        /// Base URL of the Kubernetes API server
        #[arg(long, env = "STOWAGE_API_URL", default_value = "http://127.0.0.1:8001")]
        api_url: String,
        /// File holding a bearer token, e.g. a service account token
        #[arg(long, env = "STOWAGE_TOKEN_FILE")]
        token_file: Option<PathBuf>,
        /// Milliseconds between two cluster listings
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
        /// Log as JSON lines
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print the effective configuration
    CheckConfig {
        /// Scheduler configuration file (YAML or JSON)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            api_url,
            token_file,
            poll_interval_ms,
            log_json,
        } => {
            init_tracing(log_json);
            run(config.as_deref(), &api_url, token_file.as_deref(), poll_interval_ms).await
        }
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> miette::Result<SchedulerConfig> {
    match path {
        Some(path) => SchedulerConfig::from_file(path)
            .map_err(|e| miette::miette!("Invalid configuration: {}", e)),
        None => Ok(SchedulerConfig::default()),
    }
}

fn check_config(path: &Path) -> miette::Result<()> {
    let config = load_config(Some(path))?;
    let yaml = config
        .to_yaml()
        .map_err(|e| miette::miette!("Failed to render configuration: {}", e))?;
    print!("{}", yaml);
    Ok(())
}

/// Run the scheduler until ctrl-c
async fn run(
    config_path: Option<&Path>,
    api_url: &str,
    token_file: Option<&Path>,
    poll_interval_ms: u64,
) -> miette::Result<()> {
    let config = load_config(config_path)?;
    info!(
        "Starting stowage scheduler '{}' for namespace '{}' against {}",
        config.scheduler_name, config.namespace, api_url
    );

    let mut client = ApiClient::new(api_url);
    if let Some(path) = token_file {
        client = client
            .with_token_file(path)
            .map_err(|e| miette::miette!("Failed to set up API client: {}", e))?;
    }
    let cluster: Arc<dyn ClusterView> = Arc::new(client);
    let feed: Arc<dyn EventFeed> = Arc::new(PollingInformer::new(
        cluster.clone(),
        Duration::from_millis(poll_interval_ms.max(1)),
    ));

    let scheduler = Arc::new(
        Scheduler::new(config, cluster)
            .map_err(|e| miette::miette!("Failed to create scheduler: {}", e))?,
    );

    let token = CancellationToken::new();
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run(feed, token).await {
                error!("Scheduler error: {}", e);
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, scheduler.wait_for_shutdown())
        .await
        .is_err()
    {
        error!("Scheduler did not stop within {:?}", shutdown_timeout);
    }
    let _ = scheduler_handle.await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "stowage",
            "run",
            "--config",
            "/etc/stowage/config.yaml",
            "--api-url",
            "https://10.0.0.1:6443",
            "--poll-interval-ms",
            "250",
            "--log-json",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                config,
                api_url,
                token_file,
                poll_interval_ms,
                log_json,
            } => {
                assert_eq!(config, Some(PathBuf::from("/etc/stowage/config.yaml")));
                assert_eq!(api_url, "https://10.0.0.1:6443");
                assert!(token_file.is_none());
                assert_eq!(poll_interval_ms, 250);
                assert!(log_json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_check_config_requires_a_file() {
        assert!(Cli::try_parse_from(["stowage", "check-config"]).is_err());
    }

    #[test]
    fn test_load_config() {
        assert_eq!(load_config(None).unwrap(), SchedulerConfig::default());

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "schedulerName: ws-scheduler\nstrategyName: EvenLoad").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.scheduler_name, "ws-scheduler");

        let mut invalid = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(invalid, "schedulerName: \"\"").unwrap();
        assert!(load_config(Some(invalid.path())).is_err());
    }
}

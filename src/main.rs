use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use faceid::common::{Config, DevMode};
use faceid::core::OnnxEmbeddingProvider;
use faceid::service::{router, AppState, Reconciler};
use faceid::storage::Store;

#[derive(Parser)]
#[command(name = "faceid")]
#[command(about = "Face enrollment and recognition service")]
struct Cli {
    /// Enable development mode (keeps data under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to load instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP and WebSocket service
    Serve,
    /// Purge cancelled registrations once and exit
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.dev);

    let dev_mode = DevMode::new(cli.dev)?;
    let config_path = cli.config.clone().unwrap_or_else(|| dev_mode.config_file());
    let config = Config::load_from_path(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let db_path = match &config.database.path {
        Some(path) => path.clone(),
        None => dev_mode.database_path()?,
    };
    let store = Store::open(&db_path, &config.database)
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let outcome = match cli.command {
        Commands::Serve => serve(config, store.clone()).await,
        Commands::Sweep => Reconciler::new(&store)
            .run_once()
            .await
            .map(|report| {
                println!(
                    "Swept {} cancelled registrations ({} failed), removed {} people and {} orphaned embeddings.",
                    report.marks_processed,
                    report.marks_failed,
                    report.people_removed,
                    report.orphans_removed
                );
            })
            .map_err(Into::into),
    };

    store.close().await;
    outcome
}

async fn serve(config: Config, store: Store) -> Result<()> {
    let provider = Arc::new(OnnxEmbeddingProvider::new(&config).context("loading face models")?);
    tracing::info!(
        detector = %config.models.detector_path.display(),
        recognizer = %config.models.recognizer_path.display(),
        "face models loaded"
    );

    let sweeper = Reconciler::new(&store)
        .spawn_periodic(Duration::from_secs(config.sweep.interval_secs));

    let bind = config.server.bind.clone();
    let state = AppState::new(config, store, provider.clone(), provider)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    tracing::info!(addr = %bind, "faceid listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    };
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error");

    if let Some(task) = sweeper {
        task.abort();
    }
    served
}

fn setup_logging(dev_mode: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if dev_mode { "debug" } else { "info" })
    });

    if dev_mode {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

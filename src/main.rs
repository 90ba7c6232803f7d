use anyhow::{Context, Result};
use clap::Parser;
use hashtag_counter::config::{load_env, Cli, Command, StreamConfig};
use hashtag_counter::ingester::{launch, IngestError};
use hashtag_counter::redis::RedisStore;
use hashtag_counter::server::{shutdown_signal, Server};
use hashtag_counter::source::HttpPostSource;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status when another ingester already holds the lock.
const EXIT_DUPLICATE_INSTANCE: u8 = 3;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables from --conf FILE, or .env
    let conf = load_env(std::env::args_os())?;

    let cli = Cli::parse();
    let log_level = if cli.debug { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("hashtag_counter={},tower_http=debug", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = conf {
        tracing::info!("Loaded configuration from {}", path.display());
    }

    match cli.command {
        Command::Stream(config) => run_stream(config).await,
        Command::Api(config) => {
            config.validate_config()?;
            tracing::info!(
                "Configuration: bind_addr={}, redis_url={}, filter={}",
                config.bind_addr,
                config.redis_url,
                config.filter
            );

            let server = Server::new(config)
                .await
                .context("Failed to create server")?;
            server.run().await.context("Server error")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_stream(config: StreamConfig) -> Result<ExitCode> {
    config.validate_config()?;
    let lock_name = config.lock_name();
    tracing::info!(
        "Configuration: filter={}, redis_url={}, stream_url={}, lock={}",
        config.filter,
        config.redis_url,
        config.stream_url,
        lock_name
    );

    let store = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );
    let source = Arc::new(
        HttpPostSource::new(&config.stream_url, &config.stream_token, config.stall_timeout)
            .context("Failed to build stream client")?,
    );

    let outcome = launch(
        &config.filter,
        &lock_name,
        store.clone(),
        store,
        source,
        config.ingest_settings(),
        shutdown_signal(),
    )
    .await;

    match outcome {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(IngestError::DuplicateInstance(lock)) => {
            tracing::error!(lock = %lock, "another ingester is running, exiting");
            Ok(ExitCode::from(EXIT_DUPLICATE_INSTANCE))
        }
        Err(err) => {
            tracing::error!(error = %err, "ingester stopped");
            Ok(ExitCode::FAILURE)
        }
    }
}

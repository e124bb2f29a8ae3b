//! Refresher - repairs missing Plex metadata
//!
//! One invocation performs one run (or a maintenance command) and exits. Scheduling is
//! left to the host (cron, a container restart policy, a systemd timer).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;

use refresher::cli::{Cli, Command};
use refresher::config::{Config, NotificationConfig};
use refresher::db::Database;
use refresher::jobs::RunCoordinator;
use refresher::media::{MediaServer, PlexClient, PlexConfig};
use refresher::services::health::read_health;
use refresher::services::logging::DEFAULT_SINK_CAPACITY;
use refresher::services::{
    DiscordWebhook, FileSinkWriter, LogSinks, NotificationService, Notifier, Reconciler,
    ResourceSampler, Resolver, TelegramBot, TmdbClient, init_tracing,
};

/// Exit code for unusable configuration
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                eprintln!("Could not load {}: {}", path.display(), e);
                return ExitCode::from(EXIT_CONFIG);
            }
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    // Configuration errors are fatal before anything else starts
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(cli.command(), config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Fatal error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: Config) -> Result<ExitCode> {
    let writer = FileSinkWriter::new(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;
    let sinks = Arc::new(LogSinks::new(Arc::new(writer), DEFAULT_SINK_CAPACITY));
    init_tracing(sinks.clone()).context("Failed to initialize logging")?;

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = Database::connect(&config.database_path, config.engine.pool_size)
        .await
        .context("Failed to open state database")?;

    let result = match command {
        Command::Status { dead } => status(&config, &db, dead).await,
        Command::Reset { item_id } => reset(&db, &item_id).await,
        Command::Run => refresh(&config, &db, sinks.clone()).await,
    };

    sinks.flush();
    db.close().await;
    result
}

async fn status(config: &Config, db: &Database, dead_limit: i64) -> Result<ExitCode> {
    let repo = db.item_states();
    let counts = repo.counts().await?;
    let scanned = db.scan_ledger().count().await?;

    println!("Items examined so far: {scanned}");
    println!(
        "Failing: {} | Recovered: {} | Dead: {}",
        counts.failing, counts.recovered, counts.dead
    );

    let dead = repo.list_dead(dead_limit).await?;
    if !dead.is_empty() {
        println!("\nDead items (most recent first):");
        for state in dead {
            println!(
                "  {} (library {}) fails={} last_error={} since {}",
                state.item_id,
                state.library_id,
                state.failure_count,
                state
                    .last_error
                    .map_or_else(|| "-".to_string(), |e| e.to_string()),
                state.first_failed_at.format("%Y-%m-%d")
            );
        }
    }

    match read_health(&config.health_file) {
        Some(record) => println!(
            "\nLast run: {} at {}",
            if record.ok { "OK" } else { "FAILED" },
            record.at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("\nLast run: never"),
    }

    if let Some(schedule) = config.schedule {
        println!(
            "Next scheduled run: {}",
            schedule.next_after(Local::now().naive_local())
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn reset(db: &Database, item_id: &str) -> Result<ExitCode> {
    if db.item_states().reset(item_id).await? {
        tracing::info!(item = %item_id, "Item state reset");
        println!("Reset {item_id}");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("No state recorded for {item_id}");
        Ok(ExitCode::FAILURE)
    }
}

fn notification_service(config: &NotificationConfig) -> Result<NotificationService> {
    let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();
    if let Some(url) = &config.discord_webhook {
        channels.push(Arc::new(DiscordWebhook::new(url.clone())?));
    }
    if let Some(telegram) = &config.telegram {
        channels.push(Arc::new(TelegramBot::new(
            telegram.bot_token.clone(),
            telegram.chat_id.clone(),
        )?));
    }
    Ok(NotificationService::new(channels))
}

async fn refresh(config: &Config, db: &Database, sinks: Arc<LogSinks>) -> Result<ExitCode> {
    let engine = &config.engine;

    let plex: Arc<dyn MediaServer> = Arc::new(
        PlexClient::new(PlexConfig {
            base_url: config.plex_url.clone(),
            token: config.plex_token.clone(),
            timeout: config.plex_timeout,
        })
        .context("Failed to create Plex client")?,
    );

    let tmdb = TmdbClient::new(config.tmdb_api_key.clone()).context("Failed to create TMDB client")?;
    if let Err(e) = tmdb.check_connection().await {
        tracing::warn!(error = %e, "TMDB connection check failed, lookups may be deferred");
    }

    let resolver = Arc::new(Resolver::new(
        Arc::new(tmdb),
        sinks.clone(),
        engine.resolver_threshold,
    ));
    let reconciler = Arc::new(
        Reconciler::new(
            plex,
            resolver,
            db.clone(),
            engine.escalation_policy(),
            sinks.clone(),
        )
        .with_refresh_settle(engine.refresh_settle),
    );

    if let Some(schedule) = config.schedule {
        tracing::info!(
            next_run = %schedule.next_after(Local::now().naive_local()),
            "Configured schedule"
        );
    }

    let sampler = Arc::new(ResourceSampler::new(engine.sample_window, sinks));
    let coordinator = RunCoordinator::new(
        reconciler,
        engine.clone(),
        notification_service(&config.notifications)?,
    )
    .with_sampler(sampler)
    .with_health_file(config.health_file.clone());

    match coordinator.run().await {
        Ok(report) => {
            println!("{}", report.summary_line());
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            eprintln!("{failure}");
            Ok(ExitCode::FAILURE)
        }
    }
}

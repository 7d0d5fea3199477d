//! # Mirrorsync Main Entry Point
//!
//! Loads configuration, prepares the database, and starts the admin API
//! server together with the cron dispatcher.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use mirrorsync::{
    config::ConfigLoader,
    db, logging,
    scheduler::CronDispatcher,
    server::{AppState, run_server},
    store::SqlKvStore,
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "Warehouse mirror sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load()?;
    logging::init_subscriber(&config);

    let db = db::init_pool(&config).await?;

    if let Some(command) = cli.command {
        match command {
            Commands::Migrate { action } => {
                handle_migrate_command(&db, action).await?;
                return Ok(());
            }
        }
    }

    // Migrations apply automatically for local and test profiles.
    if config.profile == "local" || config.profile == "test" {
        Migrator::up(&db, None).await?;
        tracing::info!(profile = %config.profile, "Migrations applied");
    }

    if let Ok(redacted) = config.redacted_json() {
        tracing::info!(config = %redacted, "Loaded configuration");
    }

    let config = Arc::new(config);
    let kv = Arc::new(SqlKvStore::new(db.clone()));
    let state = AppState::new(config.clone(), db, kv.clone());

    let shutdown = CancellationToken::new();
    if config.scheduler.enabled {
        let dispatcher = CronDispatcher::new(config.clone(), state.engine.clone(), kv);
        tokio::spawn(dispatcher.run(shutdown.clone()));
    }

    let result = run_server(state).await;
    shutdown.cancel();
    result
}

async fn handle_migrate_command(
    db: &DatabaseConnection,
    action: MigrateAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let summary = match action {
        MigrateAction::Up => {
            Migrator::up(db, None).await?;
            "schema is up to date".to_string()
        }
        MigrateAction::Down => {
            Migrator::down(db, Some(1)).await?;
            "reverted one migration".to_string()
        }
        MigrateAction::Status => {
            let applied = Migrator::get_applied_migrations(db).await?.len();
            let pending = Migrator::get_pending_migrations(db).await?.len();
            format!("{applied} applied, {pending} pending")
        }
    };

    tracing::info!(%summary, "Migration command finished");
    println!("migrate: {summary}");
    Ok(())
}

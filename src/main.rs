use anyhow::Result;
use chrono::Utc;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::signal;

use funnelgram::broadcast::BroadcastDispatcher;
use funnelgram::cli::{Cli, Commands};
use funnelgram::core::{config, GlobalRateLimiter};
use funnelgram::delivery::telegram::TelegramDelivery;
use funnelgram::funnel::FunnelEngine;
use funnelgram::storage::db;
use funnelgram::storage::{create_pool, get_connection};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    pretty_env_logger::init_timed();

    // Load environment variables from .env if present
    let _ = dotenv();

    match cli.command {
        Some(Commands::Run) | None => run_engines().await,
        Some(Commands::InitDb) => {
            let _ = create_pool(&config::DATABASE_PATH)?;
            log::info!("Database ready at {}", *config::DATABASE_PATH);
            Ok(())
        }
        Some(Commands::AddProject { name, token, admin }) => {
            let pool = create_pool(&config::DATABASE_PATH)?;
            let conn = get_connection(&pool)?;
            let id = db::create_project(&conn, &name, &token, admin)?;
            println!("{id}");
            Ok(())
        }
        Some(Commands::Enroll { project, chat }) => {
            let pool = create_pool(&config::DATABASE_PATH)?;
            let conn = get_connection(&pool)?;
            let id = db::enroll_subscriber(&conn, project, chat, None, Utc::now().timestamp())?;
            log::info!("Subscriber {id} enrolled in project {project}");
            Ok(())
        }
    }
}

async fn run_engines() -> Result<()> {
    let pool = Arc::new(create_pool(&config::DATABASE_PATH)?);
    log::info!("Database ready at {}", *config::DATABASE_PATH);

    let limiter = GlobalRateLimiter::new(
        config::rate_limit::MESSAGES_PER_SECOND,
        config::rate_limit::BURST_CAPACITY,
    );
    let adapter = Arc::new(TelegramDelivery::new(Arc::clone(&pool), limiter));

    let engine = FunnelEngine::new(Arc::clone(&pool), adapter.clone());
    let engine_task = engine.start();

    let dispatcher = BroadcastDispatcher::new(Arc::clone(&pool), adapter);
    let dispatcher_task = dispatcher.start();

    signal::ctrl_c().await?;
    log::info!("Shutdown signal received, stopping engines");
    engine_task.abort();
    dispatcher_task.abort();
    Ok(())
}

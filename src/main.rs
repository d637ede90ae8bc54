pub mod models {
    pub mod message;
}

pub mod bus;
pub mod config;
pub mod env_file;
pub mod db {
    pub mod models;
}
pub mod pipeline;
pub mod queue;
pub mod router;
pub mod schema;
pub mod store;
pub mod utils;
pub mod services {
    pub mod archiver;
    pub mod batch;
    pub mod flusher;
    pub mod registrar;
}

use crate::config::Config;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::store::pg::PgConnector;
use crate::utils::StopSignal;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info, warn};
use std::thread;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (broker={}:{}, batch_size={}, flush_interval={}ms, queue_maxsize={}, db_reconnect={}s, history_bucket={}s)",
        cfg.mqtt.host,
        cfg.mqtt.port,
        cfg.batch_size,
        cfg.flush_interval.as_millis(),
        cfg.queue_capacity,
        cfg.reconnect_backoff.as_secs(),
        cfg.history_bucket_secs
    );
    for sub in &cfg.mqtt.subscriptions {
        info!("Topic {:?}: {} (qos={:?})", sub.class, sub.topic, sub.qos);
    }

    // 2) Optionally bring the schema up to date
    if cfg.migrate {
        let mut conn =
            PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
        apply_database_migrations(&mut conn)?;
    } else {
        info!("Skipping database migrations (DB_MIGRATE={})", cfg.migrate);
    }

    // 3) Start queues and workers; each worker connects on its own
    let stop = StopSignal::new();
    let mut pipeline = Pipeline::start(
        PipelineSettings::from(&cfg),
        PgConnector::new(cfg.database_url.clone()),
        stop.clone(),
    )?;

    // 4) Stop on SIGINT/SIGTERM
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            stop.stop();
        })
        .map_err(|e| format!("installing signal handler failed: {}", e))?;
    }

    // 5) MQTT consumer, supervised like the workers
    let bus = {
        let router = pipeline.router.clone();
        let mqtt = cfg.mqtt.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("mqtt".to_string())
            .spawn(move || bus::run(&mqtt, &router, &stop))
            .map_err(|e| format!("spawning MQTT consumer failed: {}", e))?
    };
    pipeline.watch("mqtt", bus);

    // 6) Wait for a stop request or a dead worker
    let outcome = pipeline.supervise();

    for (queue, dropped) in pipeline.shutdown() {
        if dropped > 0 {
            warn!("Queue {} dropped {} message(s) on overload", queue, dropped);
        }
    }

    outcome
}

fn main() {
    let loaded_env = match env_file::load_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "ess-ingestor {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

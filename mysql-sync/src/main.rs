//! CLI entry point: `mysql-sync <config.json>`.
//!
//! Exit codes: `-1` (usage), `-2` (startup error), `-128` (main loop
//! returned, which should be unreachable).

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mysql_sync::bus::BusGateway;
use mysql_sync::db::{DatabaseGateway, MysqlConnectionFactory};
use mysql_sync::hub::{ApplicationEvent, EventHub, EventKind, Listener};
use mysql_sync::transform::TransformStage;
use mysql_sync_config::Config;

/// `mysql-sync <config.json>`: exactly one positional argument, the
/// path to the JSON configuration file.
#[derive(Parser, Debug)]
#[command(name = "mysql-sync")]
struct Cli {
    config: PathBuf,
}

fn init_logging(level: mysql_sync_config::LoggingLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let json = std::env::var("MYSQL_SYNC_LOG_JSON").is_ok();

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(atty_is_terminal());
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn atty_is_terminal() -> bool {
    use std::io::IsTerminal;
    std::io::stderr().is_terminal()
}

/// Logs the three database lifecycle events the Database Gateway emits
/// on its own, without participating in the apply pipeline.
struct LifecycleLogger;

#[async_trait]
impl Listener for LifecycleLogger {
    async fn handle(&self, event: &ApplicationEvent) -> Result<(), mysql_sync::hub::Error> {
        match event {
            ApplicationEvent::DatabaseConnect => info!("database connected"),
            ApplicationEvent::DatabaseDisconnect => info!("database disconnected"),
            ApplicationEvent::DatabaseError(err) => error!("database error: {}", err.0),
            _ => {}
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(255); // usage error
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(254); // startup error
        }
    };

    match runtime.block_on(run(cli.config)) {
        Ok(()) => {
            // The tick loop never returns under normal operation.
            error!("main loop returned unexpectedly");
            ExitCode::from(128) // main loop returned unexpectedly
        }
        Err(err) => {
            eprintln!("startup error: {err}");
            ExitCode::from(254) // startup error
        }
    }
}

async fn run(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&config_path)?;
    init_logging(config.logging_level);

    info!(client = %config.client_name, "starting mysql-sync");

    let hub = EventHub::new();
    let bidirectional = config.bidirectional_tables();
    let receive_tables: HashSet<String> = config.receive_tables.iter().cloned().collect();

    let database_queue_path = config.queue_directory.join("database.json");
    let db_gateway = DatabaseGateway::new(
        hub.clone(),
        Box::new(MysqlConnectionFactory {
            config: config.mysql_config.clone(),
        }),
        config.sync_tables.clone(),
        bidirectional,
        database_queue_path,
    )
    .await?;

    let bus_gateway = BusGateway::connect(
        &config.mqtt_config,
        config.client_name.clone(),
        config.check_interval as i64,
        receive_tables,
        &config.queue_directory,
        hub.clone(),
    )
    .await?;

    let transform_stage = TransformStage::new(
        hub.clone(),
        config.client_name.clone(),
        config.remote_clients.clone(),
        config.transformer_directory.clone(),
    );

    hub.on(EventKind::LocalSaveChange, db_gateway.clone());
    hub.on(EventKind::RemoteStatusChange, db_gateway.clone());
    hub.on(EventKind::DatabaseConnect, Arc::new(LifecycleLogger));
    hub.on(EventKind::DatabaseDisconnect, Arc::new(LifecycleLogger));
    hub.on(EventKind::DatabaseError, Arc::new(LifecycleLogger));

    hub.on(EventKind::LocalChange, transform_stage.clone());
    hub.on(EventKind::RemoteChange, transform_stage.clone());

    hub.on(EventKind::RemoteSendChange, bus_gateway.clone());
    hub.on(EventKind::LocalSaveSuccessful, bus_gateway.clone());
    hub.on(EventKind::LocalSaveFailed, bus_gateway.clone());

    // Exits the process directly rather than breaking the tick loop
    // below, so the loop's own "should be unreachable" contract holds.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            std::process::exit(0);
        }
    });

    let check_interval = std::time::Duration::from_millis(config.check_interval);

    loop {
        tokio::time::sleep(check_interval).await;
        if let Err(err) = db_gateway.tick().await {
            error!(%err, "database gateway tick failed");
        }
        if let Err(err) = bus_gateway.tick().await {
            error!(%err, "bus gateway tick failed");
        }
    }
}

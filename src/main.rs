use std::sync::Arc;

use clap::Parser;
use pg_relay::{
    Engine, HandlerContext, MemoryEventStore, Result, SlotConfig, StoreMessageHandler,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-relay")]
#[command(about = "PostgreSQL logical-replication CDC engine", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match SlotConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("\nRequired environment variables:");
            eprintln!("  RELAY_PG_DATABASE  - PostgreSQL database name");
            eprintln!("  RELAY_PG_USER      - replication role");
            eprintln!("  RELAY_PG_PASSWORD  - replication role password");
            eprintln!("\nOptional: RELAY_PG_HOST, RELAY_PG_PORT, RELAY_PUBLICATION,");
            eprintln!("          RELAY_SLOT_NAME, RELAY_SLOT_ID, RELAY_PG_SSL_MODE");
            std::process::exit(1);
        }
    };

    info!(
        slot_id = %config.id,
        host = %config.connection.host,
        port = config.connection.port,
        database = %config.connection.database,
        publication = %config.publication,
        slot_name = %config.slot_name,
        "configuration loaded"
    );

    // Consumer and pipeline definitions come from an external control
    // plane through StoreMessageHandler::replace_context; the binary
    // starts with an empty context and an in-memory store.
    let store = Arc::new(MemoryEventStore::new());
    let handler = Arc::new(StoreMessageHandler::new(
        store,
        HandlerContext::new(config.id.clone()),
    ));

    let engine = Engine::new();
    let session = engine.session(config, handler);

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    match session.run().await {
        Ok(()) => {
            info!("pg-relay stopped");
            Ok(())
        }
        Err(e) => {
            error!("replication failed: {}", e);
            Err(e)
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

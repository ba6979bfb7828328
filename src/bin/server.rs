use std::{
    env,
    fs::{self, OpenOptions},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    extract::{MatchedPath, Request},
};
use axum_server::Handle;
use clap::Parser;
use rusqlite::Connection;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use expense_sync::{
    AggregatorClient, AggregatorConfig, AppState, CategoryMapper, CategoryRules, SyncConfig,
    build_router, graceful_shutdown, spawn_scheduler,
};

/// The sync server for expense_sync.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to the application SQLite database.
    #[arg(long)]
    db_path: String,

    /// The port to serve the API from.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// The base URL of the aggregator API.
    #[arg(long, default_value = "https://sandbox.plaid.com")]
    aggregator_url: String,

    /// How many transactions to request per page.
    #[arg(long, default_value_t = 100)]
    page_size: u32,

    /// How often every active bank connection is synced.
    #[arg(long, default_value_t = 24)]
    sync_interval_hours: u64,

    /// How long a single sync run may take.
    #[arg(long, default_value_t = 300)]
    sync_timeout_secs: u64,

    /// A JSON file with category rules that replace the built-in table.
    #[arg(long)]
    category_rules: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    setup_logging();

    let args = Args::parse();

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));

    let client_id = env::var("AGGREGATOR_CLIENT_ID")
        .expect("The environment variable 'AGGREGATOR_CLIENT_ID' must be set");
    let secret = env::var("AGGREGATOR_SECRET")
        .expect("The environment variable 'AGGREGATOR_SECRET' must be set");

    let category_rules = match &args.category_rules {
        Some(path) => {
            let json = fs::read_to_string(path).expect("Could not read the category rules file");
            CategoryRules::from_json(&json).expect("Could not parse the category rules file")
        }
        None => CategoryRules::default(),
    };

    let aggregator = AggregatorClient::new(AggregatorConfig {
        base_url: args.aggregator_url,
        client_id,
        secret,
        page_size: args.page_size,
        request_timeout: Duration::from_secs(30),
    })
    .expect("Could not create the aggregator client");

    let sync_config = SyncConfig {
        deadline: Duration::from_secs(args.sync_timeout_secs),
        ..SyncConfig::default()
    };

    let conn = Connection::open(&args.db_path).expect("Could not open the database");
    let app_state = AppState::new(
        conn,
        Arc::new(aggregator),
        CategoryMapper::new(category_rules),
        sync_config,
    )
    .expect("Could not initialize the database");

    let scheduler = spawn_scheduler(
        app_state.orchestrator.clone(),
        Duration::from_secs(args.sync_interval_hours * 60 * 60),
    );

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    let router = add_tracing_layer(build_router(app_state));

    tracing::info!("HTTP server listening on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .unwrap();

    scheduler.abort();
}

fn setup_logging() {
    let stdout_log = tracing_subscriber::fmt::layer().pretty();

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("Could not create log file");

    let debug_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(
            stdout_log
                .with_filter(filter::LevelFilter::INFO)
                .and_then(debug_log)
                .with_filter(filter::LevelFilter::DEBUG),
        )
        .init();
}

fn add_tracing_layer(router: Router) -> Router {
    let tracing_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            let method = req.method();
            let uri = req.uri();

            let matched_path = req
                .extensions()
                .get::<MatchedPath>()
                .map(|matched_path| matched_path.as_str());

            tracing::debug_span!("request", %method, %uri, matched_path)
        })
        // Errors are logged by the sync engine and the logging middleware.
        .on_failure(());

    router.layer(tracing_layer)
}

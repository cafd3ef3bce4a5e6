//! fedinbox binary entry point

use std::sync::Arc;
use std::time::Duration;

use fedinbox::federation::{
    ActivityDelivery, ActivityPubTransport, HttpRemoteClient, RssTransport, Transports,
    WebSubClient, WebSubTransport,
};
use fedinbox::service::{
    BackgroundTasks, RetentionPurger, Scheduler, Stores, SubscriptionService, TaskContext,
    run_task_queue,
};
use fedinbox::{AppState, config, data};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Connect and migrate the database
/// 4. Wire transports, services and background workers
/// 5. Start the scheduler and the task queue loop
/// 6. Serve health and WebSub callbacks until Ctrl-C
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDINBOX__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedinbox=info,tower_http=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedinbox=info,tower_http=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedinbox...");

    // 2. Initialize metrics
    fedinbox::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        base_url = %config.federation.base_url,
        database = %config.database.path.display(),
        "Configuration loaded"
    );

    // 4. Connect to the database; migrations run before anything else starts
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(data::Database::connect(&config.database.path).await?);
    tracing::info!("Database connected");
    let stores = Stores::from_database(db);

    // 5. Federation clients and transports
    let remote = Arc::new(HttpRemoteClient::new(&config.federation)?);
    let http_client = remote.http_client();
    let transports = Transports::new(
        Arc::new(ActivityPubTransport::new(
            remote.clone(),
            Arc::new(ActivityDelivery::new(http_client.clone())),
            stores.users.clone(),
        )),
        Arc::new(WebSubTransport::new(
            Arc::new(WebSubClient::new(http_client)),
            config.federation.clone(),
        )),
        Arc::new(RssTransport),
    );

    // 6. Background workers
    let (tasks, runner) = BackgroundTasks::channel();
    let workers = runner.start(
        TaskContext {
            users: stores.users.clone(),
            inbox: stores.inbox.clone(),
            transports: transports.clone(),
        },
        config.scheduler.background_workers,
    );

    let subscriptions = SubscriptionService::new(
        stores.clone(),
        remote,
        transports,
        tasks.clone(),
        &config.polling,
    );
    let purger = RetentionPurger::new(stores.inbox.clone(), tasks.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = if config.scheduler.enabled {
        let scheduler = Scheduler::new(subscriptions.clone(), purger, config.scheduler.clone());
        Some(tokio::spawn(scheduler.run(shutdown_rx.clone())))
    } else {
        tracing::info!("Scheduler disabled by configuration");
        None
    };

    let task_queue = tokio::spawn(run_task_queue(
        stores.queue.clone(),
        stores.inbox.clone(),
        tasks,
        Duration::from_secs(config.scheduler.task_queue_interval_seconds.max(1)),
        shutdown_rx,
    ));

    // 7. HTTP server
    let state = AppState {
        config: Arc::new(config.clone()),
        subscriptions,
    };
    let app = fedinbox::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Let the loops finish their current subscription/task
    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }
    }
    if let Err(e) = task_queue.await {
        tracing::error!(error = %e, "Task queue loop panicked");
    }
    drop(workers);

    tracing::info!("fedinbox stopped");
    Ok(())
}

/// Wait for Ctrl-C, then tell the background loops to stop
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested");
    let _ = shutdown.send(true);
}

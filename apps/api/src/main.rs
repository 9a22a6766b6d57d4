use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use notification_cell::{
    ExpoPushClient, InMemoryNotificationStore, InMemoryPushTokens, NotificationDispatcher,
    NotificationInbox, NotificationState, NotificationStore, PushTokenDirectory,
    RedisNotificationStore, RedisPushTokens,
};
use service_request_cell::{
    CompletionWatcher, EventBus, InMemoryRefundDesk, InMemoryRequestStore, LifecycleEngine,
    LifecycleState, RandomCodeGenerator, RedisRequestStore, RequestFeeds, RequestStore,
    VerificationSweeper,
};
use shared_config::AppConfig;
use shared_realtime::ChangeFeed;

struct Backends {
    requests: Arc<dyn RequestStore>,
    notifications: Arc<dyn NotificationStore>,
    tokens: Arc<dyn PushTokenDirectory>,
}

async fn backends(config: &AppConfig, feeds: RequestFeeds) -> anyhow::Result<Backends> {
    if config.uses_redis() {
        let pool = shared_database::connect(config).await?;
        info!("Using Redis-backed stores");
        return Ok(Backends {
            requests: Arc::new(RedisRequestStore::new(pool.clone(), feeds)),
            notifications: Arc::new(RedisNotificationStore::new(pool.clone())),
            tokens: Arc::new(RedisPushTokens::new(pool)),
        });
    }

    info!("Using in-memory stores");
    Ok(Backends {
        requests: Arc::new(InMemoryRequestStore::new(feeds)),
        notifications: Arc::new(InMemoryNotificationStore::new()),
        tokens: Arc::new(InMemoryPushTokens::new()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting care lifecycle API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());
    let settings = config.lifecycle.clone();

    let events = EventBus::new(settings.event_bus_capacity);
    let feeds = RequestFeeds::new(settings.feed_channel_capacity);
    let backends = backends(&config, feeds).await?;

    let engine = Arc::new(LifecycleEngine::new(
        backends.requests,
        settings.clone(),
        Arc::new(RandomCodeGenerator),
        events.clone(),
        Arc::new(InMemoryRefundDesk::new()),
    ));

    let inbox = Arc::new(NotificationInbox::new(
        backends.notifications,
        ChangeFeed::new(settings.feed_channel_capacity),
    ));

    // Background subscribers
    let watcher = CompletionWatcher::new(engine.clone()).spawn().await;
    let sweeper = VerificationSweeper::new(
        engine.clone(),
        Duration::from_secs(settings.verification_sweep_interval_secs),
    )
    .spawn();
    let dispatcher = NotificationDispatcher::new(
        inbox.clone(),
        backends.tokens.clone(),
        Arc::new(ExpoPushClient::new(&config)),
    )
    .spawn(&events);

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let lifecycle_state = LifecycleState::new(config.clone(), engine);
    let notification_state = NotificationState {
        config: config.clone(),
        inbox,
        tokens: backends.tokens,
    };

    // Build the application router
    let app = router::create_router(lifecycle_state, notification_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    for task in [watcher, sweeper, dispatcher] {
        task.stop().await;
    }
    info!("Server stopped");
    Ok(())
}

use porthole_relay::config::Config;
use porthole_relay::state::Broker;
use porthole_relay::{router, AppState};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() {
    // Default to INFO for our own crate when RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "porthole_relay=info,tower_http=warn");
    }
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    info!("Starting porthole relay on {}:{}", config.host, config.port);

    let broker = Broker::new();
    broker.clone().spawn_reaper();

    let app = router(AppState { broker })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Porthole relay listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

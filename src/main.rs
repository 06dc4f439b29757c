use std::sync::Arc;

use axum::{Router, extract::State, http::HeaderValue, routing::get};
use backchat::{
    AppResult, AppState,
    config::Config,
    gateway::{self, dispatch::Dispatcher, registry::ConnectionRegistry},
    identity::{DbTokenVerifier, IdentityVerifier},
    store::{self, SqliteMessageStore},
};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
        .unwrap();
    store::init_schema(&db_pool).await.unwrap();

    let registry = Arc::new(ConnectionRegistry::new());
    let message_store = Arc::new(SqliteMessageStore::new(db_pool.clone()));
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(DbTokenVerifier::new(db_pool.clone()));
    let dispatcher = Arc::new(Dispatcher::new(registry, message_store));

    let app_state = AppState {
        db_pool,
        verifier,
        dispatcher,
    };

    let cors = CorsLayer::new()
        .allow_origin(config.cors_origin.parse::<HeaderValue>().unwrap())
        .allow_credentials(true);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(gateway::router())
        .with_state(app_state)
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .unwrap();
    tracing::info!("gateway listening on port {}", config.port);
    axum::serve(listener, app).await.unwrap();
}

async fn healthz(State(db_pool): State<SqlitePool>) -> AppResult<&'static str> {
    sqlx::query("SELECT 1").execute(&db_pool).await?;
    Ok("ok")
}

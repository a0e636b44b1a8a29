use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod broker;
mod config;
mod credentials;
mod database;
mod engine;
mod error;
mod handlers;
mod mail;
mod models;
mod nodes;
mod outbox;
mod store;

use broker::Broker;
use credentials::{CredentialResolver, CryptoService};
use engine::{ExecutionEngine, HandlerRegistry};
use handlers::AppState;
use mail::ReplyMatcher;
use nodes::{EmailSendHandler, HttpRequestHandler};
use outbox::Sweeper;
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;
    database::migrate(&db_pool).await?;

    let store = Store::new(db_pool);
    let broker = Arc::new(Broker::connect(config.broker.clone()).await?);
    let resolver = Arc::new(CredentialResolver::new(
        store.clone(),
        CryptoService::from_env()?,
    ));

    let mut registry = HandlerRegistry::new();
    registry.register("http_request", Arc::new(HttpRequestHandler::new()?));
    registry.register(
        "email",
        Arc::new(EmailSendHandler::new(
            store.clone(),
            resolver.clone(),
            config.smtp.clone(),
        )),
    );
    let registry = Arc::new(registry);

    let sweeper = Sweeper::new(store.clone(), broker.clone(), config.sweeper.clone());
    tokio::spawn(sweeper.run());

    let matcher = ReplyMatcher::new(
        store.clone(),
        broker.clone(),
        resolver.clone(),
        config.matcher.clone(),
    );
    tokio::spawn(matcher.run());

    let engine = ExecutionEngine::new(store.clone(), broker.as_ref().clone(), registry);
    tokio::spawn(async move { engine.run().await });

    let app = handlers::router(AppState { store });

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("flowd listening on {}", config.server_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

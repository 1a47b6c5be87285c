use speda_ai::{LlmBackend, LlmProvider, OpenAiCompatibleBackend};
use speda_conversation::{
    ConfirmationLedger, ConversationStore, FactStore, InMemoryConversationStore,
    InMemoryFactStore, Recall, SessionController, TurnExecutor,
};
use speda_core::UserId;
use speda_server::app::{AppState, Owner, router};
use speda_server::config::ServerConfig;
use speda_server::db::{PgConversationStore, PgFactStore};
use speda_tools::{TaskList, default_registry};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let (store, facts): (Arc<dyn ConversationStore>, Arc<dyn FactStore>) = match &config.database_url {
        Some(url) => {
            let db_pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .expect("failed to connect to database");

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&db_pool)
                .await
                .expect("failed to run migrations");

            let store: Arc<dyn ConversationStore> =
                Arc::new(PgConversationStore::new(db_pool.clone()));
            let facts: Arc<dyn FactStore> = Arc::new(PgFactStore::new(db_pool));
            (store, facts)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, conversations are kept in memory");
            let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
            let facts: Arc<dyn FactStore> = Arc::new(InMemoryFactStore::new());
            (store, facts)
        }
    };

    assert!(
        config.llm.provider != LlmProvider::Scripted,
        "the scripted LLM provider is for tests only"
    );
    let backend: Arc<dyn LlmBackend> = Arc::new(
        OpenAiCompatibleBackend::new(config.llm.backend_config())
            .expect("invalid LLM configuration"),
    );
    tracing::info!(
        provider = config.llm.provider.as_str(),
        model = %config.llm.model,
        "LLM backend configured"
    );

    let owner = Owner {
        user_id: match &config.owner.user_id {
            Some(raw) => raw.parse().expect("invalid OWNER__USER_ID"),
            None => UserId::new(),
        },
        name: config.owner.name.clone(),
    };

    let registry = default_registry(Arc::new(TaskList::new()));
    tracing::info!(tools = registry.len(), "Tool registry ready");

    let mut executor = TurnExecutor::new(
        backend,
        Arc::new(registry),
        Arc::clone(&store),
        Arc::new(ConfirmationLedger::new()),
        config.turn.turn_config(),
    );
    if config.memory.enabled {
        executor = executor.with_recall(Recall::new(facts, Arc::clone(&store)));
        tracing::info!(extract_every = config.memory.extract_every, "Long-term memory enabled");
    }
    let sessions = SessionController::new(Arc::new(executor), config.session_config());
    let app = router(Arc::new(AppState::new(sessions, store, owner)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

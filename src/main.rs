use bot_factory::analytics::FunnelAnalytics;
use bot_factory::artifact_store::ArtifactStoreClient;
use bot_factory::config::Config;
use bot_factory::db::PersistenceGateway;
use bot_factory::dispatcher::{self, DispatcherState};
use bot_factory::flow::CreationFlow;
use bot_factory::handler_runtime::HandlerRuntime;
use bot_factory::llm::CodeSynthesiser;
use bot_factory::migrations::MigrationManager;
use bot_factory::rate_limiters::telegram::TelegramRateLimiter;
use bot_factory::registry::HandlerRegistry;
use bot_factory::telegram::TelegramApiClient;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bot-factory")]
#[command(about = "Turns a plain-language description into a running Telegram bot")]
struct Args {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // initialize rustls crypto provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // load .env file if it exists
    if let Err(e) = dotenvy::dotenv() {
        // only warn if .env file exists but failed to load
        match e {
            dotenvy::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // .env file not found, which is fine
            }
            _ => {
                eprintln!("warning: failed to load .env file: {}", e);
            }
        }
    }

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let _args = Args::parse();

    let config = Arc::new(Config::from_env()?);
    info!("starting bot-factory on port {}", config.port);

    info!("initializing database...");
    let pool = PersistenceGateway::create_pool(&config.database_url)?;
    MigrationManager::run_migrations(&pool).await?;
    let db = Arc::new(PersistenceGateway::new(pool));

    let artifact_store = Arc::new(ArtifactStoreClient::new(
        config.github_token.clone(),
        config.github_user.clone(),
        config.github_repo.clone(),
        config.github_branch.clone(),
    ));

    let runtime = Arc::new(HandlerRuntime::new(db.clone()));
    let local_dir = PathBuf::from("handler_cache");
    tokio::fs::create_dir_all(&local_dir).await.ok();
    let registry = Arc::new(HandlerRegistry::new(db.clone(), artifact_store.clone(), runtime, local_dir));

    let telegram_rate_limiter = Arc::new(TelegramRateLimiter::new());
    let telegram = Arc::new(TelegramApiClient::new(telegram_rate_limiter));

    let synthesiser = Arc::new(CodeSynthesiser::new(config.anthropic_api_key.clone()));

    let creation_flow = Arc::new(CreationFlow::new(
        db.clone(),
        artifact_store,
        synthesiser,
        registry.clone(),
        telegram.clone(),
        config.clone(),
    ));

    let analytics = Arc::new(FunnelAnalytics::new(db.clone()));

    // periodic directory sync + stale-event reap (§4.3 / §4.1); sync_directory
    // also runs the 90-day funnel-event retention sweep (see registry.rs).
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                registry.sync_directory().await;
            }
        });
    }

    let state = DispatcherState {
        config: config.clone(),
        db,
        registry,
        telegram,
        creation_flow,
        analytics,
    };
    let app = dispatcher::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("listening on 0.0.0.0:{}", config.port);
    axum::serve(listener, app).await?;

    Ok(())
}

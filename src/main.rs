use std::{env, sync::Arc};

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coursegen_runtime::{
    auth::HttpIdentityProvider,
    config::Config,
    db,
    providers::OpenAiClient,
    routes,
    state::{AppState, Settings},
    storage::LocalObjectStore,
    store::PgStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "coursegen_runtime=info,axum=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env()?;

    let pool = db::connect(&cfg.database_url).await?;
    // crate-relative path for sqlx migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    let openai = Arc::new(OpenAiClient::new(&cfg.provider)?);
    let state = AppState {
        store: Arc::new(PgStore::new(pool)),
        model: openai.clone(),
        embedder: openai,
        objects: Arc::new(LocalObjectStore::new(
            &cfg.data_dir,
            &cfg.public_base_url,
            &cfg.signing_secret,
        )),
        identity: Arc::new(HttpIdentityProvider::new(
            &cfg.auth_url,
            cfg.auth_api_key.clone(),
            cfg.provider.timeout,
        )?),
        settings: Settings::from(&cfg),
    };

    let app = routes::app(state, cfg.max_upload_bytes);

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        generation_model = %cfg.provider.generation_model,
        embedding_model = %cfg.provider.embedding_model,
        "listening on http://{}",
        addr
    );

    axum::serve(listener, app).await?;
    Ok(())
}

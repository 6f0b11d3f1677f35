//! Main Entrypoint for the Recap API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the session store (Postgres or in-memory) and running migrations.
//! 3. Building the classifier, model client, lesson sources and recap agent.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use recap_api::{
    config::{ClassifierKind, Config, Provider},
    db::PgSessionStore,
    router::create_router,
    state::AppState,
};
use recap_core::{
    classifier::{LexiconClassifier, PerspectiveClassifier},
    guard::{GuardConfig, Granularity, ToxicityClassifier, ToxicityGuard},
    lesson::{FileSource, GoogleSheetsSource, LessonPlanSource, RosterSource},
    llm_client::{GeminiClient, GenerationConfig, LLMClient, OpenAICompatibleClient},
    pipeline::RecapPipeline,
    prompt::RecapPrompt,
    service::{InMemorySessionStore, RecapAgent, SessionStore},
};
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, path::Path, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Loads every `.md` file of a directory, keyed by file stem.
/// A missing directory yields no prompts.
fn load_prompts(prompts_path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    if !prompts_path.is_dir() {
        return Ok(prompts);
    }
    for entry in fs::read_dir(prompts_path)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            prompts.insert(prompt_key, fs::read_to_string(&path)?);
        }
    }
    Ok(prompts)
}

async fn session_store(config: &Config) -> anyhow::Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let store = PgSessionStore::new(pool);
            store.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; sessions are kept in memory and lost on restart.");
            Arc::new(InMemorySessionStore::default())
        }
    };
    Ok(store)
}

fn llm_client(config: &Config) -> anyhow::Result<Arc<dyn LLMClient>> {
    let client: Arc<dyn LLMClient> = match &config.provider {
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_ref()
                .context("GEMINI_API_KEY is required")?;
            Arc::new(GeminiClient::new(api_key, &config.chat_model))
        }
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY is required")?;
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/");
            Arc::new(OpenAICompatibleClient::new(
                openai_config,
                config.chat_model.clone(),
            ))
        }
    };
    Ok(client)
}

/// Builds the configured classifier with the granularity it scores at.
/// Perspective annotates sentences itself, so it gets the whole text in one request.
fn classifier(config: &Config) -> anyhow::Result<(Arc<dyn ToxicityClassifier>, Granularity)> {
    let classifier: (Arc<dyn ToxicityClassifier>, Granularity) = match &config.classifier {
        ClassifierKind::Perspective => {
            let api_key = config
                .perspective_api_key
                .as_ref()
                .context("PERSPECTIVE_API_KEY is required")?;
            (Arc::new(PerspectiveClassifier::new(api_key)), Granularity::Full)
        }
        ClassifierKind::Lexicon => {
            let path = config
                .lexicon_path
                .as_ref()
                .context("LEXICON_PATH is required")?;
            let lexicon = LexiconClassifier::from_file(path)?;
            if lexicon.is_empty() {
                warn!(path = %path.display(), "Lexicon is empty; no input will be flagged");
            }
            (Arc::new(lexicon), Granularity::Sentence)
        }
    };
    Ok(classifier)
}

fn lesson_sources(config: &Config) -> (Arc<dyn LessonPlanSource>, Arc<dyn RosterSource>) {
    match (&config.lesson_sheet_id, &config.sheets_api_key) {
        (Some(sheet_id), Some(api_key)) => {
            info!(sheet_id = %sheet_id, "Reading lesson plans from Google Sheets.");
            let source = Arc::new(GoogleSheetsSource::new(
                sheet_id,
                api_key,
                &config.lesson_range,
                &config.roster_range,
            ));
            let lessons: Arc<dyn LessonPlanSource> = source.clone();
            let roster: Arc<dyn RosterSource> = source;
            (lessons, roster)
        }
        _ => {
            info!(path = %config.lesson_plan_path.display(), "Reading lesson plans from file.");
            let source = Arc::new(FileSource::new(&config.lesson_plan_path));
            let lessons: Arc<dyn LessonPlanSource> = source.clone();
            let roster: Arc<dyn RosterSource> = source;
            (lessons, roster)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Session Storage ---
    let store = session_store(&config).await?;

    // --- 4. Initialize Shared Services ---
    let prompts = load_prompts(&config.prompts_path)?;
    let prompt = match prompts.get("recap_instruction") {
        Some(template) => {
            info!("Using recap_instruction.md from the prompts directory.");
            RecapPrompt::new(template.clone())?
        }
        None => RecapPrompt::default(),
    };

    let (toxicity_classifier, granularity) = classifier(&config)?;
    let guard = Arc::new(ToxicityGuard::new(
        toxicity_classifier,
        GuardConfig {
            threshold: config.toxicity_threshold,
            granularity,
            timeout: config.guard_timeout,
            ..GuardConfig::default()
        },
    ));
    let generation = GenerationConfig {
        max_output_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        ..GenerationConfig::default()
    };
    let pipeline = RecapPipeline::new(guard, llm_client(&config)?, generation, config.model_timeout);

    let (lessons, roster) = lesson_sources(&config);
    let agent = RecapAgent::new(store, lessons, prompt, pipeline)
        .with_session_timeout(chrono::Duration::minutes(config.session_timeout_minutes));

    let app_state = Arc::new(AppState {
        agent: Arc::new(agent),
        roster,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        classifier = ?config.classifier,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use trialguard::storage::TrialStore;
use trialguard::{jobs, settings, storage, trial, web};

#[derive(Parser, Debug)]
#[command(
    name = "trialguard",
    version,
    about = "Free-trial activation service with fraud scoring"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Create an account with this e-mail on startup if it does not exist
    #[arg(long)]
    seed_user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage
    let store = storage::init(&settings.database).await?;

    if let Some(email) = &cli.seed_user {
        ensure_user(store.as_ref(), email).await?;
    }

    let service = Arc::new(trial::FreeTrialService::new(
        store,
        settings.trial.clone(),
        settings.fraud.clone(),
    ));

    // keep the scheduler alive for the lifetime of the server
    let _scheduler = jobs::init_scheduler(service.clone()).await?;

    web::serve(settings, service).await?;
    Ok(())
}

async fn ensure_user(store: &dyn TrialStore, email: &str) -> Result<()> {
    match store.get_user_by_email(email).await.into_diagnostic()? {
        Some(user) => tracing::info!(user_id = %user.user_id, "Seed user already exists"),
        None => {
            let user = store
                .create_user(email, chrono::Utc::now().timestamp())
                .await
                .into_diagnostic()?;
            tracing::info!(user_id = %user.user_id, email, "Created seed user");
        }
    }
    Ok(())
}

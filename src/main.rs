use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use vault_review::api::{self, ApiState};
use vault_review::config::Config;
use vault_review::controller::ReviewController;
use vault_review::db::Db;
use vault_review::gemini::GeminiClient;
use vault_review::offline::OfflineTutor;
use vault_review::tutor::{AnswerEvaluator, QuestionSource};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;

    let db = Db::connect(&config.database_url)
        .await
        .with_context(|| format!("could not open database {}", config.database_url))?;

    let (questions, evaluator): (Arc<dyn QuestionSource>, Arc<dyn AnswerEvaluator>) = match &config.gemini_api_key {
        Some(key) => {
            info!("Using Gemini model {} for questions and grading", config.gemini_model);
            let client = Arc::new(GeminiClient::new(key.clone(), config.gemini_model.clone(), config.ai_timeout)?);
            (client.clone() as Arc<dyn QuestionSource>, client as Arc<dyn AnswerEvaluator>)
        }
        None => {
            warn!("GEMINI_API_KEY is not set, falling back to the offline tutor");
            let tutor = Arc::new(OfflineTutor::new());
            (tutor.clone() as Arc<dyn QuestionSource>, tutor as Arc<dyn AnswerEvaluator>)
        }
    };

    let controller = ReviewController::new(Arc::new(db), questions, evaluator, config.controller_settings());
    let app = api::app_router(ApiState { controller: Arc::new(controller) });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("could not bind {}", config.bind_addr))?;
    info!("Vault review service listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

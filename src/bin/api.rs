use finance_companion::{
    api::{start_server, ApiState},
    badges::create_default_badge_engine,
    budget::BudgetReconciler,
    classifier::ClassificationService,
    evaluator::{GeminiEvaluator, JustificationEvaluator, MockEvaluator},
    ledger::TransactionLedger,
    progression::ProgressionLedger,
    store::{CompanionStore, InMemoryStore, PostgresStore},
    streak::StreakTracker,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Finance Companion - API Server");
    info!("Port: {}", api_port);

    // Store: postgres when configured, in-memory otherwise
    let store: Arc<dyn CompanionStore> = match PostgresStore::from_env() {
        Some(postgres) => Arc::new(postgres),
        None => {
            info!("Companion store backend: in-memory");
            Arc::new(InMemoryStore::new())
        }
    };

    // External collaborators
    let classifier = ClassificationService::from_env();
    let evaluator: Arc<dyn JustificationEvaluator> = match GeminiEvaluator::from_env() {
        Some(evaluator) => Arc::new(evaluator),
        None => {
            warn!("GEMINI_API_KEY not set; justification evaluator running in mock mode");
            Arc::new(MockEvaluator::accepting())
        }
    };

    // Core components
    let progression = Arc::new(ProgressionLedger::new(store.clone()));
    let streak = Arc::new(StreakTracker::new(store.clone(), progression.clone()));
    let badges = Arc::new(create_default_badge_engine(store.clone()));
    let reconciler = BudgetReconciler::new(store.clone());
    let ledger = Arc::new(TransactionLedger::new(
        store.clone(),
        classifier,
        evaluator,
        reconciler,
        progression.clone(),
    ));

    let state = ApiState {
        ledger,
        progression,
        streak,
        badges,
    };

    info!("Companion core initialized");

    start_server(state, api_port).await?;

    Ok(())
}

use loan_match_advisor::{api::{start_server, ApiState}, AdvisorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AdvisorConfig::from_env()?;

    info!("Loan Match Advisor - API Server");
    info!("Port: {}", config.port);

    let state = ApiState::from_config(&config).await?;
    info!("Services initialized");

    start_server(state, config.port).await?;

    Ok(())
}

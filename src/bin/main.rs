use loan_match_advisor::{
    calculator::CurrencyConverter,
    llm::build_advisory_model,
    secrets::FileSecretStore,
    store::Stores,
    AdvisorConfig, MatchAdvisor, MatchRequest, RecommendationEngine,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn sample_request() -> serde_json::Value {
    json!({
        "asuId": "1234567890",
        "loanApplication": {
            "applicantName": "Priya Raman Iyer",
            "applicationDate": "2024-01-24",
            "currency": "INR",
            "interestRate": 11.75,
            "loanAmount": 5000000,
            "loanProvider": "Credila Financial Services",
            "loanTenure": 14,
            "loanType": "UNSECURED"
        },
        "salaryVerification": {
            "currency": "USD",
            "deductions": 3.35,
            "employeeName": "Priya Raman Iyer",
            "employerName": "Arizona State University",
            "grossSalary": 752.4,
            "month": "September 2025",
            "netSalary": 755.75
        },
        "employerMatchPolicy": {
            "maxMonthlyMatchCap": 500,
            "maxAnnualMatchCap": 5500,
            "maxSalaryPercentageCap": 6.0,
            "vestingSchedule": "Immediate"
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AdvisorConfig::from_env()?;

    // Payload from the first argument, or the built-in sample
    let payload = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&tokio::fs::read_to_string(&path).await?)?,
        None => sample_request(),
    };
    let request: MatchRequest = serde_json::from_value(payload)?;

    let secrets = FileSecretStore::new(config.secrets_dir.clone());
    let engine = match build_advisory_model(&config, &secrets).await? {
        Some(model) => RecommendationEngine::new(model),
        None => RecommendationEngine::fallback_only(),
    };
    let converter = CurrencyConverter::from_api_key(config.exchange_rate_api_key.clone())?;
    let stores = Stores::in_memory();
    let advisor = MatchAdvisor::new(engine, converter, stores.profiles);

    info!(asu_id = ?request.asu_id, "Running calculate-match locally");

    match advisor.calculate(request).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            let rec = &outcome.recommendation;
            let projections = &outcome.financial_projections;
            println!("\n=== KEY METRICS ===");
            println!("Recommended Match: {}%", rec.match_percentage);
            println!("Monthly Match: ${:.2}", rec.monthly_match_usd);
            println!("Annual Match: ${:.2}", rec.annual_match_usd);
            println!("Cap Applied: {}", rec.cap_applied);
            println!("Risk Assessment: {}", rec.risk_assessment);
            println!(
                "Salary Cap: {}% (max ${:.2}/month, limited: {})",
                outcome.metadata.salary_cap_percentage,
                projections.salary_cap_info.max_monthly_based_on_salary,
                projections.salary_cap_info.is_match_limited_by_salary_cap
            );
            println!(
                "Debt-to-Income: {:.2}% -> {:.2}%",
                projections.debt_to_income_impact.before_match,
                projections.debt_to_income_impact.after_match
            );
            println!(
                "Retirement value: 10y ${:.2}, 20y ${:.2}, 30y ${:.2}",
                projections.annual_summary.retirement_value_10_years,
                projections.annual_summary.retirement_value_20_years,
                projections.annual_summary.retirement_value_30_years
            );
            println!("Recommendation source: {}", outcome.metadata.recommendation_source);
            Ok(())
        }
        Err(e) => {
            eprintln!("Calculation failed ({}): {}", e.status_code(), e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

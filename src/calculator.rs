//! Financial calculator
//!
//! Pure loan and match arithmetic plus currency conversion. Everything except
//! [`CurrencyConverter`] is deterministic and free of I/O.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::AdvisorError;
use crate::models::{EmployerPolicy, FinancialFacts};

pub mod constants {
    /// Used when neither an override nor the rate service yields a rate.
    pub const DEFAULT_EXCHANGE_RATE: f64 = 0.012;
    pub const TAX_BRACKET: f64 = 0.22;
    pub const DEFAULT_SALARY_MATCH_CAP_PERCENTAGE: f64 = 6.0;
    pub const DEFAULT_MONTHLY_CAP_USD: f64 = 500.0;
    pub const DEFAULT_ANNUAL_CAP_USD: f64 = 5500.0;

    /// Longest loan tenure accepted from a request or a chat answer.
    pub const MAX_TENURE_YEARS: u32 = 100;

    /// Future value of 1/year contributed for 10, 20 and 30 years at 6%.
    pub const RETIREMENT_MULTIPLIER_10Y: f64 = 13.18;
    pub const RETIREMENT_MULTIPLIER_20Y: f64 = 36.79;
    pub const RETIREMENT_MULTIPLIER_30Y: f64 = 79.06;

    /// Compounded growth used for the short narrative projections.
    pub const GROWTH_FACTOR_5Y: f64 = 1.34;
    pub const GROWTH_FACTOR_10Y: f64 = 1.79;

    pub const LLM_TIMEOUT_SECS: u64 = 120;
    pub const LLM_TEMPERATURE: f32 = 0.3;
    pub const MAX_TOKENS: u32 = 3000;

    pub const RATE_SERVICE_URL: &str = "https://v6.exchangerate-api.com/v6";
    pub const RATE_SERVICE_TIMEOUT_SECS: u64 = 5;
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Standard amortized monthly installment, rounded to cents.
///
/// Zero rate degenerates to `principal / months`; non-positive principal or
/// zero tenure yields 0.
pub fn monthly_installment(principal: f64, annual_rate_percent: f64, tenure_years: u32) -> f64 {
    let months = tenure_years.saturating_mul(12);
    if principal <= 0.0 || months == 0 {
        return 0.0;
    }
    let r = annual_rate_percent / 12.0 / 100.0;
    if r == 0.0 {
        return round2(principal / f64::from(months));
    }
    let growth = (1.0 + r).powf(f64::from(months));
    if !growth.is_finite() {
        return round2(principal * r);
    }
    round2(principal * r * growth / (growth - 1.0))
}

/// Debt-to-income ratio in percent, rounded to 2 decimals; 0 when income is
/// non-positive.
pub fn debt_to_income_ratio(monthly_debt: f64, monthly_income: f64) -> f64 {
    if monthly_income <= 0.0 {
        return 0.0;
    }
    round2(monthly_debt / monthly_income * 100.0)
}

pub fn monthly_salary_cap(monthly_salary: f64, percentage: f64) -> f64 {
    monthly_salary * percentage / 100.0
}

pub fn annual_salary_cap(monthly_salary: f64, percentage: f64) -> f64 {
    monthly_salary * 12.0 * percentage / 100.0
}

/// Formats a percentage the way it appears in cap labels: `6.0`, `7.5`.
pub fn format_percent(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Pulls the first number out of free text such as `"$50,000"` or `"10 years"`.
pub fn parse_amount(text: &str) -> Option<f64> {
    let mut digits = String::new();
    let mut started = false;
    for ch in text.chars() {
        match ch {
            '0'..='9' => {
                started = true;
                digits.push(ch);
            }
            '.' if started && !digits.contains('.') => digits.push(ch),
            ',' if started => {}
            _ if started => break,
            _ => {}
        }
    }
    let multiplier = match text.trim().to_lowercase().chars().last() {
        Some('k') => 1_000.0,
        _ => 1.0,
    };
    digits
        .trim_end_matches('.')
        .parse::<f64>()
        .ok()
        .map(|v| v * multiplier)
}

/// Salary-derived and policy caps, resolved once per calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCaps {
    pub policy: EmployerPolicy,
    pub monthly_from_salary: f64,
    pub annual_from_salary: f64,
}

impl MatchCaps {
    pub fn new(policy: EmployerPolicy, monthly_salary: f64) -> Self {
        Self {
            monthly_from_salary: monthly_salary_cap(monthly_salary, policy.max_salary_percentage_cap),
            annual_from_salary: annual_salary_cap(monthly_salary, policy.max_salary_percentage_cap),
            policy,
        }
    }

    pub fn effective_monthly(&self) -> f64 {
        self.policy.max_monthly_cap_usd.min(self.monthly_from_salary)
    }

    pub fn effective_annual(&self) -> f64 {
        self.policy.max_annual_cap_usd.min(self.annual_from_salary)
    }
}

/// Everything derived from the facts that both the model prompt and the
/// fallback rule need. Loan figures here are already in USD.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchAnalysis {
    pub facts: FinancialFacts,
    pub original_loan_amount: f64,
    pub original_currency: String,
    pub exchange_rate: Option<f64>,
    pub loan_amount_usd: f64,
    pub monthly_installment: f64,
    pub annual_salary: f64,
    pub debt_to_income: f64,
    pub caps: MatchCaps,
}

impl MatchAnalysis {
    /// `exchange_rate` is `None` when the loan is already in USD.
    pub fn new(facts: FinancialFacts, policy: EmployerPolicy, exchange_rate: Option<f64>) -> Self {
        let loan_amount_usd = match exchange_rate {
            Some(rate) => facts.loan_amount * rate,
            None => facts.loan_amount,
        };
        let emi = monthly_installment(loan_amount_usd, facts.interest_rate_percent, facts.tenure_years);
        Self {
            original_loan_amount: facts.loan_amount,
            original_currency: facts.loan_currency.clone(),
            exchange_rate,
            loan_amount_usd,
            monthly_installment: emi,
            annual_salary: facts.monthly_salary_usd * 12.0,
            debt_to_income: debt_to_income_ratio(emi, facts.monthly_salary_usd),
            caps: MatchCaps::new(policy, facts.monthly_salary_usd),
            facts,
        }
    }

    pub fn monthly_salary(&self) -> f64 {
        self.facts.monthly_salary_usd
    }

    /// Ratio after the employer match covers part of the installment.
    pub fn debt_to_income_after(&self, monthly_match: f64) -> f64 {
        debt_to_income_ratio((self.monthly_installment - monthly_match).max(0.0), self.monthly_salary())
    }
}

//
// ================= Currency conversion =================
//

#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rate(&self, from: &str, to: &str) -> crate::Result<f64>;
}

#[derive(Debug, Deserialize)]
struct PairResponse {
    result: String,
    conversion_rate: Option<f64>,
}

/// exchangerate-api.com pair endpoint
pub struct ExchangeRateApi {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ExchangeRateApi {
    pub fn new(api_key: String) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(constants::RATE_SERVICE_TIMEOUT_SECS))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: constants::RATE_SERVICE_URL.to_string(),
        })
    }
}

#[async_trait]
impl RateSource for ExchangeRateApi {
    async fn fetch_rate(&self, from: &str, to: &str) -> crate::Result<f64> {
        let url = format!("{}/{}/pair/{}/{}", self.base_url, self.api_key, from, to);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AdvisorError::ExternalService(format!(
                "rate service returned {}",
                response.status()
            )));
        }
        let body: PairResponse = response.json().await?;
        match (body.result.as_str(), body.conversion_rate) {
            ("success", Some(rate)) => Ok(rate),
            _ => Err(AdvisorError::ExternalService(format!(
                "rate service result: {}",
                body.result
            ))),
        }
    }
}

/// Resolves exchange rates: explicit override, `EXCHANGE_RATE_<FROM>_TO_<TO>`
/// from the environment, the live service, then the fixed fallback.
#[derive(Clone, Default)]
pub struct CurrencyConverter {
    source: Option<Arc<dyn RateSource>>,
    overrides: HashMap<(String, String), f64>,
}

impl CurrencyConverter {
    pub fn new(source: Option<Arc<dyn RateSource>>) -> Self {
        Self {
            source,
            overrides: HashMap::new(),
        }
    }

    /// Uses the live service only when an API key is configured.
    pub fn from_api_key(api_key: Option<String>) -> crate::Result<Self> {
        let source = match api_key {
            Some(key) => Some(Arc::new(ExchangeRateApi::new(key)?) as Arc<dyn RateSource>),
            None => None,
        };
        Ok(Self::new(source))
    }

    pub fn with_override(mut self, from: &str, to: &str, rate: f64) -> Self {
        self.overrides
            .insert((from.to_uppercase(), to.to_uppercase()), rate);
        self
    }

    pub async fn rate(&self, from: &str, to: &str) -> f64 {
        let (from, to) = (from.to_uppercase(), to.to_uppercase());
        if from == to {
            return 1.0;
        }
        if let Some(rate) = self.overrides.get(&(from.clone(), to.clone())) {
            return *rate;
        }

        let env_key = format!("EXCHANGE_RATE_{}_TO_{}", from, to);
        if let Some(rate) = std::env::var(&env_key).ok().and_then(|v| v.parse::<f64>().ok()) {
            info!("Using exchange rate from {}: {}", env_key, rate);
            return rate;
        }

        if let Some(source) = &self.source {
            match source.fetch_rate(&from, &to).await {
                Ok(rate) => {
                    info!("Fetched live exchange rate {} -> {}: {}", from, to, rate);
                    return rate;
                }
                Err(e) => warn!("Exchange rate lookup failed: {}", e),
            }
        }

        warn!(
            "Using fallback exchange rate for {} -> {}: {}",
            from,
            to,
            constants::DEFAULT_EXCHANGE_RATE
        );
        constants::DEFAULT_EXCHANGE_RATE
    }

    /// Returns the converted amount and the rate used, `None` for same-currency.
    pub async fn convert(&self, amount: f64, from: &str, to: &str) -> (f64, Option<f64>) {
        if from.eq_ignore_ascii_case(to) {
            return (amount, None);
        }
        let rate = self.rate(from, to).await;
        (amount * rate, Some(rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    #[async_trait]
    impl RateSource for FailingSource {
        async fn fetch_rate(&self, _from: &str, _to: &str) -> crate::Result<f64> {
            Err(AdvisorError::ExternalService("down".into()))
        }
    }

    struct FixedSource(f64);

    #[async_trait]
    impl RateSource for FixedSource {
        async fn fetch_rate(&self, _from: &str, _to: &str) -> crate::Result<f64> {
            Ok(self.0)
        }
    }

    fn facts(loan: f64, currency: &str) -> FinancialFacts {
        FinancialFacts {
            loan_amount: loan,
            loan_currency: currency.to_string(),
            interest_rate_percent: 6.0,
            tenure_years: 10,
            monthly_salary_usd: 5000.0,
            gross_salary_usd: 6200.0,
        }
    }

    #[test]
    fn test_monthly_installment() {
        let emi = monthly_installment(120_000.0, 6.0, 10);
        assert!((emi - 1332.25).abs() < 0.5, "emi was {}", emi);

        assert_eq!(monthly_installment(12_000.0, 0.0, 1), 1000.0);
        assert_eq!(monthly_installment(12_000.0, 5.0, 0), 0.0);
        assert_eq!(monthly_installment(-5.0, 5.0, 3), 0.0);
    }

    #[test]
    fn test_installment_survives_absurd_tenure() {
        assert_eq!(monthly_installment(120_000.0, 6.0, u32::MAX), 600.0);
        assert_eq!(monthly_installment(120_000.0, 0.0, 400_000_000), 0.0);
        assert_eq!(monthly_installment(120_000.0, 6.0, 10), 1332.25);
    }

    #[test]
    fn test_installment_recovers_principal() {
        for (principal, rate, years) in [(1_000.0, 0.0, 1), (50_000.0, 4.5, 7), (250_000.0, 12.0, 30)] {
            let emi = monthly_installment(principal, rate, years);
            assert!(emi * (years * 12) as f64 >= principal - 0.01);
        }
    }

    #[test]
    fn test_debt_to_income_ratio() {
        assert_eq!(debt_to_income_ratio(500.0, 5000.0), 10.0);
        assert_eq!(debt_to_income_ratio(500.0, 0.0), 0.0);
        assert_eq!(debt_to_income_ratio(0.0, 4000.0), 0.0);
        assert_eq!(debt_to_income_ratio(1.0, 3.0), 33.33);
    }

    #[test]
    fn test_match_caps() {
        let caps = MatchCaps::new(EmployerPolicy::default(), 5000.0);
        assert_eq!(caps.monthly_from_salary, 300.0);
        assert_eq!(caps.annual_from_salary, 3600.0);
        assert_eq!(caps.effective_monthly(), 300.0);
        assert_eq!(caps.effective_annual(), 3600.0);
    }

    #[test]
    fn test_analysis_converts_loan() {
        let analysis = MatchAnalysis::new(facts(1_000_000.0, "INR"), EmployerPolicy::default(), Some(0.012));
        assert_eq!(analysis.loan_amount_usd, 12_000.0);
        assert_eq!(analysis.original_loan_amount, 1_000_000.0);
        assert_eq!(analysis.annual_salary, 60_000.0);

        let analysis = MatchAnalysis::new(facts(120_000.0, "USD"), EmployerPolicy::default(), None);
        assert!((analysis.debt_to_income - 26.64).abs() < 0.05);
        assert!(analysis.debt_to_income_after(300.0) < analysis.debt_to_income);
        assert_eq!(analysis.debt_to_income_after(5000.0), 0.0);
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(6.0), "6.0");
        assert_eq!(format_percent(7.5), "7.5");
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("$50,000"), Some(50_000.0));
        assert_eq!(parse_amount("10 years"), Some(10.0));
        assert_eq!(parse_amount("6.5%"), Some(6.5));
        assert_eq!(parse_amount("65k"), Some(65_000.0));
        assert_eq!(parse_amount("no idea"), None);
    }

    #[tokio::test]
    async fn test_converter_prefers_override() {
        let converter = CurrencyConverter::new(Some(Arc::new(FixedSource(0.02)))).with_override("INR", "USD", 0.011);
        assert_eq!(converter.rate("inr", "usd").await, 0.011);
        assert_eq!(converter.rate("EUR", "USD").await, 0.02);
    }

    #[tokio::test]
    async fn test_converter_falls_back() {
        let converter = CurrencyConverter::new(Some(Arc::new(FailingSource)));
        assert_eq!(
            converter.rate("ZZA", "ZZB").await,
            constants::DEFAULT_EXCHANGE_RATE
        );
    }

    #[test]
    fn test_same_currency_skips_lookup() {
        let converter = CurrencyConverter::new(Some(Arc::new(FailingSource)));
        let (amount, rate) = tokio_test::block_on(converter.convert(100.0, "USD", "usd"));
        assert_eq!(amount, 100.0);
        assert_eq!(rate, None);
    }
}

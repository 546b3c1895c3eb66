//! Recommendation engine
//!
//! Asks the advisory model for a match recommendation and falls back to a
//! deterministic debt-to-income rule whenever the model is unavailable or its
//! answer does not satisfy the JSON contract. Also derives the projections,
//! dashboard fields and next steps returned by calculate-match.

use chrono::Utc;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::calculator::{constants, format_percent, round2, CurrencyConverter, MatchAnalysis, MatchCaps};
use crate::error::AdvisorError;
use crate::llm::{AdvisoryModel, ChatMessage, ChatRequest};
use crate::models::{
    split_full_name, AnnualSummary, ConversionInfo, DashboardData, DebtToIncomeImpact, FactValue,
    FinancialProjections, LoanPayoffProjection, MatchMetadata, MatchOutcome, MatchRequest,
    MonthlyBreakdown, ProjectedOutcomes, Recommendation, RecommendationRecord, RiskLevel,
    SalaryCapInfo, TaxSavings, UserProfile, ValidatedMatch,
};
use crate::store::{ProfileStore, ProfileUpdate};

pub const METADATA_VERSION: &str = "2.1";
const REQUIRED_FIELDS: [&str; 5] = [
    "recommendedMatchPercentage",
    "recommendedMonthlyMatchAmount",
    "recommendedAnnualMatchAmount",
    "rationale",
    "riskAssessment",
];
const NUMERIC_FIELDS: [&str; 3] = [
    "recommendedMatchPercentage",
    "recommendedMonthlyMatchAmount",
    "recommendedAnnualMatchAmount",
];

const SYSTEM_PROMPT: &str = r#"You are a financial advisor who specialises in student loan repayment and retirement planning under the SECURE 2.0 Act student loan matching provisions.

Given an employee's finances, recommend the employer retirement contribution that should match their student loan payments.

The employer policy carries three caps:
1. maxMonthlyMatchCap (monthly policy limit)
2. maxAnnualMatchCap (annual policy limit)
3. maxSalaryPercentageCap (percentage of annual salary)

The monthly match MUST NOT exceed the lowest of: the monthly cap, the annual cap divided by 12, and the salary percentage cap divided by 12.

Respond with exactly this JSON object:
{
  "recommendedMatchPercentage": <50, 75 or 100>,
  "recommendedMonthlyMatchAmount": <USD amount within all caps>,
  "recommendedAnnualMatchAmount": <USD amount within all caps>,
  "rationale": "<explanation naming the limiting cap>",
  "riskAssessment": "<low|medium|high>",
  "capApplied": "<monthly_policy|annual_policy|salary_percentage|none>",
  "alternativeOptions": [
    {"matchPercentage": <number>, "monthlyAmount": <number>, "annualAmount": <number>, "pros": "<text>", "cons": "<text>"}
  ],
  "financialHealthScore": <0-100>,
  "recommendations": ["<actionable advice>", "<actionable advice>", "<actionable advice>"],
  "taxBenefits": "<tax advantages>",
  "projectedOutcomes": {"5years": "<text>", "10years": "<text>", "atLoanPayoff": "<text>"}
}

Decision criteria:
- debt-to-income below 15%: low risk, 100% match
- debt-to-income 15-25%: medium risk, 75% match
- debt-to-income above 25%: high risk, 50-75% match
- always apply the most restrictive cap
- weigh loan repayment against compounding retirement savings and tax advantages

Output JSON only. No markdown, no code fences, no text outside the object."#;

/// Where a recommendation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationSource {
    Model,
    Fallback,
}

impl fmt::Display for RecommendationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecommendationSource::Model => write!(f, "model"),
            RecommendationSource::Fallback => write!(f, "fallback"),
        }
    }
}

//
// ================= Prompt input =================
//

/// Structured summary handed to the model. All amounts in USD.
pub fn prompt_input(request: &ValidatedMatch, analysis: &MatchAnalysis) -> Value {
    let caps = &analysis.caps;
    let converted = analysis.exchange_rate.is_some();

    let mut policy = serde_json::Map::new();
    for (k, v) in &request.policy_extra {
        policy.insert(k.clone(), v.clone());
    }
    policy.insert("maxMonthlyMatchCap".into(), json!(caps.policy.max_monthly_cap_usd));
    policy.insert("maxAnnualMatchCap".into(), json!(caps.policy.max_annual_cap_usd));
    policy.insert("maxSalaryPercentageCap".into(), json!(caps.policy.max_salary_percentage_cap));
    policy.insert("maxMonthlyBasedOnSalary".into(), json!(round2(caps.monthly_from_salary)));
    policy.insert("maxAnnualBasedOnSalary".into(), json!(round2(caps.annual_from_salary)));
    policy.insert("effectiveMonthlyLimit".into(), json!(round2(caps.effective_monthly())));
    policy.insert("effectiveAnnualLimit".into(), json!(round2(caps.effective_annual())));

    json!({
        "employeeFinancials": {
            "monthlySalary": round2(analysis.monthly_salary()),
            "annualSalary": round2(analysis.annual_salary),
            "currency": "USD",
            "employer": request.salary.employer_name.as_deref().unwrap_or("Arizona State University"),
            "deductions": round2(request.salary.deductions.unwrap_or(0.0)),
            "grossSalary": round2(analysis.facts.gross_salary_usd),
        },
        "studentLoan": {
            "totalAmountUSD": round2(analysis.loan_amount_usd),
            "originalCurrency": analysis.original_currency,
            "originalAmount": round2(analysis.original_loan_amount),
            "exchangeRate": analysis.exchange_rate.map(|r| (r * 10_000.0).round() / 10_000.0),
            "conversionNote": if converted {
                format!("Converted from {}", analysis.original_currency)
            } else {
                "Already in USD".to_string()
            },
            "provider": request.loan.loan_provider.as_deref().unwrap_or("N/A"),
            "interestRate": round2(analysis.facts.interest_rate_percent),
            "tenureYears": analysis.facts.tenure_years,
            "estimatedMonthlyPaymentUSD": analysis.monthly_installment,
            "loanType": request.loan.loan_type.as_deref().unwrap_or("UNSECURED"),
        },
        "debtToIncomeRatio": analysis.debt_to_income,
        "employerMatchPolicy": policy,
        "calculationCurrency": "USD",
        "note": "All financial calculations are performed in USD with salary-based cap applied",
    })
}

fn user_prompt(input: &Value, caps: &MatchCaps) -> String {
    let pretty = serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string());
    format!(
        "Analyze this employee's financial situation and recommend the optimal retirement match:\n\n{}\n\n\
         The employer caps matching at {}% of salary, which is at most ${:.2}/month.\n\
         Do not exceed this limit even if the policy caps are higher.\n\n\
         Answer in the exact JSON format from the system prompt using the numbers above.",
        pretty,
        format_percent(caps.policy.max_salary_percentage_cap),
        caps.monthly_from_salary
    )
}

//
// ================= Response parsing =================
//

/// Strips a leading ```json / ``` fence and a trailing ``` fence.
pub fn clean_model_content(content: &str) -> &str {
    let mut content = content.trim();
    if let Some(rest) = content.strip_prefix("```json") {
        content = rest;
    } else if let Some(rest) = content.strip_prefix("```") {
        content = rest;
    }
    if let Some(rest) = content.strip_suffix("```") {
        content = rest;
    }
    content.trim()
}

/// Parses and validates the model's answer against the JSON contract.
pub fn parse_recommendation(content: &str) -> crate::Result<Recommendation> {
    let value: Value = serde_json::from_str(clean_model_content(content))
        .map_err(|e| AdvisorError::DataIntegrity(format!("model output is not JSON: {}", e)))?;

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|f| value.get(*f).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(AdvisorError::DataIntegrity(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }
    for field in NUMERIC_FIELDS {
        if !value[field].is_number() {
            return Err(AdvisorError::DataIntegrity(format!("{} must be a number", field)));
        }
    }

    serde_json::from_value(value).map_err(|e| AdvisorError::DataIntegrity(e.to_string()))
}

/// Clamps a model answer so the monthly and annual amounts respect every cap.
pub fn enforce_caps(mut rec: Recommendation, caps: &MatchCaps) -> Recommendation {
    let (limit, label) = binding_monthly_limit(caps);
    if rec.monthly_match_usd > limit + 0.005 {
        warn!(
            "Model recommended ${:.2}/month above the ${:.2} limit; clamping",
            rec.monthly_match_usd, limit
        );
        rec.monthly_match_usd = round2(limit);
        rec.cap_applied = label;
    }
    let annual_limit = (rec.monthly_match_usd * 12.0).min(caps.effective_annual());
    if rec.annual_match_usd > annual_limit + 0.005 {
        rec.annual_match_usd = round2(annual_limit);
    }
    rec
}

/// Lowest monthly limit across the three caps, with its label.
fn binding_monthly_limit(caps: &MatchCaps) -> (f64, String) {
    let salary = caps.monthly_from_salary;
    let monthly = caps.policy.max_monthly_cap_usd;
    let annual = caps.policy.max_annual_cap_usd / 12.0;
    let limit = salary.min(monthly).min(annual);
    (limit, cap_label(limit, caps))
}

fn cap_label(amount: f64, caps: &MatchCaps) -> String {
    if amount == caps.monthly_from_salary {
        format!("salary_percentage ({}%)", format_percent(caps.policy.max_salary_percentage_cap))
    } else if amount == caps.policy.max_monthly_cap_usd {
        "monthly_policy".to_string()
    } else if amount == caps.policy.max_annual_cap_usd / 12.0 {
        "annual_policy".to_string()
    } else {
        "none".to_string()
    }
}

//
// ================= Fallback rule =================
//

/// Deterministic recommendation from the debt-to-income ratio.
pub fn fallback_recommend(monthly_salary: f64, monthly_emi: f64, caps: &MatchCaps) -> Recommendation {
    let dti = crate::calculator::debt_to_income_ratio(monthly_emi, monthly_salary);
    let (pct, risk) = if dti < 15.0 {
        (100.0, RiskLevel::Low)
    } else if dti < 25.0 {
        (75.0, RiskLevel::Medium)
    } else {
        (50.0, RiskLevel::High)
    };

    let theoretical = monthly_emi * pct / 100.0;
    let monthly = theoretical
        .min(caps.policy.max_monthly_cap_usd)
        .min(caps.monthly_from_salary)
        .min(caps.policy.max_annual_cap_usd / 12.0);
    let cap_applied = cap_label(monthly, caps);
    let annual = (monthly * 12.0).min(caps.effective_annual());

    info!(
        "Fallback recommendation: {}% match, theoretical ${:.2}/month, actual ${:.2}/month ({})",
        pct, theoretical, monthly, cap_applied
    );

    Recommendation {
        match_percentage: pct,
        monthly_match_usd: round2(monthly),
        annual_match_usd: round2(annual),
        rationale: format!(
            "Fallback recommendation based on {}% debt-to-income ratio. Match limited by {}. Manual review recommended.",
            dti, cap_applied
        ),
        risk_assessment: risk,
        cap_applied,
        alternative_options: Vec::new(),
        financial_health_score: Some((100.0 - (dti * 2.0).trunc()).max(50.0)),
        recommendations: vec![
            "Review financial data for accuracy".to_string(),
            "Consult with financial advisor for personalized guidance".to_string(),
            format!("Consider starting with conservative {}% match", pct),
            "Monitor monthly budget and adjust as needed".to_string(),
        ],
        tax_benefits: Some(format!(
            "Estimated annual tax benefit of ${:.2} (at 22% bracket)",
            annual * constants::TAX_BRACKET
        )),
        projected_outcomes: Some(ProjectedOutcomes {
            five_years: Some(format!(
                "Projected retirement value: ${:.2}",
                annual * 5.0 * constants::GROWTH_FACTOR_5Y
            )),
            ten_years: Some(format!(
                "Projected retirement value: ${:.2}",
                annual * 10.0 * constants::GROWTH_FACTOR_10Y
            )),
            at_loan_payoff: Some("Total match contribution over loan term".to_string()),
        }),
    }
}

//
// ================= Engine =================
//

pub struct RecommendationEngine {
    model: Option<Arc<dyn AdvisoryModel>>,
}

impl RecommendationEngine {
    pub fn new(model: Arc<dyn AdvisoryModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Engine that never calls out and always applies the fallback rule.
    pub fn fallback_only() -> Self {
        Self { model: None }
    }

    /// Recommendation for the analysed facts. Only an exhausted
    /// authentication failure propagates; every other failure falls back.
    pub async fn recommend(
        &self,
        analysis: &MatchAnalysis,
        input: &Value,
    ) -> crate::Result<(Recommendation, RecommendationSource)> {
        let fallback = || fallback_recommend(analysis.monthly_salary(), analysis.monthly_installment, &analysis.caps);

        let Some(model) = &self.model else {
            return Ok((fallback(), RecommendationSource::Fallback));
        };

        let request = ChatRequest::new(
            vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(user_prompt(input, &analysis.caps)),
            ],
            constants::LLM_TEMPERATURE,
            constants::MAX_TOKENS,
            Duration::from_secs(constants::LLM_TIMEOUT_SECS),
        );

        match model.complete(&request).await {
            Ok(content) => match parse_recommendation(&content) {
                Ok(rec) => {
                    info!("Model recommendation parsed and validated");
                    Ok((enforce_caps(rec, &analysis.caps), RecommendationSource::Model))
                }
                Err(e) => {
                    warn!("Discarding model recommendation: {}", e);
                    Ok((fallback(), RecommendationSource::Fallback))
                }
            },
            Err(e @ AdvisorError::Authentication(_)) => Err(e),
            Err(e) => {
                warn!("Advisory model unavailable, using fallback: {}", e);
                Ok((fallback(), RecommendationSource::Fallback))
            }
        }
    }
}

//
// ================= Projections, dashboard, next steps =================
//

pub fn projections(analysis: &MatchAnalysis, rec: &Recommendation) -> FinancialProjections {
    let salary = analysis.monthly_salary();
    let emi = analysis.monthly_installment;
    let monthly = rec.monthly_match_usd;
    let annual = rec.annual_match_usd;
    let tenure = analysis.facts.tenure_years as f64;
    let caps = &analysis.caps;

    FinancialProjections {
        currency: "USD".to_string(),
        monthly_breakdown: MonthlyBreakdown {
            net_salary: round2(salary),
            loan_payment: round2(emi),
            match_contribution: round2(monthly),
            remaining_income: round2(salary - emi),
            effective_income_after_match: round2(salary - emi + monthly),
        },
        annual_summary: AnnualSummary {
            total_match_contribution: round2(annual),
            retirement_value_10_years: round2(annual * constants::RETIREMENT_MULTIPLIER_10Y),
            retirement_value_20_years: round2(annual * constants::RETIREMENT_MULTIPLIER_20Y),
            retirement_value_30_years: round2(annual * constants::RETIREMENT_MULTIPLIER_30Y),
            total_loan_principal_reduction: round2(monthly * 12.0 * tenure),
        },
        debt_to_income_impact: DebtToIncomeImpact {
            before_match: analysis.debt_to_income,
            after_match: analysis.debt_to_income_after(monthly),
            improvement: crate::calculator::debt_to_income_ratio(monthly, salary),
        },
        tax_savings: TaxSavings {
            annual_tax_benefit: round2(annual * constants::TAX_BRACKET),
            lifetime_tax_savings: round2(annual * tenure * constants::TAX_BRACKET),
            effective_cost_reduction: round2(emi - monthly * (1.0 - constants::TAX_BRACKET)),
        },
        loan_payoff_projection: LoanPayoffProjection {
            original_loan_amount_usd: round2(analysis.loan_amount_usd),
            original_tenure_years: analysis.facts.tenure_years,
            with_match_support: "Accelerated payoff potential with employer match".to_string(),
            interest_savings: "Varies based on payment strategy".to_string(),
        },
        salary_cap_info: SalaryCapInfo {
            annual_salary: round2(analysis.annual_salary),
            max_salary_percentage: caps.policy.max_salary_percentage_cap,
            max_monthly_based_on_salary: round2(caps.monthly_from_salary),
            max_annual_based_on_salary: round2(caps.annual_from_salary),
            is_match_limited_by_salary_cap: monthly >= caps.monthly_from_salary - 0.01,
        },
        conversion_info: ConversionInfo {
            original_currency: analysis.original_currency.clone(),
            original_loan_amount: round2(analysis.original_loan_amount),
            exchange_rate: analysis.exchange_rate.map(|r| (r * 10_000.0).round() / 10_000.0),
            all_calculations_in_usd: true,
        },
    }
}

pub fn dashboard_data(rec: &Recommendation, projections: &FinancialProjections) -> DashboardData {
    DashboardData {
        program_approval: json!({
            "status": "Pending",
            "matchPercentage": rec.match_percentage,
            "maxAnnualMatch": rec.annual_match_usd,
            "policyCompliant": true,
            "capApplied": rec.cap_applied,
        }),
        current_period_progress: json!({
            "currentMonth": Utc::now().format("%B %Y").to_string(),
            "monthlyMatchEarned": 0,
            "monthlyMatchPending": rec.monthly_match_usd,
            "ytdMatchEarned": 0,
            "nextPaymentDate": "Pending enrollment",
        }),
        progress_metrics: json!({
            "annualLimitUsed": 0,
            "annualLimitRemaining": rec.annual_match_usd,
            "percentOfLimitUsed": 0,
            "onTrackForMaxMatch": true,
            "projectedYearEndTotal": rec.annual_match_usd,
        }),
        financial_health: json!({
            "healthScore": rec.financial_health_score.unwrap_or(70.0),
            "riskLevel": rec.risk_assessment,
            "debtToIncomeRatio": projections.debt_to_income_impact.before_match,
            "improvementWithMatch": projections.debt_to_income_impact.improvement,
        }),
        retirement_projection: json!({
            "value10Years": projections.annual_summary.retirement_value_10_years,
            "value20Years": projections.annual_summary.retirement_value_20_years,
            "value30Years": projections.annual_summary.retirement_value_30_years,
        }),
        salary_cap_info: projections.salary_cap_info.clone(),
    }
}

pub fn next_steps(rec: &Recommendation) -> Vec<String> {
    let mut steps = vec![
        format!(
            "Admin to review and approve {}% match recommendation",
            rec.match_percentage
        ),
        "Employee to enroll in SECURE 2.0 student loan match program".to_string(),
        format!(
            "Set up automatic loan payment verification (${:.2}/month)",
            rec.monthly_match_usd
        ),
        "Complete 401(k) retirement plan enrollment if not already enrolled".to_string(),
        "Link student loan servicer account for automated payment verification".to_string(),
        "Review and acknowledge program terms and conditions".to_string(),
        "First match contribution expected within 2-3 pay periods after approval".to_string(),
    ];
    if !rec.recommendations.is_empty() {
        steps.push("--- Additional Financial Recommendations ---".to_string());
        steps.extend(rec.recommendations.iter().take(3).cloned());
    }
    steps
}

//
// ================= Calculate-match flow =================
//

/// Runs a full calculate-match invocation.
pub struct MatchAdvisor {
    engine: RecommendationEngine,
    converter: CurrencyConverter,
    profiles: Arc<dyn ProfileStore>,
}

impl MatchAdvisor {
    pub fn new(engine: RecommendationEngine, converter: CurrencyConverter, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            engine,
            converter,
            profiles,
        }
    }

    pub async fn calculate(&self, request: MatchRequest) -> crate::Result<MatchOutcome> {
        let validated = request.validate()?;
        info!(asu_id = %validated.asu_id, "Processing match recommendation");

        let (_, exchange_rate) = self
            .converter
            .convert(validated.facts.loan_amount, &validated.facts.loan_currency, "USD")
            .await;
        let analysis = MatchAnalysis::new(validated.facts.clone(), validated.policy, exchange_rate);
        info!(
            loan_usd = analysis.loan_amount_usd,
            emi = analysis.monthly_installment,
            dti = analysis.debt_to_income,
            "Financial summary computed"
        );

        let input = prompt_input(&validated, &analysis);
        let (recommendation, source) = self.engine.recommend(&analysis, &input).await?;
        info!(
            "Recommendation ({}): {}% match, ${:.2}/month",
            source, recommendation.match_percentage, recommendation.monthly_match_usd
        );

        let financial_projections = projections(&analysis, &recommendation);
        let dashboard = dashboard_data(&recommendation, &financial_projections);
        let now = Utc::now();

        let outcome = MatchOutcome {
            asu_id: validated.asu_id.clone(),
            timestamp: now,
            next_steps: next_steps(&recommendation),
            approval_status: "Pending".to_string(),
            metadata: MatchMetadata {
                exchange_rate: financial_projections.conversion_info.exchange_rate,
                calculation_date: now,
                calculation_currency: "USD".to_string(),
                original_loan_currency: analysis.original_currency.clone(),
                original_loan_amount: analysis.original_loan_amount,
                converted_loan_amount_usd: round2(analysis.loan_amount_usd),
                salary_cap_percentage: analysis.caps.policy.max_salary_percentage_cap,
                recommendation_source: source.to_string(),
                version: METADATA_VERSION.to_string(),
            },
            recommendation,
            financial_projections,
            dashboard_data: dashboard,
        };

        if let Err(e) = save_outcome(self.profiles.as_ref(), &validated, &outcome).await {
            error!(asu_id = %validated.asu_id, "Failed to save recommendation to profile: {}", e);
        }

        Ok(outcome)
    }
}

/// Appends the outcome to the profile's history, creating the profile when
/// it does not exist yet.
pub async fn save_outcome(
    profiles: &dyn ProfileStore,
    request: &ValidatedMatch,
    outcome: &MatchOutcome,
) -> crate::Result<()> {
    let record = RecommendationRecord {
        timestamp: outcome.timestamp,
        recommendation: outcome.recommendation.clone(),
        financial_projections: outcome.financial_projections.clone(),
        dashboard_data: outcome.dashboard_data.clone(),
        metadata: outcome.metadata.clone(),
        status: "Pending".to_string(),
    };
    let loan_json = serde_json::to_value(&request.loan)?;
    let salary_json = serde_json::to_value(&request.salary)?;
    let debt = FactValue::Text(request.facts.loan_amount.to_string());
    let rate = FactValue::Number(request.facts.interest_rate_percent);
    let period = FactValue::Text(request.facts.tenure_years.to_string());
    let salary = FactValue::Number(request.facts.monthly_salary_usd);

    match profiles.get(&request.asu_id).await? {
        Some(existing) => {
            let mut history = existing.recommendations;
            history.push(record.clone());
            let update = ProfileUpdate::new()
                .set("recommendations", &history)?
                .set("latestRecommendation", &record)?
                .set("loanApplication", &loan_json)?
                .set("salaryVerification", &salary_json)?
                .set("debtAmount", &debt)?
                .set("interestRate", &rate)?
                .set("repaymentPeriod", &period)?
                .set("salary", &salary)?
                .set("updatedAt", &outcome.timestamp)?;
            profiles.update(&request.asu_id, update).await?;
            info!(asu_id = %request.asu_id, "Profile updated with recommendation");
        }
        None => {
            let full_name = request
                .loan
                .applicant_name
                .clone()
                .or_else(|| request.salary.employee_name.clone())
                .unwrap_or_default();
            let (first, last) = split_full_name(&full_name);

            let mut profile = UserProfile::new(request.asu_id.clone());
            profile.asu_email = Some(format!("{}@asu.edu", request.asu_id));
            profile.first_name = Some(first);
            profile.last_name = Some(last);
            profile.loan_application = Some(loan_json);
            profile.salary_verification = Some(salary_json);
            profile.debt_amount = Some(debt);
            profile.interest_rate = Some(rate);
            profile.repayment_period = Some(period);
            profile.salary = Some(salary);
            profile.recommendations = vec![record.clone()];
            profile.latest_recommendation = Some(record);
            profile.created_at = Some(outcome.timestamp);
            profile.updated_at = Some(outcome.timestamp);

            profiles.put(&profile).await?;
            info!(asu_id = %request.asu_id, "Profile created with recommendation");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmployerPolicy, FinancialFacts};
    use crate::store::memory::MemoryProfileStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedModel {
        reply: crate::Result<String>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(err: AdvisorError) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(err),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AdvisoryModel for ScriptedModel {
        async fn complete(&self, request: &ChatRequest) -> crate::Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(AdvisorError::Authentication(m)) => Err(AdvisorError::Authentication(m.clone())),
                Err(e) => Err(AdvisorError::ExternalService(e.to_string())),
            }
        }
    }

    fn scenario() -> MatchAnalysis {
        let facts = FinancialFacts {
            loan_amount: 120_000.0,
            loan_currency: "USD".into(),
            interest_rate_percent: 6.0,
            tenure_years: 10,
            monthly_salary_usd: 5000.0,
            gross_salary_usd: 6200.0,
        };
        MatchAnalysis::new(facts, EmployerPolicy::default(), None)
    }

    fn request_json() -> Value {
        json!({
            "asuId": "1234567890",
            "loanApplication": {
                "loanAmount": 120000, "interestRate": 6, "loanTenure": 10,
                "currency": "USD", "applicantName": "Jordan Lee Park"
            },
            "salaryVerification": { "netSalary": 5000, "grossSalary": 6200, "currency": "USD" }
        })
    }

    const MODEL_JSON: &str = r#"{
        "recommendedMatchPercentage": 75,
        "recommendedMonthlyMatchAmount": 280,
        "recommendedAnnualMatchAmount": 3360,
        "rationale": "Salary cap is close to binding",
        "riskAssessment": "Medium",
        "capApplied": "none",
        "recommendations": ["a", "b", "c", "d"]
    }"#;

    #[test]
    fn test_fallback_scenario() {
        let analysis = scenario();
        let rec = fallback_recommend(analysis.monthly_salary(), analysis.monthly_installment, &analysis.caps);

        assert_eq!(rec.risk_assessment, RiskLevel::High);
        assert_eq!(rec.match_percentage, 50.0);
        assert_eq!(rec.monthly_match_usd, 300.0);
        assert_eq!(rec.annual_match_usd, 3600.0);
        assert_eq!(rec.cap_applied, "salary_percentage (6.0%)");
        assert_eq!(rec.financial_health_score, Some(50.0));
    }

    #[test]
    fn test_fallback_respects_every_cap() {
        let policies = [
            EmployerPolicy::default(),
            EmployerPolicy { max_monthly_cap_usd: 100.0, ..Default::default() },
            EmployerPolicy { max_annual_cap_usd: 1200.0, ..Default::default() },
            EmployerPolicy { max_salary_percentage_cap: 50.0, ..Default::default() },
        ];
        for policy in policies {
            for (salary, emi) in [(5000.0, 1332.25), (9000.0, 400.0), (3000.0, 50.0)] {
                let caps = MatchCaps::new(policy, salary);
                let rec = fallback_recommend(salary, emi, &caps);
                assert!(rec.monthly_match_usd <= policy.max_monthly_cap_usd + 1e-9);
                assert!(rec.monthly_match_usd <= policy.max_annual_cap_usd / 12.0 + 0.005);
                assert!(rec.monthly_match_usd <= caps.monthly_from_salary + 0.005);
                assert!(rec.annual_match_usd <= rec.monthly_match_usd * 12.0 + 0.01);
            }
        }

        let caps = MatchCaps::new(EmployerPolicy { max_monthly_cap_usd: 100.0, ..Default::default() }, 5000.0);
        assert_eq!(fallback_recommend(5000.0, 1332.25, &caps).cap_applied, "monthly_policy");

        let caps = MatchCaps::new(EmployerPolicy::default(), 20_000.0);
        let rec = fallback_recommend(20_000.0, 200.0, &caps);
        assert_eq!(rec.risk_assessment, RiskLevel::Low);
        assert_eq!(rec.monthly_match_usd, 200.0);
        assert_eq!(rec.cap_applied, "none");
    }

    #[test]
    fn test_parse_strips_fences() {
        let fenced = format!("```json\n{}\n```", MODEL_JSON);
        let rec = parse_recommendation(&fenced).unwrap();
        assert_eq!(rec.match_percentage, 75.0);
        assert_eq!(rec.risk_assessment, RiskLevel::Medium);
        assert_eq!(clean_model_content("```\n{}\n```"), "{}");
    }

    #[test]
    fn test_parse_rejects_contract_violations() {
        let missing = r#"{"recommendedMatchPercentage":75,"recommendedMonthlyMatchAmount":280,"recommendedAnnualMatchAmount":3360,"rationale":"x"}"#;
        let err = parse_recommendation(missing).unwrap_err();
        assert!(err.to_string().contains("riskAssessment"));

        let wrong_type = r#"{"recommendedMatchPercentage":"75","recommendedMonthlyMatchAmount":280,"recommendedAnnualMatchAmount":3360,"rationale":"x","riskAssessment":"low"}"#;
        assert!(parse_recommendation(wrong_type).is_err());
        assert!(parse_recommendation("I think 75%").is_err());
    }

    #[test]
    fn test_enforce_caps_clamps_model_output() {
        let analysis = scenario();
        let mut rec = parse_recommendation(MODEL_JSON).unwrap();
        rec.monthly_match_usd = 450.0;
        rec.annual_match_usd = 5400.0;
        let rec = enforce_caps(rec, &analysis.caps);
        assert_eq!(rec.monthly_match_usd, 300.0);
        assert_eq!(rec.annual_match_usd, 3600.0);
        assert_eq!(rec.cap_applied, "salary_percentage (6.0%)");
    }

    #[tokio::test]
    async fn test_engine_uses_model_answer() {
        let model = ScriptedModel::replying(MODEL_JSON);
        let engine = RecommendationEngine::new(model.clone());
        let analysis = scenario();

        let (rec, source) = engine.recommend(&analysis, &json!({})).await.unwrap();
        assert_eq!(source, RecommendationSource::Model);
        assert_eq!(rec.monthly_match_usd, 280.0);

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].temperature, constants::LLM_TEMPERATURE);
        assert_eq!(seen[0].max_tokens, constants::MAX_TOKENS);
        assert!(seen[0].messages[1].content.contains("6.0% of salary"));
    }

    #[tokio::test]
    async fn test_engine_falls_back_on_missing_field() {
        let model = ScriptedModel::replying(
            r#"{"recommendedMatchPercentage":75,"recommendedMonthlyMatchAmount":280,"recommendedAnnualMatchAmount":3360,"rationale":"x"}"#,
        );
        let engine = RecommendationEngine::new(model);
        let (rec, source) = engine.recommend(&scenario(), &json!({})).await.unwrap();
        assert_eq!(source, RecommendationSource::Fallback);
        assert_eq!(rec.monthly_match_usd, 300.0);
    }

    #[tokio::test]
    async fn test_engine_failure_modes() {
        let engine = RecommendationEngine::new(ScriptedModel::failing(AdvisorError::ExternalService("503".into())));
        let (_, source) = engine.recommend(&scenario(), &json!({})).await.unwrap();
        assert_eq!(source, RecommendationSource::Fallback);

        let engine = RecommendationEngine::new(ScriptedModel::failing(AdvisorError::Authentication("no".into())));
        let err = engine.recommend(&scenario(), &json!({})).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn test_projections_and_next_steps() {
        let analysis = scenario();
        let rec = fallback_recommend(analysis.monthly_salary(), analysis.monthly_installment, &analysis.caps);
        let p = projections(&analysis, &rec);

        assert_eq!(p.annual_summary.total_loan_principal_reduction, 36_000.0);
        assert_eq!(p.annual_summary.retirement_value_10_years, round2(3600.0 * 13.18));
        assert_eq!(p.debt_to_income_impact.improvement, 6.0);
        assert!(p.debt_to_income_impact.after_match < p.debt_to_income_impact.before_match);
        assert!(p.salary_cap_info.is_match_limited_by_salary_cap);
        assert_eq!(p.tax_savings.annual_tax_benefit, 792.0);
        assert_eq!(p.conversion_info.exchange_rate, None);

        let steps = next_steps(&rec);
        assert_eq!(steps.len(), 7 + 1 + 3);
        assert_eq!(steps[7], "--- Additional Financial Recommendations ---");
        assert!(steps[2].contains("$300.00/month"));

        let dashboard = dashboard_data(&rec, &p);
        assert_eq!(dashboard.financial_health["riskLevel"], "high");
        assert_eq!(dashboard.program_approval["capApplied"], "salary_percentage (6.0%)");
    }

    #[test]
    fn test_prompt_input_shape() {
        let request: MatchRequest = serde_json::from_value(request_json()).unwrap();
        let validated = request.validate().unwrap();
        let analysis = MatchAnalysis::new(validated.facts.clone(), validated.policy, None);
        let input = prompt_input(&validated, &analysis);

        assert_eq!(input["studentLoan"]["conversionNote"], "Already in USD");
        assert_eq!(input["studentLoan"]["loanType"], "UNSECURED");
        assert_eq!(input["employerMatchPolicy"]["effectiveMonthlyLimit"], 300.0);
        assert_eq!(input["employeeFinancials"]["annualSalary"], 60000.0);
    }

    #[tokio::test]
    async fn test_calculate_creates_then_appends() {
        let profiles = Arc::new(MemoryProfileStore::default());
        let advisor = MatchAdvisor::new(
            RecommendationEngine::fallback_only(),
            CurrencyConverter::default(),
            profiles.clone(),
        );

        let request: MatchRequest = serde_json::from_value(request_json()).unwrap();
        let outcome = advisor.calculate(request.clone()).await.unwrap();
        assert_eq!(outcome.metadata.version, "2.1");
        assert_eq!(outcome.metadata.recommendation_source, "fallback");
        assert_eq!(outcome.approval_status, "Pending");

        let profile = profiles.get("1234567890").await.unwrap().unwrap();
        assert_eq!(profile.first_name.as_deref(), Some("Jordan"));
        assert_eq!(profile.last_name.as_deref(), Some("Lee Park"));
        assert_eq!(profile.asu_email.as_deref(), Some("1234567890@asu.edu"));
        assert_eq!(profile.recommendations.len(), 1);

        advisor.calculate(request).await.unwrap();
        let profile = profiles.get("1234567890").await.unwrap().unwrap();
        assert_eq!(profile.recommendations.len(), 2);
        assert_eq!(
            profile.latest_recommendation.as_ref().map(|r| r.timestamp),
            profile.recommendations.last().map(|r| r.timestamp)
        );
    }

    #[tokio::test]
    async fn test_stored_facts_reproduce_figures() {
        let profiles = Arc::new(MemoryProfileStore::default());
        let advisor = MatchAdvisor::new(
            RecommendationEngine::fallback_only(),
            CurrencyConverter::default(),
            profiles.clone(),
        );
        let request: MatchRequest = serde_json::from_value(request_json()).unwrap();
        advisor.calculate(request).await.unwrap();

        let profile = profiles.get("1234567890").await.unwrap().unwrap();
        let stored: MatchRequest = serde_json::from_value(json!({
            "asuId": profile.asu_id,
            "loanApplication": profile.loan_application,
            "salaryVerification": profile.salary_verification,
        }))
        .unwrap();
        let replayed = stored.validate().unwrap();

        let debt = match profile.debt_amount {
            Some(FactValue::Text(text)) => crate::calculator::parse_amount(&text),
            Some(FactValue::Number(n)) => Some(n),
            None => None,
        };
        assert_eq!(debt, Some(replayed.facts.loan_amount));

        let analysis = MatchAnalysis::new(replayed.facts, replayed.policy, None);
        let latest = profile.latest_recommendation.unwrap().financial_projections;
        assert_eq!(analysis.monthly_installment, latest.monthly_breakdown.loan_payment);
        assert_eq!(analysis.debt_to_income, latest.debt_to_income_impact.before_match);
        assert_eq!(analysis.monthly_installment, 1332.25);
    }

    #[tokio::test]
    async fn test_calculate_rejects_invalid_payload() {
        let advisor = MatchAdvisor::new(
            RecommendationEngine::fallback_only(),
            CurrencyConverter::default(),
            Arc::new(MemoryProfileStore::default()),
        );
        let err = advisor.calculate(MatchRequest::default()).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}

//! Core data models for the loan match advisor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::calculator::constants;
use crate::error::AdvisorError;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" | "moderate" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

// Model output is not consistent about casing ("Low", "LOW", "low").
impl<'de> Deserialize<'de> for RiskLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RiskLevel::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown risk level: {}", raw)))
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    ActionRequired,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    /// Statuses an administrator may set explicitly.
    pub fn parse_admin(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::ActionRequired => "action_required",
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

//
// ================= Calculation inputs =================
//

/// Loan and salary facts for one calculation. Amounts are in `loan_currency`
/// for the loan and USD for salaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialFacts {
    pub loan_amount: f64,
    pub loan_currency: String,
    pub interest_rate_percent: f64,
    pub tenure_years: u32,
    pub monthly_salary_usd: f64,
    pub gross_salary_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployerPolicy {
    #[serde(rename = "maxMonthlyMatchCap")]
    pub max_monthly_cap_usd: f64,
    #[serde(rename = "maxAnnualMatchCap")]
    pub max_annual_cap_usd: f64,
    pub max_salary_percentage_cap: f64,
}

impl Default for EmployerPolicy {
    fn default() -> Self {
        Self {
            max_monthly_cap_usd: constants::DEFAULT_MONTHLY_CAP_USD,
            max_annual_cap_usd: constants::DEFAULT_ANNUAL_CAP_USD,
            max_salary_percentage_cap: constants::DEFAULT_SALARY_MATCH_CAP_PERCENTAGE,
        }
    }
}

//
// ================= Calculate-match payload =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanApplication {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub loan_amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub interest_rate: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub loan_tenure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoanApplication {
    pub fn currency(&self) -> &str {
        self.currency.as_deref().unwrap_or("INR")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryVerification {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub net_salary: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub gross_salary: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub deductions: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SalaryVerification {
    pub fn currency(&self) -> &str {
        self.currency.as_deref().unwrap_or("USD")
    }
}

/// Employer policy as sent by callers: every cap optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployerPolicyInput {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub max_monthly_match_cap: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub max_annual_match_cap: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub max_salary_percentage_cap: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EmployerPolicyInput {
    pub fn resolve(&self) -> EmployerPolicy {
        let defaults = EmployerPolicy::default();
        EmployerPolicy {
            max_monthly_cap_usd: self.max_monthly_match_cap.unwrap_or(defaults.max_monthly_cap_usd),
            max_annual_cap_usd: self.max_annual_match_cap.unwrap_or(defaults.max_annual_cap_usd),
            max_salary_percentage_cap: self
                .max_salary_percentage_cap
                .unwrap_or(defaults.max_salary_percentage_cap),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    #[serde(default)]
    pub asu_id: Option<String>,
    #[serde(default)]
    pub loan_application: Option<LoanApplication>,
    #[serde(default)]
    pub salary_verification: Option<SalaryVerification>,
    #[serde(default)]
    pub employer_match_policy: Option<EmployerPolicyInput>,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedMatch {
    pub asu_id: String,
    pub loan: LoanApplication,
    pub salary: SalaryVerification,
    pub policy: EmployerPolicy,
    /// Policy keys beyond the three caps, passed through to the model.
    pub policy_extra: Map<String, Value>,
    pub facts: FinancialFacts,
}

impl MatchRequest {
    pub fn validate(self) -> crate::Result<ValidatedMatch> {
        let asu_id = self
            .asu_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid("Missing required field: asuId"))?;
        let loan = self
            .loan_application
            .ok_or_else(|| invalid("Missing required field: loanApplication"))?;
        let salary = self
            .salary_verification
            .ok_or_else(|| invalid("Missing required field: salaryVerification"))?;

        let loan_amount = require_field(loan.loan_amount, "Missing loan field: loanAmount")?;
        let interest_rate = require_field(loan.interest_rate, "Missing loan field: interestRate")?;
        let loan_tenure = require_field(loan.loan_tenure, "Missing loan field: loanTenure")?;

        for (name, value) in [
            ("loanAmount", loan_amount),
            ("interestRate", interest_rate),
            ("loanTenure", loan_tenure),
        ] {
            if value < 0.0 {
                return Err(invalid(&format!("Invalid {}: must be non-negative", name)));
            }
        }
        if interest_rate > 100.0 {
            return Err(invalid("Interest rate must be <= 100%"));
        }
        if loan_tenure > f64::from(constants::MAX_TENURE_YEARS) {
            return Err(invalid(&format!("Invalid loanTenure: must be at most {} years", constants::MAX_TENURE_YEARS)));
        }

        let net_salary = require_field(salary.net_salary, "Missing salary field: netSalary")?;
        let gross_salary = require_field(salary.gross_salary, "Missing salary field: grossSalary")?;
        for (name, value) in [("netSalary", net_salary), ("grossSalary", gross_salary)] {
            if value <= 0.0 {
                return Err(invalid(&format!("Invalid {}: must be positive", name)));
            }
        }

        if salary.currency() != "USD" {
            return Err(invalid(&format!(
                "Salary must be in USD. Received currency: {}. Please convert salary to USD before submitting.",
                salary.currency()
            )));
        }

        let policy_input = self.employer_match_policy.unwrap_or_default();
        if matches!(policy_input.max_monthly_match_cap, Some(v) if v <= 0.0) {
            return Err(invalid("maxMonthlyMatchCap must be positive"));
        }
        if matches!(policy_input.max_annual_match_cap, Some(v) if v <= 0.0) {
            return Err(invalid("maxAnnualMatchCap must be positive"));
        }
        if matches!(policy_input.max_salary_percentage_cap, Some(v) if v <= 0.0 || v > 100.0) {
            return Err(invalid("maxSalaryPercentageCap must be between 0 and 100"));
        }

        let facts = FinancialFacts {
            loan_amount,
            loan_currency: loan.currency().to_string(),
            interest_rate_percent: interest_rate,
            tenure_years: loan_tenure.trunc() as u32,
            monthly_salary_usd: net_salary,
            gross_salary_usd: gross_salary,
        };

        Ok(ValidatedMatch {
            asu_id,
            policy: policy_input.resolve(),
            policy_extra: policy_input.extra,
            loan,
            salary,
            facts,
        })
    }
}

fn invalid(message: &str) -> AdvisorError {
    AdvisorError::Validation(message.to_string())
}

fn require_field(value: Option<f64>, message: &str) -> crate::Result<f64> {
    value.ok_or_else(|| invalid(message))
}

/// Accepts `12.5`, `"12.5"` or null for numeric payload fields.
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(serde::de::Error::custom(format!("expected a number, got \"{}\"", s))),
        },
        Some(other) => Err(serde::de::Error::custom(format!("expected a number, got {}", other))),
    }
}

//
// ================= Recommendation =================
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternativeOption {
    #[serde(default)]
    pub match_percentage: Option<f64>,
    #[serde(default)]
    pub monthly_amount: Option<f64>,
    #[serde(default)]
    pub annual_amount: Option<f64>,
    #[serde(default)]
    pub pros: Option<String>,
    #[serde(default)]
    pub cons: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectedOutcomes {
    #[serde(rename = "5years", default)]
    pub five_years: Option<String>,
    #[serde(rename = "10years", default)]
    pub ten_years: Option<String>,
    #[serde(rename = "atLoanPayoff", default)]
    pub at_loan_payoff: Option<String>,
}

/// Match recommendation, either from the advisory model or the fallback rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(rename = "recommendedMatchPercentage")]
    pub match_percentage: f64,
    #[serde(rename = "recommendedMonthlyMatchAmount")]
    pub monthly_match_usd: f64,
    #[serde(rename = "recommendedAnnualMatchAmount")]
    pub annual_match_usd: f64,
    pub rationale: String,
    pub risk_assessment: RiskLevel,
    #[serde(default = "unknown_cap")]
    pub cap_applied: String,
    #[serde(default)]
    pub alternative_options: Vec<AlternativeOption>,
    #[serde(default)]
    pub financial_health_score: Option<f64>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub tax_benefits: Option<String>,
    #[serde(default)]
    pub projected_outcomes: Option<ProjectedOutcomes>,
}

fn unknown_cap() -> String {
    "unknown".to_string()
}

//
// ================= Projections & dashboard =================
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyBreakdown {
    pub net_salary: f64,
    pub loan_payment: f64,
    pub match_contribution: f64,
    pub remaining_income: f64,
    pub effective_income_after_match: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualSummary {
    pub total_match_contribution: f64,
    #[serde(rename = "projectedRetirementValue10Years")]
    pub retirement_value_10_years: f64,
    #[serde(rename = "projectedRetirementValue20Years")]
    pub retirement_value_20_years: f64,
    #[serde(rename = "projectedRetirementValue30Years")]
    pub retirement_value_30_years: f64,
    pub total_loan_principal_reduction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtToIncomeImpact {
    pub before_match: f64,
    pub after_match: f64,
    pub improvement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxSavings {
    pub annual_tax_benefit: f64,
    pub lifetime_tax_savings: f64,
    pub effective_cost_reduction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanPayoffProjection {
    #[serde(rename = "originalLoanAmountUSD")]
    pub original_loan_amount_usd: f64,
    pub original_tenure_years: u32,
    pub with_match_support: String,
    pub interest_savings: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryCapInfo {
    pub annual_salary: f64,
    pub max_salary_percentage: f64,
    pub max_monthly_based_on_salary: f64,
    pub max_annual_based_on_salary: f64,
    pub is_match_limited_by_salary_cap: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionInfo {
    pub original_currency: String,
    pub original_loan_amount: f64,
    pub exchange_rate: Option<f64>,
    #[serde(rename = "allCalculationsInUSD")]
    pub all_calculations_in_usd: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialProjections {
    pub currency: String,
    pub monthly_breakdown: MonthlyBreakdown,
    pub annual_summary: AnnualSummary,
    pub debt_to_income_impact: DebtToIncomeImpact,
    pub tax_savings: TaxSavings,
    pub loan_payoff_projection: LoanPayoffProjection,
    pub salary_cap_info: SalaryCapInfo,
    pub conversion_info: ConversionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub program_approval: Value,
    pub current_period_progress: Value,
    pub progress_metrics: Value,
    pub financial_health: Value,
    pub retirement_projection: Value,
    pub salary_cap_info: SalaryCapInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchMetadata {
    pub exchange_rate: Option<f64>,
    pub calculation_date: DateTime<Utc>,
    pub calculation_currency: String,
    pub original_loan_currency: String,
    pub original_loan_amount: f64,
    #[serde(rename = "convertedLoanAmountUSD")]
    pub converted_loan_amount_usd: f64,
    pub salary_cap_percentage: f64,
    /// "model" or "fallback"
    pub recommendation_source: String,
    pub version: String,
}

/// Full response of a calculate-match invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutcome {
    pub asu_id: String,
    pub timestamp: DateTime<Utc>,
    pub recommendation: Recommendation,
    pub financial_projections: FinancialProjections,
    pub approval_status: String,
    pub next_steps: Vec<String>,
    pub dashboard_data: DashboardData,
    pub metadata: MatchMetadata,
}

//
// ================= Profiles =================
//

/// Profile attributes that arrive either as numbers or as free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Number(n) => write!(f, "{}", n),
            FactValue::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDocuments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_doc_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_doc_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_doc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_doc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<String>,
}

impl ProfileDocuments {
    pub fn has_loan_document(&self) -> bool {
        self.loan_doc_url.is_some() || self.loan_doc_key.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRecord {
    pub timestamp: DateTime<Utc>,
    pub recommendation: Recommendation,
    pub financial_projections: FinancialProjections,
    pub dashboard_data: DashboardData,
    pub metadata: MatchMetadata,
    pub status: String,
}

/// Persisted user profile, keyed by ASU ID.
///
/// Unknown attributes written by other tools are kept in `extra` so that a
/// read-modify-write never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub asu_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asu_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debt_amount: Option<FactValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interest_rate: Option<FactValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repayment_period: Option<FactValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary: Option<FactValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_application: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_verification: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<ProfileDocuments>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<RecommendationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_recommendation: Option<RecommendationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn new(asu_id: impl Into<String>) -> Self {
        Self {
            asu_id: asu_id.into(),
            ..Default::default()
        }
    }

    pub fn has_documents(&self) -> bool {
        self.documents
            .as_ref()
            .map(ProfileDocuments::has_loan_document)
            .unwrap_or(false)
    }

    /// Serialized form with the password hash removed, for API responses.
    pub fn public_view(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("passwordHash");
            obj.insert("hasDocuments".to_string(), Value::Bool(self.has_documents()));
        }
        value
    }
}

/// Splits "First Middle Last" into ("First", "Middle Last").
pub fn split_full_name(full_name: &str) -> (String, String) {
    let mut parts = full_name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let last = parts.collect::<Vec<_>>().join(" ");
    (first, last)
}

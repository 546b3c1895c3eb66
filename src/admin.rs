//! Administrator views over user profiles
//!
//! Listing, per-user lookups, approval decisions and portfolio-wide
//! insights. Everything here reads the profile store directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::calculator::round2;
use crate::error::AdvisorError;
use crate::models::{ApprovalStatus, UserProfile};
use crate::store::{ProfileStore, ProfileUpdate};
use crate::Result;

/// Share of monthly installments the employer is assumed to match.
const MATCH_SHARE: f64 = 0.5;
const RETENTION_RATE: f64 = 0.35;
const REPLACEMENT_COST_USD: f64 = 50_000.0;
const HIGH_INTEREST_THRESHOLD: f64 = 7.0;
const REFINANCE_RATE: f64 = 5.0;
const SAVINGS_HORIZON_YEARS: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserList {
    pub count: usize,
    pub users: Vec<Value>,
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_scanned: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentLink {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentPair {
    pub loan: DocumentLink,
    pub salary: DocumentLink,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDocuments {
    pub asu_id: String,
    pub has_documents: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<DocumentPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub asu_id: String,
    pub approval_status: ApprovalStatus,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    #[serde(default)]
    pub approval_status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalUpdate {
    pub asu_id: String,
    pub approval_status: ApprovalStatus,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

//
// ================= Insights =================
//

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialStress {
    pub high_burden_count: usize,
    pub high_burden_percent: f64,
    pub manageable_count: usize,
    pub moderate_count: usize,
    pub no_debt_count: usize,
    pub total_users: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtToIncomeInsight {
    #[serde(rename = "averageDTI")]
    pub average_dti: f64,
    pub above30_count: usize,
    pub above40_count: usize,
    pub distribution: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtTotals {
    pub original_debt: f64,
    pub remaining_debt: f64,
    pub paid_off: f64,
    pub average_loan: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestSavings {
    pub high_interest_count: usize,
    pub potential_savings: f64,
    pub distribution: BTreeMap<&'static str, usize>,
    pub average_interest_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnOnInvestment {
    pub annual_cost: f64,
    pub retained_employees: usize,
    pub turnover_savings: f64,
    pub roi_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    pub financial_stress: FinancialStress,
    pub debt_to_income: DebtToIncomeInsight,
    pub total_debt: DebtTotals,
    pub interest_savings: InterestSavings,
    pub roi: ReturnOnInvestment,
}

fn as_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn average(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        round2(total / count as f64)
    }
}

/// Per-user figures feeding the insights.
struct UserFigures {
    loan_amount: f64,
    interest_rate: f64,
    dti_after_match: f64,
    remaining_balance: f64,
    monthly_emi: f64,
    repayment_status: Option<String>,
}

impl UserFigures {
    fn of(user: &UserProfile) -> Self {
        let loan = user.loan_application.as_ref();
        Self {
            loan_amount: as_number(loan.and_then(|l| l.get("loanAmount"))),
            interest_rate: as_number(loan.and_then(|l| l.get("interestRate"))),
            dti_after_match: user
                .latest_recommendation
                .as_ref()
                .map(|r| r.financial_projections.debt_to_income_impact.after_match)
                .unwrap_or(0.0),
            remaining_balance: as_number(user.extra.get("remaining_balance")),
            monthly_emi: as_number(user.extra.get("monthly_emi")),
            repayment_status: user
                .extra
                .get("repayment_status")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

pub fn compute_insights(users: &[UserProfile]) -> Insights {
    let total_users = users.len();
    let figures: Vec<UserFigures> = users.iter().map(UserFigures::of).collect();

    let count_status = |status: &str| {
        figures
            .iter()
            .filter(|f| f.repayment_status.as_deref() == Some(status))
            .count()
    };
    let high_burden = count_status("High Burden");
    let financial_stress = FinancialStress {
        high_burden_count: high_burden,
        high_burden_percent: if total_users == 0 {
            0.0
        } else {
            (high_burden as f64 / total_users as f64 * 1000.0).round() / 10.0
        },
        manageable_count: count_status("Manageable"),
        moderate_count: count_status("Moderate Burden"),
        no_debt_count: count_status("No Debt"),
        total_users,
    };

    let dti: Vec<f64> = figures.iter().map(|f| f.dti_after_match).collect();
    let count_dti = |pred: &dyn Fn(f64) -> bool| dti.iter().filter(|d| pred(**d)).count();
    let debt_to_income = DebtToIncomeInsight {
        average_dti: average(dti.iter().sum(), total_users),
        above30_count: count_dti(&|d| d > 30.0),
        above40_count: count_dti(&|d| d > 40.0),
        distribution: BTreeMap::from([
            ("<10", count_dti(&|d| d < 10.0)),
            ("10-20", count_dti(&|d| (10.0..20.0).contains(&d))),
            ("20-30", count_dti(&|d| (20.0..30.0).contains(&d))),
            ("30-40", count_dti(&|d| (30.0..40.0).contains(&d))),
            (">40", count_dti(&|d| d >= 40.0)),
        ]),
    };

    let original: f64 = figures.iter().map(|f| f.loan_amount).sum();
    let remaining: f64 = figures.iter().map(|f| f.remaining_balance).sum();
    let total_debt = DebtTotals {
        original_debt: round2(original),
        remaining_debt: round2(remaining),
        paid_off: round2(original - remaining),
        average_loan: average(original, total_users),
    };

    let rates: Vec<f64> = figures.iter().map(|f| f.interest_rate).collect();
    let count_rate = |pred: &dyn Fn(f64) -> bool| rates.iter().filter(|r| pred(**r)).count();
    let potential_savings: f64 = figures
        .iter()
        .filter(|f| f.interest_rate > HIGH_INTEREST_THRESHOLD && f.remaining_balance > 0.0)
        .map(|f| {
            f.remaining_balance * (f.interest_rate - REFINANCE_RATE) / 100.0 * SAVINGS_HORIZON_YEARS
        })
        .sum();
    let interest_savings = InterestSavings {
        high_interest_count: count_rate(&|r| r > HIGH_INTEREST_THRESHOLD),
        potential_savings: round2(potential_savings),
        distribution: BTreeMap::from([
            ("<5", count_rate(&|r| r > 0.0 && r < 5.0)),
            ("5-6", count_rate(&|r| (5.0..6.0).contains(&r))),
            ("6-7", count_rate(&|r| (6.0..7.0).contains(&r))),
            (">7", count_rate(&|r| r >= 7.0)),
        ]),
        average_interest_rate: average(rates.iter().sum(), total_users),
    };

    let annual_cost = figures.iter().map(|f| f.monthly_emi).sum::<f64>() * MATCH_SHARE * 12.0;
    let retained_employees = (high_burden as f64 * RETENTION_RATE) as usize;
    let turnover_savings = retained_employees as f64 * REPLACEMENT_COST_USD;
    let roi_percent = if annual_cost > 0.0 {
        ((turnover_savings - annual_cost) / annual_cost * 1000.0).round() / 10.0
    } else {
        0.0
    };

    Insights {
        financial_stress,
        debt_to_income,
        total_debt,
        interest_savings,
        roi: ReturnOnInvestment {
            annual_cost: round2(annual_cost),
            retained_employees,
            turnover_savings,
            roi_percent,
        },
    }
}

//
// ================= Service =================
//

pub struct AdminService {
    profiles: Arc<dyn ProfileStore>,
    table_name: String,
}

impl AdminService {
    pub fn new(profiles: Arc<dyn ProfileStore>, table_name: impl Into<String>) -> Self {
        Self {
            profiles,
            table_name: table_name.into(),
        }
    }

    async fn require(&self, asu_id: &str) -> Result<UserProfile> {
        self.profiles
            .get(asu_id)
            .await?
            .ok_or_else(|| AdvisorError::NotFound(format!("User not found: {}", asu_id)))
    }

    /// Every profile, following scan pages to the end.
    pub async fn all_profiles(&self) -> Result<(Vec<UserProfile>, usize)> {
        let mut users = Vec::new();
        let mut start_after: Option<String> = None;
        let mut pages = 0;
        loop {
            pages += 1;
            let page = self.profiles.scan(None, start_after.as_deref()).await?;
            debug!(page = pages, items = page.items.len(), "Scanned profile page");
            users.extend(page.items);
            match page.last_key {
                Some(key) => start_after = Some(key),
                None => break,
            }
        }
        Ok((users, pages))
    }

    /// Public views, profiles with documents first.
    pub async fn list_users(&self, limit: Option<usize>) -> Result<UserList> {
        let (mut profiles, pages_scanned) = match limit {
            Some(limit) => (self.profiles.scan(Some(limit), None).await?.items, None),
            None => {
                let (profiles, pages) = self.all_profiles().await?;
                (profiles, Some(pages))
            }
        };
        profiles.sort_by_key(|p| !p.has_documents());

        info!(count = profiles.len(), "Listed users");
        Ok(UserList {
            count: profiles.len(),
            users: profiles.iter().map(UserProfile::public_view).collect(),
            table_name: self.table_name.clone(),
            pages_scanned,
        })
    }

    pub async fn get_user(&self, asu_id: &str) -> Result<Value> {
        Ok(self.require(asu_id).await?.public_view())
    }

    pub async fn documents(&self, asu_id: &str) -> Result<UserDocuments> {
        let user = self.require(asu_id).await?;
        let docs = user.documents.unwrap_or_default();

        match (docs.loan_doc_url, docs.salary_doc_url) {
            (Some(loan), Some(salary)) => Ok(UserDocuments {
                asu_id: asu_id.to_string(),
                has_documents: true,
                documents: Some(DocumentPair {
                    loan: DocumentLink { url: loan },
                    salary: DocumentLink { url: salary },
                }),
                uploaded_at: docs.uploaded_at,
                message: None,
            }),
            _ => Ok(UserDocuments {
                asu_id: asu_id.to_string(),
                has_documents: false,
                documents: None,
                uploaded_at: None,
                message: Some("No documents uploaded for this user".to_string()),
            }),
        }
    }

    pub async fn status(&self, asu_id: &str) -> Result<UserStatus> {
        let user = self.require(asu_id).await?;
        Ok(UserStatus {
            asu_id: asu_id.to_string(),
            approval_status: user.approval_status.unwrap_or(ApprovalStatus::Pending),
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.asu_email,
        })
    }

    /// Only pending, approved or rejected may be set; absent means pending.
    pub async fn update_approval(&self, asu_id: &str, request: ApprovalRequest) -> Result<ApprovalUpdate> {
        let requested = request.approval_status.unwrap_or_else(|| "pending".to_string());
        let status = ApprovalStatus::parse_admin(&requested).ok_or_else(|| {
            AdvisorError::Validation(format!(
                "Invalid approval status: {}. Valid statuses: pending, approved, rejected",
                requested
            ))
        })?;

        let now = Utc::now();
        let update = ProfileUpdate::new()
            .set("approvalStatus", &status)?
            .set("updatedAt", &now)?;
        self.profiles.update(asu_id, update).await?;

        info!(asu_id, status = status.as_str(), "Approval status updated");
        Ok(ApprovalUpdate {
            asu_id: asu_id.to_string(),
            approval_status: status,
            message: format!("User approval status updated to {}", status.as_str()),
            updated_at: now,
        })
    }

    pub async fn insights(&self) -> Result<Insights> {
        let (users, _) = self.all_profiles().await?;
        Ok(compute_insights(&users))
    }
}

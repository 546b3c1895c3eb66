//! Student Loan Retirement-Match Advisor
//!
//! Recommends how much an employer should contribute to an employee's
//! retirement plan as a match on qualified student-loan payments:
//! - Deterministic financial calculations (installment, DTI, salary caps)
//! - Advisory-model recommendations with a rule-based fallback
//! - A conversational session state machine over the same figures
//! - Profile persistence, document intake and admin insights
//!
//! The advisory model is called with a service credential that is renewed
//! transparently by the token authority.

pub mod accounts;
pub mod admin;
pub mod api;
pub mod auth;
pub mod calculator;
pub mod config;
pub mod documents;
pub mod error;
pub mod llm;
pub mod models;
pub mod recommendation;
pub mod secrets;
pub mod session;
pub mod store;

pub use error::{AdvisorError, Result};

// Re-export common types
pub use config::AdvisorConfig;
pub use models::{MatchOutcome, MatchRequest, Recommendation, UserProfile};
pub use recommendation::{MatchAdvisor, RecommendationEngine};
pub use session::SessionManager;

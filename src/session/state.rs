//! Chat session states and the transition table

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Facts collected during a conversation, keyed by [`FactKey::as_str`].
pub type Facts = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Menu,
    OptAsuId,
    OptDebtAmount,
    OptRepayPeriod,
    OptInterestRate,
    OptSalary,
    OptComplete,
    ProfileAsuId,
    ProfileCollectDebt,
    ProfileCollectPeriod,
    ProfileCollectRate,
    ProfileCollectSalary,
    ProfileQuestions,
    Faq,
    /// Anything unrecognised read back from storage.
    #[serde(other)]
    Unknown,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Menu
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionContext {
    Optimization,
    Profile,
    Faq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKey {
    AsuId,
    DebtAmount,
    RepaymentPeriod,
    InterestRate,
    Salary,
}

impl FactKey {
    pub const ALL: [FactKey; 5] = [
        FactKey::AsuId,
        FactKey::DebtAmount,
        FactKey::RepaymentPeriod,
        FactKey::InterestRate,
        FactKey::Salary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactKey::AsuId => "asu_id",
            FactKey::DebtAmount => "debt_amount",
            FactKey::RepaymentPeriod => "repayment_period",
            FactKey::InterestRate => "interest_rate",
            FactKey::Salary => "salary",
        }
    }
}

pub fn has_all_facts(facts: &Facts) -> bool {
    FactKey::ALL.iter().all(|k| facts.contains_key(k.as_str()))
}

/// One data-collection step: store the input under `key`, move to `next`,
/// reply with `prompt`. `finalizes` marks the last step of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStep {
    pub key: FactKey,
    pub next: SessionState,
    pub prompt: &'static str,
    pub finalizes: bool,
}

const fn step(key: FactKey, next: SessionState, prompt: &'static str) -> CollectStep {
    CollectStep {
        key,
        next,
        prompt,
        finalizes: false,
    }
}

const fn last_step(key: FactKey, next: SessionState, prompt: &'static str) -> CollectStep {
    CollectStep {
        key,
        next,
        prompt,
        finalizes: true,
    }
}

/// What the session manager has to do for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ShowMenu,
    BeginOptimization,
    RunOptimization,
    OpenProfile,
    OpenFaq,
    Collect(CollectStep),
    LookupProfile,
    Ask(SessionContext),
}

pub fn plan(state: SessionState, input: &str, facts: &Facts) -> Action {
    use SessionState::*;

    match state {
        Menu => match input.trim() {
            "1" if has_all_facts(facts) => Action::RunOptimization,
            "1" => Action::BeginOptimization,
            "2" => Action::OpenProfile,
            "3" => Action::OpenFaq,
            _ => Action::ShowMenu,
        },
        OptAsuId => Action::Collect(step(
            FactKey::AsuId,
            OptDebtAmount,
            "What is your total student loan debt amount? (e.g., $50,000)",
        )),
        OptDebtAmount => Action::Collect(step(
            FactKey::DebtAmount,
            OptRepayPeriod,
            "How many years do you have to repay your loans? (e.g., 10 years)",
        )),
        OptRepayPeriod => Action::Collect(step(
            FactKey::RepaymentPeriod,
            OptInterestRate,
            "What is your interest rate on the loan? (e.g., 5.5%)",
        )),
        OptInterestRate => Action::Collect(step(
            FactKey::InterestRate,
            OptSalary,
            "What is your annual salary? (e.g., $65,000)",
        )),
        // the reply comes from the advisory model
        OptSalary => Action::Collect(last_step(FactKey::Salary, OptComplete, "")),
        ProfileAsuId => Action::LookupProfile,
        ProfileCollectDebt => Action::Collect(step(
            FactKey::DebtAmount,
            ProfileCollectPeriod,
            "How many years do you have to repay?",
        )),
        ProfileCollectPeriod => Action::Collect(step(
            FactKey::RepaymentPeriod,
            ProfileCollectRate,
            "What is your interest rate?",
        )),
        ProfileCollectRate => Action::Collect(step(
            FactKey::InterestRate,
            ProfileCollectSalary,
            "What is your annual salary?",
        )),
        ProfileCollectSalary => Action::Collect(last_step(
            FactKey::Salary,
            ProfileQuestions,
            "Profile created! What would you like to know?",
        )),
        OptComplete => Action::Ask(SessionContext::Optimization),
        ProfileQuestions => Action::Ask(SessionContext::Profile),
        Faq => Action::Ask(SessionContext::Faq),
        Unknown => Action::ShowMenu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_facts() -> Facts {
        FactKey::ALL
            .iter()
            .map(|k| (k.as_str().to_string(), "x".to_string()))
            .collect()
    }

    #[test]
    fn test_menu_transitions() {
        let empty = Facts::new();
        assert_eq!(plan(SessionState::Menu, " 1 ", &empty), Action::BeginOptimization);
        assert_eq!(plan(SessionState::Menu, "1", &full_facts()), Action::RunOptimization);
        assert_eq!(plan(SessionState::Menu, "2", &empty), Action::OpenProfile);
        assert_eq!(plan(SessionState::Menu, "3", &empty), Action::OpenFaq);
        assert_eq!(plan(SessionState::Menu, "hello", &empty), Action::ShowMenu);
    }

    #[test]
    fn test_optimization_sequence_is_linear() {
        let facts = Facts::new();
        let mut state = SessionState::OptAsuId;
        let mut keys = Vec::new();
        loop {
            match plan(state, "value", &facts) {
                Action::Collect(step) => {
                    keys.push(step.key);
                    state = step.next;
                    if step.finalizes {
                        break;
                    }
                }
                other => panic!("unexpected action {:?}", other),
            }
        }
        assert_eq!(keys, FactKey::ALL.to_vec());
        assert_eq!(state, SessionState::OptComplete);
    }

    #[test]
    fn test_profile_collection_ends_in_questions() {
        match plan(SessionState::ProfileCollectSalary, "65000", &Facts::new()) {
            Action::Collect(step) => {
                assert!(step.finalizes);
                assert_eq!(step.next, SessionState::ProfileQuestions);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_unknown_state_shows_menu() {
        let state: SessionState = serde_json::from_str("\"SOMETHING_ELSE\"").unwrap();
        assert_eq!(state, SessionState::Unknown);
        assert_eq!(plan(state, "1", &Facts::new()), Action::ShowMenu);

        let state: SessionState = serde_json::from_str("\"OPT_ASU_ID\"").unwrap();
        assert_eq!(state, SessionState::OptAsuId);
    }
}

//! Chat sessions for the conversational advisor
//!
//! A session is a small state machine (see [`state`]) persisted between
//! messages. Steady states forward each message, with recent history and
//! the collected facts, to the advisory model.

pub mod history;
pub mod state;

pub use history::{ChatTurn, ConversationHistory, TurnRole};
pub use state::{plan, Action, CollectStep, FactKey, Facts, SessionContext, SessionState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::calculator::{constants, debt_to_income_ratio, monthly_installment, parse_amount, round2};
use crate::llm::{AdvisoryModel, ChatMessage, ChatRequest};
use crate::models::{FactValue, UserProfile};
use crate::store::{ConnectionRecord, ProfileStore, ProfileUpdate, SessionStore};
use crate::Result;

pub const HISTORY_WINDOW: usize = 15;
pub const CHAT_TEMPERATURE: f32 = 0.7;
pub const CHAT_MAX_TOKENS: u32 = 3000;
pub const CHAT_TIMEOUT_SECS: u64 = 60;

pub const MENU_TEXT: &str = "Welcome to ASU Student Loan Repayment Advisor! Please select an option:

1. Suggest best plans for maximum retirement savings
   Get a personalized optimization plan to clear student loans while building retirement savings

2. Ask questions based on my personal profile
   Get answers about your match earnings, payment history, and personalized recommendations

3. General information & FAQs
   Learn about employer match, SECURE 2.0, eligibility, and more

Reply with the number (1, 2, or 3) to continue.";

pub const APOLOGY_TEXT: &str =
    "I apologize, but I'm experiencing technical difficulties. Please try again.";
pub const SESSION_NOT_FOUND_TEXT: &str =
    "Session not found. Please reconnect to start a new session.";
pub const NO_ACTIVE_SESSION_TEXT: &str =
    "No active session. Please send {\"action\": \"start\"} first.";

const FAQ_INTRO_PROMPT: &str = "Provide a brief overview of ASU's Student Loan Repayment Match Program and SECURE 2.0, then ask what specific information the user wants to know.";

fn system_prompt(context: Option<SessionContext>) -> &'static str {
    match context {
        Some(SessionContext::Optimization) => {
            "You are a financial optimization specialist for ASU employees balancing student loan repayment with retirement savings under the Student Loan Repayment Match Program.

Every plan you write must include:
1. A monthly budget breakdown
2. A loan payoff timeline
3. Retirement savings projections
4. Tax strategies
5. An employer match plan
6. Emergency fund guidance
7. Concrete action steps with deadlines

Use the employee's figures exactly and show your arithmetic."
        }
        Some(SessionContext::Profile) => {
            "You are a personalized assistant for ASU's Student Loan Repayment Match Program. Answer questions using the employee's profile data below and quote exact numbers from it. If a figure is missing, say so instead of guessing."
        }
        Some(SessionContext::Faq) => {
            "You are an expert on ASU's Student Loan Repayment Match Program and the SECURE 2.0 Act. Explain eligibility, how qualified student loan payments earn an employer retirement match, contribution limits and enrollment steps in clear, concise language."
        }
        None => "You are a helpful financial advisor for ASU's Student Loan Repayment Match Program.",
    }
}

/// A persisted chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub connection_id: String,
    #[serde(default)]
    pub history: ConversationHistory,
    #[serde(default)]
    pub state: SessionState,
    #[serde(default)]
    pub user_data: Facts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<SessionContext>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            connection_id: connection_id.into(),
            history: ConversationHistory::new(),
            state: SessionState::Menu,
            user_data: Facts::new(),
            context: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn fact(&self, key: FactKey) -> Option<&str> {
        self.user_data.get(key.as_str()).map(String::as_str)
    }

    fn set_fact(&mut self, key: FactKey, value: impl Into<String>) {
        self.user_data.insert(key.as_str().to_string(), value.into());
    }

    /// Additive merge of caller-supplied facts; same-named keys are overwritten.
    pub fn merge_user_data(&mut self, provided: &Value) {
        let Some(obj) = provided.as_object() else {
            return;
        };
        for (key, value) in obj {
            let text = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.user_data.insert(key.clone(), text);
        }
    }
}

/// Reply sent back over the chat surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatReply {
    SessionStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: String,
    },
    Response {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ChatReply {
    pub fn is_error(&self) -> bool {
        matches!(self, ChatReply::Error { .. })
    }
}

/// Numeric view of the free-text facts, when every figure parses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedFacts {
    pub debt: f64,
    pub years: u32,
    pub rate_percent: f64,
    pub annual_salary: f64,
}

impl ParsedFacts {
    pub fn from_facts(facts: &Facts) -> Option<Self> {
        let get = |key: FactKey| {
            facts
                .get(key.as_str())
                .and_then(|v| parse_amount(v))
                .filter(|v| v.is_finite())
        };
        let years = get(FactKey::RepaymentPeriod)?.round();
        if years > f64::from(constants::MAX_TENURE_YEARS) {
            return None;
        }
        Some(Self {
            debt: get(FactKey::DebtAmount)?,
            years: years as u32,
            rate_percent: get(FactKey::InterestRate)?,
            annual_salary: get(FactKey::Salary)?,
        })
    }

    /// Deterministic figures appended to the optimization prompt.
    pub fn summary(&self) -> String {
        let emi = monthly_installment(self.debt, self.rate_percent, self.years);
        let dti = debt_to_income_ratio(emi, self.annual_salary / 12.0);
        format!(
            "Calculated figures:\n- Estimated monthly loan payment: ${:.2}\n- Monthly gross income: ${:.2}\n- Debt-to-income ratio: {:.2}%",
            emi,
            round2(self.annual_salary / 12.0),
            dti
        )
    }
}

fn fact_line(facts: &Facts, key: FactKey) -> &str {
    facts.get(key.as_str()).map(String::as_str).unwrap_or("N/A")
}

fn optimization_prompt(facts: &Facts, month_by_month: bool) -> String {
    let header = if month_by_month {
        "Based on this employee's data, create a detailed month-by-month optimization plan:"
    } else {
        "Based on this employee's data, create a detailed optimization plan:"
    };
    let footer = if month_by_month {
        "Provide:\n1. Monthly budget breakdown\n2. Loan payoff schedule\n3. Retirement savings plan\n4. Employer match strategy\n5. Tax optimization tips\n6. Specific action steps"
    } else {
        "Provide specific monthly budget and timeline."
    };

    let mut prompt = format!(
        "{}\n\nASU ID: {}\nStudent Loan Debt: {}\nRepayment Period: {}\nInterest Rate: {}\nAnnual Salary: {}\n\n",
        header,
        fact_line(facts, FactKey::AsuId),
        fact_line(facts, FactKey::DebtAmount),
        fact_line(facts, FactKey::RepaymentPeriod),
        fact_line(facts, FactKey::InterestRate),
        fact_line(facts, FactKey::Salary),
    );
    if let Some(parsed) = ParsedFacts::from_facts(facts) {
        prompt.push_str(&parsed.summary());
        prompt.push_str("\n\n");
    }
    prompt.push_str(footer);
    prompt
}

fn profile_value(value: &Option<FactValue>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

/// Drives chat sessions against the session and profile stores.
pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    profiles: Arc<dyn ProfileStore>,
    model: Arc<dyn AdvisoryModel>,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        profiles: Arc<dyn ProfileStore>,
        model: Arc<dyn AdvisoryModel>,
    ) -> Self {
        Self {
            sessions,
            profiles,
            model,
        }
    }

    pub async fn connect(&self, connection_id: &str) -> Result<()> {
        info!(connection_id, "Chat connection opened");
        self.sessions
            .put_connection(&ConnectionRecord {
                connection_id: connection_id.to_string(),
                session_id: None,
                connected_at: Utc::now(),
            })
            .await
    }

    /// Deletes the linked session, then the connection.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        if let Some(connection) = self.sessions.get_connection(connection_id).await? {
            if let Some(session_id) = connection.session_id {
                self.sessions.delete_session(&session_id).await?;
                info!(connection_id, session_id = %session_id, "Session deleted");
            }
        }
        self.sessions.delete_connection(connection_id).await
    }

    /// Creates a fresh session in `MENU` and links it to the connection.
    pub async fn start(&self, connection_id: &str) -> Result<ChatReply> {
        let now = Utc::now();
        let session_id = format!("session_{}.{:06}", now.timestamp(), now.timestamp_subsec_micros());
        let session = SessionRecord::new(&session_id, connection_id);
        self.sessions.put_session(&session).await?;
        self.sessions
            .put_connection(&ConnectionRecord {
                connection_id: connection_id.to_string(),
                session_id: Some(session_id.clone()),
                connected_at: now,
            })
            .await?;

        info!(connection_id, session_id = %session_id, "Session started");
        Ok(ChatReply::SessionStarted {
            session_id,
            message: MENU_TEXT.to_string(),
        })
    }

    /// Routes one chat message for a connection.
    pub async fn handle_message(
        &self,
        connection_id: &str,
        message: &str,
        user_data: Option<&Value>,
    ) -> Result<ChatReply> {
        let session_id = self
            .sessions
            .get_connection(connection_id)
            .await?
            .and_then(|c| c.session_id);
        let Some(session_id) = session_id else {
            return Ok(ChatReply::Error {
                message: NO_ACTIVE_SESSION_TEXT.to_string(),
            });
        };

        let reply = self.handle_flow(&session_id, message, user_data).await?;
        Ok(ChatReply::Response {
            message: reply,
            timestamp: Utc::now(),
        })
    }

    /// Runs one state transition and returns the reply text.
    pub async fn handle_flow(&self, session_id: &str, message: &str, user_data: Option<&Value>) -> Result<String> {
        let Some(mut session) = self.sessions.get_session(session_id).await? else {
            warn!(session_id, "Session not found");
            return Ok(SESSION_NOT_FOUND_TEXT.to_string());
        };

        if let Some(provided) = user_data {
            session.merge_user_data(provided);
        }

        let input = message.trim();
        let action = plan(session.state, input, &session.user_data);
        debug!(session_id, state = ?session.state, action = ?action, "Session transition");

        let reply = match action {
            Action::ShowMenu => MENU_TEXT.to_string(),
            Action::BeginOptimization => {
                session.state = SessionState::OptAsuId;
                session.context = Some(SessionContext::Optimization);
                "Great! Let's create your personalized retirement optimization plan.\n\nFirst, please provide your ASU ID:".to_string()
            }
            Action::RunOptimization => {
                session.state = SessionState::OptComplete;
                session.context = Some(SessionContext::Optimization);
                self.persist_facts(&session.user_data).await;
                let prompt = optimization_prompt(&session.user_data, true);
                self.ask(&mut session, &prompt).await
            }
            Action::OpenProfile => self.open_profile(&mut session).await,
            Action::OpenFaq => {
                session.state = SessionState::Faq;
                session.context = Some(SessionContext::Faq);
                self.ask(&mut session, FAQ_INTRO_PROMPT).await
            }
            Action::LookupProfile => self.lookup_profile(&mut session, input).await,
            Action::Collect(step) => {
                session.set_fact(step.key, input);
                session.state = step.next;
                if !step.finalizes {
                    step.prompt.to_string()
                } else {
                    self.persist_facts(&session.user_data).await;
                    if step.next == SessionState::OptComplete {
                        let prompt = optimization_prompt(&session.user_data, false);
                        self.ask(&mut session, &prompt).await
                    } else {
                        session.context = Some(SessionContext::Profile);
                        step.prompt.to_string()
                    }
                }
            }
            Action::Ask(context) => {
                session.context = Some(context);
                self.ask(&mut session, input).await
            }
        };

        session.updated_at = Utc::now();
        if let Err(error) = self.sessions.put_session(&session).await {
            warn!(session_id, error = %error, "Failed to save session");
        }
        Ok(reply)
    }

    async fn load_profile(&self, asu_id: &str) -> Option<UserProfile> {
        match self.profiles.get(asu_id).await {
            Ok(profile) => profile,
            Err(error) => {
                warn!(asu_id, error = %error, "Profile lookup failed");
                None
            }
        }
    }

    async fn open_profile(&self, session: &mut SessionRecord) -> String {
        session.context = Some(SessionContext::Profile);

        let Some(asu_id) = session.fact(FactKey::AsuId).map(str::to_string) else {
            session.state = SessionState::ProfileAsuId;
            return "I'll help answer questions based on your profile.\n\nPlease provide your ASU ID:".to_string();
        };

        match self.load_profile(&asu_id).await {
            Some(profile) => {
                copy_profile_facts(session, &profile);
                session.state = SessionState::ProfileQuestions;
                format!(
                    "Found your profile!\n- ASU ID: {}\n- Debt Amount: {}\n- Salary: {}\n- Interest Rate: {}\n\nWhat would you like to know? You can ask:\n- How much match have I earned this year?\n- When is my next payment due?\n- Should I pay extra or invest more in 401(k)?\n- What's the fastest way to pay off my debt?",
                    asu_id,
                    fact_line(&session.user_data, FactKey::DebtAmount),
                    fact_line(&session.user_data, FactKey::Salary),
                    fact_line(&session.user_data, FactKey::InterestRate),
                )
            }
            None => {
                session.state = SessionState::ProfileCollectDebt;
                format!(
                    "I don't have a profile for ASU ID: {}. Let's create one.\n\nWhat is your total student loan debt?",
                    asu_id
                )
            }
        }
    }

    async fn lookup_profile(&self, session: &mut SessionRecord, asu_id: &str) -> String {
        session.user_data = Facts::new();
        session.set_fact(FactKey::AsuId, asu_id);

        match self.load_profile(asu_id).await {
            Some(profile) => {
                copy_profile_facts(session, &profile);
                session.state = SessionState::ProfileQuestions;
                format!(
                    "Found your profile! Here's what I have:\n- Debt Amount: {}\n- Salary: {}\n\nWhat would you like to know?",
                    fact_line(&session.user_data, FactKey::DebtAmount),
                    fact_line(&session.user_data, FactKey::Salary),
                )
            }
            None => {
                session.state = SessionState::ProfileCollectDebt;
                "I don't have a profile for this ASU ID. Let's create one.\n\nWhat is your total student loan debt?".to_string()
            }
        }
    }

    /// Saves the collected facts on the profile; best-effort.
    async fn persist_facts(&self, facts: &Facts) {
        let Some(asu_id) = facts.get(FactKey::AsuId.as_str()) else {
            return;
        };

        let result = async {
            let text = |key: FactKey| facts.get(key.as_str()).cloned().map(FactValue::Text);
            match self.profiles.get(asu_id).await? {
                Some(_) => {
                    let mut update = ProfileUpdate::new().set("updatedAt", &Utc::now())?;
                    for (attribute, key) in [
                        ("debtAmount", FactKey::DebtAmount),
                        ("repaymentPeriod", FactKey::RepaymentPeriod),
                        ("interestRate", FactKey::InterestRate),
                        ("salary", FactKey::Salary),
                    ] {
                        if let Some(value) = text(key) {
                            update = update.set(attribute, &value)?;
                        }
                    }
                    self.profiles.update(asu_id, update).await
                }
                None => {
                    let now = Utc::now();
                    let mut profile = UserProfile::new(asu_id.as_str());
                    profile.debt_amount = text(FactKey::DebtAmount);
                    profile.repayment_period = text(FactKey::RepaymentPeriod);
                    profile.interest_rate = text(FactKey::InterestRate);
                    profile.salary = text(FactKey::Salary);
                    profile.created_at = Some(now);
                    profile.updated_at = Some(now);
                    self.profiles.put(&profile).await
                }
            }
        }
        .await;

        match result {
            Ok(()) => info!(asu_id = %asu_id, "Profile saved from chat"),
            Err(error) => warn!(asu_id = %asu_id, error = %error, "Failed to save profile from chat"),
        }
    }

    /// One advisory exchange; history is only extended on success.
    async fn ask(&self, session: &mut SessionRecord, message: &str) -> String {
        let mut system = system_prompt(session.context).to_string();
        if !session.user_data.is_empty() {
            system.push_str("\n\nUSER PROFILE DATA:\n");
            for (key, value) in &session.user_data {
                system.push_str(&format!("- {}: {}\n", key, value));
            }
        }

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(session.history.recent_messages(HISTORY_WINDOW));
        messages.push(ChatMessage::user(message));

        let request = ChatRequest::new(
            messages,
            CHAT_TEMPERATURE,
            CHAT_MAX_TOKENS,
            Duration::from_secs(CHAT_TIMEOUT_SECS),
        );

        match self.model.complete(&request).await {
            Ok(answer) => {
                session.history.record_exchange(message, &answer);
                answer
            }
            Err(error) => {
                warn!(session_id = %session.session_id, error = %error, "Advisory model call failed");
                APOLOGY_TEXT.to_string()
            }
        }
    }
}

fn copy_profile_facts(session: &mut SessionRecord, profile: &UserProfile) {
    session.set_fact(FactKey::DebtAmount, profile_value(&profile.debt_amount));
    session.set_fact(FactKey::Salary, profile_value(&profile.salary));
    session.set_fact(FactKey::RepaymentPeriod, profile_value(&profile.repayment_period));
    session.set_fact(FactKey::InterestRate, profile_value(&profile.interest_rate));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdvisorError;
    use crate::store::memory::{MemoryProfileStore, MemorySessionStore};
    use serde_json::json;
    use std::sync::Mutex;

    /// Echoes a fixed answer and records every request it receives.
    struct RecordingModel {
        answer: Option<String>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl RecordingModel {
        fn answering(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Some(answer.to_string()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                answer: None,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last_request(&self) -> ChatRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl AdvisoryModel for RecordingModel {
        async fn complete(&self, request: &ChatRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            self.answer
                .clone()
                .ok_or_else(|| AdvisorError::ExternalService("model unavailable".into()))
        }
    }

    struct Harness {
        manager: SessionManager,
        sessions: Arc<MemorySessionStore>,
        profiles: Arc<MemoryProfileStore>,
        model: Arc<RecordingModel>,
    }

    fn harness(model: Arc<RecordingModel>) -> Harness {
        let sessions = Arc::new(MemorySessionStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        let manager = SessionManager::new(sessions.clone(), profiles.clone(), model.clone());
        Harness {
            manager,
            sessions,
            profiles,
            model,
        }
    }

    async fn started(h: &Harness) -> String {
        h.manager.connect("conn-1").await.unwrap();
        match h.manager.start("conn-1").await.unwrap() {
            ChatReply::SessionStarted { session_id, message } => {
                assert_eq!(message, MENU_TEXT);
                session_id
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    async fn session(h: &Harness, id: &str) -> SessionRecord {
        h.sessions.get_session(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_message_without_session_is_an_error_reply() {
        let h = harness(RecordingModel::answering("ok"));
        h.manager.connect("conn-1").await.unwrap();

        let reply = h.manager.handle_message("conn-1", "1", None).await.unwrap();
        assert!(reply.is_error());
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "error");
    }

    #[tokio::test]
    async fn test_missing_session_reports_not_found() {
        let h = harness(RecordingModel::answering("ok"));
        let reply = h.manager.handle_flow("session_gone", "hello", None).await.unwrap();
        assert_eq!(reply, SESSION_NOT_FOUND_TEXT);
    }

    #[tokio::test]
    async fn test_non_menu_input_repeats_menu() {
        let h = harness(RecordingModel::answering("ok"));
        let id = started(&h).await;

        let reply = h.manager.handle_flow(&id, "what?", None).await.unwrap();
        assert_eq!(reply, MENU_TEXT);
        assert_eq!(session(&h, &id).await.state, SessionState::Menu);
        assert_eq!(h.model.calls(), 0);
    }

    #[tokio::test]
    async fn test_menu_shortcut_with_all_facts() {
        let h = harness(RecordingModel::answering("Here is your plan"));
        let id = started(&h).await;

        let facts = json!({
            "asu_id": "1234567890",
            "debt_amount": "$120,000",
            "repayment_period": "10 years",
            "interest_rate": "6%",
            "salary": "$72,000"
        });
        let reply = h.manager.handle_flow(&id, "1", Some(&facts)).await.unwrap();
        assert_eq!(reply, "Here is your plan");

        let record = session(&h, &id).await;
        assert_eq!(record.state, SessionState::OptComplete);
        assert_eq!(record.context, Some(SessionContext::Optimization));
        assert_eq!(record.history.len(), 2);

        let request = h.model.last_request();
        assert_eq!(request.temperature, CHAT_TEMPERATURE);
        assert!(request.messages[0].content.contains("USER PROFILE DATA"));
        let prompt = &request.messages.last().unwrap().content;
        assert!(prompt.contains("month-by-month"));
        assert!(prompt.contains("Estimated monthly loan payment: $1332.25"));

        let profile = h.profiles.get("1234567890").await.unwrap().unwrap();
        assert_eq!(profile.debt_amount, Some(FactValue::Text("$120,000".into())));
    }

    #[tokio::test]
    async fn test_optimization_collection_flow() {
        let h = harness(RecordingModel::answering("Plan"));
        let id = started(&h).await;

        let reply = h.manager.handle_flow(&id, "1", None).await.unwrap();
        assert!(reply.contains("provide your ASU ID"));

        let steps = [
            ("1234567890", "student loan debt amount"),
            ("$50,000", "How many years"),
            ("10 years", "interest rate"),
            ("5.5%", "annual salary"),
        ];
        for (input, expected) in steps {
            let reply = h.manager.handle_flow(&id, input, None).await.unwrap();
            assert!(reply.contains(expected), "{} -> {}", input, reply);
        }
        assert_eq!(h.model.calls(), 0);

        let reply = h.manager.handle_flow(&id, "$65,000", None).await.unwrap();
        assert_eq!(reply, "Plan");

        let record = session(&h, &id).await;
        assert_eq!(record.state, SessionState::OptComplete);
        assert_eq!(record.user_data.get("salary").map(String::as_str), Some("$65,000"));
        assert!(h.profiles.get("1234567890").await.unwrap().is_some());

        // steady state keeps answering
        h.manager.handle_flow(&id, "What about taxes?", None).await.unwrap();
        assert_eq!(session(&h, &id).await.state, SessionState::OptComplete);
        assert_eq!(h.model.calls(), 2);
    }

    #[tokio::test]
    async fn test_profile_lookup_and_creation() {
        let h = harness(RecordingModel::answering("Answer"));
        let mut existing = UserProfile::new("1111111111");
        existing.debt_amount = Some(FactValue::Number(40000.0));
        existing.password_hash = Some("hash".into());
        h.profiles.put(&existing).await.unwrap();

        let id = started(&h).await;
        h.manager.handle_flow(&id, "2", None).await.unwrap();
        assert_eq!(session(&h, &id).await.state, SessionState::ProfileAsuId);

        let reply = h.manager.handle_flow(&id, "1111111111", None).await.unwrap();
        assert!(reply.contains("Debt Amount: 40000"));
        assert!(reply.contains("Salary: N/A"));
        assert_eq!(session(&h, &id).await.state, SessionState::ProfileQuestions);

        // unknown id walks the collection steps and creates the profile
        let h = harness(RecordingModel::answering("Answer"));
        let id = started(&h).await;
        let facts = json!({"asu_id": "2222222222"});
        let reply = h.manager.handle_flow(&id, "2", Some(&facts)).await.unwrap();
        assert!(reply.contains("ASU ID: 2222222222"));
        for input in ["$30,000", "5 years", "4%"] {
            h.manager.handle_flow(&id, input, None).await.unwrap();
        }
        let reply = h.manager.handle_flow(&id, "$60,000", None).await.unwrap();
        assert_eq!(reply, "Profile created! What would you like to know?");

        let record = session(&h, &id).await;
        assert_eq!(record.state, SessionState::ProfileQuestions);
        let profile = h.profiles.get("2222222222").await.unwrap().unwrap();
        assert_eq!(profile.salary, Some(FactValue::Text("$60,000".into())));
    }

    #[tokio::test]
    async fn test_merge_keeps_password_hash() {
        let h = harness(RecordingModel::answering("Answer"));
        let mut existing = UserProfile::new("3333333333");
        existing.password_hash = Some("pbkdf2_sha256$1$a$b".into());
        h.profiles.put(&existing).await.unwrap();

        let id = started(&h).await;
        h.manager.handle_flow(&id, "1", None).await.unwrap();
        for input in ["3333333333", "$10,000", "2 years", "3%", "$50,000"] {
            h.manager.handle_flow(&id, input, None).await.unwrap();
        }

        let profile = h.profiles.get("3333333333").await.unwrap().unwrap();
        assert_eq!(profile.password_hash.as_deref(), Some("pbkdf2_sha256$1$a$b"));
        assert_eq!(profile.debt_amount, Some(FactValue::Text("$10,000".into())));
    }

    #[tokio::test]
    async fn test_model_failure_apologizes_without_history() {
        let h = harness(RecordingModel::failing());
        let id = started(&h).await;

        let reply = h.manager.handle_flow(&id, "3", None).await.unwrap();
        assert_eq!(reply, APOLOGY_TEXT);
        let record = session(&h, &id).await;
        assert_eq!(record.state, SessionState::Faq);
        assert!(record.history.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_removes_session_and_connection() {
        let h = harness(RecordingModel::answering("ok"));
        let id = started(&h).await;

        h.manager.disconnect("conn-1").await.unwrap();
        assert!(h.sessions.get_session(&id).await.unwrap().is_none());
        assert!(h.sessions.get_connection("conn-1").await.unwrap().is_none());
    }

    #[test]
    fn test_parsed_facts_need_every_figure() {
        let mut facts = Facts::new();
        facts.insert("debt_amount".into(), "$50,000".into());
        facts.insert("repayment_period".into(), "10 years".into());
        facts.insert("interest_rate".into(), "5.5%".into());
        assert!(ParsedFacts::from_facts(&facts).is_none());

        facts.insert("salary".into(), "65k".into());
        let parsed = ParsedFacts::from_facts(&facts).unwrap();
        assert_eq!(parsed.years, 10);
        assert_eq!(parsed.annual_salary, 65_000.0);

        facts.insert("repayment_period".into(), "400000000 years".into());
        assert!(ParsedFacts::from_facts(&facts).is_none());
    }

    #[tokio::test]
    async fn test_absurd_repayment_period_skips_figures() {
        let h = harness(RecordingModel::answering("Here is your plan"));
        let id = started(&h).await;

        let facts = json!({
            "asu_id": "1234567890",
            "debt_amount": "$120,000",
            "repayment_period": "400000000 years",
            "interest_rate": "6%",
            "salary": "$72,000"
        });
        let reply = h.manager.handle_flow(&id, "1", Some(&facts)).await.unwrap();
        assert_eq!(reply, "Here is your plan");

        let request = h.model.last_request();
        let prompt = &request.messages.last().unwrap().content;
        assert!(prompt.contains("400000000 years"));
        assert!(!prompt.contains("Estimated monthly loan payment"));
    }
}

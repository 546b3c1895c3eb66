//! Account signup and login

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AdvisorError;
use crate::models::{ApprovalStatus, FactValue, UserProfile};
use crate::store::{ProfileStore, ProfileUpdate};
use crate::Result;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_SIZE: usize = 16;
const HASH_SIZE: usize = 32;
const HASH_SCHEME: &str = "pbkdf2_sha256";

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 72;

//
// ================= Password hashing =================
//

/// `pbkdf2_sha256$<iterations>$<salt b64>$<hash b64>`
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    hash_with_salt(password, &salt, PBKDF2_ITERATIONS)
}

fn hash_with_salt(password: &str, salt: &[u8], iterations: u32) -> String {
    let mut derived = [0u8; HASH_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut derived);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        iterations,
        STANDARD.encode(salt),
        STANDARD.encode(derived)
    )
}

/// False for malformed hashes as well as wrong passwords.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, iterations, salt, expected] = parts.as_slice() else {
        return false;
    };
    if *scheme != HASH_SCHEME {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(expected)) = (
        iterations.parse::<u32>(),
        STANDARD.decode(salt),
        STANDARD.decode(expected),
    ) else {
        return false;
    };
    if iterations == 0 || expected.is_empty() {
        return false;
    }

    let mut derived = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut derived);
    derived
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

//
// ================= Requests =================
//

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[serde(default)]
    pub asu_id: String,
    #[serde(default)]
    pub asu_email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub debt_amount: Option<Value>,
    #[serde(default)]
    pub salary: Option<Value>,
    #[serde(default)]
    pub repayment_period: Option<Value>,
    #[serde(default)]
    pub interest_rate: Option<Value>,
}

impl SignupRequest {
    /// Every problem with the request, in field order.
    pub fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let asu_id = self.asu_id.trim();
        if asu_id.is_empty() {
            errors.push("asuId is required".to_string());
        } else if !asu_id.chars().all(char::is_alphanumeric) {
            errors.push("asuId must be alphanumeric".to_string());
        }

        let email = self.asu_email.trim();
        if !email.is_empty() && !email.ends_with("@asu.edu") {
            errors.push("asuEmail must be a valid ASU email (ending with @asu.edu)".to_string());
        }
        if self.first_name.trim().is_empty() {
            errors.push("firstName is required".to_string());
        }
        if self.last_name.trim().is_empty() {
            errors.push("lastName is required".to_string());
        }

        let length = self.password.chars().count();
        if self.password.is_empty() {
            errors.push("password is required".to_string());
        } else if length < MIN_PASSWORD_LEN {
            errors.push(format!("password must be at least {} characters long", MIN_PASSWORD_LEN));
        } else if length > MAX_PASSWORD_LEN {
            errors.push(format!("password must not exceed {} characters", MAX_PASSWORD_LEN));
        }
        errors
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub asu_id: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    pub message: String,
    pub asu_id: String,
    pub approval_status: ApprovalStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub message: String,
    pub asu_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub asu_email: Option<String>,
    pub approval_status: Option<ApprovalStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AuthOutcome {
    SignedUp(SignupResponse),
    LoggedIn(LoginResponse),
}

/// Truthy optional profile figure: non-zero number or non-empty text.
fn optional_fact(value: &Option<Value>) -> Option<FactValue> {
    match value.as_ref()? {
        Value::Number(n) => n.as_f64().filter(|v| *v != 0.0).map(FactValue::Number),
        Value::String(s) if !s.trim().is_empty() => Some(FactValue::Text(s.clone())),
        _ => None,
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| AdvisorError::Validation(format!("Invalid request: {}", e)))
}

//
// ================= Service =================
//

pub struct AccountService {
    profiles: Arc<dyn ProfileStore>,
}

impl AccountService {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }

    /// Routes `{operation: signup|login, ...}`.
    pub async fn handle(&self, body: Value) -> Result<AuthOutcome> {
        let operation = body
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        match operation.as_str() {
            "signup" => Ok(AuthOutcome::SignedUp(self.signup(parse_body(body)?).await?)),
            "login" => Ok(AuthOutcome::LoggedIn(self.login(parse_body(body)?).await?)),
            _ => Err(AdvisorError::Validation(
                "Operation must be either \"signup\" or \"login\"".into(),
            )),
        }
    }

    pub async fn signup(&self, request: SignupRequest) -> Result<SignupResponse> {
        let problems = request.problems();
        if !problems.is_empty() {
            return Err(AdvisorError::Validation(format!(
                "Validation failed: {}",
                problems.join("; ")
            )));
        }

        let asu_id = request.asu_id.trim().to_string();
        if self.profiles.get(&asu_id).await?.is_some() {
            info!(asu_id = %asu_id, "Signup rejected, profile exists");
            return Err(AdvisorError::Conflict(format!(
                "User profile for ASU ID {} already exists.",
                asu_id
            )));
        }

        let now = Utc::now();
        let email = request.asu_email.trim();
        let mut profile = UserProfile::new(asu_id.as_str());
        profile.first_name = Some(request.first_name.trim().to_string());
        profile.last_name = Some(request.last_name.trim().to_string());
        profile.asu_email = (!email.is_empty()).then(|| email.to_string());
        profile.password_hash = Some(hash_password(&request.password));
        profile.approval_status = Some(ApprovalStatus::ActionRequired);
        profile.debt_amount = optional_fact(&request.debt_amount);
        profile.salary = optional_fact(&request.salary);
        profile.repayment_period = optional_fact(&request.repayment_period);
        profile.interest_rate = optional_fact(&request.interest_rate);
        profile.created_at = Some(now);
        profile.updated_at = Some(now);

        self.profiles.put(&profile).await?;
        info!(asu_id = %asu_id, "Created user profile");

        Ok(SignupResponse {
            message: "User profile created successfully".to_string(),
            asu_id,
            approval_status: ApprovalStatus::ActionRequired,
        })
    }

    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse> {
        let asu_id = request.asu_id.trim();
        if asu_id.is_empty() {
            return Err(AdvisorError::Validation("asuId is required".into()));
        }
        if request.password.is_empty() {
            return Err(AdvisorError::Validation("password is required".into()));
        }

        let invalid = || AdvisorError::Authentication("Invalid credentials".into());
        let Some(user) = self.profiles.get(asu_id).await? else {
            info!(asu_id, "Login for unknown user");
            return Err(invalid());
        };
        let Some(stored) = user.password_hash.as_deref() else {
            warn!(asu_id, "Login for profile without password");
            return Err(AdvisorError::Authentication(
                "Account needs to be migrated. Please use signup to set a password.".into(),
            ));
        };
        if !verify_password(&request.password, stored) {
            info!(asu_id, "Invalid password");
            return Err(invalid());
        }

        let update = ProfileUpdate::new().set("lastLogin", &Utc::now())?;
        self.profiles.update(asu_id, update).await?;
        info!(asu_id, "Login successful");

        Ok(LoginResponse {
            message: "Login successful".to_string(),
            asu_id: asu_id.to_string(),
            first_name: user.first_name,
            last_name: user.last_name,
            asu_email: user.asu_email,
            approval_status: user.approval_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryProfileStore;
    use serde_json::json;

    fn service() -> (AccountService, Arc<MemoryProfileStore>) {
        let profiles = Arc::new(MemoryProfileStore::new());
        (AccountService::new(profiles.clone()), profiles)
    }

    #[test]
    fn test_hash_round_trip() {
        let hash = hash_with_salt("correct horse", b"0123456789abcdef", 1_000);
        assert!(hash.starts_with("pbkdf2_sha256$1000$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "$2b$12$legacybcrypthash"));
    }

    #[test]
    fn test_signup_problems() {
        let request = SignupRequest {
            asu_id: "12-34".into(),
            asu_email: "someone@gmail.com".into(),
            password: "short".into(),
            ..Default::default()
        };
        let problems = request.problems();
        assert_eq!(problems.len(), 5);
        assert_eq!(problems[0], "asuId must be alphanumeric");
        assert!(problems[4].contains("at least 8"));
    }

    #[tokio::test]
    async fn test_signup_then_login() {
        let (svc, profiles) = service();
        let body = json!({
            "operation": "SignUp",
            "asuId": "1234567890",
            "firstName": "Ada",
            "lastName": "Lovelace",
            "password": "analytical-engine",
            "debtAmount": 45000,
            "salary": ""
        });

        match svc.handle(body.clone()).await.unwrap() {
            AuthOutcome::SignedUp(resp) => assert_eq!(resp.approval_status, ApprovalStatus::ActionRequired),
            other => panic!("unexpected outcome {:?}", other),
        }
        let stored = profiles.get("1234567890").await.unwrap().unwrap();
        assert_eq!(stored.debt_amount, Some(FactValue::Number(45000.0)));
        assert!(stored.salary.is_none());

        let duplicate = svc.handle(body).await.unwrap_err();
        assert_eq!(duplicate.status_code(), 409);

        let login = json!({"operation": "login", "asuId": "1234567890", "password": "analytical-engine"});
        match svc.handle(login).await.unwrap() {
            AuthOutcome::LoggedIn(resp) => assert_eq!(resp.first_name.as_deref(), Some("Ada")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(profiles.get("1234567890").await.unwrap().unwrap().last_login.is_some());

        let wrong = json!({"operation": "login", "asuId": "1234567890", "password": "nope-nope"});
        assert_eq!(svc.handle(wrong).await.unwrap_err().status_code(), 401);
    }

    #[tokio::test]
    async fn test_login_edge_cases() {
        let (svc, profiles) = service();
        profiles.put(&UserProfile::new("5555555555")).await.unwrap();

        let legacy = svc
            .login(LoginRequest {
                asu_id: "5555555555".into(),
                password: "whatever1".into(),
            })
            .await
            .unwrap_err();
        assert!(legacy.to_string().contains("migrated"));

        let missing = svc.login(LoginRequest::default()).await.unwrap_err();
        assert_eq!(missing.status_code(), 400);

        let unknown = svc.handle(json!({"operation": "delete"})).await.unwrap_err();
        assert_eq!(unknown.status_code(), 400);
    }
}

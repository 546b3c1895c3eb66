//! Loan and salary document handling
//!
//! Issues pre-signed upload URLs, then runs extraction over the uploaded
//! documents and folds the extracted data into the applicant's profile.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::auth::token::hmac_sha256;
use crate::config::ObjectStoreConfig;
use crate::error::AdvisorError;
use crate::models::{split_full_name, ApprovalStatus, FactValue, ProfileDocuments, UserProfile};
use crate::store::{ProfileStore, ProfileUpdate};
use crate::Result;

/// Lifetime of the download links stored on a profile.
pub const DOWNLOAD_URL_EXPIRATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const LOAN_QUERY: &str = r#"Extract loan information as JSON:
{"loanProvider":"bank name","applicantName":"full name","sanctionedAmount":number,"loanAmount":number,
"currency":"INR/USD/EUR","interestRate":number,"loanTenure":number,"loanType":"type",
"applicationDate":"YYYY-MM-DD","disbursementDate":"YYYY-MM-DD"}"#;

pub const SALARY_QUERY: &str = r#"Extract salary information as JSON:
{"employerName":"company","employeeName":"name","month":"month year","grossSalary":number,
"deductions":number,"netSalary":number,"currency":"USD/INR","averageSalary3Months":number,
"employmentDuration":"text"}"#;

//
// ================= Object store =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMethod {
    Get,
    Put,
}

impl UrlMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlMethod::Get => "GET",
            UrlMethod::Put => "PUT",
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn default_bucket(&self) -> &str;

    async fn presign_upload(&self, bucket: &str, key: &str, content_type: &str, expires: Duration) -> Result<String>;

    async fn presign_download(&self, bucket: &str, key: &str, expires: Duration) -> Result<String>;
}

/// HMAC-signed URLs of the form
/// `<base>/<bucket>/<key>?X-Method=..&X-Expires=<unix>&X-Signature=<hex>`.
pub struct SignedUrlObjectStore {
    base_url: String,
    bucket: String,
    signing_key: Vec<u8>,
}

impl SignedUrlObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        if config.signing_key.is_empty() {
            return Err(AdvisorError::Config("OBJECT_STORE_SIGNING_KEY is not set".into()));
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            signing_key: config.signing_key.as_bytes().to_vec(),
        })
    }

    fn string_to_sign(method: &str, path: &str, expires: i64, content_type: &str) -> String {
        format!("{}\n{}\n{}\n{}", method, path, expires, content_type)
    }

    fn sign(
        &self,
        method: UrlMethod,
        bucket: &str,
        key: &str,
        content_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let mut url = Url::parse(&format!("{}/{}/{}", self.base_url, bucket, key))
            .map_err(|e| AdvisorError::Config(format!("invalid object URL: {}", e)))?;
        let expires = expires_at.timestamp();
        let payload = Self::string_to_sign(method.as_str(), url.path(), expires, content_type);
        let signature = hex::encode(hmac_sha256(&self.signing_key, payload.as_bytes())?);

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("X-Method", method.as_str());
            if !content_type.is_empty() {
                query.append_pair("X-Content-Type", content_type);
            }
            query.append_pair("X-Expires", &expires.to_string());
            query.append_pair("X-Signature", &signature);
        }
        Ok(url.to_string())
    }

    /// True when `url` carries a valid, unexpired signature for `method`.
    pub fn verify(&self, url: &str, method: UrlMethod, now: DateTime<Utc>) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };

        if param("X-Method").as_deref() != Some(method.as_str()) {
            return false;
        }
        let Some(expires) = param("X-Expires").and_then(|v| v.parse::<i64>().ok()) else {
            return false;
        };
        if expires < now.timestamp() {
            return false;
        }
        let Some(signature) = param("X-Signature").and_then(|s| hex::decode(s).ok()) else {
            return false;
        };
        let content_type = param("X-Content-Type").unwrap_or_default();

        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&self.signing_key) else {
            return false;
        };
        mac.update(Self::string_to_sign(method.as_str(), url.path(), expires, &content_type).as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

#[async_trait]
impl ObjectStore for SignedUrlObjectStore {
    fn default_bucket(&self) -> &str {
        &self.bucket
    }

    async fn presign_upload(&self, bucket: &str, key: &str, content_type: &str, expires: Duration) -> Result<String> {
        let expires_at = Utc::now() + chrono::Duration::seconds(expires.as_secs() as i64);
        self.sign(UrlMethod::Put, bucket, key, content_type, expires_at)
    }

    async fn presign_download(&self, bucket: &str, key: &str, expires: Duration) -> Result<String> {
        let expires_at = Utc::now() + chrono::Duration::seconds(expires.as_secs() as i64);
        self.sign(UrlMethod::Get, bucket, key, "", expires_at)
    }
}

//
// ================= Extraction =================
//

/// Answers a structured-extraction query over one stored document.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, bucket: &str, key: &str, query: &str) -> Result<String>;
}

/// Extraction over HTTP: POST `{bucket, key, query}`, read `{result}`.
pub struct HttpDocumentExtractor {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpDocumentExtractor {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    result: String,
}

#[async_trait]
impl DocumentExtractor for HttpDocumentExtractor {
    async fn extract(&self, bucket: &str, key: &str, query: &str) -> Result<String> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({"bucket": bucket, "key": key, "query": query}));
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", format!("Bearer {}", api_key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdvisorError::ExternalService(format!(
                "extraction service returned {}: {}",
                status, body
            )));
        }
        Ok(response.json::<ExtractionResponse>().await?.result)
    }
}

/// Drops code fences and any prose around the first `{...}` block.
pub fn clean_json_response(text: &str) -> &str {
    let text = text.trim();
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text.trim_matches('`').trim(),
    }
}

fn parse_extracted(label: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(clean_json_response(raw))
        .map_err(|e| AdvisorError::DataIntegrity(format!("{} extraction is not valid JSON: {}", label, e)))
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

fn first_number(data: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|k| number(data.get(*k)))
        .find(|n| *n != 0.0)
}

//
// ================= Service =================
//

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub upload_url: String,
    pub file_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrls {
    pub asu_id: String,
    pub loan_document: UploadTarget,
    pub salary_slips: UploadTarget,
    pub bucket: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub asu_id: Option<String>,
    pub loan_doc_key: Option<String>,
    pub salary_slips_key: Option<String>,
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLinks {
    pub loan_doc_url: String,
    pub salary_doc_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub asu_id: String,
    pub status: &'static str,
    pub action: ProcessAction,
    pub processing_time: f64,
    pub loan_application: Value,
    pub salary_verification: Value,
    pub documents: DocumentLinks,
}

pub struct DocumentService {
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn DocumentExtractor>,
    profiles: Arc<dyn ProfileStore>,
    upload_expiration: Duration,
}

impl DocumentService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn DocumentExtractor>,
        profiles: Arc<dyn ProfileStore>,
        upload_expiration: Duration,
    ) -> Self {
        Self {
            objects,
            extractor,
            profiles,
            upload_expiration,
        }
    }

    /// Pre-signed PUT URLs for the loan document and salary slips.
    pub async fn upload_urls(&self, asu_id: Option<&str>) -> Result<UploadUrls> {
        let asu_id = asu_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AdvisorError::Validation("asuId is required".into()))?;
        if asu_id.len() != 10 || !asu_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(AdvisorError::Validation(
                "Invalid asuId format. Must be 10 digits.".into(),
            ));
        }

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let bucket = self.objects.default_bucket().to_string();
        let loan_key = format!("{}/loan-{}.pdf", asu_id, stamp);
        let salary_key = format!("{}/salary-{}.pdf", asu_id, stamp);

        let loan_url = self
            .objects
            .presign_upload(&bucket, &loan_key, "application/pdf", self.upload_expiration)
            .await?;
        let salary_url = self
            .objects
            .presign_upload(&bucket, &salary_key, "application/pdf", self.upload_expiration)
            .await?;

        info!(asu_id, "Generated upload URLs");
        Ok(UploadUrls {
            asu_id: asu_id.to_string(),
            loan_document: UploadTarget {
                upload_url: loan_url,
                file_key: loan_key,
            },
            salary_slips: UploadTarget {
                upload_url: salary_url,
                file_key: salary_key,
            },
            bucket,
            expires_in: self.upload_expiration.as_secs(),
        })
    }

    /// Extracts both documents and creates or updates the profile.
    pub async fn process(&self, request: ProcessRequest) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let (Some(asu_id), Some(loan_key), Some(salary_key)) = (
            request.asu_id.filter(|s| !s.is_empty()),
            request.loan_doc_key.filter(|s| !s.is_empty()),
            request.salary_slips_key.filter(|s| !s.is_empty()),
        ) else {
            return Err(AdvisorError::Validation(
                "Missing required: asuId, loanDocKey, salarySlipsKey".into(),
            ));
        };
        let bucket = request
            .bucket
            .unwrap_or_else(|| self.objects.default_bucket().to_string());

        info!(asu_id = %asu_id, "Processing documents");
        let (loan_raw, salary_raw) = tokio::try_join!(
            self.extractor.extract(&bucket, &loan_key, LOAN_QUERY),
            self.extractor.extract(&bucket, &salary_key, SALARY_QUERY),
        )?;
        let loan_data = parse_extracted("loan", &loan_raw)?;
        let salary_data = parse_extracted("salary", &salary_raw)?;

        let loan_doc_url = self
            .objects
            .presign_download(&bucket, &loan_key, DOWNLOAD_URL_EXPIRATION)
            .await?;
        let salary_doc_url = self
            .objects
            .presign_download(&bucket, &salary_key, DOWNLOAD_URL_EXPIRATION)
            .await?;

        let now = Utc::now();
        let documents = ProfileDocuments {
            loan_doc_key: Some(loan_key),
            salary_doc_key: Some(salary_key),
            bucket: Some(bucket),
            loan_doc_url: Some(loan_doc_url.clone()),
            salary_doc_url: Some(salary_doc_url.clone()),
            uploaded_at: Some(now.to_rfc3339()),
        };
        let debt = first_number(&loan_data, &["loanAmount", "sanctionedAmount"]).map(FactValue::Number);
        let rate = number(loan_data.get("interestRate")).map(FactValue::Number);
        let period = FactValue::Number(number(loan_data.get("loanTenure")).unwrap_or(0.0) / 12.0);
        let salary = first_number(&salary_data, &["netSalary", "grossSalary"]).map(FactValue::Number);

        let existing = match self.profiles.get(&asu_id).await {
            Ok(profile) => profile,
            Err(error) => {
                warn!(asu_id = %asu_id, error = %error, "Profile lookup failed, creating new profile");
                None
            }
        };

        let action = if existing.is_some() {
            let update = ProfileUpdate::new()
                .set("approvalStatus", &ApprovalStatus::Pending)?
                .set("updatedAt", &now)?
                .set("debtAmount", &debt)?
                .set("interestRate", &rate)?
                .set("repaymentPeriod", &period)?
                .set("salary", &salary)?
                .set("loanApplication", &loan_data)?
                .set("salaryVerification", &salary_data)?
                .set("documents", &documents)?;
            self.profiles.update(&asu_id, update).await?;
            ProcessAction::Updated
        } else {
            let applicant = loan_data
                .get("applicantName")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let (first_name, last_name) = split_full_name(applicant);

            let mut profile = UserProfile::new(asu_id.as_str());
            profile.first_name = Some(first_name);
            profile.last_name = Some(last_name);
            profile.asu_email = Some(format!("{}@asu.edu", asu_id));
            profile.approval_status = Some(ApprovalStatus::Pending);
            profile.debt_amount = debt;
            profile.interest_rate = rate;
            profile.repayment_period = Some(period);
            profile.salary = salary;
            profile.loan_application = Some(loan_data.clone());
            profile.salary_verification = Some(salary_data.clone());
            profile.documents = Some(documents);
            profile.created_at = Some(now);
            profile.updated_at = Some(now);
            self.profiles.put(&profile).await?;
            ProcessAction::Created
        };

        info!(asu_id = %asu_id, action = ?action, "Documents processed");
        Ok(ProcessOutcome {
            asu_id,
            status: "success",
            action,
            processing_time: started.elapsed().as_secs_f64(),
            loan_application: loan_data,
            salary_verification: salary_data,
            documents: DocumentLinks {
                loan_doc_url,
                salary_doc_url,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryProfileStore;

    fn object_store() -> SignedUrlObjectStore {
        SignedUrlObjectStore::new(&ObjectStoreConfig {
            bucket: "loan-docs".into(),
            base_url: "http://objects.local/".into(),
            signing_key: "test-signing-key".into(),
            upload_expiration: Duration::from_secs(300),
        })
        .unwrap()
    }

    /// Answers by query type, fenced the way models tend to answer.
    struct CannedExtractor;

    #[async_trait]
    impl DocumentExtractor for CannedExtractor {
        async fn extract(&self, _bucket: &str, key: &str, _query: &str) -> Result<String> {
            if key.contains("loan") {
                Ok("Here you go:\n```json\n{\"applicantName\": \"Jane Q Doe\", \"loanAmount\": 0, \"sanctionedAmount\": \"1,200,000\", \"currency\": \"INR\", \"interestRate\": 9.5, \"loanTenure\": 120}\n```".into())
            } else {
                Ok("{\"employeeName\": \"Jane Doe\", \"netSalary\": 5200, \"grossSalary\": 6500, \"currency\": \"USD\"}".into())
            }
        }
    }

    fn service(profiles: Arc<MemoryProfileStore>) -> DocumentService {
        DocumentService::new(
            Arc::new(object_store()),
            Arc::new(CannedExtractor),
            profiles,
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_signed_urls_verify() {
        let store = object_store();
        let expires_at = Utc::now() + chrono::Duration::seconds(60);
        let url = store
            .sign(UrlMethod::Put, "loan-docs", "1234567890/loan-x.pdf", "application/pdf", expires_at)
            .unwrap();

        assert!(url.starts_with("http://objects.local/loan-docs/1234567890/loan-x.pdf?X-Method=PUT"));
        assert!(store.verify(&url, UrlMethod::Put, Utc::now()));
        assert!(!store.verify(&url, UrlMethod::Get, Utc::now()));
        assert!(!store.verify(&url, UrlMethod::Put, expires_at + chrono::Duration::seconds(1)));

        let tampered = url.replace("loan-x", "loan-y");
        assert!(!store.verify(&tampered, UrlMethod::Put, Utc::now()));
    }

    #[test]
    fn test_clean_json_response() {
        assert_eq!(clean_json_response("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(clean_json_response("Result: {\"a\": {\"b\": 2}} done"), "{\"a\": {\"b\": 2}}");
        assert_eq!(clean_json_response("no json"), "no json");
    }

    #[tokio::test]
    async fn test_upload_urls_validate_id() {
        let svc = service(Arc::new(MemoryProfileStore::new()));

        assert_eq!(svc.upload_urls(None).await.unwrap_err().status_code(), 400);
        assert_eq!(svc.upload_urls(Some("12345")).await.unwrap_err().status_code(), 400);

        let urls = svc.upload_urls(Some("1234567890")).await.unwrap();
        assert!(urls.loan_document.file_key.starts_with("1234567890/loan-"));
        assert!(urls.salary_slips.file_key.ends_with(".pdf"));
        assert_eq!(urls.bucket, "loan-docs");
        assert_eq!(urls.expires_in, 300);
    }

    #[tokio::test]
    async fn test_process_creates_then_updates_profile() {
        let profiles = Arc::new(MemoryProfileStore::new());
        let svc = service(profiles.clone());
        let request = ProcessRequest {
            asu_id: Some("1234567890".into()),
            loan_doc_key: Some("1234567890/loan-1.pdf".into()),
            salary_slips_key: Some("1234567890/salary-1.pdf".into()),
            bucket: None,
        };

        let outcome = svc.process(request.clone()).await.unwrap();
        assert_eq!(outcome.action, ProcessAction::Created);

        let profile = profiles.get("1234567890").await.unwrap().unwrap();
        assert_eq!(profile.first_name.as_deref(), Some("Jane"));
        assert_eq!(profile.last_name.as_deref(), Some("Q Doe"));
        assert_eq!(profile.approval_status, Some(ApprovalStatus::Pending));
        assert_eq!(profile.debt_amount, Some(FactValue::Number(1_200_000.0)));
        assert_eq!(profile.repayment_period, Some(FactValue::Number(10.0)));
        assert_eq!(profile.salary, Some(FactValue::Number(5200.0)));
        assert!(profile.has_documents());

        let outcome = svc.process(request).await.unwrap();
        assert_eq!(outcome.action, ProcessAction::Updated);
    }

    #[tokio::test]
    async fn test_process_requires_keys() {
        let svc = service(Arc::new(MemoryProfileStore::new()));
        let err = svc
            .process(ProcessRequest {
                asu_id: Some("1234567890".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}

//! Persistence for trial tokens, device fingerprints and the fraud audit log.
//!
//! Business logic only ever talks to [`TrialStore`]. The backend is picked once
//! by [`init`] from configuration: [`memory::MemoryStore`] keeps everything in
//! process, [`sql::SqlStore`] goes through SeaORM to SQLite or PostgreSQL.

pub mod memory;
pub mod sql;

use crate::errors::TrialError;
use crate::settings::{Backend, Database as DbCfg};
use async_trait::async_trait;
use base64ct::Encoding;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use sql::SqlStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Pending,
    Active,
    Expired,
    Revoked,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Pending => "pending",
            TrialStatus::Active => "active",
            TrialStatus::Expired => "expired",
            TrialStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TrialError> {
        match s {
            "pending" => Ok(TrialStatus::Pending),
            "active" => Ok(TrialStatus::Active),
            "expired" => Ok(TrialStatus::Expired),
            "revoked" => Ok(TrialStatus::Revoked),
            other => Err(TrialError::Other(format!("unknown trial status `{other}`"))),
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialStatus::Expired | TrialStatus::Revoked)
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TrialError> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(TrialError::Other(format!("unknown severity `{other}`"))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeTrialToken {
    pub token_id: String,
    pub user_id: String,
    pub fingerprint_hash: Option<String>,
    pub status: TrialStatus,
    pub reports_remaining: i64,
    pub activated_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub revoke_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub fingerprint_hash: String,
    pub device_data: Option<Value>,
    pub trial_count: i64,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

/// A heuristic finding that has not been written to the audit log yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFraudFlag {
    pub flag_type: String,
    pub severity: Severity,
    pub fraud_score: i64,
    pub details: Value,
}

impl NewFraudFlag {
    pub fn new(flag_type: &str, severity: Severity, fraud_score: i64, details: Value) -> Self {
        Self {
            flag_type: flag_type.to_string(),
            severity,
            fraud_score,
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudFlag {
    pub id: i64,
    pub user_id: Option<String>,
    pub fingerprint_hash: Option<String>,
    pub flag_type: String,
    pub severity: Severity,
    pub fraud_score: i64,
    pub details: Value,
    pub resolved: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub id: i64,
    pub user_id: String,
    pub card_fingerprint: String,
    pub succeeded: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialUsage {
    pub id: i64,
    pub token_id: String,
    pub user_id: String,
    pub report_id: String,
    pub used_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_name: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: Option<bool>, // None while running
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
}

/// Every read and write the trial pipeline performs.
///
/// Each method is a single row-level operation; callers must not assume that
/// a sequence of calls is transactional.
#[async_trait]
pub trait TrialStore: Send + Sync {
    // Users

    async fn create_user(&self, email: &str, now: i64) -> Result<User, TrialError>;
    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>, TrialError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, TrialError>;

    // Devices

    async fn get_device(&self, fingerprint_hash: &str) -> Result<Option<DeviceRecord>, TrialError>;
    /// Inserts the device with `trial_count = 1`, or increments the count and
    /// bumps `last_seen_at` on an existing row.
    async fn record_device_trial(
        &self,
        fingerprint_hash: &str,
        device_data: Option<&Value>,
        now: i64,
    ) -> Result<DeviceRecord, TrialError>;
    /// Marks the device blocked, recording it first if it was never seen.
    async fn block_device(
        &self,
        fingerprint_hash: &str,
        reason: &str,
        now: i64,
    ) -> Result<DeviceRecord, TrialError>;

    // Trial tokens

    async fn insert_token(&self, token: &FreeTrialToken) -> Result<(), TrialError>;
    async fn get_token(&self, token_id: &str) -> Result<Option<FreeTrialToken>, TrialError>;
    /// Most recently activated token for the user.
    async fn latest_token_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<FreeTrialToken>, TrialError>;
    async fn count_tokens_for_user(&self, user_id: &str) -> Result<u64, TrialError>;
    /// Moves a pending or active token to `status`. Returns false when the
    /// token is missing or already terminal.
    async fn transition_token(
        &self,
        token_id: &str,
        status: TrialStatus,
        reason: Option<&str>,
        now: i64,
    ) -> Result<bool, TrialError>;
    /// Decrements `reports_remaining` only while the token is active and above
    /// zero. Returns whether a report was taken.
    async fn decrement_reports(&self, token_id: &str) -> Result<bool, TrialError>;
    /// Expires active tokens whose `expires_at` is before `now`.
    async fn expire_tokens_before(&self, now: i64) -> Result<u64, TrialError>;

    // Fraud flags

    async fn insert_flags(
        &self,
        user_id: &str,
        fingerprint_hash: &str,
        flags: &[NewFraudFlag],
        now: i64,
    ) -> Result<Vec<FraudFlag>, TrialError>;
    /// Unresolved flags raised against the user or the fingerprint since `since`.
    async fn unresolved_flags_since(
        &self,
        user_id: &str,
        fingerprint_hash: &str,
        since: i64,
    ) -> Result<Vec<FraudFlag>, TrialError>;
    /// Newest first.
    async fn list_flags(
        &self,
        user_id: Option<&str>,
        unresolved_only: bool,
        limit: u64,
    ) -> Result<Vec<FraudFlag>, TrialError>;
    async fn resolve_flag(&self, flag_id: i64, now: i64) -> Result<bool, TrialError>;

    // Sessions

    async fn record_session(
        &self,
        user_id: &str,
        ip_address: &str,
        user_agent: Option<&str>,
        now: i64,
    ) -> Result<Session, TrialError>;
    async fn count_sessions_from_ip_since(
        &self,
        ip_address: &str,
        since: i64,
    ) -> Result<u64, TrialError>;
    async fn delete_sessions_before(&self, cutoff: i64) -> Result<u64, TrialError>;

    // Payment verifications

    async fn record_payment_verification(
        &self,
        user_id: &str,
        card_fingerprint: &str,
        succeeded: bool,
        now: i64,
    ) -> Result<PaymentVerification, TrialError>;
    async fn latest_successful_payment(
        &self,
        user_id: &str,
    ) -> Result<Option<PaymentVerification>, TrialError>;
    /// Distinct accounts that have ever presented this card.
    async fn count_users_with_card(&self, card_fingerprint: &str) -> Result<u64, TrialError>;

    // Usage log

    async fn record_usage(
        &self,
        token_id: &str,
        user_id: &str,
        report_id: &str,
        now: i64,
    ) -> Result<TrialUsage, TrialError>;
    /// Newest first.
    async fn recent_usage(&self, user_id: &str, limit: u64) -> Result<Vec<TrialUsage>, TrialError>;

    // Job executions

    async fn start_job_execution(&self, job_name: &str, now: i64) -> Result<i64, TrialError>;
    async fn complete_job_execution(
        &self,
        execution_id: i64,
        success: bool,
        error_message: Option<String>,
        records_processed: Option<i64>,
        now: i64,
    ) -> Result<(), TrialError>;
    /// Newest first.
    async fn list_job_executions(
        &self,
        job_name: Option<&str>,
        only_failures: bool,
        limit: u64,
    ) -> Result<Vec<JobExecution>, TrialError>;
}

/// Build the configured backend. The SQL backend applies pending migrations.
pub async fn init(cfg: &DbCfg) -> Result<Arc<dyn TrialStore>, TrialError> {
    match cfg.backend {
        Backend::Memory => {
            tracing::warn!("Using in-memory storage; trial state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        Backend::Sql => {
            let store = SqlStore::connect(&cfg.url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

pub(crate) fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

use super::{
    normalize_email, random_id, DeviceRecord, FraudFlag, FreeTrialToken, JobExecution,
    NewFraudFlag, PaymentVerification, Session, TrialStatus, TrialStore, TrialUsage, User,
};
use crate::errors::TrialError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    tokens: HashMap<String, FreeTrialToken>,
    /// Insertion order of tokens, breaks ties on `activated_at`
    token_seq: HashMap<String, i64>,
    devices: HashMap<String, DeviceRecord>,
    flags: Vec<FraudFlag>,
    sessions: Vec<Session>,
    payments: Vec<PaymentVerification>,
    usage: Vec<TrialUsage>,
    jobs: Vec<JobExecution>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store. Every operation takes the table lock once, so each
/// call is atomic the same way a single SQL statement is.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrialStore for MemoryStore {
    async fn create_user(&self, email: &str, now: i64) -> Result<User, TrialError> {
        let email = normalize_email(email);
        let mut t = self.tables.write().await;
        if t.users.values().any(|u| u.email == email) {
            return Err(TrialError::BadRequest(format!(
                "a user with email {email} already exists"
            )));
        }
        let user = User {
            user_id: random_id(),
            email,
            created_at: now,
        };
        t.users.insert(user.user_id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>, TrialError> {
        Ok(self.tables.read().await.users.get(user_id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, TrialError> {
        let email = normalize_email(email);
        let t = self.tables.read().await;
        Ok(t.users.values().find(|u| u.email == email).cloned())
    }

    async fn get_device(&self, fingerprint_hash: &str) -> Result<Option<DeviceRecord>, TrialError> {
        Ok(self.tables.read().await.devices.get(fingerprint_hash).cloned())
    }

    async fn record_device_trial(
        &self,
        fingerprint_hash: &str,
        device_data: Option<&Value>,
        now: i64,
    ) -> Result<DeviceRecord, TrialError> {
        let mut t = self.tables.write().await;
        let device = t
            .devices
            .entry(fingerprint_hash.to_string())
            .and_modify(|d| {
                d.trial_count += 1;
                d.last_seen_at = now;
                if let Some(data) = device_data {
                    d.device_data = Some(data.clone());
                }
            })
            .or_insert_with(|| DeviceRecord {
                fingerprint_hash: fingerprint_hash.to_string(),
                device_data: device_data.cloned(),
                trial_count: 1,
                is_blocked: false,
                blocked_reason: None,
                first_seen_at: now,
                last_seen_at: now,
            });
        Ok(device.clone())
    }

    async fn block_device(
        &self,
        fingerprint_hash: &str,
        reason: &str,
        now: i64,
    ) -> Result<DeviceRecord, TrialError> {
        let mut t = self.tables.write().await;
        let device = t
            .devices
            .entry(fingerprint_hash.to_string())
            .or_insert_with(|| DeviceRecord {
                fingerprint_hash: fingerprint_hash.to_string(),
                device_data: None,
                trial_count: 0,
                is_blocked: false,
                blocked_reason: None,
                first_seen_at: now,
                last_seen_at: now,
            });
        device.is_blocked = true;
        device.blocked_reason = Some(reason.to_string());
        Ok(device.clone())
    }

    async fn insert_token(&self, token: &FreeTrialToken) -> Result<(), TrialError> {
        let mut t = self.tables.write().await;
        if t.tokens.contains_key(&token.token_id) {
            return Err(TrialError::Other(format!(
                "duplicate trial token id {}",
                token.token_id
            )));
        }
        let seq = t.next_id();
        t.token_seq.insert(token.token_id.clone(), seq);
        t.tokens.insert(token.token_id.clone(), token.clone());
        Ok(())
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<FreeTrialToken>, TrialError> {
        Ok(self.tables.read().await.tokens.get(token_id).cloned())
    }

    async fn latest_token_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<FreeTrialToken>, TrialError> {
        let t = self.tables.read().await;
        Ok(t.tokens
            .values()
            .filter(|tok| tok.user_id == user_id)
            .max_by_key(|tok| {
                (
                    tok.activated_at.unwrap_or(i64::MIN),
                    t.token_seq.get(&tok.token_id).copied().unwrap_or_default(),
                )
            })
            .cloned())
    }

    async fn count_tokens_for_user(&self, user_id: &str) -> Result<u64, TrialError> {
        let t = self.tables.read().await;
        Ok(t.tokens.values().filter(|tok| tok.user_id == user_id).count() as u64)
    }

    async fn transition_token(
        &self,
        token_id: &str,
        status: TrialStatus,
        reason: Option<&str>,
        now: i64,
    ) -> Result<bool, TrialError> {
        let mut t = self.tables.write().await;
        let Some(token) = t.tokens.get_mut(token_id) else {
            return Ok(false);
        };
        if token.status.is_terminal() {
            return Ok(false);
        }
        token.status = status;
        if status == TrialStatus::Revoked {
            token.revoked_at = Some(now);
            token.revoke_reason = reason.map(str::to_string);
        }
        Ok(true)
    }

    async fn decrement_reports(&self, token_id: &str) -> Result<bool, TrialError> {
        let mut t = self.tables.write().await;
        match t.tokens.get_mut(token_id) {
            Some(token) if token.status == TrialStatus::Active && token.reports_remaining > 0 => {
                token.reports_remaining -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_tokens_before(&self, now: i64) -> Result<u64, TrialError> {
        let mut t = self.tables.write().await;
        let mut expired = 0;
        for token in t.tokens.values_mut() {
            if token.status == TrialStatus::Active && token.expires_at.is_some_and(|e| e < now) {
                token.status = TrialStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn insert_flags(
        &self,
        user_id: &str,
        fingerprint_hash: &str,
        flags: &[NewFraudFlag],
        now: i64,
    ) -> Result<Vec<FraudFlag>, TrialError> {
        let mut t = self.tables.write().await;
        let mut stored = Vec::with_capacity(flags.len());
        for flag in flags {
            let row = FraudFlag {
                id: t.next_id(),
                user_id: Some(user_id.to_string()),
                fingerprint_hash: Some(fingerprint_hash.to_string()),
                flag_type: flag.flag_type.clone(),
                severity: flag.severity,
                fraud_score: flag.fraud_score,
                details: flag.details.clone(),
                resolved: false,
                created_at: now,
                resolved_at: None,
            };
            t.flags.push(row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn unresolved_flags_since(
        &self,
        user_id: &str,
        fingerprint_hash: &str,
        since: i64,
    ) -> Result<Vec<FraudFlag>, TrialError> {
        let t = self.tables.read().await;
        Ok(t.flags
            .iter()
            .filter(|f| !f.resolved && f.created_at >= since)
            .filter(|f| {
                f.user_id.as_deref() == Some(user_id)
                    || f.fingerprint_hash.as_deref() == Some(fingerprint_hash)
            })
            .cloned()
            .collect())
    }

    async fn list_flags(
        &self,
        user_id: Option<&str>,
        unresolved_only: bool,
        limit: u64,
    ) -> Result<Vec<FraudFlag>, TrialError> {
        let t = self.tables.read().await;
        Ok(t.flags
            .iter()
            .rev()
            .filter(|f| user_id.is_none() || f.user_id.as_deref() == user_id)
            .filter(|f| !unresolved_only || !f.resolved)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn resolve_flag(&self, flag_id: i64, now: i64) -> Result<bool, TrialError> {
        let mut t = self.tables.write().await;
        match t.flags.iter_mut().find(|f| f.id == flag_id) {
            Some(flag) if !flag.resolved => {
                flag.resolved = true;
                flag.resolved_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_session(
        &self,
        user_id: &str,
        ip_address: &str,
        user_agent: Option<&str>,
        now: i64,
    ) -> Result<Session, TrialError> {
        let session = Session {
            session_id: random_id(),
            user_id: user_id.to_string(),
            ip_address: ip_address.to_string(),
            user_agent: user_agent.map(str::to_string),
            created_at: now,
        };
        self.tables.write().await.sessions.push(session.clone());
        Ok(session)
    }

    async fn count_sessions_from_ip_since(
        &self,
        ip_address: &str,
        since: i64,
    ) -> Result<u64, TrialError> {
        let t = self.tables.read().await;
        Ok(t.sessions
            .iter()
            .filter(|s| s.ip_address == ip_address && s.created_at >= since)
            .count() as u64)
    }

    async fn delete_sessions_before(&self, cutoff: i64) -> Result<u64, TrialError> {
        let mut t = self.tables.write().await;
        let before = t.sessions.len();
        t.sessions.retain(|s| s.created_at >= cutoff);
        Ok((before - t.sessions.len()) as u64)
    }

    async fn record_payment_verification(
        &self,
        user_id: &str,
        card_fingerprint: &str,
        succeeded: bool,
        now: i64,
    ) -> Result<PaymentVerification, TrialError> {
        let mut t = self.tables.write().await;
        let verification = PaymentVerification {
            id: t.next_id(),
            user_id: user_id.to_string(),
            card_fingerprint: card_fingerprint.to_string(),
            succeeded,
            created_at: now,
        };
        t.payments.push(verification.clone());
        Ok(verification)
    }

    async fn latest_successful_payment(
        &self,
        user_id: &str,
    ) -> Result<Option<PaymentVerification>, TrialError> {
        let t = self.tables.read().await;
        Ok(t.payments
            .iter()
            .filter(|p| p.user_id == user_id && p.succeeded)
            .max_by_key(|p| (p.created_at, p.id))
            .cloned())
    }

    async fn count_users_with_card(&self, card_fingerprint: &str) -> Result<u64, TrialError> {
        let t = self.tables.read().await;
        let users: HashSet<&str> = t
            .payments
            .iter()
            .filter(|p| p.card_fingerprint == card_fingerprint)
            .map(|p| p.user_id.as_str())
            .collect();
        Ok(users.len() as u64)
    }

    async fn record_usage(
        &self,
        token_id: &str,
        user_id: &str,
        report_id: &str,
        now: i64,
    ) -> Result<TrialUsage, TrialError> {
        let mut t = self.tables.write().await;
        let usage = TrialUsage {
            id: t.next_id(),
            token_id: token_id.to_string(),
            user_id: user_id.to_string(),
            report_id: report_id.to_string(),
            used_at: now,
        };
        t.usage.push(usage.clone());
        Ok(usage)
    }

    async fn recent_usage(&self, user_id: &str, limit: u64) -> Result<Vec<TrialUsage>, TrialError> {
        let t = self.tables.read().await;
        let mut rows: Vec<TrialUsage> = t
            .usage
            .iter()
            .filter(|u| u.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.used_at, b.id).cmp(&(a.used_at, a.id)));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn start_job_execution(&self, job_name: &str, now: i64) -> Result<i64, TrialError> {
        let mut t = self.tables.write().await;
        let id = t.next_id();
        t.jobs.push(JobExecution {
            id,
            job_name: job_name.to_string(),
            started_at: now,
            completed_at: None,
            success: None,
            error_message: None,
            records_processed: None,
        });
        Ok(id)
    }

    async fn complete_job_execution(
        &self,
        execution_id: i64,
        success: bool,
        error_message: Option<String>,
        records_processed: Option<i64>,
        now: i64,
    ) -> Result<(), TrialError> {
        let mut t = self.tables.write().await;
        if let Some(execution) = t.jobs.iter_mut().find(|j| j.id == execution_id) {
            execution.completed_at = Some(now);
            execution.success = Some(success);
            execution.error_message = error_message;
            execution.records_processed = records_processed;
        }
        Ok(())
    }

    async fn list_job_executions(
        &self,
        job_name: Option<&str>,
        only_failures: bool,
        limit: u64,
    ) -> Result<Vec<JobExecution>, TrialError> {
        let t = self.tables.read().await;
        Ok(t.jobs
            .iter()
            .rev()
            .filter(|j| job_name.map_or(true, |name| j.job_name == name))
            .filter(|j| !only_failures || j.success == Some(false))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Severity;
    use serde_json::json;

    fn active_token(token_id: &str, user_id: &str, remaining: i64, now: i64) -> FreeTrialToken {
        FreeTrialToken {
            token_id: token_id.to_string(),
            user_id: user_id.to_string(),
            fingerprint_hash: None,
            status: TrialStatus::Active,
            reports_remaining: remaining,
            activated_at: Some(now),
            expires_at: Some(now + 3600),
            revoked_at: None,
            revoke_reason: None,
        }
    }

    #[tokio::test]
    async fn test_user_email_lookup_is_case_insensitive() {
        let store = MemoryStore::new();
        let user = store
            .create_user("Someone@Example.com", 10)
            .await
            .expect("Failed to create user");

        let found = store
            .get_user_by_email("someone@example.COM")
            .await
            .expect("Query failed")
            .expect("User not found");
        assert_eq!(found.user_id, user.user_id);
        assert!(store.create_user("someone@example.com", 11).await.is_err());
    }

    #[tokio::test]
    async fn test_record_device_trial_inserts_then_increments() {
        let store = MemoryStore::new();
        let first = store
            .record_device_trial("fp-1", Some(&json!({"os": "linux"})), 100)
            .await
            .expect("Failed to record device");
        assert_eq!(first.trial_count, 1);
        assert_eq!(first.first_seen_at, 100);

        let second = store
            .record_device_trial("fp-1", None, 200)
            .await
            .expect("Failed to record device");
        assert_eq!(second.trial_count, 2);
        assert_eq!(second.first_seen_at, 100);
        assert_eq!(second.last_seen_at, 200);
        assert_eq!(second.device_data, Some(json!({"os": "linux"})));
    }

    #[tokio::test]
    async fn test_block_unseen_device() {
        let store = MemoryStore::new();
        let device = store
            .block_device("fp-new", "chargeback", 50)
            .await
            .expect("Failed to block device");
        assert!(device.is_blocked);
        assert_eq!(device.trial_count, 0);
        assert_eq!(device.blocked_reason.as_deref(), Some("chargeback"));
    }

    #[tokio::test]
    async fn test_latest_token_breaks_timestamp_ties_by_insertion() {
        let store = MemoryStore::new();
        for token_id in ["tok-z", "tok-a", "tok-m"] {
            store
                .insert_token(&active_token(token_id, "u1", 5, 100))
                .await
                .expect("Failed to insert token");
        }

        let latest = store
            .latest_token_for_user("u1")
            .await
            .unwrap()
            .expect("Token not found");
        assert_eq!(latest.token_id, "tok-m");
    }

    #[tokio::test]
    async fn test_unresolved_filter_applies_before_limit() {
        let store = MemoryStore::new();
        let flags: Vec<NewFraudFlag> = ["a", "b", "c"]
            .iter()
            .map(|t| NewFraudFlag::new(t, Severity::Low, 10, json!({})))
            .collect();
        let stored = store.insert_flags("u1", "fp", &flags, 100).await.unwrap();
        assert!(store.resolve_flag(stored[2].id, 200).await.unwrap());

        let open = store.list_flags(None, true, 2).await.unwrap();
        let types: Vec<&str> = open.iter().map(|f| f.flag_type.as_str()).collect();
        assert_eq!(types, vec!["b", "a"]);
        assert_eq!(store.list_flags(None, false, 2).await.unwrap()[0].flag_type, "c");
    }

    #[tokio::test]
    async fn test_decrement_stops_at_zero() {
        let store = MemoryStore::new();
        store
            .insert_token(&active_token("tok", "u1", 1, 0))
            .await
            .expect("Failed to insert token");

        assert!(store.decrement_reports("tok").await.unwrap());
        assert!(!store.decrement_reports("tok").await.unwrap());
        let token = store.get_token("tok").await.unwrap().unwrap();
        assert_eq!(token.reports_remaining, 0);
    }

    #[tokio::test]
    async fn test_transition_never_leaves_terminal_status() {
        let store = MemoryStore::new();
        store
            .insert_token(&active_token("tok", "u1", 5, 0))
            .await
            .expect("Failed to insert token");

        assert!(store
            .transition_token("tok", TrialStatus::Revoked, Some("abuse"), 10)
            .await
            .unwrap());
        assert!(!store
            .transition_token("tok", TrialStatus::Expired, None, 20)
            .await
            .unwrap());

        let token = store.get_token("tok").await.unwrap().unwrap();
        assert_eq!(token.status, TrialStatus::Revoked);
        assert_eq!(token.revoked_at, Some(10));
        assert_eq!(token.revoke_reason.as_deref(), Some("abuse"));
    }

    #[tokio::test]
    async fn test_expire_tokens_before() {
        let store = MemoryStore::new();
        store.insert_token(&active_token("old", "u1", 5, -7200)).await.unwrap();
        store.insert_token(&active_token("new", "u2", 5, 0)).await.unwrap();

        assert_eq!(store.expire_tokens_before(0).await.unwrap(), 1);
        assert_eq!(
            store.get_token("old").await.unwrap().unwrap().status,
            TrialStatus::Expired
        );
        assert_eq!(
            store.get_token("new").await.unwrap().unwrap().status,
            TrialStatus::Active
        );
    }

    #[tokio::test]
    async fn test_count_users_with_card_is_distinct() {
        let store = MemoryStore::new();
        store.record_payment_verification("u1", "card", true, 1).await.unwrap();
        store.record_payment_verification("u1", "card", true, 2).await.unwrap();
        store.record_payment_verification("u2", "card", false, 3).await.unwrap();

        assert_eq!(store.count_users_with_card("card").await.unwrap(), 2);
        let latest = store.latest_successful_payment("u1").await.unwrap().unwrap();
        assert_eq!(latest.created_at, 2);
        assert!(store.latest_successful_payment("u2").await.unwrap().is_none());
    }
}

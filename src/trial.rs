use crate::errors::TrialError;
use crate::fraud::{FraudContext, FraudEngine};
use crate::settings::{FraudPolicy, TrialPolicy};
use crate::storage::{
    random_id, FraudFlag, FreeTrialToken, NewFraudFlag, PaymentVerification, Session,
    TrialStatus, TrialStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const DAY: i64 = 24 * 3600;

/// Sessions older than this no longer feed the IP rate check and are pruned.
pub const SESSION_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct TrialActivationRequest {
    pub user_id: String,
    pub fingerprint_hash: String,
    #[serde(default)]
    pub device_data: Option<Value>,
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialGrant {
    pub token_id: String,
    pub reports_remaining: i64,
    pub expires_at: i64,
    pub fraud_score: i64,
    pub flags: Vec<NewFraudFlag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialDenial {
    pub reason: String,
    pub fraud_score: i64,
    pub flags: Vec<NewFraudFlag>,
}

/// Outcome of an activation attempt. A denial is a normal result, not an
/// error: callers need the score and flags either way.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TrialActivation {
    Granted(TrialGrant),
    Denied(TrialDenial),
}

impl TrialActivation {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TrialActivation::Granted(_))
    }

    pub fn fraud_score(&self) -> i64 {
        match self {
            TrialActivation::Granted(g) => g.fraud_score,
            TrialActivation::Denied(d) => d.fraud_score,
        }
    }

    pub fn flags(&self) -> &[NewFraudFlag] {
        match self {
            TrialActivation::Granted(g) => &g.flags,
            TrialActivation::Denied(d) => &d.flags,
        }
    }
}

/// Trial lifecycle: gated activation, metered consumption, and the
/// administrative controls around them.
#[derive(Clone)]
pub struct FreeTrialService {
    store: Arc<dyn TrialStore>,
    fraud: FraudEngine,
    policy: TrialPolicy,
}

impl FreeTrialService {
    pub fn new(store: Arc<dyn TrialStore>, trial: TrialPolicy, fraud: FraudPolicy) -> Self {
        Self {
            fraud: FraudEngine::new(store.clone(), fraud),
            store,
            policy: trial,
        }
    }

    pub fn store(&self) -> &Arc<dyn TrialStore> {
        &self.store
    }

    pub fn fraud(&self) -> &FraudEngine {
        &self.fraud
    }

    pub async fn activate_trial(
        &self,
        req: TrialActivationRequest,
    ) -> Result<TrialActivation, TrialError> {
        if req.fingerprint_hash.trim().is_empty() {
            return Err(TrialError::BadRequest(
                "fingerprint_hash must not be empty".to_string(),
            ));
        }

        let user = self
            .store
            .get_user_by_id(&req.user_id)
            .await?
            .ok_or_else(|| TrialError::UserNotFound(req.user_id.clone()))?;

        let now = Utc::now().timestamp();
        let ctx = FraudContext {
            user_id: &user.user_id,
            email: &user.email,
            fingerprint_hash: &req.fingerprint_hash,
            ip_address: &req.ip_address,
            now,
        };
        let assessment = self.fraud.calculate_fraud_score(&ctx).await?;

        // Audit trail is written whatever the outcome
        if !assessment.flags.is_empty() {
            self.store
                .insert_flags(&user.user_id, &req.fingerprint_hash, &assessment.flags, now)
                .await?;
        }

        if !assessment.allowed {
            let reason = assessment
                .reason
                .unwrap_or_else(|| "Trial activation denied".to_string());
            warn!(
                user_id = %user.user_id,
                fraud_score = assessment.total_score,
                flags = assessment.flags.len(),
                %reason,
                "Trial activation denied"
            );
            return Ok(TrialActivation::Denied(TrialDenial {
                reason,
                fraud_score: assessment.total_score,
                flags: assessment.flags,
            }));
        }

        self.store
            .record_device_trial(&req.fingerprint_hash, req.device_data.as_ref(), now)
            .await?;

        let expires_at = now + self.policy.duration_days * DAY;
        let token = FreeTrialToken {
            token_id: random_id(),
            user_id: user.user_id.clone(),
            fingerprint_hash: Some(req.fingerprint_hash.clone()),
            status: TrialStatus::Active,
            reports_remaining: self.policy.reports_per_trial,
            activated_at: Some(now),
            expires_at: Some(expires_at),
            revoked_at: None,
            revoke_reason: None,
        };
        self.store.insert_token(&token).await?;

        info!(
            user_id = %user.user_id,
            fraud_score = assessment.total_score,
            user_agent = req.user_agent.as_deref().unwrap_or("-"),
            "Trial activated"
        );

        Ok(TrialActivation::Granted(TrialGrant {
            token_id: token.token_id,
            reports_remaining: token.reports_remaining,
            expires_at,
            fraud_score: assessment.total_score,
            flags: assessment.flags,
        }))
    }

    /// Most recently activated token for the user, as stored.
    pub async fn get_trial_status(
        &self,
        user_id: &str,
    ) -> Result<Option<FreeTrialToken>, TrialError> {
        self.store.latest_token_for_user(user_id).await
    }

    /// Take one report from the token. Returns false without taking one when
    /// the token is missing, not active, past its expiry or exhausted; the
    /// last two also move it to `expired`.
    pub async fn consume_trial_report(
        &self,
        token_id: &str,
        report_id: &str,
    ) -> Result<bool, TrialError> {
        let Some(token) = self.store.get_token(token_id).await? else {
            return Ok(false);
        };
        if token.status != TrialStatus::Active {
            return Ok(false);
        }

        let now = Utc::now().timestamp();
        if token.expires_at.is_some_and(|expires_at| now > expires_at) {
            self.store
                .transition_token(token_id, TrialStatus::Expired, None, now)
                .await?;
            info!(token_id, "Trial token lapsed");
            return Ok(false);
        }
        if token.reports_remaining <= 0 {
            self.store
                .transition_token(token_id, TrialStatus::Expired, None, now)
                .await?;
            info!(token_id, "Trial token exhausted");
            return Ok(false);
        }

        // Lost a race with another consumer
        if !self.store.decrement_reports(token_id).await? {
            return Ok(false);
        }

        self.store
            .record_usage(token_id, &token.user_id, report_id, now)
            .await?;
        Ok(true)
    }

    pub async fn revoke_trial(&self, token_id: &str, reason: &str) -> Result<bool, TrialError> {
        let now = Utc::now().timestamp();
        let revoked = self
            .store
            .transition_token(token_id, TrialStatus::Revoked, Some(reason), now)
            .await?;
        if revoked {
            warn!(token_id, reason, "Trial revoked");
        }
        Ok(revoked)
    }

    pub async fn block_device(
        &self,
        fingerprint_hash: &str,
        reason: &str,
    ) -> Result<bool, TrialError> {
        let now = Utc::now().timestamp();
        self.store.block_device(fingerprint_hash, reason, now).await?;
        warn!(fingerprint_hash, reason, "Device blocked");
        Ok(true)
    }

    pub async fn resolve_flag(&self, flag_id: i64) -> Result<bool, TrialError> {
        let resolved = self
            .store
            .resolve_flag(flag_id, Utc::now().timestamp())
            .await?;
        if resolved {
            warn!(flag_id, "Fraud flag resolved");
        }
        Ok(resolved)
    }

    pub async fn list_flags(
        &self,
        user_id: Option<&str>,
        unresolved_only: bool,
        limit: u64,
    ) -> Result<Vec<FraudFlag>, TrialError> {
        self.store.list_flags(user_id, unresolved_only, limit).await
    }

    pub async fn expire_lapsed_trials(&self) -> Result<u64, TrialError> {
        self.store
            .expire_tokens_before(Utc::now().timestamp())
            .await
    }

    pub async fn cleanup_old_sessions(&self) -> Result<u64, TrialError> {
        let cutoff = Utc::now().timestamp() - SESSION_RETENTION_DAYS * DAY;
        self.store.delete_sessions_before(cutoff).await
    }

    pub async fn record_session(
        &self,
        user_id: &str,
        ip_address: &str,
        user_agent: Option<&str>,
    ) -> Result<Session, TrialError> {
        self.store
            .record_session(user_id, ip_address, user_agent, Utc::now().timestamp())
            .await
    }

    pub async fn record_payment_verification(
        &self,
        user_id: &str,
        card_fingerprint: &str,
        succeeded: bool,
    ) -> Result<PaymentVerification, TrialError> {
        self.store
            .record_payment_verification(
                user_id,
                card_fingerprint,
                succeeded,
                Utc::now().timestamp(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn service() -> (Arc<MemoryStore>, FreeTrialService) {
        let store = Arc::new(MemoryStore::new());
        let svc = FreeTrialService::new(
            store.clone(),
            TrialPolicy::default(),
            FraudPolicy::default(),
        );
        (store, svc)
    }

    fn request(user_id: &str, fingerprint: &str) -> TrialActivationRequest {
        TrialActivationRequest {
            user_id: user_id.to_string(),
            fingerprint_hash: fingerprint.to_string(),
            device_data: None,
            ip_address: "203.0.113.9".to_string(),
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn test_empty_fingerprint_rejected() {
        let (store, svc) = service();
        let user = store.create_user("a@example.com", 0).await.unwrap();

        let err = svc.activate_trial(request(&user.user_id, "  ")).await.unwrap_err();
        assert!(matches!(err, TrialError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_side_effects() {
        let (store, svc) = service();

        let err = svc.activate_trial(request("ghost", "fp-1")).await.unwrap_err();
        assert!(matches!(err, TrialError::UserNotFound(ref id) if id == "ghost"));
        assert!(store.get_device("fp-1").await.unwrap().is_none());
        assert!(store.list_flags(None, false, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consume_lapsed_token_expires_it() {
        let (store, svc) = service();
        let now = Utc::now().timestamp();
        store
            .insert_token(&FreeTrialToken {
                token_id: "old".to_string(),
                user_id: "u".to_string(),
                fingerprint_hash: None,
                status: TrialStatus::Active,
                reports_remaining: 3,
                activated_at: Some(now - 8 * DAY),
                expires_at: Some(now - DAY),
                revoked_at: None,
                revoke_reason: None,
            })
            .await
            .unwrap();

        assert!(!svc.consume_trial_report("old", "r1").await.unwrap());
        let token = store.get_token("old").await.unwrap().unwrap();
        assert_eq!(token.status, TrialStatus::Expired);
        assert_eq!(token.reports_remaining, 3);
    }

    #[tokio::test]
    async fn test_consume_unknown_token() {
        let (_store, svc) = service();
        assert!(!svc.consume_trial_report("missing", "r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_is_one_way() {
        let (store, svc) = service();
        let user = store.create_user("a@example.com", 0).await.unwrap();
        let grant = match svc.activate_trial(request(&user.user_id, "fp-1")).await.unwrap() {
            TrialActivation::Granted(g) => g,
            TrialActivation::Denied(d) => panic!("unexpected denial: {}", d.reason),
        };

        assert!(svc.revoke_trial(&grant.token_id, "abuse").await.unwrap());
        assert!(!svc.revoke_trial(&grant.token_id, "again").await.unwrap());
        assert!(!svc.consume_trial_report(&grant.token_id, "r1").await.unwrap());

        let token = svc.get_trial_status(&user.user_id).await.unwrap().unwrap();
        assert_eq!(token.status, TrialStatus::Revoked);
        assert_eq!(token.revoke_reason.as_deref(), Some("abuse"));
        assert!(token.revoked_at.is_some());
    }

    #[tokio::test]
    async fn test_activation_serializes_with_outcome_tag() {
        let (store, svc) = service();
        let user = store.create_user("a@example.com", 0).await.unwrap();
        let activation = svc.activate_trial(request(&user.user_id, "fp-1")).await.unwrap();

        let body = serde_json::to_value(&activation).unwrap();
        assert_eq!(body["outcome"], "granted");
        assert_eq!(body["reports_remaining"], 5);
    }
}

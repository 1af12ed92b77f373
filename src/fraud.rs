//! Fraud scoring for trial activation.
//!
//! Six independent, read-only checkers each look at one signal and return a
//! [`CheckResult`]. [`FraudEngine::calculate_fraud_score`] runs them
//! concurrently and folds the results with [`aggregate`]. A checker that
//! returns `allowed = false` vetoes activation no matter how low the total is;
//! that is how hard blocks (blocked device, recent critical flag) stay
//! distinct from soft accumulation.

use crate::errors::TrialError;
use crate::settings::FraudPolicy;
use crate::storage::{NewFraudFlag, Severity, TrialStore};
use serde::Serialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

pub const MAX_FRAUD_SCORE: i64 = 100;
pub const CRITICAL_FLAGS_REASON: &str = "Critical fraud flags detected";

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

const RAPID_REGISTRATION_WINDOW: i64 = HOUR;
const IP_SESSION_WINDOW: i64 = DAY;
const IP_SESSION_LIMIT: u64 = 3;
const CARD_ACCOUNT_LIMIT: u64 = 3;
const USAGE_SAMPLE: u64 = 5;
const USAGE_BURST_WINDOW: i64 = HOUR;
pub const LOCKOUT_WINDOW: i64 = 7 * DAY;
const LOCKOUT_FLAG_LIMIT: usize = 3;

/// Inputs shared by all checkers for one activation attempt.
#[derive(Debug, Clone, Copy)]
pub struct FraudContext<'a> {
    pub user_id: &'a str,
    pub email: &'a str,
    pub fingerprint_hash: &'a str,
    pub ip_address: &'a str,
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub fraud_score: i64,
    pub flags: Vec<NewFraudFlag>,
    /// Set when the checker vetoes activation
    pub reason: Option<String>,
}

impl CheckResult {
    pub fn pass() -> Self {
        Self {
            allowed: true,
            fraud_score: 0,
            flags: Vec::new(),
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            fraud_score: MAX_FRAUD_SCORE,
            flags: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    fn raise(&mut self, flag: NewFraudFlag) {
        self.fraud_score += flag.fraud_score;
        self.flags.push(flag);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudAssessment {
    pub allowed: bool,
    /// Sum of checker scores, capped at [`MAX_FRAUD_SCORE`]
    pub total_score: i64,
    pub flags: Vec<NewFraudFlag>,
    pub reason: Option<String>,
}

/// Fold checker results in order: concatenate flags, sum and cap scores, and
/// allow only when every checker allowed and the total is under `threshold`.
pub fn aggregate(results: Vec<CheckResult>, threshold: i64) -> FraudAssessment {
    let mut total: i64 = 0;
    let mut flags = Vec::new();
    let mut veto = None;

    for result in results {
        total = total.saturating_add(result.fraud_score);
        if !result.allowed && veto.is_none() {
            veto = Some(
                result
                    .reason
                    .unwrap_or_else(|| "Blocked by fraud check".to_string()),
            );
        }
        flags.extend(result.flags);
    }

    let total_score = total.min(MAX_FRAUD_SCORE);
    let allowed = veto.is_none() && total_score < threshold;
    let reason = match veto {
        Some(reason) => Some(reason),
        None if !allowed => Some(format!(
            "Fraud score {total_score} exceeds threshold {threshold}"
        )),
        None => None,
    };

    FraudAssessment {
        allowed,
        total_score,
        flags,
        reason,
    }
}

/// Private, loopback, link-local and unique-local ranges. A stand-in for real
/// VPN/proxy detection: traffic from these ranges reaching a public service
/// means something rewrote the client address.
pub fn is_suspicious_ip(ip_address: &str) -> bool {
    match ip_address.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.is_private() || v4.is_loopback() || v4.is_link_local();
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

fn email_domain(email: &str) -> Option<String> {
    email
        .trim()
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
}

#[derive(Clone)]
pub struct FraudEngine {
    store: Arc<dyn TrialStore>,
    policy: FraudPolicy,
}

impl FraudEngine {
    pub fn new(store: Arc<dyn TrialStore>, policy: FraudPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &FraudPolicy {
        &self.policy
    }

    /// Run all six checkers concurrently and aggregate. Any store error aborts
    /// the whole assessment.
    pub async fn calculate_fraud_score(
        &self,
        ctx: &FraudContext<'_>,
    ) -> Result<FraudAssessment, TrialError> {
        let (device, email, ip, payment, usage, lockout) = tokio::try_join!(
            self.check_device(ctx),
            self.check_email(ctx),
            self.check_ip(ctx),
            self.check_payment(ctx),
            self.check_usage_pattern(ctx),
            self.check_time_lockout(ctx),
        )?;

        debug!(
            user_id = ctx.user_id,
            device = device.fraud_score,
            email = email.fraud_score,
            ip = ip.fraud_score,
            payment = payment.fraud_score,
            usage = usage.fraud_score,
            lockout = lockout.fraud_score,
            "Fraud checks complete"
        );

        Ok(aggregate(
            vec![device, email, ip, payment, usage, lockout],
            self.policy.threshold,
        ))
    }

    /// One trial per device, no rapid re-registration, never a blocked device.
    pub async fn check_device(&self, ctx: &FraudContext<'_>) -> Result<CheckResult, TrialError> {
        let Some(device) = self.store.get_device(ctx.fingerprint_hash).await? else {
            return Ok(CheckResult::pass());
        };

        if device.is_blocked {
            let reason = device
                .blocked_reason
                .clone()
                .unwrap_or_else(|| "no reason recorded".to_string());
            let mut result = CheckResult::deny(format!("Device is blocked: {reason}"));
            result.flags.push(NewFraudFlag::new(
                "device_blocked",
                Severity::Critical,
                MAX_FRAUD_SCORE,
                json!({ "reason": reason }),
            ));
            return Ok(result);
        }

        let weights = &self.policy.weights;
        let mut result = CheckResult::pass();

        if device.trial_count >= 1 {
            result.raise(NewFraudFlag::new(
                "device_trial_limit_exceeded",
                Severity::High,
                weights.device_reuse,
                json!({ "trial_count": device.trial_count }),
            ));
        }

        let since_last_seen = ctx.now - device.last_seen_at;
        if device.trial_count > 0 && since_last_seen < RAPID_REGISTRATION_WINDOW {
            result.raise(NewFraudFlag::new(
                "rapid_device_registration",
                Severity::Medium,
                weights.rapid_registration,
                json!({ "seconds_since_last_seen": since_last_seen }),
            ));
        }

        Ok(result)
    }

    /// Disposable domains and one trial per e-mail address.
    pub async fn check_email(&self, ctx: &FraudContext<'_>) -> Result<CheckResult, TrialError> {
        let weights = &self.policy.weights;
        let mut result = CheckResult::pass();

        if let Some(domain) = email_domain(ctx.email) {
            if self.policy.is_disposable_domain(&domain) {
                result.raise(NewFraudFlag::new(
                    "disposable_email",
                    Severity::Medium,
                    weights.disposable_email,
                    json!({ "domain": domain }),
                ));
            }
        }

        if let Some(owner) = self.store.get_user_by_email(ctx.email).await? {
            let existing = self.store.count_tokens_for_user(&owner.user_id).await?;
            if existing >= 1 {
                result.raise(NewFraudFlag::new(
                    "email_trial_limit_exceeded",
                    Severity::High,
                    weights.email_reuse,
                    json!({ "existing_trials": existing }),
                ));
            }
        }

        Ok(result)
    }

    pub async fn check_ip(&self, ctx: &FraudContext<'_>) -> Result<CheckResult, TrialError> {
        let weights = &self.policy.weights;
        let mut result = CheckResult::pass();

        if is_suspicious_ip(ctx.ip_address) {
            result.raise(NewFraudFlag::new(
                "suspicious_ip",
                Severity::Low,
                weights.suspicious_ip,
                json!({ "ip_address": ctx.ip_address }),
            ));
        }

        let sessions = self
            .store
            .count_sessions_from_ip_since(ctx.ip_address, ctx.now - IP_SESSION_WINDOW)
            .await?;
        if sessions >= IP_SESSION_LIMIT {
            result.raise(NewFraudFlag::new(
                "ip_rate_limit_exceeded",
                Severity::High,
                weights.ip_rate_limit,
                json!({ "ip_address": ctx.ip_address, "sessions_24h": sessions }),
            ));
        }

        Ok(result)
    }

    /// Only engages once the user has a successful payment verification.
    pub async fn check_payment(&self, ctx: &FraudContext<'_>) -> Result<CheckResult, TrialError> {
        let Some(verification) = self.store.latest_successful_payment(ctx.user_id).await? else {
            return Ok(CheckResult::pass());
        };

        let mut result = CheckResult::pass();
        let accounts = self
            .store
            .count_users_with_card(&verification.card_fingerprint)
            .await?;
        if accounts > CARD_ACCOUNT_LIMIT {
            result.raise(NewFraudFlag::new(
                "payment_method_reuse",
                Severity::High,
                self.policy.weights.payment_reuse,
                json!({ "linked_accounts": accounts }),
            ));
        }

        Ok(result)
    }

    /// Flags a burst of report generations: the last five inside one hour.
    pub async fn check_usage_pattern(
        &self,
        ctx: &FraudContext<'_>,
    ) -> Result<CheckResult, TrialError> {
        let recent = self.store.recent_usage(ctx.user_id, USAGE_SAMPLE).await?;
        let mut result = CheckResult::pass();

        if recent.len() as u64 >= USAGE_SAMPLE {
            let newest = recent.first().map(|u| u.used_at).unwrap_or_default();
            let oldest = recent.last().map(|u| u.used_at).unwrap_or_default();
            let span = newest - oldest;
            if span < USAGE_BURST_WINDOW {
                result.raise(NewFraudFlag::new(
                    "suspicious_usage_pattern",
                    Severity::Medium,
                    self.policy.weights.usage_pattern,
                    json!({ "reports": recent.len(), "span_seconds": span }),
                ));
            }
        }

        Ok(result)
    }

    /// Unresolved flags from the last seven days against the user or device.
    pub async fn check_time_lockout(
        &self,
        ctx: &FraudContext<'_>,
    ) -> Result<CheckResult, TrialError> {
        let flags = self
            .store
            .unresolved_flags_since(ctx.user_id, ctx.fingerprint_hash, ctx.now - LOCKOUT_WINDOW)
            .await?;

        let critical = flags
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        if critical > 0 {
            return Ok(CheckResult::deny(format!(
                "{CRITICAL_FLAGS_REASON} ({critical} in the last 7 days)"
            )));
        }

        let mut result = CheckResult::pass();
        let serious = flags
            .iter()
            .filter(|f| f.severity >= Severity::High)
            .count();
        if serious >= LOCKOUT_FLAG_LIMIT {
            result.raise(NewFraudFlag::new(
                "repeated_fraud_flags",
                Severity::High,
                self.policy.weights.repeated_flags,
                json!({ "unresolved_high_flags": serious }),
            ));
        }

        Ok(result)
    }
}

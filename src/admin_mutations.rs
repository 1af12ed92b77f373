use async_graphql::*;
use std::sync::Arc;

use crate::jobs;
use crate::storage::{FraudFlag, FreeTrialToken, JobExecution};
use crate::trial::FreeTrialService;

fn service<'a>(ctx: &Context<'a>) -> Result<&'a Arc<FreeTrialService>> {
    ctx.data::<Arc<FreeTrialService>>()
        .map_err(|_| Error::new("Trial service not available"))
}

fn internal(e: crate::errors::TrialError) -> Error {
    Error::new(e.to_string())
}

/// Custom mutations for admin operations
#[derive(Default)]
pub struct AdminMutation;

#[Object]
impl AdminMutation {
    /// Revoke a pending or active trial token
    async fn revoke_trial(
        &self,
        ctx: &Context<'_>,
        token_id: String,
        reason: String,
    ) -> Result<bool> {
        service(ctx)?
            .revoke_trial(&token_id, &reason)
            .await
            .map_err(internal)
    }

    /// Block a device; later activations from it are denied outright
    async fn block_device(
        &self,
        ctx: &Context<'_>,
        fingerprint_hash: String,
        reason: String,
    ) -> Result<bool> {
        service(ctx)?
            .block_device(&fingerprint_hash, &reason)
            .await
            .map_err(internal)
    }

    /// Mark a fraud flag reviewed so it no longer counts toward lockout
    async fn resolve_flag(&self, ctx: &Context<'_>, flag_id: i64) -> Result<bool> {
        service(ctx)?.resolve_flag(flag_id).await.map_err(internal)
    }

    /// Manually trigger a background job by name
    async fn trigger_job(&self, ctx: &Context<'_>, job_name: String) -> Result<JobTriggerResult> {
        let svc = service(ctx)?;

        match jobs::trigger_job_manually(svc.as_ref(), &job_name).await {
            Ok(_) => Ok(JobTriggerResult {
                success: true,
                message: format!("Job '{}' triggered successfully", job_name),
                job_name,
            }),
            Err(e) => Ok(JobTriggerResult {
                success: false,
                message: format!("Failed to trigger job '{}': {}", job_name, e),
                job_name,
            }),
        }
    }
}

/// Result of triggering a job
#[derive(SimpleObject)]
pub struct JobTriggerResult {
    pub success: bool,
    pub message: String,
    pub job_name: String,
}

/// Custom queries for admin operations
#[derive(Default)]
pub struct AdminQuery;

#[Object]
impl AdminQuery {
    /// Latest trial token for a user
    async fn trial_status(&self, ctx: &Context<'_>, user_id: String) -> Result<Option<TrialToken>> {
        let token = service(ctx)?
            .get_trial_status(&user_id)
            .await
            .map_err(internal)?;
        Ok(token.map(TrialToken::from))
    }

    /// Fraud audit log, newest first
    async fn fraud_flags(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Filter by user id")] user_id: Option<String>,
        #[graphql(desc = "Only show unresolved flags", default = false)] unresolved_only: bool,
        #[graphql(desc = "Limit number of results", default = 100)] limit: i64,
    ) -> Result<Vec<FraudFlagEntry>> {
        let flags = service(ctx)?
            .list_flags(user_id.as_deref(), unresolved_only, limit.max(0) as u64)
            .await
            .map_err(internal)?;

        Ok(flags.into_iter().map(FraudFlagEntry::from).collect())
    }

    /// Get recent job executions with optional filtering
    async fn job_logs(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Filter by job name")] job_name: Option<String>,
        #[graphql(desc = "Limit number of results", default = 100)] limit: i64,
        #[graphql(desc = "Only show failed jobs")] only_failures: Option<bool>,
    ) -> Result<Vec<JobLog>> {
        let results = service(ctx)?
            .store()
            .list_job_executions(
                job_name.as_deref(),
                only_failures.unwrap_or(false),
                limit.max(0) as u64,
            )
            .await
            .map_err(internal)?;

        Ok(results.into_iter().map(JobLog::from).collect())
    }

    /// Get list of available jobs that can be triggered
    async fn available_jobs(&self) -> Result<Vec<JobInfo>> {
        Ok(jobs::JOBS
            .iter()
            .map(|(name, description, schedule)| JobInfo {
                name: name.to_string(),
                description: description.to_string(),
                schedule: schedule.to_string(),
            })
            .collect())
    }
}

#[derive(SimpleObject)]
pub struct TrialToken {
    pub token_id: String,
    pub user_id: String,
    pub fingerprint_hash: Option<String>,
    pub status: String,
    pub reports_remaining: i64,
    pub activated_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub revoke_reason: Option<String>,
}

impl From<FreeTrialToken> for TrialToken {
    fn from(t: FreeTrialToken) -> Self {
        Self {
            token_id: t.token_id,
            user_id: t.user_id,
            fingerprint_hash: t.fingerprint_hash,
            status: t.status.to_string(),
            reports_remaining: t.reports_remaining,
            activated_at: t.activated_at,
            expires_at: t.expires_at,
            revoked_at: t.revoked_at,
            revoke_reason: t.revoke_reason,
        }
    }
}

#[derive(SimpleObject)]
pub struct FraudFlagEntry {
    pub id: i64,
    pub user_id: Option<String>,
    pub fingerprint_hash: Option<String>,
    pub flag_type: String,
    pub severity: String,
    pub fraud_score: i64,
    pub details: Json<serde_json::Value>,
    pub resolved: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl From<FraudFlag> for FraudFlagEntry {
    fn from(f: FraudFlag) -> Self {
        Self {
            id: f.id,
            user_id: f.user_id,
            fingerprint_hash: f.fingerprint_hash,
            flag_type: f.flag_type,
            severity: f.severity.to_string(),
            fraud_score: f.fraud_score,
            details: Json(f.details),
            resolved: f.resolved,
            created_at: f.created_at,
            resolved_at: f.resolved_at,
        }
    }
}

/// Job log entry
#[derive(SimpleObject)]
pub struct JobLog {
    pub id: i64,
    pub job_name: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
}

impl From<JobExecution> for JobLog {
    fn from(e: JobExecution) -> Self {
        Self {
            id: e.id,
            job_name: e.job_name,
            started_at: e.started_at,
            completed_at: e.completed_at,
            success: e.success,
            error_message: e.error_message,
            records_processed: e.records_processed,
        }
    }
}

/// Information about an available job
#[derive(SimpleObject)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub schedule: String,
}

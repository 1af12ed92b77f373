use crate::errors::TrialError;
use crate::trial::FreeTrialService;
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const EXPIRE_LAPSED_TRIALS: &str = "expire_lapsed_trials";
pub const CLEANUP_OLD_SESSIONS: &str = "cleanup_old_sessions";

/// Name, description and cron schedule of every background job.
pub const JOBS: [(&str, &str, &str); 2] = [
    (
        EXPIRE_LAPSED_TRIALS,
        "Mark active trial tokens past their expiry as expired",
        "0 0 * * * *",
    ),
    (
        CLEANUP_OLD_SESSIONS,
        "Delete sessions older than the IP rate-check retention",
        "0 30 * * * *",
    ),
];

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(service: Arc<FreeTrialService>) -> Result<JobScheduler, TrialError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| TrialError::Other(format!("Failed to create job scheduler: {}", e)))?;

    for (name, _, schedule) in JOBS {
        let service = service.clone();
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                info!("Running {} job", name);
                if let Err(e) = run_logged(&service, name).await {
                    error!("Failed to record {} execution: {}", name, e);
                }
            })
        })
        .map_err(|e| TrialError::Other(format!("Failed to create {} job: {}", name, e)))?;

        sched
            .add(job)
            .await
            .map_err(|e| TrialError::Other(format!("Failed to add {} job: {}", name, e)))?;
    }

    sched
        .start()
        .await
        .map_err(|e| TrialError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", JOBS.len());

    Ok(sched)
}

async fn run_job(service: &FreeTrialService, job_name: &str) -> Result<u64, TrialError> {
    match job_name {
        EXPIRE_LAPSED_TRIALS => service.expire_lapsed_trials().await,
        CLEANUP_OLD_SESSIONS => service.cleanup_old_sessions().await,
        _ => Err(TrialError::Other(format!("Unknown job name: {}", job_name))),
    }
}

/// Run a job and record it in the execution log. The job's own failure is
/// recorded, not returned; only a failure to write the log is an error.
async fn run_logged(service: &FreeTrialService, job_name: &str) -> Result<(), TrialError> {
    let store = service.store();
    let execution_id = store
        .start_job_execution(job_name, Utc::now().timestamp())
        .await?;

    match run_job(service, job_name).await {
        Ok(count) => {
            info!("Job {} completed: {} records", job_name, count);
            store
                .complete_job_execution(
                    execution_id,
                    true,
                    None,
                    Some(count as i64),
                    Utc::now().timestamp(),
                )
                .await
        }
        Err(e) => {
            error!("Job {} failed: {}", job_name, e);
            store
                .complete_job_execution(
                    execution_id,
                    false,
                    Some(e.to_string()),
                    None,
                    Utc::now().timestamp(),
                )
                .await
        }
    }
}

/// Manually trigger a job by name (admin API)
pub async fn trigger_job_manually(
    service: &FreeTrialService,
    job_name: &str,
) -> Result<(), TrialError> {
    if !JOBS.iter().any(|(name, _, _)| *name == job_name) {
        return Err(TrialError::Other(format!("Unknown job name: {}", job_name)));
    }
    info!("Manually triggering job: {}", job_name);
    run_logged(service, job_name).await
}

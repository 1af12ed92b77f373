use super::{
    normalize_email, random_id, DeviceRecord, FraudFlag, FreeTrialToken, JobExecution,
    NewFraudFlag, PaymentVerification, Session, Severity, TrialStatus, TrialStore, TrialUsage,
    User,
};
use crate::entities;
use crate::errors::TrialError;
use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, Database, DatabaseConnection, EntityTrait, NotSet,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use sea_orm_migration::MigratorTrait;
use serde_json::Value;

const PAYMENT_SUCCEEDED: &str = "succeeded";
const PAYMENT_FAILED: &str = "failed";

/// SeaORM-backed store for SQLite and PostgreSQL.
#[derive(Clone)]
pub struct SqlStore {
    db: DatabaseConnection,
}

impl SqlStore {
    pub async fn connect(url: &str) -> Result<Self, TrialError> {
        let db = Database::connect(url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<(), TrialError> {
        migration::Migrator::up(&self.db, None).await?;
        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn token_from_model(model: entities::free_trial_token::Model) -> Result<FreeTrialToken, TrialError> {
    Ok(FreeTrialToken {
        status: TrialStatus::parse(&model.status)?,
        token_id: model.token_id,
        user_id: model.user_id,
        fingerprint_hash: model.fingerprint_hash,
        reports_remaining: model.reports_remaining,
        activated_at: model.activated_at,
        expires_at: model.expires_at,
        revoked_at: model.revoked_at,
        revoke_reason: model.revoke_reason,
    })
}

fn device_from_model(
    model: entities::device_fingerprint::Model,
) -> Result<DeviceRecord, TrialError> {
    let device_data = match model.device_data {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };
    Ok(DeviceRecord {
        fingerprint_hash: model.fingerprint_hash,
        device_data,
        trial_count: model.trial_count,
        is_blocked: model.is_blocked != 0,
        blocked_reason: model.blocked_reason,
        first_seen_at: model.first_seen_at,
        last_seen_at: model.last_seen_at,
    })
}

fn flag_from_model(model: entities::fraud_flag::Model) -> Result<FraudFlag, TrialError> {
    Ok(FraudFlag {
        id: model.id,
        user_id: model.user_id,
        fingerprint_hash: model.fingerprint_hash,
        severity: Severity::parse(&model.severity)?,
        flag_type: model.flag_type,
        fraud_score: model.fraud_score,
        details: serde_json::from_str(&model.details)?,
        resolved: model.resolved != 0,
        created_at: model.created_at,
        resolved_at: model.resolved_at,
    })
}

fn payment_from_model(model: entities::payment_verification::Model) -> PaymentVerification {
    PaymentVerification {
        id: model.id,
        user_id: model.user_id,
        card_fingerprint: model.card_fingerprint,
        succeeded: model.status == PAYMENT_SUCCEEDED,
        created_at: model.created_at,
    }
}

fn usage_from_model(model: entities::trial_usage::Model) -> TrialUsage {
    TrialUsage {
        id: model.id,
        token_id: model.token_id,
        user_id: model.user_id,
        report_id: model.report_id,
        used_at: model.used_at,
    }
}

#[async_trait]
impl TrialStore for SqlStore {
    async fn create_user(&self, email: &str, now: i64) -> Result<User, TrialError> {
        let user_id = random_id();
        let email = normalize_email(email);

        let user = entities::user::ActiveModel {
            user_id: Set(user_id.clone()),
            email: Set(email.clone()),
            created_at: Set(now),
        };
        user.insert(&self.db).await?;

        Ok(User {
            user_id,
            email,
            created_at: now,
        })
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>, TrialError> {
        use entities::user::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .map(|model| User {
                user_id: model.user_id,
                email: model.email,
                created_at: model.created_at,
            }))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, TrialError> {
        use entities::user::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::Email.eq(normalize_email(email)))
            .one(&self.db)
            .await?
            .map(|model| User {
                user_id: model.user_id,
                email: model.email,
                created_at: model.created_at,
            }))
    }

    async fn get_device(&self, fingerprint_hash: &str) -> Result<Option<DeviceRecord>, TrialError> {
        use entities::device_fingerprint::{Column, Entity};

        match Entity::find()
            .filter(Column::FingerprintHash.eq(fingerprint_hash))
            .one(&self.db)
            .await?
        {
            Some(model) => Ok(Some(device_from_model(model)?)),
            None => Ok(None),
        }
    }

    async fn record_device_trial(
        &self,
        fingerprint_hash: &str,
        device_data: Option<&Value>,
        now: i64,
    ) -> Result<DeviceRecord, TrialError> {
        use entities::device_fingerprint::{Column, Entity};

        let device_json = device_data.map(serde_json::to_string).transpose()?;
        let keep_data = device_json.is_some();

        let device = entities::device_fingerprint::ActiveModel {
            fingerprint_hash: Set(fingerprint_hash.to_string()),
            device_data: Set(device_json),
            trial_count: Set(1),
            is_blocked: Set(0),
            blocked_reason: Set(None),
            first_seen_at: Set(now),
            last_seen_at: Set(now),
        };

        // Single upsert statement: first trial inserts, later ones increment
        let mut on_conflict = OnConflict::column(Column::FingerprintHash);
        on_conflict
            .value(
                Column::TrialCount,
                Expr::col((Entity, Column::TrialCount)).add(1),
            )
            .update_column(Column::LastSeenAt);
        if keep_data {
            on_conflict.update_column(Column::DeviceData);
        }

        Entity::insert(device)
            .on_conflict(on_conflict)
            .exec_without_returning(&self.db)
            .await?;

        self.get_device(fingerprint_hash)
            .await?
            .ok_or_else(|| TrialError::Other(format!("device {fingerprint_hash} vanished after upsert")))
    }

    async fn block_device(
        &self,
        fingerprint_hash: &str,
        reason: &str,
        now: i64,
    ) -> Result<DeviceRecord, TrialError> {
        use entities::device_fingerprint::{Column, Entity};

        // An unseen device is recorded blocked with no trials
        let device = entities::device_fingerprint::ActiveModel {
            fingerprint_hash: Set(fingerprint_hash.to_string()),
            device_data: Set(None),
            trial_count: Set(0),
            is_blocked: Set(1),
            blocked_reason: Set(Some(reason.to_string())),
            first_seen_at: Set(now),
            last_seen_at: Set(now),
        };

        Entity::insert(device)
            .on_conflict(
                OnConflict::column(Column::FingerprintHash)
                    .update_columns([Column::IsBlocked, Column::BlockedReason])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        self.get_device(fingerprint_hash)
            .await?
            .ok_or_else(|| TrialError::Other(format!("device {fingerprint_hash} vanished after upsert")))
    }

    async fn insert_token(&self, token: &FreeTrialToken) -> Result<(), TrialError> {
        let model = entities::free_trial_token::ActiveModel {
            id: NotSet,
            token_id: Set(token.token_id.clone()),
            user_id: Set(token.user_id.clone()),
            fingerprint_hash: Set(token.fingerprint_hash.clone()),
            status: Set(token.status.as_str().to_string()),
            reports_remaining: Set(token.reports_remaining),
            activated_at: Set(token.activated_at),
            expires_at: Set(token.expires_at),
            revoked_at: Set(token.revoked_at),
            revoke_reason: Set(token.revoke_reason.clone()),
        };
        model.insert(&self.db).await?;
        Ok(())
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<FreeTrialToken>, TrialError> {
        use entities::free_trial_token::{Column, Entity};

        match Entity::find()
            .filter(Column::TokenId.eq(token_id))
            .one(&self.db)
            .await?
        {
            Some(model) => Ok(Some(token_from_model(model)?)),
            None => Ok(None),
        }
    }

    async fn latest_token_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<FreeTrialToken>, TrialError> {
        use entities::free_trial_token::{Column, Entity};

        match Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::ActivatedAt)
            .order_by_desc(Column::Id)
            .one(&self.db)
            .await?
        {
            Some(model) => Ok(Some(token_from_model(model)?)),
            None => Ok(None),
        }
    }

    async fn count_tokens_for_user(&self, user_id: &str) -> Result<u64, TrialError> {
        use entities::free_trial_token::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::UserId.eq(user_id))
            .count(&self.db)
            .await?)
    }

    async fn transition_token(
        &self,
        token_id: &str,
        status: TrialStatus,
        reason: Option<&str>,
        now: i64,
    ) -> Result<bool, TrialError> {
        use entities::free_trial_token::{Column, Entity};

        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .filter(Column::TokenId.eq(token_id))
            .filter(Column::Status.is_in([
                TrialStatus::Pending.as_str(),
                TrialStatus::Active.as_str(),
            ]));
        if status == TrialStatus::Revoked {
            update = update
                .col_expr(Column::RevokedAt, Expr::value(now))
                .col_expr(
                    Column::RevokeReason,
                    Expr::value(reason.map(str::to_string)),
                );
        }

        let result = update.exec(&self.db).await?;
        Ok(result.rows_affected == 1)
    }

    async fn decrement_reports(&self, token_id: &str) -> Result<bool, TrialError> {
        use entities::free_trial_token::{Column, Entity};

        // Single conditional UPDATE so concurrent consumers cannot go below zero
        let result = Entity::update_many()
            .col_expr(
                Column::ReportsRemaining,
                Expr::col(Column::ReportsRemaining).sub(1),
            )
            .filter(Column::TokenId.eq(token_id))
            .filter(Column::Status.eq(TrialStatus::Active.as_str()))
            .filter(Column::ReportsRemaining.gt(0))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn expire_tokens_before(&self, now: i64) -> Result<u64, TrialError> {
        use entities::free_trial_token::{Column, Entity};

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(TrialStatus::Expired.as_str()))
            .filter(Column::Status.eq(TrialStatus::Active.as_str()))
            .filter(Column::ExpiresAt.lt(now))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }

    async fn insert_flags(
        &self,
        user_id: &str,
        fingerprint_hash: &str,
        flags: &[NewFraudFlag],
        now: i64,
    ) -> Result<Vec<FraudFlag>, TrialError> {
        let mut stored = Vec::with_capacity(flags.len());
        for flag in flags {
            let row = entities::fraud_flag::ActiveModel {
                id: NotSet,
                user_id: Set(Some(user_id.to_string())),
                fingerprint_hash: Set(Some(fingerprint_hash.to_string())),
                flag_type: Set(flag.flag_type.clone()),
                severity: Set(flag.severity.as_str().to_string()),
                fraud_score: Set(flag.fraud_score),
                details: Set(serde_json::to_string(&flag.details)?),
                resolved: Set(0),
                created_at: Set(now),
                resolved_at: Set(None),
            };
            let inserted = row.insert(&self.db).await?;
            stored.push(flag_from_model(inserted)?);
        }
        Ok(stored)
    }

    async fn unresolved_flags_since(
        &self,
        user_id: &str,
        fingerprint_hash: &str,
        since: i64,
    ) -> Result<Vec<FraudFlag>, TrialError> {
        use entities::fraud_flag::{Column, Entity};

        Entity::find()
            .filter(Column::Resolved.eq(0))
            .filter(Column::CreatedAt.gte(since))
            .filter(
                Condition::any()
                    .add(Column::UserId.eq(user_id))
                    .add(Column::FingerprintHash.eq(fingerprint_hash)),
            )
            .all(&self.db)
            .await?
            .into_iter()
            .map(flag_from_model)
            .collect()
    }

    async fn list_flags(
        &self,
        user_id: Option<&str>,
        unresolved_only: bool,
        limit: u64,
    ) -> Result<Vec<FraudFlag>, TrialError> {
        use entities::fraud_flag::{Column, Entity};

        let mut query = Entity::find();
        if let Some(user_id) = user_id {
            query = query.filter(Column::UserId.eq(user_id));
        }
        if unresolved_only {
            query = query.filter(Column::Resolved.eq(0));
        }

        query
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(flag_from_model)
            .collect()
    }

    async fn resolve_flag(&self, flag_id: i64, now: i64) -> Result<bool, TrialError> {
        use entities::fraud_flag::{Column, Entity};

        let result = Entity::update_many()
            .col_expr(Column::Resolved, Expr::value(1))
            .col_expr(Column::ResolvedAt, Expr::value(now))
            .filter(Column::Id.eq(flag_id))
            .filter(Column::Resolved.eq(0))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn record_session(
        &self,
        user_id: &str,
        ip_address: &str,
        user_agent: Option<&str>,
        now: i64,
    ) -> Result<Session, TrialError> {
        let session_id = random_id();

        let session = entities::session::ActiveModel {
            session_id: Set(session_id.clone()),
            user_id: Set(user_id.to_string()),
            ip_address: Set(ip_address.to_string()),
            user_agent: Set(user_agent.map(str::to_string)),
            created_at: Set(now),
        };
        session.insert(&self.db).await?;

        Ok(Session {
            session_id,
            user_id: user_id.to_string(),
            ip_address: ip_address.to_string(),
            user_agent: user_agent.map(str::to_string),
            created_at: now,
        })
    }

    async fn count_sessions_from_ip_since(
        &self,
        ip_address: &str,
        since: i64,
    ) -> Result<u64, TrialError> {
        use entities::session::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::IpAddress.eq(ip_address))
            .filter(Column::CreatedAt.gte(since))
            .count(&self.db)
            .await?)
    }

    async fn delete_sessions_before(&self, cutoff: i64) -> Result<u64, TrialError> {
        use entities::session::{Column, Entity};

        let result = Entity::delete_many()
            .filter(Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }

    async fn record_payment_verification(
        &self,
        user_id: &str,
        card_fingerprint: &str,
        succeeded: bool,
        now: i64,
    ) -> Result<PaymentVerification, TrialError> {
        let verification = entities::payment_verification::ActiveModel {
            id: NotSet,
            user_id: Set(user_id.to_string()),
            card_fingerprint: Set(card_fingerprint.to_string()),
            status: Set(if succeeded {
                PAYMENT_SUCCEEDED.to_string()
            } else {
                PAYMENT_FAILED.to_string()
            }),
            created_at: Set(now),
        };
        let inserted = verification.insert(&self.db).await?;
        Ok(payment_from_model(inserted))
    }

    async fn latest_successful_payment(
        &self,
        user_id: &str,
    ) -> Result<Option<PaymentVerification>, TrialError> {
        use entities::payment_verification::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(PAYMENT_SUCCEEDED))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .one(&self.db)
            .await?
            .map(payment_from_model))
    }

    async fn count_users_with_card(&self, card_fingerprint: &str) -> Result<u64, TrialError> {
        use entities::payment_verification::{Column, Entity};

        let users: Vec<String> = Entity::find()
            .select_only()
            .column(Column::UserId)
            .distinct()
            .filter(Column::CardFingerprint.eq(card_fingerprint))
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(users.len() as u64)
    }

    async fn record_usage(
        &self,
        token_id: &str,
        user_id: &str,
        report_id: &str,
        now: i64,
    ) -> Result<TrialUsage, TrialError> {
        let usage = entities::trial_usage::ActiveModel {
            id: NotSet,
            token_id: Set(token_id.to_string()),
            user_id: Set(user_id.to_string()),
            report_id: Set(report_id.to_string()),
            used_at: Set(now),
        };
        let inserted = usage.insert(&self.db).await?;
        Ok(usage_from_model(inserted))
    }

    async fn recent_usage(&self, user_id: &str, limit: u64) -> Result<Vec<TrialUsage>, TrialError> {
        use entities::trial_usage::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::UsedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(usage_from_model)
            .collect())
    }

    async fn start_job_execution(&self, job_name: &str, now: i64) -> Result<i64, TrialError> {
        let execution = entities::job_execution::ActiveModel {
            id: NotSet,
            job_name: Set(job_name.to_string()),
            started_at: Set(now),
            completed_at: Set(None),
            success: Set(None),
            error_message: Set(None),
            records_processed: Set(None),
        };

        let result = execution.insert(&self.db).await?;
        Ok(result.id)
    }

    async fn complete_job_execution(
        &self,
        execution_id: i64,
        success: bool,
        error_message: Option<String>,
        records_processed: Option<i64>,
        now: i64,
    ) -> Result<(), TrialError> {
        use entities::job_execution::{Column, Entity};

        if let Some(execution) = Entity::find()
            .filter(Column::Id.eq(execution_id))
            .one(&self.db)
            .await?
        {
            let mut active: entities::job_execution::ActiveModel = execution.into();
            active.completed_at = Set(Some(now));
            active.success = Set(Some(if success { 1 } else { 0 }));
            active.error_message = Set(error_message);
            active.records_processed = Set(records_processed);
            active.update(&self.db).await?;
        }

        Ok(())
    }

    async fn list_job_executions(
        &self,
        job_name: Option<&str>,
        only_failures: bool,
        limit: u64,
    ) -> Result<Vec<JobExecution>, TrialError> {
        use entities::job_execution::{Column, Entity};

        let mut query = Entity::find();
        if let Some(name) = job_name {
            query = query.filter(Column::JobName.eq(name));
        }
        if only_failures {
            query = query.filter(Column::Success.eq(0));
        }

        Ok(query
            .order_by_desc(Column::StartedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|model| JobExecution {
                id: model.id,
                job_name: model.job_name,
                started_at: model.started_at,
                completed_at: model.completed_at,
                success: model.success.map(|s| s != 0),
                error_message: model.error_message,
                records_processed: model.records_processed,
            })
            .collect())
    }
}

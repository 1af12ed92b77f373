use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Usage log: one row per consumed trial report
        manager
            .create_table(
                Table::create()
                    .table(TrialUsage::Table)
                    .if_not_exists()
                    .col(crate::id_column(manager, TrialUsage::Id))
                    .col(string(TrialUsage::TokenId))
                    .col(string(TrialUsage::UserId))
                    .col(string(TrialUsage::ReportId))
                    .col(big_integer(TrialUsage::UsedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_trial_usage_user_id")
                    .table(TrialUsage::Table)
                    .col(TrialUsage::UserId)
                    .col(TrialUsage::UsedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(crate::id_column(manager, JobExecutions::Id))
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(string_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TrialUsage::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TrialUsage {
    Table,
    Id,
    TokenId,
    UserId,
    ReportId,
    UsedAt,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}

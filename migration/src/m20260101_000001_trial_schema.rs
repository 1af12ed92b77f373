use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create users table
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::UserId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Users::Email).string().not_null().unique_key())
                    .col(big_integer(Users::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create free_trial_tokens table
        manager
            .create_table(
                Table::create()
                    .table(FreeTrialTokens::Table)
                    .if_not_exists()
                    // Surrogate id orders tokens activated within the same second
                    .col(crate::id_column(manager, FreeTrialTokens::Id))
                    .col(
                        ColumnDef::new(FreeTrialTokens::TokenId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(string(FreeTrialTokens::UserId))
                    .col(string_null(FreeTrialTokens::FingerprintHash))
                    .col(
                        ColumnDef::new(FreeTrialTokens::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(big_integer(FreeTrialTokens::ReportsRemaining))
                    .col(big_integer_null(FreeTrialTokens::ActivatedAt))
                    .col(big_integer_null(FreeTrialTokens::ExpiresAt))
                    .col(big_integer_null(FreeTrialTokens::RevokedAt))
                    .col(string_null(FreeTrialTokens::RevokeReason))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_free_trial_tokens_user_id")
                    .table(FreeTrialTokens::Table)
                    .col(FreeTrialTokens::UserId)
                    .to_owned(),
            )
            .await?;

        // Create device_fingerprints table
        manager
            .create_table(
                Table::create()
                    .table(DeviceFingerprints::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceFingerprints::FingerprintHash)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string_null(DeviceFingerprints::DeviceData))
                    .col(
                        ColumnDef::new(DeviceFingerprints::TrialCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DeviceFingerprints::IsBlocked)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(string_null(DeviceFingerprints::BlockedReason))
                    .col(big_integer(DeviceFingerprints::FirstSeenAt))
                    .col(big_integer(DeviceFingerprints::LastSeenAt))
                    .to_owned(),
            )
            .await?;

        // Create fraud_flags table
        manager
            .create_table(
                Table::create()
                    .table(FraudFlags::Table)
                    .if_not_exists()
                    .col(crate::id_column(manager, FraudFlags::Id))
                    .col(string_null(FraudFlags::UserId))
                    .col(string_null(FraudFlags::FingerprintHash))
                    .col(string(FraudFlags::FlagType))
                    .col(string(FraudFlags::Severity))
                    .col(big_integer(FraudFlags::FraudScore))
                    .col(string(FraudFlags::Details))
                    .col(
                        ColumnDef::new(FraudFlags::Resolved)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(FraudFlags::CreatedAt))
                    .col(big_integer_null(FraudFlags::ResolvedAt))
                    .to_owned(),
            )
            .await?;

        // Create index on fraud_flags.created_at for the lockout window
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_fraud_flags_created_at")
                    .table(FraudFlags::Table)
                    .col(FraudFlags::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Create sessions table
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::SessionId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Sessions::UserId))
                    .col(string(Sessions::IpAddress))
                    .col(string_null(Sessions::UserAgent))
                    .col(big_integer(Sessions::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_ip_address")
                    .table(Sessions::Table)
                    .col(Sessions::IpAddress)
                    .col(Sessions::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Create payment_verifications table
        manager
            .create_table(
                Table::create()
                    .table(PaymentVerifications::Table)
                    .if_not_exists()
                    .col(crate::id_column(manager, PaymentVerifications::Id))
                    .col(string(PaymentVerifications::UserId))
                    .col(string(PaymentVerifications::CardFingerprint))
                    .col(string(PaymentVerifications::Status))
                    .col(big_integer(PaymentVerifications::CreatedAt))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PaymentVerifications::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(FraudFlags::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DeviceFingerprints::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(FreeTrialTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Users {
    Table,
    UserId,
    Email,
    CreatedAt,
}

#[derive(DeriveIden)]
enum FreeTrialTokens {
    Table,
    Id,
    TokenId,
    UserId,
    FingerprintHash,
    Status,
    ReportsRemaining,
    ActivatedAt,
    ExpiresAt,
    RevokedAt,
    RevokeReason,
}

#[derive(DeriveIden)]
enum DeviceFingerprints {
    Table,
    FingerprintHash,
    DeviceData,
    TrialCount,
    IsBlocked,
    BlockedReason,
    FirstSeenAt,
    LastSeenAt,
}

#[derive(DeriveIden)]
enum FraudFlags {
    Table,
    Id,
    UserId,
    FingerprintHash,
    FlagType,
    Severity,
    FraudScore,
    Details,
    Resolved,
    CreatedAt,
    ResolvedAt,
}

#[derive(DeriveIden)]
enum Sessions {
    Table,
    SessionId,
    UserId,
    IpAddress,
    UserAgent,
    CreatedAt,
}

#[derive(DeriveIden)]
enum PaymentVerifications {
    Table,
    Id,
    UserId,
    CardFingerprint,
    Status,
    CreatedAt,
}

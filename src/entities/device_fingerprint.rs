use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_fingerprints")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub fingerprint_hash: String,
    pub device_data: Option<String>, // JSON blob of the last attributes seen
    pub trial_count: i64,
    pub is_blocked: i64,
    pub blocked_reason: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

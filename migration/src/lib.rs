pub use sea_orm_migration::prelude::*;

mod m20260101_000001_trial_schema;
mod m20260102_000001_add_usage_and_jobs;

pub struct Migrator;

/// Auto-increment primary key with a backend-specific type. SQLite only
/// allows AUTOINCREMENT on an INTEGER PRIMARY KEY.
pub(crate) fn id_column<T>(manager: &SchemaManager, col: T) -> ColumnDef
where
    T: IntoIden,
{
    match manager.get_database_backend() {
        sea_orm::DatabaseBackend::Postgres => ColumnDef::new(col)
            .big_integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
        _ => ColumnDef::new(col)
            .integer()
            .not_null()
            .auto_increment()
            .primary_key()
            .to_owned(),
    }
}

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_trial_schema::Migration),
            Box::new(m20260102_000001_add_usage_and_jobs::Migration),
        ]
    }
}

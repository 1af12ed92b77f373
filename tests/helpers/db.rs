use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use tempfile::NamedTempFile;
use trialguard::settings::{FraudPolicy, TrialPolicy};
use trialguard::storage::{MemoryStore, SqlStore, TrialStore};
use trialguard::trial::FreeTrialService;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// SQL-backed store over this database
    pub fn store(&self) -> Arc<dyn TrialStore> {
        Arc::new(SqlStore::from_connection(self.connection.clone()))
    }
}

pub fn memory_store() -> Arc<dyn TrialStore> {
    Arc::new(MemoryStore::new())
}

/// Trial service with default policies
pub fn service(store: Arc<dyn TrialStore>) -> FreeTrialService {
    FreeTrialService::new(store, TrialPolicy::default(), FraudPolicy::default())
}

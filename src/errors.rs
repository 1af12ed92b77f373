use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TrialError {
    #[error("Serialization error: {0}")]
    #[diagnostic(code(trialguard::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(trialguard::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("User not found: {0}")]
    #[diagnostic(
        code(trialguard::user_not_found),
        help("Trials can only be activated for existing accounts")
    )]
    UserNotFound(String),

    #[error("Bad request: {0}")]
    #[diagnostic(code(trialguard::bad_request))]
    BadRequest(String),

    #[error("{0}")]
    #[diagnostic(code(trialguard::other))]
    Other(String),
}

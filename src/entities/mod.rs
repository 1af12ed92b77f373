pub mod device_fingerprint;
pub mod fraud_flag;
pub mod free_trial_token;
pub mod job_execution;
pub mod payment_verification;
pub mod session;
pub mod trial_usage;
pub mod user;

pub use device_fingerprint::Entity as DeviceFingerprint;
pub use fraud_flag::Entity as FraudFlag;
pub use free_trial_token::Entity as FreeTrialToken;
pub use job_execution::Entity as JobExecution;
pub use payment_verification::Entity as PaymentVerification;
pub use session::Entity as Session;
pub use trial_usage::Entity as TrialUsage;
pub use user::Entity as User;

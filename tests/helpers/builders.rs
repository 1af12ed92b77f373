use chrono::Utc;
use trialguard::storage::{DeviceRecord, FreeTrialToken, TrialStatus, TrialStore, User};

/// Builder for creating test users
pub struct UserBuilder {
    email: String,
}

impl UserBuilder {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
        }
    }

    pub async fn create(self, store: &dyn TrialStore) -> User {
        store
            .create_user(&self.email, Utc::now().timestamp())
            .await
            .expect("Failed to create test user")
    }
}

/// Builder for device history
pub struct DeviceBuilder {
    fingerprint_hash: String,
    trials: u32,
    last_seen_ago: i64,
    blocked_reason: Option<String>,
}

impl DeviceBuilder {
    pub fn new(fingerprint_hash: &str) -> Self {
        Self {
            fingerprint_hash: fingerprint_hash.to_string(),
            trials: 0,
            last_seen_ago: 0,
            blocked_reason: None,
        }
    }

    pub fn with_trials(mut self, trials: u32) -> Self {
        self.trials = trials;
        self
    }

    /// Seconds since the device was last seen
    pub fn last_seen_ago(mut self, seconds: i64) -> Self {
        self.last_seen_ago = seconds;
        self
    }

    pub fn blocked(mut self, reason: &str) -> Self {
        self.blocked_reason = Some(reason.to_string());
        self
    }

    pub async fn create(self, store: &dyn TrialStore) -> DeviceRecord {
        let seen = Utc::now().timestamp() - self.last_seen_ago;
        for _ in 0..self.trials {
            store
                .record_device_trial(&self.fingerprint_hash, None, seen)
                .await
                .expect("Failed to record device trial");
        }
        if let Some(reason) = &self.blocked_reason {
            store
                .block_device(&self.fingerprint_hash, reason, seen)
                .await
                .expect("Failed to block device");
        }
        store
            .get_device(&self.fingerprint_hash)
            .await
            .expect("Failed to load device")
            .expect("Device not recorded")
    }
}

/// Builder for trial tokens inserted directly into the store
pub struct TokenBuilder {
    token: FreeTrialToken,
}

impl TokenBuilder {
    pub fn new(token_id: &str, user_id: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            token: FreeTrialToken {
                token_id: token_id.to_string(),
                user_id: user_id.to_string(),
                fingerprint_hash: None,
                status: TrialStatus::Active,
                reports_remaining: 5,
                activated_at: Some(now),
                expires_at: Some(now + 7 * 86400),
                revoked_at: None,
                revoke_reason: None,
            },
        }
    }

    pub fn with_reports(mut self, reports: i64) -> Self {
        self.token.reports_remaining = reports;
        self
    }

    pub fn with_status(mut self, status: TrialStatus) -> Self {
        self.token.status = status;
        self
    }

    pub fn activated_at(mut self, ts: i64) -> Self {
        self.token.activated_at = Some(ts);
        self.token.expires_at = Some(ts + 7 * 86400);
        self
    }

    pub async fn create(self, store: &dyn TrialStore) -> FreeTrialToken {
        store
            .insert_token(&self.token)
            .await
            .expect("Failed to insert token");
        self.token
    }
}

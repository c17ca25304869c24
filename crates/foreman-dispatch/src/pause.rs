use chrono::{DateTime, Utc};
use foreman_core::{CoreError, SqliteStore};

pub const KEY_QUOTA_PAUSE_UNTIL: &str = "pause.quota_until";
pub const KEY_QUOTA_PAUSE_REASON: &str = "pause.quota_reason";
pub const KEY_AUTH_EXPIRED: &str = "pause.auth_expired";
pub const KEY_AUTH_REASON: &str = "pause.auth_reason";

pub const KEY_HEARTBEAT_LAST_RUN: &str = "heartbeat.last_run_at";
pub const KEY_HEARTBEAT_STATUS: &str = "heartbeat.status";
pub const KEY_CYCLE_DISPATCHED: &str = "cycle.dispatched";
pub const KEY_CYCLE_COMPLETED: &str = "cycle.completed";
pub const KEY_CYCLE_SKIPPED: &str = "cycle.skipped";

pub const HEARTBEAT_RUNNING: &str = "running";
pub const HEARTBEAT_IDLE: &str = "idle";

/// Persisted reasons are operator-facing breadcrumbs, not transcripts.
pub const PAUSE_REASON_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPause {
    pub until: DateTime<Utc>,
    pub reason: String,
}

/// Global gating state, read once at the top of a cycle and passed down so
/// the gate logic is testable without a live store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlState {
    pub auth_expired: bool,
    pub auth_reason: Option<String>,
    pub quota_pause: Option<QuotaPause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleGate {
    Proceed,
    AuthExpired,
    QuotaPaused,
}

impl ControlState {
    pub fn load(store: &SqliteStore) -> Result<Self, CoreError> {
        let auth_expired = store.get_setting(KEY_AUTH_EXPIRED)?.is_some();
        let auth_reason = store.get_setting(KEY_AUTH_REASON)?;

        let quota_pause = match store.get_setting(KEY_QUOTA_PAUSE_UNTIL)? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(until) => Some(QuotaPause {
                    until: until.with_timezone(&Utc),
                    reason: store.get_setting(KEY_QUOTA_PAUSE_REASON)?.unwrap_or_default(),
                }),
                Err(error) => {
                    tracing::warn!(
                        value = raw.as_str(),
                        error = %error,
                        "discarding unparseable quota pause timestamp"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            auth_expired,
            auth_reason,
            quota_pause,
        })
    }

    pub fn gate(&self, now: DateTime<Utc>) -> CycleGate {
        if self.auth_expired {
            return CycleGate::AuthExpired;
        }
        match &self.quota_pause {
            Some(pause) if pause.until > now => CycleGate::QuotaPaused,
            _ => CycleGate::Proceed,
        }
    }

    /// A pause whose resume timestamp has passed; the caller auto-clears it.
    pub fn quota_pause_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(&self.quota_pause, Some(pause) if pause.until <= now)
    }
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(PAUSE_REASON_MAX_CHARS).collect()
}

pub fn record_quota_pause(
    store: &SqliteStore,
    until: DateTime<Utc>,
    reason: &str,
) -> Result<(), CoreError> {
    store.set_setting(KEY_QUOTA_PAUSE_UNTIL, &until.to_rfc3339())?;
    store.set_setting(KEY_QUOTA_PAUSE_REASON, &truncate_reason(reason))
}

pub fn clear_quota_pause(store: &SqliteStore) -> Result<(), CoreError> {
    store.delete_setting(KEY_QUOTA_PAUSE_UNTIL)?;
    store.delete_setting(KEY_QUOTA_PAUSE_REASON)
}

pub fn record_auth_expired(store: &SqliteStore, reason: &str) -> Result<(), CoreError> {
    store.set_setting(KEY_AUTH_EXPIRED, "true")?;
    store.set_setting(KEY_AUTH_REASON, &truncate_reason(reason))
}

/// Cleared by an external control action once reauthentication succeeds.
pub fn clear_auth_expired(store: &SqliteStore) -> Result<(), CoreError> {
    store.delete_setting(KEY_AUTH_EXPIRED)?;
    store.delete_setting(KEY_AUTH_REASON)
}

pub fn record_heartbeat_running(store: &SqliteStore, now: DateTime<Utc>) -> Result<(), CoreError> {
    store.set_setting(KEY_HEARTBEAT_LAST_RUN, &now.to_rfc3339())?;
    store.set_setting(KEY_HEARTBEAT_STATUS, HEARTBEAT_RUNNING)
}

pub fn record_heartbeat_idle(
    store: &SqliteStore,
    dispatched: usize,
    completed: usize,
    skipped: usize,
) -> Result<(), CoreError> {
    store.set_setting(KEY_HEARTBEAT_STATUS, HEARTBEAT_IDLE)?;
    store.set_setting(KEY_CYCLE_DISPATCHED, &dispatched.to_string())?;
    store.set_setting(KEY_CYCLE_COMPLETED, &completed.to_string())?;
    store.set_setting(KEY_CYCLE_SKIPPED, &skipped.to_string())
}

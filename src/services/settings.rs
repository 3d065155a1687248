use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::database::Database;

const SETTINGS_KEY: &str = "sync_settings";

/// Tunables for the sync reconciler.
///
/// None of these values are correctness-critical; the deletion age only has
/// to be comfortably larger than the time a new conversation needs to show
/// up in the remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// How many of the most recent remote conversations one pass looks at.
    pub window_size: usize,
    /// Page size requested from the remote listing.
    pub page_size: u32,
    /// Local conversations younger than this are never deleted by sync.
    pub deletion_min_age_hours: i64,
    /// Unconfirmed optimistic messages older than this are garbage-collected
    /// once their conversation has been synced.
    pub optimistic_ttl_minutes: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            window_size: 100,
            page_size: 100,
            deletion_min_age_hours: 24,
            optimistic_ttl_minutes: 60,
        }
    }
}

/// Upper bound for persisted ages, roughly a century.
const MAX_AGE_HOURS: i64 = 24 * 365 * 100;

impl SyncSettings {
    pub fn deletion_min_age(&self) -> Duration {
        Duration::hours(self.deletion_min_age_hours.clamp(0, MAX_AGE_HOURS))
    }

    pub fn optimistic_ttl(&self) -> Duration {
        Duration::minutes(self.optimistic_ttl_minutes.clamp(0, MAX_AGE_HOURS * 60))
    }
}

pub struct SettingsService;

impl SettingsService {
    pub async fn load(db: &Database) -> SyncSettings {
        match db.get_setting(SETTINGS_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable sync settings: {}", e);
                SyncSettings::default()
            }),
            _ => SyncSettings::default(),
        }
    }

    pub async fn save(db: &Database, settings: &SyncSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        db.set_setting(SETTINGS_KEY, &json).await
    }
}

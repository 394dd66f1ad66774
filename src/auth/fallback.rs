//! Persisted OAuth → prepaid-key fallback record.
//!
//! The record is a single `{"fallbackSince": <epoch ms> | null}` file. It is
//! re-read on every resolution and never cached in memory, because other
//! runs (and operators) may change it between calls.
//!
//! ```text
//!            OAuth unavailable / rate limit seen while on OAuth
//!   ┌───────┐ ────────────────────────────────────────────▶ ┌──────────┐
//!   │ OAuth │                                                │ Fallback │
//!   └───────┘ ◀──────────────────────────────────────────── └──────────┘
//!            window (5h) elapsed / healthy OAuth run
//! ```

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// How long fallback mode lasts before OAuth is retried.
pub const FALLBACK_DURATION: Duration = Duration::from_secs(5 * 60 * 60);

/// On-disk shape of the fallback record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackState {
    #[serde(default)]
    pub fallback_since: Option<i64>,
}

/// Where the fallback window stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStatus {
    /// No fallback recorded; OAuth is the active method.
    Inactive,
    /// Inside the window; the prepaid key should be used.
    Active {
        since: DateTime<Utc>,
        remaining: Duration,
    },
    /// A fallback was recorded but the window has elapsed.
    Expired { since: DateTime<Utc> },
}

impl FallbackState {
    pub fn status_at(&self, now: DateTime<Utc>) -> FallbackStatus {
        let Some(since_ms) = self.fallback_since else {
            return FallbackStatus::Inactive;
        };
        let since = Utc
            .timestamp_millis_opt(since_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let elapsed_ms = now.timestamp_millis().saturating_sub(since_ms);
        let window_ms = FALLBACK_DURATION.as_millis() as i64;

        if elapsed_ms < window_ms {
            FallbackStatus::Active {
                since,
                remaining: Duration::from_millis((window_ms - elapsed_ms.max(0)) as u64),
            }
        } else {
            FallbackStatus::Expired { since }
        }
    }
}

/// Narrow read/transition/write interface over the fallback record.
#[derive(Debug, Clone)]
pub struct FallbackStore {
    path: PathBuf,
}

impl FallbackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Read the record. Missing or unreadable records count as "no fallback".
    pub fn load(&self) -> FallbackState {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to read auth state");
                }
                return FallbackState::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Corrupt auth state, treating as OAuth");
                FallbackState::default()
            }
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> FallbackStatus {
        self.load().status_at(now)
    }

    fn save(&self, state: FallbackState) -> std::io::Result<()> {
        let mut body = serde_json::to_string(&state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        body.push('\n');
        super::write_atomic(&self.path, body.as_bytes())
    }

    /// OAuth → Fallback. Restarts the window at `now`.
    pub fn enter_fallback(&self, now: DateTime<Utc>) {
        let state = FallbackState {
            fallback_since: Some(now.timestamp_millis()),
        };
        match self.save(state) {
            Ok(()) => tracing::warn!(
                retry_after_hours = FALLBACK_DURATION.as_secs() / 3600,
                "Auth: entered fallback mode (prepaid API key)"
            ),
            Err(e) => tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Auth: failed to persist fallback mode"
            ),
        }
    }

    /// Fallback → OAuth. Returns whether a recorded fallback was cleared.
    pub fn clear(&self) -> bool {
        if self.load().fallback_since.is_none() {
            return false;
        }
        match self.save(FallbackState::default()) {
            Ok(()) => {
                tracing::info!("Auth: cleared fallback mode, back to OAuth");
                true
            }
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "Auth: failed to clear fallback mode"
                );
                false
            }
        }
    }
}

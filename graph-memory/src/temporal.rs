//! Bi-temporal lifecycle for facts
//!
//! Implements the Graphiti-style bi-temporal model:
//! - **Valid time**: when the relationship became true (`valid_at`) and when a
//!   newer fact superseded it (`invalid_at`)
//! - **Transaction time**: when the record was written (`created_at`) and when
//!   it was retired from the live graph (`expired_at`)
//!
//! The invariant `valid_at <= invalid_at <= expired_at` holds whenever the
//! optional fields are set; every mutator below enforces it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Lifecycle timestamps of a fact edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactTemporal {
    /// When this record was created in the system
    pub created_at: DateTime<Utc>,

    /// When the relationship became true
    pub valid_at: DateTime<Utc>,

    /// When a newer fact superseded this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<DateTime<Utc>>,

    /// When the fact was retired from the live graph
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl FactTemporal {
    /// Lifecycle for a fact that became valid now
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            valid_at: now,
            invalid_at: None,
            expired_at: None,
        }
    }

    /// Lifecycle with a specific valid_at time
    pub fn valid_from(valid_at: DateTime<Utc>) -> Self {
        Self {
            created_at: Utc::now(),
            valid_at,
            invalid_at: None,
            expired_at: None,
        }
    }

    /// Live means not expired, or expiring in the future
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        match self.expired_at {
            None => true,
            Some(expired_at) => expired_at > now,
        }
    }

    /// Live as of the current instant
    pub fn is_live(&self) -> bool {
        self.is_live_at(Utc::now())
    }

    /// Whether a newer fact has superseded this one
    pub fn is_invalidated(&self) -> bool {
        self.invalid_at.is_some()
    }

    /// Check if the relationship held at a specific point in time
    pub fn was_valid_at(&self, time: DateTime<Utc>) -> bool {
        let valid_start = self.valid_at <= time;
        let valid_end = match self.invalid_at {
            None => true,
            Some(invalid_at) => invalid_at > time,
        };
        valid_start && valid_end
    }

    /// Mark as superseded at `at`.
    ///
    /// Returns `Ok(false)` when the fact is already invalid; the first
    /// supersession time is never overwritten. Timestamps earlier than
    /// `valid_at` are clamped up to it.
    pub fn invalidate_at(&mut self, at: DateTime<Utc>) -> Result<bool> {
        if self.invalid_at.is_some() {
            return Ok(false);
        }
        let at = at.max(self.valid_at);
        if let Some(expired_at) = self.expired_at {
            if at > expired_at {
                return Err(MemoryError::validation(format!(
                    "invalid_at {} would follow expired_at {}",
                    at, expired_at
                )));
            }
        }
        self.invalid_at = Some(at);
        Ok(true)
    }

    /// Retire the fact at `at`
    pub fn expire_at(&mut self, at: DateTime<Utc>) -> Result<()> {
        let floor = self.invalid_at.unwrap_or(self.valid_at);
        if at < floor {
            return Err(MemoryError::validation(format!(
                "expired_at {} precedes {}",
                at, floor
            )));
        }
        self.expired_at = Some(at);
        Ok(())
    }

    /// Move valid_at, keeping it at or before any supersession
    pub fn set_valid_at(&mut self, valid_at: DateTime<Utc>) -> Result<()> {
        let ceiling = self.invalid_at.or(self.expired_at);
        if let Some(ceiling) = ceiling {
            if valid_at > ceiling {
                return Err(MemoryError::validation(format!(
                    "valid_at {} would follow {}",
                    valid_at, ceiling
                )));
            }
        }
        self.valid_at = valid_at;
        Ok(())
    }

    /// Check `valid_at <= invalid_at <= expired_at`
    pub fn is_consistent(&self) -> bool {
        let after_valid = |t: Option<DateTime<Utc>>| t.map_or(true, |t| t >= self.valid_at);
        let ordered = match (self.invalid_at, self.expired_at) {
            (Some(invalid_at), Some(expired_at)) => invalid_at <= expired_at,
            _ => true,
        };
        after_valid(self.invalid_at) && after_valid(self.expired_at) && ordered
    }

    /// Time since the record was created, floored at zero
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }

    /// Get the duration this relationship has been valid
    pub fn valid_duration(&self) -> Duration {
        let end = self.invalid_at.unwrap_or_else(Utc::now);
        end - self.valid_at
    }
}

impl Default for FactTemporal {
    fn default() -> Self {
        Self::now()
    }
}

/// Age in fractional days, floored at zero
pub fn age_days(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - created_at).num_seconds().max(0) as f64;
    secs / 86_400.0
}

/// Start of a look-back window of `days` ending at `now`
///
/// Negative lengths count as zero; windows reaching past the representable
/// range start at [`DateTime::MIN_UTC`].
pub fn days_before(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    window_start(now, Duration::try_days(days.max(0)))
}

/// Start of a look-back window of `hours` ending at `now`
pub fn hours_before(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    window_start(now, Duration::try_hours(hours.max(0)))
}

fn window_start(now: DateTime<Utc>, length: Option<Duration>) -> DateTime<Utc> {
    length
        .and_then(|length| now.checked_sub_signed(length))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_live_and_valid() {
        let t = FactTemporal::now();
        assert!(t.is_live());
        assert!(!t.is_invalidated());
        assert!(t.is_consistent());
    }

    #[test]
    fn test_is_live_with_future_expiry() {
        let mut t = FactTemporal::now();
        t.expired_at = Some(Utc::now() + Duration::hours(1));
        assert!(t.is_live());
    }

    #[test]
    fn test_is_live_with_past_expiry() {
        let mut t = FactTemporal::valid_from(Utc::now() - Duration::hours(3));
        t.expire_at(Utc::now() - Duration::hours(1)).unwrap();
        assert!(!t.is_live());
    }

    #[test]
    fn test_was_valid_at_with_invalid() {
        let now = Utc::now();
        let mut t = FactTemporal::valid_from(now - Duration::hours(2));
        t.invalidate_at(now - Duration::hours(1)).unwrap();

        assert!(t.was_valid_at(now - Duration::minutes(90)));
        assert!(!t.was_valid_at(now));
        assert!(!t.was_valid_at(now - Duration::hours(3)));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let now = Utc::now();
        let mut t = FactTemporal::valid_from(now - Duration::hours(2));
        assert!(t.invalidate_at(now - Duration::hours(1)).unwrap());
        assert!(!t.invalidate_at(now).unwrap());
        assert_eq!(t.invalid_at, Some(now - Duration::hours(1)));
    }

    #[test]
    fn test_invalidate_clamps_to_valid_at() {
        let now = Utc::now();
        let mut t = FactTemporal::valid_from(now);
        t.invalidate_at(now - Duration::days(1)).unwrap();
        assert_eq!(t.invalid_at, Some(now));
        assert!(t.is_consistent());
    }

    #[test]
    fn test_invalidate_after_expiry_rejected() {
        let now = Utc::now();
        let mut t = FactTemporal::valid_from(now - Duration::days(2));
        t.expire_at(now - Duration::days(1)).unwrap();
        assert!(t.invalidate_at(now).is_err());
        assert!(t.invalid_at.is_none());
    }

    #[test]
    fn test_expire_before_invalid_rejected() {
        let now = Utc::now();
        let mut t = FactTemporal::valid_from(now - Duration::days(2));
        t.invalidate_at(now - Duration::days(1)).unwrap();
        assert!(t.expire_at(now - Duration::days(2)).is_err());
        assert!(t.expire_at(now).is_ok());
        assert!(t.is_consistent());
    }

    #[test]
    fn test_set_valid_at_respects_ceiling() {
        let now = Utc::now();
        let mut t = FactTemporal::valid_from(now - Duration::days(2));
        t.invalidate_at(now - Duration::days(1)).unwrap();
        assert!(t.set_valid_at(now).is_err());
        assert!(t.set_valid_at(now - Duration::days(3)).is_ok());
    }

    #[test]
    fn test_valid_duration() {
        let now = Utc::now();
        let mut t = FactTemporal::valid_from(now - Duration::hours(2));
        t.invalidate_at(now - Duration::hours(1)).unwrap();
        assert_eq!(t.valid_duration().num_hours(), 1);
    }

    #[test]
    fn test_age_days_floor() {
        let now = Utc::now();
        assert_eq!(age_days(now + Duration::days(1), now), 0.0);
        assert!((age_days(now - Duration::days(2), now) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_start_saturates() {
        let now = Utc::now();
        assert_eq!(days_before(now, 2), now - Duration::days(2));
        assert_eq!(hours_before(now, 5), now - Duration::hours(5));
        assert_eq!(days_before(now, -3), now);
        assert_eq!(days_before(now, i64::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(hours_before(now, i64::MAX), DateTime::<Utc>::MIN_UTC);
        // Representable length, but before the earliest instant
        assert_eq!(days_before(now, 200_000_000), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_serialization() {
        let mut t = FactTemporal::now();
        t.invalidate_at(Utc::now()).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: FactTemporal = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}

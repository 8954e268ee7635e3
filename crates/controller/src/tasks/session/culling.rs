//! Time based culling: when a session is hibernated and when it is deleted.

use crate::crds::{Culling, InteractiveSessionStatus, SessionState};
use crate::tasks::session::status::{format_timestamp, parse_timestamp};
use crate::tasks::types::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use tracing::debug;

/// Parsed culling thresholds; a zero duration disables its rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullingPolicy {
    pub max_age: Duration,
    pub max_idle: Duration,
    pub max_starting: Duration,
    pub max_failed: Duration,
    pub max_hibernated: Duration,
    pub last_interaction: Option<DateTime<Utc>>,
}

fn parse_duration(field: &str, value: Option<&str>) -> Result<Duration> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(Duration::ZERO),
        Some(text) => humantime::parse_duration(text)
            .map_err(|e| Error::PolicyError(format!("culling.{field} '{text}': {e}"))),
    }
}

/// Time elapsed since `since`, zero when `since` lies in the future
fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

fn exceeds(max: Duration, now: DateTime<Utc>, since: Option<DateTime<Utc>>) -> bool {
    !max.is_zero() && since.is_some_and(|since| elapsed(now, since) > max)
}

fn deadline(since: Option<DateTime<Utc>>, max: Duration) -> Option<DateTime<Utc>> {
    if max.is_zero() {
        return None;
    }
    let max = TimeDelta::from_std(max).ok()?;
    since?.checked_add_signed(max)
}

impl CullingPolicy {
    pub fn from_spec(culling: &Culling) -> Result<Self> {
        let last_interaction = match culling.last_interaction.as_deref() {
            None | Some("") => None,
            Some(text) => Some(parse_timestamp(Some(text)).ok_or_else(|| {
                Error::PolicyError(format!("culling.lastInteraction '{text}' is not RFC3339"))
            })?),
        };

        Ok(Self {
            max_age: parse_duration("maxAge", culling.max_age.as_deref())?,
            max_idle: parse_duration("maxIdleDuration", culling.max_idle_duration.as_deref())?,
            max_starting: parse_duration(
                "maxStartingDuration",
                culling.max_starting_duration.as_deref(),
            )?,
            max_failed: parse_duration("maxFailedDuration", culling.max_failed_duration.as_deref())?,
            max_hibernated: parse_duration(
                "maxHibernatedDuration",
                culling.max_hibernated_duration.as_deref(),
            )?,
            last_interaction,
        })
    }

    /// Start of the idle window; a later user interaction restarts it
    fn idle_origin(&self, status: &InteractiveSessionStatus) -> Option<DateTime<Utc>> {
        let idle_since = parse_timestamp(status.idle_since.as_deref())?;
        Some(match self.last_interaction {
            Some(interaction) if interaction > idle_since => interaction,
            _ => idle_since,
        })
    }

    /// Whether the session must be hibernated now; `started_at` is the pod creation time
    #[must_use]
    pub fn needs_scale_down(
        &self,
        now: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        status: &InteractiveSessionStatus,
    ) -> bool {
        if status.state == SessionState::Hibernated {
            return false;
        }
        let starting = status.state == SessionState::NotReady;
        let failing_since = parse_timestamp(status.failing_since.as_deref());

        let by_age = exceeds(self.max_age, now, started_at);
        let by_starting = starting && exceeds(self.max_starting, now, started_at);
        let by_idle = exceeds(self.max_idle, now, self.idle_origin(status));
        let by_failing = exceeds(self.max_failed, now, failing_since);

        debug!(
            by_age,
            by_starting,
            by_idle,
            by_failing,
            state = %status.state,
            "Evaluated culling rules"
        );
        by_age || by_starting || by_idle || by_failing
    }

    /// Whether a hibernated session has been hibernated for too long
    #[must_use]
    pub fn needs_deletion(&self, now: DateTime<Utc>, status: &InteractiveSessionStatus) -> bool {
        status.state == SessionState::Hibernated
            && exceeds(
                self.max_hibernated,
                now,
                parse_timestamp(status.hibernated_since.as_deref()),
            )
    }

    /// Earliest date at which any enabled hibernation rule fires
    #[must_use]
    pub fn hibernation_date(
        &self,
        started_at: Option<DateTime<Utc>>,
        status: &InteractiveSessionStatus,
    ) -> Option<DateTime<Utc>> {
        if status.state == SessionState::Hibernated {
            return None;
        }
        let starting = status.state == SessionState::NotReady;
        let candidates = [
            ("MaxAge", deadline(started_at, self.max_age)),
            (
                "MaxStartingDuration",
                deadline(started_at.filter(|_| starting), self.max_starting),
            ),
            (
                "MaxFailedDuration",
                deadline(parse_timestamp(status.failing_since.as_deref()), self.max_failed),
            ),
            ("MaxIdleDuration", deadline(self.idle_origin(status), self.max_idle)),
        ];

        let mut decision = Vec::new();
        let mut earliest: Option<(&str, DateTime<Utc>)> = None;
        for (rule, date) in candidates {
            let Some(date) = date else { continue };
            decision.push(format!("{rule}:{}", format_timestamp(date)));
            if earliest.map_or(true, |(_, best)| date < best) {
                earliest = Some((rule, date));
            }
        }
        match earliest {
            Some((rule, date)) => decision.push(format!("=> {rule}:{}", format_timestamp(date))),
            None => decision.push("=> NONE".to_string()),
        }
        debug!(decision_log = %decision.join(" "), "Computed hibernation date");

        earliest.map(|(_, date)| date)
    }
}

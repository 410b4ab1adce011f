//! Full vs. incremental decision.

use crate::models::policy::CalendarRule;
use crate::models::{BackupKind, ChainMarker, ScheduleRule, Server};
use crate::services::chain_state::ChainStateStore;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backup type asked for by the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeRequest {
    #[default]
    Auto,
    Full,
    Incremental,
}

impl FromStr for TypeRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(TypeRequest::Auto),
            "full" => Ok(TypeRequest::Full),
            "incremental" | "incr" => Ok(TypeRequest::Incremental),
            other => Err(format!("unknown backup type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// No full backup exists yet
    Bootstrap,
    Requested,
    CalendarDay,
    IntervalElapsed,
    WithinInterval,
    ManualSchedule,
    /// Incremental downgraded: server has no binary log to anchor to
    LogCaptureUnavailable,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DecisionReason::Bootstrap => "no prior full backup",
            DecisionReason::Requested => "requested",
            DecisionReason::CalendarDay => "calendar rule",
            DecisionReason::IntervalElapsed => "full backup interval elapsed",
            DecisionReason::WithinInterval => "within full backup interval",
            DecisionReason::ManualSchedule => "manual full backup schedule",
            DecisionReason::LogCaptureUnavailable => "binary log unavailable",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: BackupKind,
    pub reason: DecisionReason,
}

impl Decision {
    fn full(reason: DecisionReason) -> Self {
        Self {
            kind: BackupKind::Full,
            reason,
        }
    }

    fn incremental(reason: DecisionReason) -> Self {
        Self {
            kind: BackupKind::Incremental,
            reason,
        }
    }
}

/// Decides full vs. incremental from the stored chain marker.
pub struct BackupTypeScheduler<'a> {
    store: &'a dyn ChainStateStore,
}

impl<'a> BackupTypeScheduler<'a> {
    pub fn new(store: &'a dyn ChainStateStore) -> Self {
        Self { store }
    }

    pub fn decide<E: fmt::Display>(
        &self,
        server: &Server,
        database: &str,
        request: TypeRequest,
        now: DateTime<Utc>,
        log_capture: impl FnOnce() -> Result<bool, E>,
    ) -> crate::Result<Decision> {
        let marker = self.store.get(&server.name, database)?;
        Ok(decide(
            marker.as_ref(),
            &server.schedule.full_backup_interval,
            request,
            now,
            log_capture,
        ))
    }
}

/// Decide the backup type for one database.
///
/// `log_capture` is only consulted when the answer would otherwise be
/// incremental; an error from it counts as "not available".
pub fn decide<E: fmt::Display>(
    marker: Option<&ChainMarker>,
    rule: &ScheduleRule,
    request: TypeRequest,
    now: DateTime<Utc>,
    log_capture: impl FnOnce() -> Result<bool, E>,
) -> Decision {
    let Some(marker) = marker else {
        if request == TypeRequest::Incremental {
            tracing::info!("Incremental requested but no full backup exists, taking full");
        }
        return Decision::full(DecisionReason::Bootstrap);
    };

    let tentative = match request {
        TypeRequest::Full => Decision::full(DecisionReason::Requested),
        TypeRequest::Incremental => Decision::incremental(DecisionReason::Requested),
        TypeRequest::Auto => by_schedule(marker, rule, now),
    };

    if tentative.kind == BackupKind::Full {
        return tentative;
    }

    let available = match log_capture() {
        Ok(available) => available,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine binary log status, treating as unavailable");
            false
        }
    };
    if !available {
        tracing::warn!(
            requested = ?request,
            "Policy downgrade: incremental backup needs binary logging, taking full backup instead"
        );
        return Decision::full(DecisionReason::LogCaptureUnavailable);
    }

    tentative
}

fn by_schedule(marker: &ChainMarker, rule: &ScheduleRule, now: DateTime<Utc>) -> Decision {
    match rule {
        ScheduleRule::Manual => Decision::incremental(DecisionReason::ManualSchedule),
        ScheduleRule::Interval(interval) => {
            if now - marker.last_full >= *interval {
                Decision::full(DecisionReason::IntervalElapsed)
            } else {
                Decision::incremental(DecisionReason::WithinInterval)
            }
        }
        ScheduleRule::Calendar(calendar) => {
            let due_today = match calendar {
                CalendarRule::DayOfMonth(day) => now.day() == *day,
                CalendarRule::Weekday(weekday) => now.weekday() == *weekday,
            };
            let full_taken_today = marker.last_full.date_naive() == now.date_naive();
            if due_today && !full_taken_today {
                Decision::full(DecisionReason::CalendarDay)
            } else {
                Decision::incremental(DecisionReason::CalendarDay)
            }
        }
    }
}

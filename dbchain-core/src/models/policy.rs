use crate::utils::errors::{BackupError, Result};
use chrono::{Duration, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schemas skipped by ALL/EXCLUDE selections unless explicitly included.
pub const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    All,
    Specific,
    Exclude,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSetSelection {
    #[serde(default = "default_selection_mode")]
    pub mode: SelectionMode,

    /// Databases to back up in SPECIFIC mode
    #[serde(default)]
    pub databases: Vec<String>,

    /// Databases to skip in EXCLUDE mode
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Back up system schemas as well
    #[serde(default)]
    pub include_system: bool,
}

fn default_selection_mode() -> SelectionMode {
    SelectionMode::All
}

impl Default for BackupSetSelection {
    fn default() -> Self {
        Self {
            mode: SelectionMode::All,
            databases: Vec::new(),
            exclude: Vec::new(),
            include_system: false,
        }
    }
}

/// Outcome of matching a selection against the live database list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSelection {
    pub databases: Vec<String>,
    /// Explicitly requested databases the server does not have.
    pub missing: Vec<String>,
}

impl BackupSetSelection {
    pub fn validate(&self) -> Result<()> {
        if self.mode == SelectionMode::Specific && self.databases.is_empty() {
            return Err(BackupError::Config(
                "selection mode 'specific' requires a non-empty database list".into(),
            ));
        }
        Ok(())
    }

    /// Resolve against `live`, preserving the server's enumeration order
    /// (or the configured order for SPECIFIC).
    pub fn resolve(&self, live: &[String]) -> Result<ResolvedSelection> {
        self.validate()?;

        let is_system = |db: &str| SYSTEM_SCHEMAS.contains(&db);

        let resolved = match self.mode {
            SelectionMode::Specific => {
                let mut databases = Vec::new();
                let mut missing = Vec::new();
                for name in &self.databases {
                    if databases.contains(name) || missing.contains(name) {
                        continue;
                    }
                    if live.contains(name) {
                        databases.push(name.clone());
                    } else {
                        missing.push(name.clone());
                    }
                }
                ResolvedSelection { databases, missing }
            }
            SelectionMode::All | SelectionMode::Exclude => {
                let databases = live
                    .iter()
                    .filter(|db| self.include_system || !is_system(db))
                    .filter(|db| self.mode == SelectionMode::All || !self.exclude.contains(db))
                    .cloned()
                    .collect();
                ResolvedSelection {
                    databases,
                    missing: Vec::new(),
                }
            }
        };

        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,

    /// Most recent full backups that survive regardless of age
    #[serde(default = "default_min_full_backups_kept")]
    pub min_full_backups_kept: u32,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_retention_enabled() -> bool {
    true
}

fn default_min_full_backups_kept() -> u32 {
    2
}

/// A century; anything longer is a typo.
pub const MAX_AGE_DAYS_LIMIT: u32 = 36_500;

fn default_max_age_days() -> u32 {
    30
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            enabled: default_retention_enabled(),
            min_full_backups_kept: default_min_full_backups_kept(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.min_full_backups_kept < 1 {
            return Err(BackupError::Config(
                "retention.min_full_backups_kept must be at least 1".into(),
            ));
        }
        if !(1..=MAX_AGE_DAYS_LIMIT).contains(&self.max_age_days) {
            return Err(BackupError::Config(format!(
                "retention.max_age_days must be between 1 and {MAX_AGE_DAYS_LIMIT}"
            )));
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::days(i64::from(self.max_age_days))
    }
}

/// Calendar day on which a full backup is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarRule {
    DayOfMonth(u32),
    Weekday(Weekday),
}

/// When a full backup is due.
///
/// Accepted spellings: `manual`, `<N>d`, `<N>h`, `<N>m`, `monthly`,
/// `monthly:<day>` (1-28), `weekly:<weekday>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleRule {
    Manual,
    Interval(Duration),
    Calendar(CalendarRule),
}

impl Default for ScheduleRule {
    fn default() -> Self {
        ScheduleRule::Interval(Duration::days(7))
    }
}

impl FromStr for ScheduleRule {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim().to_ascii_lowercase();
        let invalid = || BackupError::Config(format!("invalid full backup interval '{s}'"));

        if raw == "manual" {
            return Ok(ScheduleRule::Manual);
        }
        if raw == "monthly" {
            return Ok(ScheduleRule::Calendar(CalendarRule::DayOfMonth(1)));
        }
        if let Some(day) = raw.strip_prefix("monthly:") {
            let day: u32 = day.parse().map_err(|_| invalid())?;
            if !(1..=28).contains(&day) {
                return Err(invalid());
            }
            return Ok(ScheduleRule::Calendar(CalendarRule::DayOfMonth(day)));
        }
        if let Some(day) = raw.strip_prefix("weekly:") {
            let weekday: Weekday = day.parse().map_err(|_| invalid())?;
            return Ok(ScheduleRule::Calendar(CalendarRule::Weekday(weekday)));
        }

        let unit_start = raw.char_indices().last().map(|(i, _)| i).ok_or_else(invalid)?;
        let (amount, unit) = raw.split_at(unit_start);
        let amount: i64 = amount.parse().map_err(|_| invalid())?;
        if amount <= 0 {
            return Err(invalid());
        }
        let interval = match unit {
            "d" => Duration::try_days(amount),
            "h" => Duration::try_hours(amount),
            "m" => Duration::try_minutes(amount),
            _ => return Err(invalid()),
        };
        interval.map(ScheduleRule::Interval).ok_or_else(invalid)
    }
}

impl TryFrom<String> for ScheduleRule {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScheduleRule> for String {
    fn from(rule: ScheduleRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for ScheduleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleRule::Manual => write!(f, "manual"),
            ScheduleRule::Interval(d) => {
                let minutes = d.num_minutes();
                if minutes % (24 * 60) == 0 {
                    write!(f, "{}d", minutes / (24 * 60))
                } else if minutes % 60 == 0 {
                    write!(f, "{}h", minutes / 60)
                } else {
                    write!(f, "{}m", minutes)
                }
            }
            ScheduleRule::Calendar(CalendarRule::DayOfMonth(day)) => write!(f, "monthly:{day}"),
            ScheduleRule::Calendar(CalendarRule::Weekday(day)) => {
                write!(f, "weekly:{}", day.to_string().to_ascii_lowercase())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub full_backup_interval: ScheduleRule,
}

//! Restore planning: which full backup to start from and which
//! incrementals to replay on top of it, for a point in time.

use crate::models::artifact::sort_chronologically;
use crate::models::{BackupArtifact, BackupKind, Server};
use crate::ports::DatabaseBackupPort;
use crate::services::artifact_store::ArtifactStore;
use crate::utils::errors::{BackupError, ChainIntegrityError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "at")]
pub enum RestoreTarget {
    Latest,
    At(DateTime<Utc>),
}

impl RestoreTarget {
    fn admits(&self, ts: DateTime<Utc>) -> bool {
        match self {
            RestoreTarget::Latest => true,
            RestoreTarget::At(target) => ts <= *target,
        }
    }
}

impl fmt::Display for RestoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreTarget::Latest => write!(f, "latest"),
            RestoreTarget::At(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// Accepts `latest`, RFC 3339, `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS`
/// (UTC) and `YYYY-MM-DD` (end of that day, UTC).
impl FromStr for RestoreTarget {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        if raw.eq_ignore_ascii_case("latest") {
            return Ok(RestoreTarget::Latest);
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(RestoreTarget::At(ts.with_timezone(&Utc)));
        }
        for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Ok(RestoreTarget::At(naive.and_utc()));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
            return Ok(RestoreTarget::At(date.and_time(end_of_day).and_utc()));
        }
        Err(BackupError::Config(format!("unrecognised restore target '{s}'")))
    }
}

/// Ordered apply list: the baseline full, then incrementals ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    pub server: String,
    pub database: String,
    pub target: RestoreTarget,
    pub baseline: BackupArtifact,
    pub incrementals: Vec<BackupArtifact>,
}

impl RestorePlan {
    pub fn steps(&self) -> impl Iterator<Item = &BackupArtifact> {
        std::iter::once(&self.baseline).chain(self.incrementals.iter())
    }

    pub fn step_count(&self) -> usize {
        1 + self.incrementals.len()
    }

    /// Point in time the plan actually restores to.
    pub fn restores_to(&self) -> DateTime<Utc> {
        self.incrementals
            .last()
            .map(|a| a.created_at)
            .unwrap_or(self.baseline.created_at)
    }
}

/// Build a restore plan from the artifacts of one database.
pub fn plan(
    server: &str,
    database: &str,
    artifacts: &[BackupArtifact],
    target: RestoreTarget,
) -> std::result::Result<RestorePlan, ChainIntegrityError> {
    let mut sorted = artifacts.to_vec();
    sort_chronologically(server, database, &mut sorted)?;

    let baseline = sorted
        .iter()
        .rev()
        .filter(|a| a.kind == BackupKind::Full)
        .find(|a| target.admits(a.created_at))
        .cloned()
        .ok_or_else(|| ChainIntegrityError::NoSuitableBaseline {
            server: server.to_string(),
            database: database.to_string(),
            target: target.to_string(),
        })?;

    let incrementals: Vec<BackupArtifact> = sorted
        .into_iter()
        .filter(|a| a.kind == BackupKind::Incremental)
        .filter(|a| a.created_at > baseline.created_at && target.admits(a.created_at))
        .collect();

    Ok(RestorePlan {
        server: server.to_string(),
        database: database.to_string(),
        target,
        baseline,
        incrementals,
    })
}

pub struct RestorePlanner<'a> {
    artifacts: &'a dyn ArtifactStore,
}

impl<'a> RestorePlanner<'a> {
    pub fn new(artifacts: &'a dyn ArtifactStore) -> Self {
        Self { artifacts }
    }

    pub fn plan(&self, server: &Server, database: &str, target: RestoreTarget) -> Result<RestorePlan> {
        let artifacts = self.artifacts.list(server, database)?;
        let plan = plan(&server.name, database, &artifacts, target)?;
        tracing::info!(
            server = %server.name,
            database,
            target = %target,
            baseline = %plan.baseline.created_at,
            incrementals = plan.incrementals.len(),
            "Restore plan built"
        );
        Ok(plan)
    }

    /// Apply every step of `plan` in order; the first failure aborts.
    pub fn execute(&self, plan: &RestorePlan, port: &dyn DatabaseBackupPort) -> Result<()> {
        for (step, artifact) in plan.steps().enumerate() {
            tracing::info!(
                server = %plan.server,
                database = %plan.database,
                step = step + 1,
                of = plan.step_count(),
                kind = %artifact.kind,
                created_at = %artifact.created_at,
                "Applying backup"
            );
            let mut source = self.artifacts.open(artifact)?;
            port.apply(&plan.database, &mut source).map_err(|e| match e {
                BackupError::Apply { .. } => e,
                other => BackupError::Apply {
                    server: plan.server.clone(),
                    database: plan.database.clone(),
                    reason: format!("{} ({}): {}", artifact.file_name(), artifact.kind, other),
                },
            })?;
        }
        tracing::info!(
            server = %plan.server,
            database = %plan.database,
            restored_to = %plan.restores_to(),
            "Restore completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{artifact, day, FakePort, MemoryArtifactStore};
    use chrono::TimeZone;

    fn scenario_c() -> Vec<BackupArtifact> {
        vec![
            artifact(BackupKind::Full, day(10)),
            artifact(BackupKind::Incremental, day(5)),
            artifact(BackupKind::Full, day(1)),
            artifact(BackupKind::Incremental, day(3)),
        ]
    }

    fn times(plan: &RestorePlan) -> Vec<DateTime<Utc>> {
        plan.steps().map(|a| a.created_at).collect()
    }

    #[test]
    fn test_scenario_c_point_in_time() {
        let plan = plan("db1", "app", &scenario_c(), RestoreTarget::At(day(7))).unwrap();
        assert_eq!(times(&plan), vec![day(1), day(3), day(5)]);
        assert_eq!(plan.baseline.kind, BackupKind::Full);
        assert_eq!(plan.restores_to(), day(5));
    }

    #[test]
    fn test_latest_uses_newest_full() {
        let mut artifacts = scenario_c();
        artifacts.push(artifact(BackupKind::Incremental, day(12)));
        let plan = plan("db1", "app", &artifacts, RestoreTarget::Latest).unwrap();
        assert_eq!(times(&plan), vec![day(10), day(12)]);
    }

    #[test]
    fn test_target_on_full_boundary() {
        let plan = plan("db1", "app", &scenario_c(), RestoreTarget::At(day(10))).unwrap();
        assert_eq!(times(&plan), vec![day(10)]);

        let plan2 = plan_at(day(3));
        assert_eq!(times(&plan2), vec![day(1), day(3)]);
    }

    fn plan_at(target: DateTime<Utc>) -> RestorePlan {
        plan("db1", "app", &scenario_c(), RestoreTarget::At(target)).unwrap()
    }

    #[test]
    fn test_plan_shape_holds_for_every_target() {
        for d in 1..=15 {
            let target = day(d);
            let plan = plan_at(target);
            assert!(plan.baseline.is_full());
            assert!(plan.baseline.created_at <= target);
            let mut previous = plan.baseline.created_at;
            for incr in &plan.incrementals {
                assert_eq!(incr.kind, BackupKind::Incremental);
                assert!(incr.created_at > previous);
                assert!(incr.created_at <= target);
                previous = incr.created_at;
            }
        }
    }

    #[test]
    fn test_target_before_every_full() {
        let artifacts = vec![
            artifact(BackupKind::Incremental, day(2)),
            artifact(BackupKind::Full, day(4)),
        ];
        let err = plan("db1", "app", &artifacts, RestoreTarget::At(day(3))).unwrap_err();
        assert!(matches!(err, ChainIntegrityError::NoSuitableBaseline { .. }));

        let err = plan("db1", "app", &[], RestoreTarget::Latest).unwrap_err();
        assert!(matches!(err, ChainIntegrityError::NoSuitableBaseline { .. }));
    }

    #[test]
    fn test_orphans_are_never_offered() {
        let artifacts = vec![
            artifact(BackupKind::Incremental, day(1)),
            artifact(BackupKind::Full, day(2)),
            artifact(BackupKind::Incremental, day(3)),
        ];
        let plan = plan("db1", "app", &artifacts, RestoreTarget::Latest).unwrap();
        assert_eq!(times(&plan), vec![day(2), day(3)]);
    }

    #[test]
    fn test_duplicate_timestamps_fail() {
        let artifacts = vec![
            artifact(BackupKind::Full, day(1)),
            artifact(BackupKind::Incremental, day(3)),
            artifact(BackupKind::Full, day(3)),
        ];
        let err = plan("db1", "app", &artifacts, RestoreTarget::Latest).unwrap_err();
        assert!(matches!(err, ChainIntegrityError::DuplicateTimestamp { .. }));
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!("latest".parse::<RestoreTarget>().unwrap(), RestoreTarget::Latest);
        assert_eq!(
            "2024-01-07".parse::<RestoreTarget>().unwrap(),
            RestoreTarget::At(Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 59).unwrap())
        );
        assert_eq!(
            "2024-01-07 08:30:00".parse::<RestoreTarget>().unwrap(),
            RestoreTarget::At(Utc.with_ymd_and_hms(2024, 1, 7, 8, 30, 0).unwrap())
        );
        assert_eq!(
            "2024-01-07T10:30:00+02:00".parse::<RestoreTarget>().unwrap(),
            RestoreTarget::At(Utc.with_ymd_and_hms(2024, 1, 7, 8, 30, 0).unwrap())
        );
        assert!("last tuesday".parse::<RestoreTarget>().is_err());
    }

    #[test]
    fn test_execute_applies_in_order() {
        let store = MemoryArtifactStore::default();
        let server = Server::for_tests("db1", "/tmp/unused".into());
        for a in scenario_c() {
            store.insert(a);
        }
        let port = FakePort::default();
        let planner = RestorePlanner::new(&store);

        let plan = planner.plan(&server, "app", RestoreTarget::At(day(7))).unwrap();
        planner.execute(&plan, &port).unwrap();

        let applied = port.applied();
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[0], ("app".to_string(), store.content_of(&plan.baseline)));
    }

    #[test]
    fn test_execute_stops_at_first_failure() {
        let store = MemoryArtifactStore::default();
        let server = Server::for_tests("db1", "/tmp/unused".into());
        for a in scenario_c() {
            store.insert(a);
        }
        let port = FakePort::default().failing_apply_after(1);
        let planner = RestorePlanner::new(&store);

        let plan = planner.plan(&server, "app", RestoreTarget::At(day(7))).unwrap();
        let err = planner.execute(&plan, &port).unwrap_err();
        assert!(matches!(err, BackupError::Apply { .. }));
        assert_eq!(port.applied().len(), 1);
    }
}

// Batch recompute of league constants for one season.
//
// Sequence:
//   1. Load the season's games (exclusions applied)
//   2. Sample and check box-score invariants
//   3. On failure, fail open to the pinned version or stop with no fallback
//   4. Pick the prior from the gate's last good version (or the seed)
//   5. Estimate empirical constants from league totals
//   6. Stabilize against the prior and scan for alerts
//   7. Write the update log, save the successor version, record success
//
// A failure in step 7 goes through the gate like a failed check. A version
// saved without a matching healthy entry is never used as a prior.
//
// Only one job may run against a reports directory at a time; the gate's
// files are last-write-wins.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use statline_core::config::Config;
use statline_core::constants::{ConstantsSet, ConstantsStore, LeagueConstants, StoreError};
use statline_core::estimate::{estimate_constants, stabilize_constants};
use statline_core::quality::{ConstantsInfo, FailOpenController, QualityError, TestResults};
use statline_core::shrink::{
    check_alert_conditions_with, generate_update_log, AlertCheck, Severity, ShrinkContext,
    UpdateLog, UpdateMetadata,
};
use statline_core::stats::{sum_stats, BattingLine, GameRecord, PitchingLine};

use crate::invariants::{run_invariant_checks, InvariantReport};
use crate::source::StatsSource;

/// Version label recorded when the prior came from the built-in seed.
pub const SEED_VERSION: &str = "seed";

#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error("quality gate failed and no fallback version is available: {reason}")]
    NoFallback { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Quality(#[from] QualityError),

    #[error("failed to write update log {path}: {message}")]
    UpdateLog { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecomputeRequest {
    pub year: i32,
    pub league: String,
    pub month: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum RecomputeOutcome {
    /// A new constants version was accepted.
    Updated {
        version: String,
        baseline: String,
        update_log: PathBuf,
        log: UpdateLog,
        alerts: AlertCheck,
        results: TestResults,
    },
    /// The gate failed; live constants stay on `pinned`.
    FailedOpen {
        pinned: String,
        reason: String,
        results: TestResults,
    },
}

pub struct RecomputeJob<'a, S: ?Sized> {
    source: &'a S,
    store: &'a ConstantsStore,
    gate: &'a FailOpenController,
    config: &'a Config,
    reports_dir: PathBuf,
}

impl<'a, S: StatsSource + ?Sized> RecomputeJob<'a, S> {
    pub fn new(
        source: &'a S,
        store: &'a ConstantsStore,
        gate: &'a FailOpenController,
        config: &'a Config,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            store,
            gate,
            config,
            reports_dir: reports_dir.into(),
        }
    }

    pub async fn run(
        &self,
        request: &RecomputeRequest,
        now: DateTime<Utc>,
    ) -> Result<RecomputeOutcome, RecomputeError> {
        let year = request.year;
        let league = &request.league;
        info!("recompute started for {year}/{league}");

        let games = match self
            .source
            .games(year, league, &self.config.invariants.exclude)
            .await
        {
            Ok(games) => games,
            Err(e) => {
                return self.fail(
                    &format!("failed to load games: {e}"),
                    TestResults::default(),
                    now,
                )
            }
        };

        let today: NaiveDate = now.date_naive();
        let report: InvariantReport = match run_invariant_checks(
            self.source,
            &games,
            &self.config.invariants,
            year,
            today,
            now,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                return self.fail(
                    &format!("failed to load box scores: {e}"),
                    TestResults::default(),
                    now,
                )
            }
        };
        if let Some(reason) = report.failure_reason() {
            return self.fail(&reason, report.results, now);
        }

        let lines = match (
            self.source.batting_lines(year, league).await,
            self.source.pitching_lines(year, league).await,
        ) {
            (Ok(b), Ok(p)) => (b, p),
            (Err(e), _) | (_, Err(e)) => {
                return self.fail(
                    &format!("failed to load season lines: {e}"),
                    report.results,
                    now,
                )
            }
        };

        match self.publish(request, &games, &lines.0, &lines.1, report.results, now) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("failed to publish constants for {year}/{league}: {e}");
                self.fail(
                    &format!("failed to publish constants: {e}"),
                    report.results,
                    now,
                )
            }
        }
    }

    /// Steps 4 to 7 for a run whose checks passed.
    fn publish(
        &self,
        request: &RecomputeRequest,
        games: &[GameRecord],
        batting_lines: &[BattingLine],
        pitching_lines: &[PitchingLine],
        results: TestResults,
        now: DateTime<Utc>,
    ) -> Result<RecomputeOutcome, RecomputeError> {
        let year = request.year;
        let league = &request.league;
        let batting = sum_stats(batting_lines);
        let pitching = sum_stats(pitching_lines);

        let (base, prior, baseline) = self.prior(year, league, now)?;
        let empirical = estimate_constants(&prior, &batting, &pitching, games);
        let ctx = ShrinkContext {
            league: league.clone(),
            year,
        };
        let stabilized = stabilize_constants(&prior, &empirical, &self.config.shrink, &ctx);

        let alerts = check_alert_conditions_with(&stabilized.results, &self.config.alerts);
        for alert in &alerts.alerts {
            match alert.severity {
                Severity::Error => error!(
                    "{}: {} (delta {:.4}, n={})",
                    alert.coefficient, alert.reason, alert.delta, alert.sample_size
                ),
                Severity::Warning => warn!(
                    "{}: {} (delta {:.4}, n={})",
                    alert.coefficient, alert.reason, alert.delta, alert.sample_size
                ),
            }
        }
        if alerts.should_alert {
            warn!("constants update for {year}/{league} needs operator review");
        }

        let log = generate_update_log(
            &stabilized.results,
            UpdateMetadata {
                league: league.clone(),
                year,
                month: request.month,
            },
        );

        let set = base.successor(stabilized.constants, now);
        let update_log = self.write_update_log(&set.version, &log)?;
        self.store.save(&set)?;

        self.gate.record_successful_execution_at(
            &set.version,
            results,
            ConstantsInfo {
                baseline_version: baseline.clone(),
                last_update: now.to_rfc3339(),
            },
            now,
        )?;

        info!(
            "constants {} accepted for {year}/{league}: {} of {} coefficients changed, {} guarded",
            set.version,
            log.summary.changed_coefficients,
            log.summary.total_coefficients,
            log.summary.guarded_coefficients
        );
        Ok(RecomputeOutcome::Updated {
            version: set.version,
            baseline,
            update_log,
            log,
            alerts,
            results,
        })
    }

    /// Hand a failure to the gate. A pinned version keeps the job
    /// successful; no fallback is an error.
    fn fail(
        &self,
        reason: &str,
        results: TestResults,
        now: DateTime<Utc>,
    ) -> Result<RecomputeOutcome, RecomputeError> {
        match self.gate.handle_quality_failure_at(reason, results, now) {
            Some(pinned) => Ok(RecomputeOutcome::FailedOpen {
                pinned,
                reason: reason.to_string(),
                results,
            }),
            None => Err(RecomputeError::NoFallback {
                reason: reason.to_string(),
            }),
        }
    }

    /// The set to build on, the prior for this season and the prior's
    /// version. Only the gate's last good version counts; within it, falls
    /// back to last season's record, then the seed.
    fn prior(
        &self,
        year: i32,
        league: &str,
        now: DateTime<Utc>,
    ) -> Result<(ConstantsSet, LeagueConstants, String), RecomputeError> {
        let accepted = match self.gate.last_good_version()? {
            Some(version) => Some(self.store.load(&version)?),
            None => None,
        };
        match accepted {
            Some(set) => {
                let prior = set
                    .get(year, league)
                    .or_else(|| set.get(year - 1, league))
                    .cloned()
                    .unwrap_or_else(|| LeagueConstants::seed(year, league));
                let version = set.version.clone();
                Ok((set, prior, version))
            }
            None => {
                info!("no accepted constants version yet, starting from seed");
                let empty = ConstantsSet {
                    version: SEED_VERSION.to_string(),
                    updated: now,
                    constants: Vec::new(),
                };
                Ok((
                    empty,
                    LeagueConstants::seed(year, league),
                    SEED_VERSION.to_string(),
                ))
            }
        }
    }

    fn write_update_log(&self, version: &str, log: &UpdateLog) -> Result<PathBuf, RecomputeError> {
        let dir = self.reports_dir.join("updates");
        let path = dir.join(format!(
            "{version}_{}_{}.json",
            log.metadata.run.year, log.metadata.run.league
        ));
        write_log(&dir, &path, log).map_err(|message| RecomputeError::UpdateLog {
            path: path.clone(),
            message,
        })?;
        Ok(path)
    }
}

fn write_log(dir: &Path, path: &Path, log: &UpdateLog) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(log).map_err(|e| e.to_string())?;
    std::fs::write(path, json).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{ctx, game, test_db};
    use crate::source::{BoxScore, FetchError, SqliteSource};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use statline_core::config::QualityConfig;
    use statline_core::quality::PublicStatus;
    use statline_core::shrink::{AlertThresholds, ShrinkConfig};
    use statline_core::stats::{BattingStats, PitchingStats};
    use statline_core::tolerance::{
        AdditionalInvariants, AutoRelaxation, ExclusionRules, InvariantsConfig, SamplingConfig,
        StratifiedSampling,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "statline_recompute_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(root: &Path) -> Config {
        Config {
            db_path: ":memory:".into(),
            constants_dir: root.join("constants").display().to_string(),
            quality: QualityConfig {
                reports_dir: root.join(".reports").display().to_string(),
                public_status_dir: root.join("public").display().to_string(),
                pin_env: "STATLINE_TEST_PIN_UNSET".into(),
                degraded_window_hours: 24,
            },
            shrink: ShrinkConfig::default(),
            alerts: AlertThresholds::default(),
            invariants: InvariantsConfig {
                version: "test".into(),
                updated: "2024-09-01".into(),
                sampling: SamplingConfig {
                    recent_days: 30,
                    random_historic: 10,
                    seed: "test".into(),
                    max_sample_size: 50,
                },
                tolerance: [("R".to_string(), 0.0)].into_iter().collect(),
                auto_relaxation: AutoRelaxation {
                    enabled: false,
                    small_sample_threshold: 0,
                    relaxation_factor: 1.0,
                    max_relaxation: 1.0,
                },
                exclude: ExclusionRules::default(),
                stratified_sampling: StratifiedSampling::default(),
                additional_invariants: AdditionalInvariants::default(),
                temporary_relaxation: BTreeMap::new(),
            },
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap()
    }

    /// A consistent 4-3 home win with one batter and one pitcher a side.
    fn seeded_source(home_runs_reported: u32) -> SqliteSource {
        let db = test_db();
        let home = BattingStats {
            pa: 38,
            ab: 33,
            h: 10,
            doubles: 2,
            hr: 1,
            bb: 4,
            hbp: 1,
            so: 6,
            r: 4,
            ..Default::default()
        };
        let away = BattingStats {
            pa: 36,
            ab: 32,
            h: 8,
            doubles: 1,
            bb: 3,
            sf: 1,
            so: 9,
            r: 3,
            ..Default::default()
        };
        let home_staff = PitchingStats {
            ip_outs: 27,
            bf: 36,
            h: 8,
            r: 3,
            er: 3,
            bb: 3,
            so: 9,
            ..Default::default()
        };
        let away_staff = PitchingStats {
            ip_outs: 24,
            bf: 38,
            h: 10,
            r: 4,
            er: 4,
            hr: 1,
            bb: 4,
            hbp: 1,
            so: 6,
            ..Default::default()
        };
        db.import_box_scores(
            &[game("g1", 18, home_runs_reported, 3)],
            &[
                BattingLine {
                    ctx: ctx("g1", "Swallows", "s"),
                    stats: home,
                },
                BattingLine {
                    ctx: ctx("g1", "Giants", "g"),
                    stats: away,
                },
            ],
            &[
                PitchingLine {
                    ctx: ctx("g1", "Swallows", "sp"),
                    stats: home_staff,
                },
                PitchingLine {
                    ctx: ctx("g1", "Giants", "gp"),
                    stats: away_staff,
                },
            ],
        )
        .unwrap();
        SqliteSource::new(Arc::new(db))
    }

    fn parts(root: &Path) -> (Config, ConstantsStore, FailOpenController) {
        let cfg = config(root);
        let store = ConstantsStore::new(&cfg.constants_dir);
        let gate =
            FailOpenController::new(&cfg.quality.reports_dir, &cfg.quality.public_status_dir);
        (cfg, store, gate)
    }

    fn request() -> RecomputeRequest {
        RecomputeRequest {
            year: 2024,
            league: "central".into(),
            month: Some(5),
        }
    }

    #[tokio::test]
    async fn passing_run_saves_version_and_records_success() {
        let root = scratch("pass");
        let (cfg, store, gate) = parts(&root);
        let source = seeded_source(4);
        let job = RecomputeJob::new(&source, &store, &gate, &cfg, &cfg.quality.reports_dir);

        let outcome = job.run(&request(), now()).await.unwrap();
        let RecomputeOutcome::Updated {
            version,
            baseline,
            update_log,
            log,
            results,
            ..
        } = outcome
        else {
            panic!("expected an update");
        };

        assert_eq!(baseline, SEED_VERSION);
        assert!(results.all_passed());
        assert!(update_log.exists());
        assert_eq!(log.metadata.run.month, Some(5));

        // A tiny sample keeps every coefficient at the seed
        let saved = store.load(&version).unwrap();
        let c = saved.get(2024, "central").unwrap();
        assert_eq!(c.woba_bb, LeagueConstants::seed(2024, "central").woba_bb);
        assert!(log.coefficients.values().all(|r| r.is_guarded));

        assert_eq!(gate.last_good_version().unwrap(), Some(version.clone()));
        assert!(matches!(
            gate.get_quality_status(),
            PublicStatus::Healthy { .. }
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failing_checks_without_history_is_fatal() {
        let root = scratch("nofallback");
        let (cfg, store, gate) = parts(&root);
        // Score says 5, lines sum to 4
        let source = seeded_source(5);
        let job = RecomputeJob::new(&source, &store, &gate, &cfg, &cfg.quality.reports_dir);

        let err = job.run(&request(), now()).await.unwrap_err();
        assert!(matches!(err, RecomputeError::NoFallback { .. }));
        assert!(store.latest().unwrap().is_none());
        match gate.get_quality_status() {
            PublicStatus::Degraded { pinned_version, .. } => assert_eq!(pinned_version, None),
            other => panic!("expected degraded, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failing_checks_fall_back_to_last_good_version() {
        let root = scratch("failopen");
        let (cfg, store, gate) = parts(&root);

        let good = seeded_source(4);
        let first = RecomputeJob::new(&good, &store, &gate, &cfg, &cfg.quality.reports_dir)
            .run(&request(), now())
            .await
            .unwrap();
        let RecomputeOutcome::Updated { version, .. } = first else {
            panic!("first run should update");
        };

        let bad = seeded_source(5);
        let later = now() + chrono::Duration::hours(1);
        let outcome = RecomputeJob::new(&bad, &store, &gate, &cfg, &cfg.quality.reports_dir)
            .run(&request(), later)
            .await
            .unwrap();
        match outcome {
            RecomputeOutcome::FailedOpen {
                pinned, results, ..
            } => {
                assert_eq!(pinned, version);
                assert_eq!(results.failed, 1);
            }
            other => panic!("expected fail-open, got {other:?}"),
        }
        // No new version was written
        assert_eq!(store.list_versions().unwrap(), vec![version]);
        assert!(gate.is_fail_open_mode_at(later));

        let _ = std::fs::remove_dir_all(&root);
    }

    /// Replace `reports_dir/updates` with a plain file so the update log
    /// cannot be written.
    fn block_update_logs(cfg: &Config) {
        let updates = Path::new(&cfg.quality.reports_dir).join("updates");
        let _ = std::fs::remove_dir_all(&updates);
        std::fs::create_dir_all(&cfg.quality.reports_dir).unwrap();
        std::fs::write(&updates, "not a directory").unwrap();
    }

    #[tokio::test]
    async fn unwritable_update_log_saves_nothing() {
        let root = scratch("nolog");
        let (cfg, store, gate) = parts(&root);
        block_update_logs(&cfg);
        let source = seeded_source(4);
        let job = RecomputeJob::new(&source, &store, &gate, &cfg, &cfg.quality.reports_dir);

        let err = job.run(&request(), now()).await.unwrap_err();
        match err {
            RecomputeError::NoFallback { reason } => {
                assert!(reason.contains("failed to write update log"));
            }
            other => panic!("expected no fallback, got {other:?}"),
        }
        assert!(store.list_versions().unwrap().is_empty());
        assert_eq!(gate.last_good_version().unwrap(), None);
        assert!(matches!(
            gate.get_quality_status(),
            PublicStatus::Degraded { .. }
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn unwritable_update_log_fails_open_and_keeps_prior() {
        let root = scratch("nolog_history");
        let (cfg, store, gate) = parts(&root);
        let source = seeded_source(4);
        let job = RecomputeJob::new(&source, &store, &gate, &cfg, &cfg.quality.reports_dir);

        let RecomputeOutcome::Updated { version: good, .. } =
            job.run(&request(), now()).await.unwrap()
        else {
            panic!("first run should update");
        };

        block_update_logs(&cfg);
        let later = now() + chrono::Duration::hours(1);
        match job.run(&request(), later).await.unwrap() {
            RecomputeOutcome::FailedOpen { pinned, reason, .. } => {
                assert_eq!(pinned, good);
                assert!(reason.starts_with("failed to publish constants"));
            }
            other => panic!("expected fail-open, got {other:?}"),
        }
        assert_eq!(store.list_versions().unwrap(), vec![good.clone()]);

        // A version in the store that the gate never accepted is not a prior
        let stray = ConstantsSet {
            version: "v20240520_150000_000".into(),
            updated: later,
            constants: vec![LeagueConstants::seed(2024, "central")],
        };
        store.save(&stray).unwrap();
        std::fs::remove_file(Path::new(&cfg.quality.reports_dir).join("updates")).unwrap();

        let last = now() + chrono::Duration::hours(2);
        match job.run(&request(), last).await.unwrap() {
            RecomputeOutcome::Updated { baseline, .. } => assert_eq!(baseline, good),
            other => panic!("expected an update, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    /// Source whose every query fails.
    struct BrokenSource;

    #[async_trait]
    impl StatsSource for BrokenSource {
        async fn games(
            &self,
            _year: i32,
            _league: &str,
            _exclude: &ExclusionRules,
        ) -> Result<Vec<GameRecord>, FetchError> {
            Err(FetchError::Join("unavailable".into()))
        }

        async fn batting_lines(
            &self,
            _year: i32,
            _league: &str,
        ) -> Result<Vec<BattingLine>, FetchError> {
            Err(FetchError::Join("unavailable".into()))
        }

        async fn pitching_lines(
            &self,
            _year: i32,
            _league: &str,
        ) -> Result<Vec<PitchingLine>, FetchError> {
            Err(FetchError::Join("unavailable".into()))
        }

        async fn box_score(&self, _game_id: &str) -> Result<BoxScore, FetchError> {
            Err(FetchError::Join("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn unavailable_source_uses_pin() {
        let root = scratch("pinned");
        let (cfg, store, gate) = parts(&root);
        let gate = gate.with_pin(Some("v20240101_000000_000".into()));
        let job =
            RecomputeJob::new(&BrokenSource, &store, &gate, &cfg, &cfg.quality.reports_dir);

        let outcome = job.run(&request(), now()).await.unwrap();
        match outcome {
            RecomputeOutcome::FailedOpen { pinned, reason, .. } => {
                assert_eq!(pinned, "v20240101_000000_000");
                assert!(reason.starts_with("failed to load games"));
            }
            other => panic!("expected fail-open, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&root);
    }
}

// Box-score invariant checks over a stratified sample of games.
//
// Per team and game:
//   - team_runs:        game score vs summed batting R
//   - pa_decomposition: PA vs AB + BB + HBP + SF + SH
//   - team_box_cross:   batting totals vs the opposing pitching totals
//   - ip_outs:          pitching outs vs the innings the game lasted
//
// Every comparison passes when the gap is within the metric's adjusted
// tolerance. Tolerances are resolved once per run.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use statline_core::quality::TestResults;
use statline_core::sampling::stratified_sample;
use statline_core::stats::{BattingStats, GameRecord, PitchingStats};
use statline_core::tolerance::InvariantsConfig;

use crate::source::{BoxScore, FetchError, StatsSource};

pub const CHECK_TEAM_RUNS: &str = "team_runs";
pub const CHECK_PA_DECOMPOSITION: &str = "pa_decomposition";
pub const CHECK_TEAM_BOX_CROSS: &str = "team_box_cross";
pub const CHECK_IP_OUTS: &str = "ip_outs";

/// Regulation length of a game.
const REGULATION_INNINGS: u32 = 9;

/// Result of one comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub game_id: String,
    pub team: String,
    pub check: &'static str,
    pub metric: String,
    /// Closest acceptable value to `actual`.
    pub expected: i64,
    pub actual: i64,
    pub tolerance: u32,
    pub passed: bool,
}

impl CheckOutcome {
    pub fn gap(&self) -> i64 {
        (self.actual - self.expected).abs()
    }
}

/// Everything one run of checks produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvariantReport {
    pub sampled: usize,
    /// Sampled games that had box-score lines to check.
    pub covered: usize,
    pub outcomes: Vec<CheckOutcome>,
    pub results: TestResults,
}

impl InvariantReport {
    pub fn from_outcomes(sampled: usize, covered: usize, outcomes: Vec<CheckOutcome>) -> Self {
        let passed = outcomes.iter().filter(|o| o.passed).count() as u32;
        let total = outcomes.len() as u32;
        let coverage_pct = if sampled == 0 {
            0.0
        } else {
            covered as f64 / sampled as f64 * 100.0
        };
        Self {
            sampled,
            covered,
            outcomes,
            results: TestResults {
                total,
                passed,
                failed: total - passed,
                coverage_pct,
            },
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    /// Why the gate should fail, or `None` when it should pass. A run that
    /// checked nothing fails.
    pub fn failure_reason(&self) -> Option<String> {
        if self.results.total == 0 {
            return Some(format!(
                "no invariant checks ran ({} games sampled, {} with box scores)",
                self.sampled, self.covered
            ));
        }
        let first = self.failures().next()?;
        Some(format!(
            "{} of {} invariant checks failed; first: {} {} for {}/{} expected {} got {} (tolerance {})",
            self.results.failed,
            self.results.total,
            first.check,
            first.metric,
            first.game_id,
            first.team,
            first.expected,
            first.actual,
            first.tolerance
        ))
    }
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Runs the per-game checks against one configuration.
pub struct InvariantChecker<'a> {
    config: &'a InvariantsConfig,
    year: i32,
    sample_size: u32,
    now: DateTime<Utc>,
    tolerances: BTreeMap<String, u32>,
}

impl<'a> InvariantChecker<'a> {
    /// `sample_size` is the number of games in the checked sample; small
    /// samples get the auto-relaxed tolerance.
    pub fn new(
        config: &'a InvariantsConfig,
        year: i32,
        sample_size: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            year,
            sample_size,
            now,
            tolerances: BTreeMap::new(),
        }
    }

    pub fn tolerance(&mut self, metric: &str) -> u32 {
        if let Some(t) = self.tolerances.get(metric) {
            return *t;
        }
        let t = self
            .config
            .adjusted_tolerance_at(metric, self.sample_size, Some(self.year), self.now);
        self.tolerances.insert(metric.to_string(), t);
        t
    }

    fn outcome(
        &mut self,
        game: &GameRecord,
        team: &str,
        check: &'static str,
        metric: &str,
        range: (i64, i64),
        actual: i64,
    ) -> CheckOutcome {
        let tolerance = self.tolerance(metric);
        let expected = actual.clamp(range.0, range.1);
        let passed = (actual - expected).abs() <= i64::from(tolerance);
        if !passed {
            debug!(
                "{check} {metric} failed for {}/{team}: expected {expected}, got {actual}",
                game.game_id
            );
        }
        CheckOutcome {
            game_id: game.game_id.clone(),
            team: team.to_string(),
            check,
            metric: metric.to_string(),
            expected,
            actual,
            tolerance,
            passed,
        }
    }

    /// Check one game. A team with no lines on a side skips the checks that
    /// need that side.
    pub fn check_game(&mut self, game: &GameRecord, box_score: &BoxScore) -> Vec<CheckOutcome> {
        let extra = self.config.additional_invariants.clone();
        let mut out = Vec::new();

        for (team, opponent) in [
            (game.home_team.as_str(), game.away_team.as_str()),
            (game.away_team.as_str(), game.home_team.as_str()),
        ] {
            let batting = batting_total(box_score, team);
            let opposing = pitching_total(box_score, opponent);
            let own_pitching = pitching_total(box_score, team);

            if let Some(bat) = &batting {
                if let Some(runs) = game.runs_for(team) {
                    let runs = i64::from(runs);
                    out.push(self.outcome(
                        game,
                        team,
                        CHECK_TEAM_RUNS,
                        "R",
                        (runs, runs),
                        i64::from(bat.r),
                    ));
                }

                if extra.pa_decomposition.enabled {
                    let parts = [bat.ab, bat.bb, bat.hbp, bat.sf, bat.sh]
                        .into_iter()
                        .map(i64::from)
                        .sum::<i64>();
                    out.push(self.outcome(
                        game,
                        team,
                        CHECK_PA_DECOMPOSITION,
                        "PA",
                        (parts, parts),
                        i64::from(bat.pa),
                    ));
                }

                if extra.team_box_cross.enabled {
                    if let Some(pit) = &opposing {
                        for metric in &extra.team_box_cross.metrics {
                            let Some((b, p)) = cross_pair(metric, bat, pit) else {
                                warn!("unknown team_box_cross metric `{metric}`, skipping");
                                continue;
                            };
                            let allowed = i64::from(p);
                            out.push(self.outcome(
                                game,
                                team,
                                CHECK_TEAM_BOX_CROSS,
                                metric,
                                (allowed, allowed),
                                i64::from(b),
                            ));
                        }
                    }
                }
            }

            if extra.ip_outs_consistency.enabled {
                if let Some(pit) = &own_pitching {
                    let range = outs_range(
                        game,
                        team == game.home_team,
                        extra.ip_outs_consistency.extra_innings_allowed,
                    );
                    out.push(self.outcome(
                        game,
                        team,
                        CHECK_IP_OUTS,
                        "IP_outs",
                        range,
                        i64::from(pit.ip_outs),
                    ));
                }
            }
        }
        out
    }
}

fn batting_total(box_score: &BoxScore, team: &str) -> Option<BattingStats> {
    let mut lines = box_score.batting.iter().filter(|l| l.ctx.team == team).peekable();
    lines.peek()?;
    let mut total = BattingStats::default();
    for line in lines {
        total += line.stats;
    }
    Some(total)
}

fn pitching_total(box_score: &BoxScore, team: &str) -> Option<PitchingStats> {
    let mut lines = box_score.pitching.iter().filter(|l| l.ctx.team == team).peekable();
    lines.peek()?;
    let mut total = PitchingStats::default();
    for line in lines {
        total += line.stats;
    }
    Some(total)
}

/// Batting count and the matching count allowed by the opposing staff.
fn cross_pair(metric: &str, bat: &BattingStats, pit: &PitchingStats) -> Option<(u32, u32)> {
    match metric {
        "R" => Some((bat.r, pit.r)),
        "H" => Some((bat.h, pit.h)),
        "HR" => Some((bat.hr, pit.hr)),
        "BB" => Some((bat.bb, pit.bb)),
        "IBB" => Some((bat.ibb, pit.ibb)),
        "HBP" => Some((bat.hbp, pit.hbp)),
        "SO" => Some((bat.so, pit.so)),
        _ => None,
    }
}

/// Acceptable outs recorded by one team's pitchers.
///
/// The home staff pitches every top half. The visiting staff can be short
/// one inning (or part of one) when the home side won and did not need, or
/// did not finish, the last bottom half. Unknown innings mean nine, with no
/// upper bound when extra innings are allowed.
fn outs_range(game: &GameRecord, home_staff: bool, extra_allowed: bool) -> (i64, i64) {
    let (innings, open_ended) = match game.innings {
        Some(n) if extra_allowed => (n, false),
        Some(n) => (n.min(REGULATION_INNINGS), false),
        None => (REGULATION_INNINGS, extra_allowed),
    };
    let full = i64::from(innings) * 3;
    let upper = if open_ended { i64::MAX } else { full };
    if !home_staff && game.home_runs > game.away_runs {
        (full - 3, upper)
    } else {
        (full, upper)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Sample `games`, fetch each sampled box score and check it.
pub async fn run_invariant_checks<S>(
    source: &S,
    games: &[GameRecord],
    config: &InvariantsConfig,
    year: i32,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<InvariantReport, FetchError>
where
    S: StatsSource + ?Sized,
{
    let sample = stratified_sample(games, config, today);
    let mut checker = InvariantChecker::new(config, year, sample.len() as u32, now);

    let mut outcomes = Vec::new();
    let mut covered = 0;
    for sampled in &sample {
        let box_score = source.box_score(&sampled.game.game_id).await?;
        if box_score.batting.is_empty() && box_score.pitching.is_empty() {
            warn!("no box score for sampled game {}", sampled.game.game_id);
            continue;
        }
        covered += 1;
        outcomes.extend(checker.check_game(&sampled.game, &box_score));
    }

    let report = InvariantReport::from_outcomes(sample.len(), covered, outcomes);
    info!(
        "invariant checks: {}/{} passed over {} sampled games ({:.1}% covered)",
        report.results.passed,
        report.results.total,
        report.sampled,
        report.results.coverage_pct
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{ctx, game, test_db};
    use crate::source::SqliteSource;
    use chrono::TimeZone;
    use statline_core::stats::{BattingLine, PitchingLine};
    use statline_core::tolerance::{
        AdditionalInvariants, AutoRelaxation, ExclusionRules, SamplingConfig, StratifiedSampling,
    };
    use std::sync::Arc;

    fn config(auto_relax: bool) -> InvariantsConfig {
        let tolerance: BTreeMap<String, f64> = [
            ("R", 0.0),
            ("H", 1.0),
            ("HR", 0.0),
            ("BB", 1.0),
            ("SO", 1.0),
            ("PA", 2.0),
            ("IP_outs", 3.0),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
        InvariantsConfig {
            version: "test".into(),
            updated: "2024-09-01".into(),
            sampling: SamplingConfig {
                recent_days: 7,
                random_historic: 10,
                seed: "test".into(),
                max_sample_size: 50,
            },
            tolerance,
            auto_relaxation: AutoRelaxation {
                enabled: auto_relax,
                small_sample_threshold: 20,
                relaxation_factor: 2.0,
                max_relaxation: 3.0,
            },
            exclude: ExclusionRules::default(),
            stratified_sampling: StratifiedSampling::default(),
            additional_invariants: AdditionalInvariants::default(),
            temporary_relaxation: BTreeMap::new(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn bat(game_id: &str, team: &str, player: &str, stats: BattingStats) -> BattingLine {
        BattingLine {
            ctx: ctx(game_id, team, player),
            stats,
        }
    }

    fn pitch(game_id: &str, team: &str, player: &str, stats: PitchingStats) -> PitchingLine {
        PitchingLine {
            ctx: ctx(game_id, team, player),
            stats,
        }
    }

    /// Swallows beat Giants 3-2 at home in nine; the visitors' staff records
    /// 24 outs because the bottom of the ninth was not played.
    fn consistent_box(game_id: &str) -> BoxScore {
        let swallows = BattingStats {
            pa: 36,
            ab: 31,
            h: 8,
            hr: 1,
            bb: 3,
            hbp: 1,
            sf: 1,
            so: 7,
            r: 3,
            ..Default::default()
        };
        let giants = BattingStats {
            pa: 35,
            ab: 32,
            h: 6,
            hr: 0,
            bb: 2,
            sh: 1,
            so: 9,
            r: 2,
            ..Default::default()
        };
        BoxScore {
            batting: vec![
                bat(game_id, "Swallows", "s", swallows),
                bat(game_id, "Giants", "g", giants),
            ],
            pitching: vec![
                pitch(
                    game_id,
                    "Swallows",
                    "sp",
                    PitchingStats {
                        ip_outs: 27,
                        bf: 35,
                        h: 6,
                        r: 2,
                        er: 2,
                        bb: 2,
                        so: 9,
                        ..Default::default()
                    },
                ),
                pitch(
                    game_id,
                    "Giants",
                    "gp",
                    PitchingStats {
                        ip_outs: 24,
                        bf: 36,
                        h: 8,
                        r: 3,
                        er: 3,
                        hr: 1,
                        bb: 3,
                        hbp: 1,
                        so: 7,
                        ..Default::default()
                    },
                ),
            ],
        }
    }

    // ------------------------------------------------------------------
    // Per-game checks
    // ------------------------------------------------------------------

    #[test]
    fn consistent_game_passes_every_check() {
        let cfg = config(false);
        let mut checker = InvariantChecker::new(&cfg, 2024, 50, now());
        let outcomes = checker.check_game(&game("g1", 1, 3, 2), &consistent_box("g1"));

        // Per team: runs, PA, five cross metrics, outs
        assert_eq!(outcomes.len(), 16);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.passed).collect();
        assert!(failed.is_empty(), "unexpected failures: {failed:?}");
    }

    #[test]
    fn huge_counts_fail_without_overflowing() {
        let cfg = config(false);
        let mut checker = InvariantChecker::new(&cfg, 2024, 50, now());
        let mut box_score = consistent_box("g1");
        box_score.batting.push(bat(
            "g1",
            "Swallows",
            "x",
            BattingStats {
                pa: u32::MAX,
                ab: u32::MAX,
                bb: u32::MAX,
                ..Default::default()
            },
        ));

        let outcomes = checker.check_game(&game("g1", 1, 3, 2), &box_score);
        let pa = outcomes
            .iter()
            .find(|o| o.check == CHECK_PA_DECOMPOSITION && o.team == "Swallows")
            .unwrap();
        assert!(!pa.passed);
        assert_eq!(pa.actual, i64::from(u32::MAX));
        // AB and BB saturate, then HBP 1 and SF 1 from the real line
        assert_eq!(pa.expected, 2 * i64::from(u32::MAX) + 2);
    }

    #[test]
    fn run_mismatch_fails_team_runs() {
        let cfg = config(false);
        let mut checker = InvariantChecker::new(&cfg, 2024, 50, now());
        // Score says 4, batting lines sum to 3
        let outcomes = checker.check_game(&game("g1", 1, 4, 2), &consistent_box("g1"));
        let runs: Vec<_> = outcomes
            .iter()
            .filter(|o| o.check == CHECK_TEAM_RUNS && !o.passed)
            .collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].team, "Swallows");
        assert_eq!(runs[0].expected, 4);
        assert_eq!(runs[0].actual, 3);
        assert_eq!(runs[0].gap(), 1);
    }

    #[test]
    fn small_sample_relaxes_tolerance() {
        let cfg = config(true);
        // R base tolerance 0 stays 0 after relaxation; H 1 -> 2
        let mut checker = InvariantChecker::new(&cfg, 2024, 5, now());
        assert_eq!(checker.tolerance("R"), 0);
        assert_eq!(checker.tolerance("H"), 2);
        assert_eq!(checker.tolerance("IP_outs"), 6);
        // Unlisted metrics use the default base tolerance
        assert_eq!(checker.tolerance("SB"), 4);
    }

    #[test]
    fn outs_range_rules() {
        let mut g = game("g1", 1, 3, 2);
        assert_eq!(outs_range(&g, true, true), (27, 27));
        assert_eq!(outs_range(&g, false, true), (24, 27));

        g.home_runs = 1;
        assert_eq!(outs_range(&g, false, true), (27, 27));

        g.innings = Some(12);
        assert_eq!(outs_range(&g, true, true), (36, 36));
        assert_eq!(outs_range(&g, true, false), (27, 27));

        g.innings = None;
        assert_eq!(outs_range(&g, true, true), (27, i64::MAX));
        assert_eq!(outs_range(&g, true, false), (27, 27));
    }

    #[test]
    fn disabled_extras_only_check_runs() {
        let mut cfg = config(false);
        cfg.additional_invariants.pa_decomposition.enabled = false;
        cfg.additional_invariants.ip_outs_consistency.enabled = false;
        cfg.additional_invariants.team_box_cross.enabled = false;
        let mut checker = InvariantChecker::new(&cfg, 2024, 50, now());
        let outcomes = checker.check_game(&game("g1", 1, 3, 2), &consistent_box("g1"));
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.check == CHECK_TEAM_RUNS));
    }

    // ------------------------------------------------------------------
    // Report
    // ------------------------------------------------------------------

    #[test]
    fn empty_run_is_a_failure() {
        let report = InvariantReport::from_outcomes(0, 0, Vec::new());
        assert_eq!(report.results.total, 0);
        assert_eq!(report.results.coverage_pct, 0.0);
        assert!(report.failure_reason().is_some());
    }

    #[test]
    fn failure_reason_names_first_failure() {
        let cfg = config(false);
        let mut checker = InvariantChecker::new(&cfg, 2024, 50, now());
        let outcomes = checker.check_game(&game("g1", 1, 4, 2), &consistent_box("g1"));
        let report = InvariantReport::from_outcomes(1, 1, outcomes);
        assert_eq!(report.results.failed, 1);
        let reason = report.failure_reason().unwrap();
        assert!(reason.starts_with("1 of 16 invariant checks failed"));
        assert!(reason.contains("team_runs R for g1/Swallows"));
    }

    // ------------------------------------------------------------------
    // End to end over SQLite
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn run_checks_over_database() {
        let db = test_db();
        let b = consistent_box("g1");
        db.import_box_scores(
            &[game("g1", 1, 3, 2), game("g2", 2, 0, 0)],
            &b.batting,
            &b.pitching,
        )
        .unwrap();
        let source = SqliteSource::new(Arc::new(db));
        let cfg = config(false);
        let games = source
            .games(2024, "central", &cfg.exclude)
            .await
            .unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 5, 3).unwrap();
        let report = run_invariant_checks(&source, &games, &cfg, 2024, today, now())
            .await
            .unwrap();
        assert_eq!(report.sampled, 2);
        // g2 has no lines
        assert_eq!(report.covered, 1);
        assert_eq!(report.results.coverage_pct, 50.0);
        assert!(report.results.all_passed());
        assert!(report.failure_reason().is_none());
    }
}

// Invariant-check configuration: tolerances with auto-relaxation, game
// exclusions, and the CI summary of the active settings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::stats::GameRecord;

/// Tolerance used for metrics without a configured base value.
pub const DEFAULT_BASE_TOLERANCE: f64 = 2.0;

// ---------------------------------------------------------------------------
// Configuration structs (invariants.toml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantsConfig {
    pub version: String,
    pub updated: String,
    pub sampling: SamplingConfig,
    /// Metric name (R, H, HR, AB, BB, SO, PA, IP_outs, ...) -> base tolerance.
    #[serde(default)]
    pub tolerance: BTreeMap<String, f64>,
    pub auto_relaxation: AutoRelaxation,
    #[serde(default)]
    pub exclude: ExclusionRules,
    #[serde(default)]
    pub stratified_sampling: StratifiedSampling,
    #[serde(default)]
    pub additional_invariants: AdditionalInvariants,
    /// Year (as a string key) -> temporary relaxation window.
    #[serde(default)]
    pub temporary_relaxation: BTreeMap<String, RelaxationWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub recent_days: u32,
    pub random_historic: usize,
    pub seed: String,
    pub max_sample_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoRelaxation {
    pub enabled: bool,
    pub small_sample_threshold: u32,
    pub relaxation_factor: f64,
    pub max_relaxation: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRules {
    #[serde(default)]
    pub leagues: Vec<String>,
    /// Glob patterns over game IDs (`*` any run, `?` one character).
    #[serde(default)]
    pub game_patterns: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub specific_games: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratifiedSampling {
    pub enabled: bool,
    pub recent: RecentStratum,
    pub historic: HistoricStratum,
    pub edge_cases: EdgeCaseStratum,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecentStratum {
    pub days: u32,
    pub full_coverage: bool,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricStratum {
    pub random_count: usize,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeCaseStratum {
    pub high_scoring_min_runs: u32,
    pub high_scoring_count: usize,
    pub extra_innings_min: u32,
    pub extra_innings_count: usize,
    pub weight: f64,
}

impl Default for StratifiedSampling {
    fn default() -> Self {
        Self {
            enabled: false,
            recent: RecentStratum {
                days: 7,
                full_coverage: true,
                weight: 1.0,
            },
            historic: HistoricStratum {
                random_count: 12,
                weight: 0.5,
            },
            edge_cases: EdgeCaseStratum {
                high_scoring_min_runs: 15,
                high_scoring_count: 3,
                extra_innings_min: 10,
                extra_innings_count: 3,
                weight: 0.8,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalInvariants {
    #[serde(default = "enabled")]
    pub pa_decomposition: Toggle,
    #[serde(default = "enabled_ip_outs")]
    pub ip_outs_consistency: IpOutsToggle,
    #[serde(default = "enabled_cross")]
    pub team_box_cross: CrossCheckToggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpOutsToggle {
    pub enabled: bool,
    /// Allow more than nine innings of outs when the game went extra.
    #[serde(default = "yes")]
    pub extra_innings_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossCheckToggle {
    pub enabled: bool,
    /// Metrics compared between a team's batting lines and the opposing
    /// pitching lines.
    pub metrics: Vec<String>,
}

fn yes() -> bool {
    true
}

fn enabled() -> Toggle {
    Toggle { enabled: true }
}

fn enabled_ip_outs() -> IpOutsToggle {
    IpOutsToggle {
        enabled: true,
        extra_innings_allowed: true,
    }
}

fn enabled_cross() -> CrossCheckToggle {
    CrossCheckToggle {
        enabled: true,
        metrics: ["R", "H", "HR", "BB", "SO"].iter().map(|s| s.to_string()).collect(),
    }
}

impl Default for AdditionalInvariants {
    fn default() -> Self {
        Self {
            pa_decomposition: enabled(),
            ip_outs_consistency: enabled_ip_outs(),
            team_box_cross: enabled_cross(),
        }
    }
}

impl AdditionalInvariants {
    /// Names of the enabled extra invariants, in a fixed order.
    pub fn enabled_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.pa_decomposition.enabled {
            names.push("PA_decomposition");
        }
        if self.ip_outs_consistency.enabled {
            names.push("IP_outs_consistency");
        }
        if self.team_box_cross.enabled {
            names.push("team_box_cross");
        }
        names
    }
}

/// A temporary, dated relaxation for one season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaxationWindow {
    pub reason: String,
    pub multiplier: f64,
    /// RFC 3339 timestamp or `YYYY-MM-DD` (midnight UTC).
    pub expires: String,
}

impl RelaxationWindow {
    /// Parsed expiry, or `None` when the value is unreadable.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&self.expires) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(&self.expires, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    /// Active strictly before expiry. Unreadable expiries count as expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires) => now < expires,
            None => {
                warn!(
                    "ignoring temporary relaxation with unreadable expiry `{}`",
                    self.expires
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tolerances
// ---------------------------------------------------------------------------

impl InvariantsConfig {
    /// Base tolerance for `metric`, or `DEFAULT_BASE_TOLERANCE` when unset.
    pub fn base_tolerance(&self, metric: &str) -> f64 {
        self.tolerance
            .get(metric)
            .copied()
            .unwrap_or(DEFAULT_BASE_TOLERANCE)
    }

    /// Tolerance for `metric` given the current time.
    pub fn adjusted_tolerance(&self, metric: &str, sample_size: u32, year: Option<i32>) -> u32 {
        self.adjusted_tolerance_at(metric, sample_size, year, Utc::now())
    }

    /// Tolerance for `metric` at `now`.
    ///
    /// The year's temporary multiplier (if unexpired) applies first, then the
    /// small-sample factor `min(relaxation_factor, max_relaxation)`, then the
    /// result is rounded to the nearest integer.
    pub fn adjusted_tolerance_at(
        &self,
        metric: &str,
        sample_size: u32,
        year: Option<i32>,
        now: DateTime<Utc>,
    ) -> u32 {
        let mut tolerance = self.base_tolerance(metric);

        if let Some(window) = year.and_then(|y| self.temporary_relaxation.get(&y.to_string())) {
            if window.is_active(now) {
                tolerance *= window.multiplier;
                warn!(
                    "applied temporary relaxation for {}: {} ({}x)",
                    year.unwrap_or_default(),
                    window.reason,
                    window.multiplier
                );
            }
        }

        let auto = &self.auto_relaxation;
        if auto.enabled && sample_size < auto.small_sample_threshold {
            let factor = auto.relaxation_factor.min(auto.max_relaxation);
            let relaxed = tolerance * factor;
            warn!(
                "auto-relaxed tolerance for {metric}: {tolerance} -> {relaxed} (sample size: {sample_size})"
            );
            tolerance = relaxed;
        }

        tolerance.round().max(0.0) as u32
    }

    // -----------------------------------------------------------------------
    // CI summary
    // -----------------------------------------------------------------------

    /// Markdown description of the active configuration for PR comments.
    pub fn config_summary(&self) -> String {
        let tol = |m: &str| self.base_tolerance(m);
        let active = self
            .additional_invariants
            .enabled_names()
            .iter()
            .map(|n| format!("- {n}"))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "## Game Invariant Test Configuration\n\n\
             **Version**: {} ({})\n\n\
             **Sampling**: {}d recent + {} historic (max {})\n\n\
             **Tolerances**: R±{}, H±{}, HR±{}, AB±{}, BB±{}, SO±{}\n\n\
             **Auto-Relaxation**: {} ({}x for samples <{})\n\n\
             **Active Invariants**:\n{}\n\n\
             **Exclusions**: {} patterns, {} teams, {} specific games",
            self.version,
            self.updated,
            self.sampling.recent_days,
            self.sampling.random_historic,
            self.sampling.max_sample_size,
            tol("R"),
            tol("H"),
            tol("HR"),
            tol("AB"),
            tol("BB"),
            tol("SO"),
            if self.auto_relaxation.enabled { "Enabled" } else { "Disabled" },
            self.auto_relaxation.relaxation_factor,
            self.auto_relaxation.small_sample_threshold,
            active,
            self.exclude.game_patterns.len(),
            self.exclude.teams.len(),
            self.exclude.specific_games.len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Exclusions
// ---------------------------------------------------------------------------

/// A parameterized SQL predicate over a `games` table with columns
/// `game_id`, `league`, `home_team`, `away_team`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionClause {
    pub sql: String,
    pub params: Vec<String>,
}

/// Translate a game-ID glob into a LIKE pattern with `\` as escape.
fn glob_to_like(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len());
    for c in glob.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Glob match with `*` (any run, including empty) and `?` (one character).
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

impl ExclusionRules {
    /// Build the WHERE predicate that keeps only non-excluded games.
    /// With no rules the predicate is `1=1`.
    pub fn build_exclusion_clause(&self) -> ExclusionClause {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        for league in &self.leagues {
            clauses.push("league != ?".to_string());
            params.push(league.clone());
        }
        for pattern in &self.game_patterns {
            clauses.push("game_id NOT LIKE ? ESCAPE '\\'".to_string());
            params.push(glob_to_like(pattern));
        }
        for team in &self.teams {
            clauses.push("home_team != ? AND away_team != ?".to_string());
            params.push(team.clone());
            params.push(team.clone());
        }
        for game_id in &self.specific_games {
            clauses.push("game_id != ?".to_string());
            params.push(game_id.clone());
        }

        let sql = if clauses.is_empty() {
            "1=1".to_string()
        } else {
            clauses.join(" AND ")
        };
        ExclusionClause { sql, params }
    }

    /// In-memory counterpart of `build_exclusion_clause`.
    pub fn is_excluded(&self, game: &GameRecord) -> bool {
        self.leagues.iter().any(|l| *l == game.league)
            || self
                .game_patterns
                .iter()
                .any(|p| glob_matches(p, &game.game_id))
            || self
                .teams
                .iter()
                .any(|t| *t == game.home_team || *t == game.away_team)
            || self.specific_games.iter().any(|g| *g == game.game_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

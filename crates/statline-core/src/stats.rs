// Counting-stat bundles and the per-game lines they are summed from.
//
// Everything downstream (formula engine, estimators, team splits) consumes
// these normalized shapes only. Raw scraped records are mapped into them by
// `normalize` at the boundary.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::AddAssign;

// ---------------------------------------------------------------------------
// Games
// ---------------------------------------------------------------------------

/// One game's header row: who played where, and the final score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: String,
    pub date: NaiveDate,
    pub year: i32,
    pub league: String,
    pub venue: String,
    pub home_team: String,
    pub away_team: String,
    pub home_runs: u32,
    pub away_runs: u32,
    /// Innings played, when the source reports it.
    pub innings: Option<u32>,
}

impl GameRecord {
    pub fn total_runs(&self) -> u64 {
        u64::from(self.home_runs) + u64::from(self.away_runs)
    }

    /// Runs scored by `team` in this game, or `None` if it did not play.
    pub fn runs_for(&self, team: &str) -> Option<u32> {
        if team == self.home_team {
            Some(self.home_runs)
        } else if team == self.away_team {
            Some(self.away_runs)
        } else {
            None
        }
    }

    /// The other side of the game from `team`.
    pub fn opponent_of(&self, team: &str) -> Option<&str> {
        if team == self.home_team {
            Some(&self.away_team)
        } else if team == self.away_team {
            Some(&self.home_team)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Counting-stat bundles
// ---------------------------------------------------------------------------

/// Aggregated batting totals for a player, team, or league.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattingStats {
    #[serde(rename = "PA")]
    pub pa: u32,
    #[serde(rename = "AB")]
    pub ab: u32,
    #[serde(rename = "H")]
    pub h: u32,
    #[serde(rename = "2B", default)]
    pub doubles: u32,
    #[serde(rename = "3B", default)]
    pub triples: u32,
    #[serde(rename = "HR", default)]
    pub hr: u32,
    #[serde(rename = "BB", default)]
    pub bb: u32,
    #[serde(rename = "IBB", default)]
    pub ibb: u32,
    #[serde(rename = "HBP", default)]
    pub hbp: u32,
    #[serde(rename = "SF", default)]
    pub sf: u32,
    #[serde(rename = "SH", default)]
    pub sh: u32,
    #[serde(rename = "SO", default)]
    pub so: u32,
    #[serde(rename = "R", default)]
    pub r: u32,
    #[serde(rename = "RBI", default)]
    pub rbi: u32,
    #[serde(rename = "SB", default)]
    pub sb: u32,
    #[serde(rename = "CS", default)]
    pub cs: u32,
}

impl BattingStats {
    /// Singles, derived as `H - 2B - 3B - HR` (saturating at zero).
    pub fn singles(&self) -> u32 {
        self.h
            .saturating_sub(self.doubles)
            .saturating_sub(self.triples)
            .saturating_sub(self.hr)
    }

    /// Walks excluding intentional walks.
    pub fn unintentional_bb(&self) -> u32 {
        self.bb.saturating_sub(self.ibb)
    }

    /// Total bases: `H + 2B + 2*3B + 3*HR`.
    pub fn total_bases(&self) -> u64 {
        u64::from(self.h)
            + u64::from(self.doubles)
            + 2 * u64::from(self.triples)
            + 3 * u64::from(self.hr)
    }

    /// Returns a description of the first violated count invariant, if any.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        if self.pa < self.ab {
            return Some("PA must be >= AB");
        }
        if self.h > self.ab {
            return Some("H must be <= AB");
        }
        let extra_base = u64::from(self.doubles) + u64::from(self.triples) + u64::from(self.hr);
        if extra_base > u64::from(self.h) {
            return Some("extra-base hits exceed H");
        }
        if self.ibb > self.bb {
            return Some("IBB must be <= BB");
        }
        None
    }
}

impl AddAssign for BattingStats {
    fn add_assign(&mut self, rhs: Self) {
        self.pa = self.pa.saturating_add(rhs.pa);
        self.ab = self.ab.saturating_add(rhs.ab);
        self.h = self.h.saturating_add(rhs.h);
        self.doubles = self.doubles.saturating_add(rhs.doubles);
        self.triples = self.triples.saturating_add(rhs.triples);
        self.hr = self.hr.saturating_add(rhs.hr);
        self.bb = self.bb.saturating_add(rhs.bb);
        self.ibb = self.ibb.saturating_add(rhs.ibb);
        self.hbp = self.hbp.saturating_add(rhs.hbp);
        self.sf = self.sf.saturating_add(rhs.sf);
        self.sh = self.sh.saturating_add(rhs.sh);
        self.so = self.so.saturating_add(rhs.so);
        self.r = self.r.saturating_add(rhs.r);
        self.rbi = self.rbi.saturating_add(rhs.rbi);
        self.sb = self.sb.saturating_add(rhs.sb);
        self.cs = self.cs.saturating_add(rhs.cs);
    }
}

/// Aggregated pitching totals. Innings are carried as outs so that thirds
/// of an inning stay exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitchingStats {
    #[serde(rename = "IP_outs")]
    pub ip_outs: u32,
    #[serde(rename = "BF", default)]
    pub bf: u32,
    #[serde(rename = "H", default)]
    pub h: u32,
    #[serde(rename = "R", default)]
    pub r: u32,
    #[serde(rename = "ER", default)]
    pub er: u32,
    #[serde(rename = "HR", default)]
    pub hr: u32,
    #[serde(rename = "BB", default)]
    pub bb: u32,
    #[serde(rename = "IBB", default)]
    pub ibb: u32,
    #[serde(rename = "HBP", default)]
    pub hbp: u32,
    #[serde(rename = "SO", default)]
    pub so: u32,
}

impl PitchingStats {
    /// Innings pitched as a real number (`outs / 3`).
    pub fn innings(&self) -> f64 {
        self.ip_outs as f64 / 3.0
    }

    pub fn unintentional_bb(&self) -> u32 {
        self.bb.saturating_sub(self.ibb)
    }

    pub fn invariant_violation(&self) -> Option<&'static str> {
        if self.er > self.r {
            return Some("ER must be <= R");
        }
        if self.hr > self.h {
            return Some("HR must be <= H");
        }
        if self.ibb > self.bb {
            return Some("IBB must be <= BB");
        }
        None
    }
}

impl AddAssign for PitchingStats {
    fn add_assign(&mut self, rhs: Self) {
        self.ip_outs = self.ip_outs.saturating_add(rhs.ip_outs);
        self.bf = self.bf.saturating_add(rhs.bf);
        self.h = self.h.saturating_add(rhs.h);
        self.r = self.r.saturating_add(rhs.r);
        self.er = self.er.saturating_add(rhs.er);
        self.hr = self.hr.saturating_add(rhs.hr);
        self.bb = self.bb.saturating_add(rhs.bb);
        self.ibb = self.ibb.saturating_add(rhs.ibb);
        self.hbp = self.hbp.saturating_add(rhs.hbp);
        self.so = self.so.saturating_add(rhs.so);
    }
}

// ---------------------------------------------------------------------------
// Per-game lines
// ---------------------------------------------------------------------------

/// Where and for whom a single box-score line was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineContext {
    pub game_id: String,
    pub year: i32,
    pub league: String,
    pub venue: String,
    pub team: String,
    pub player_id: String,
    pub player_name: String,
    /// True when `team` was the home side of the game.
    pub home: bool,
}

/// One player's batting line in one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattingLine {
    pub ctx: LineContext,
    pub stats: BattingStats,
}

/// One player's pitching line in one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitchingLine {
    pub ctx: LineContext,
    pub stats: PitchingStats,
}

/// Common access for line types so aggregation is written once.
pub trait CountingLine {
    type Stats: AddAssign + Default + Copy;

    fn ctx(&self) -> &LineContext;
    fn stats(&self) -> Self::Stats;
}

impl CountingLine for BattingLine {
    type Stats = BattingStats;

    fn ctx(&self) -> &LineContext {
        &self.ctx
    }

    fn stats(&self) -> BattingStats {
        self.stats
    }
}

impl CountingLine for PitchingLine {
    type Stats = PitchingStats;

    fn ctx(&self) -> &LineContext {
        &self.ctx
    }

    fn stats(&self) -> PitchingStats {
        self.stats
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// How per-game lines are grouped into totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    /// One row per (player, team, year, league).
    PlayerSeason,
    /// One row per player across every season and team.
    PlayerCareer,
    /// One row per (team, year, league).
    TeamSeason,
    /// One row per (year, league).
    LeagueSeason,
}

/// Identifies one aggregated row. Fields a grouping does not split on are
/// `None`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub player_id: Option<String>,
    pub team: Option<String>,
    pub year: Option<i32>,
    pub league: Option<String>,
}

impl GroupKey {
    fn for_line(ctx: &LineContext, grouping: Grouping) -> Self {
        match grouping {
            Grouping::PlayerSeason => GroupKey {
                player_id: Some(ctx.player_id.clone()),
                team: Some(ctx.team.clone()),
                year: Some(ctx.year),
                league: Some(ctx.league.clone()),
            },
            Grouping::PlayerCareer => GroupKey {
                player_id: Some(ctx.player_id.clone()),
                team: None,
                year: None,
                league: None,
            },
            Grouping::TeamSeason => GroupKey {
                player_id: None,
                team: Some(ctx.team.clone()),
                year: Some(ctx.year),
                league: Some(ctx.league.clone()),
            },
            Grouping::LeagueSeason => GroupKey {
                player_id: None,
                team: None,
                year: Some(ctx.year),
                league: Some(ctx.league.clone()),
            },
        }
    }
}

/// Summed stats for one group, plus the number of distinct games and the
/// most recent display name seen for the player.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Totals<S> {
    pub key: GroupKey,
    pub player_name: Option<String>,
    pub games: u32,
    pub stats: S,
}

/// Sum per-game lines into totals. Output is ordered by `GroupKey`.
pub fn aggregate<L: CountingLine>(lines: &[L], grouping: Grouping) -> Vec<Totals<L::Stats>> {
    let mut groups: BTreeMap<GroupKey, (L::Stats, BTreeSet<&str>, Option<&str>)> =
        BTreeMap::new();

    for line in lines {
        let ctx = line.ctx();
        let entry = groups
            .entry(GroupKey::for_line(ctx, grouping))
            .or_insert_with(|| (L::Stats::default(), BTreeSet::new(), None));
        entry.0 += line.stats();
        entry.1.insert(ctx.game_id.as_str());
        if matches!(grouping, Grouping::PlayerSeason | Grouping::PlayerCareer) {
            entry.2 = Some(ctx.player_name.as_str());
        }
    }

    groups
        .into_iter()
        .map(|(key, (stats, games, name))| Totals {
            key,
            player_name: name.map(str::to_string),
            games: games.len() as u32,
            stats,
        })
        .collect()
}

/// Sum every line into a single bundle, ignoring grouping keys.
pub fn sum_stats<L: CountingLine>(lines: &[L]) -> L::Stats {
    let mut total = L::Stats::default();
    for line in lines {
        total += line.stats();
    }
    total
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// Team home/away splits and season leader boards.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::constants::LeagueConstants;
use crate::formulas::{round_to, SabermetricsCalculator};
use crate::stats::{
    aggregate, BattingLine, BattingStats, CountingLine, Grouping, PitchingLine, PitchingStats,
};

/// Minimum plate appearances to appear on the batting leader board.
pub const MIN_LEADER_PA: u32 = 120;
/// Minimum innings (in outs) to appear on the pitching leader board.
pub const MIN_LEADER_IP_OUTS: u32 = 30 * 3;

// ---------------------------------------------------------------------------
// Splits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitType {
    Home,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Low,
    Medium,
    High,
}

impl Reliability {
    /// `high` from 200 PA, `medium` from 50 PA.
    pub fn from_pa(pa: u32) -> Self {
        if pa >= 200 {
            Reliability::High
        } else if pa >= 50 {
            Reliability::Medium
        } else {
            Reliability::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitBatting {
    #[serde(rename = "PA")]
    pub pa: u32,
    #[serde(rename = "wOBA")]
    pub woba: f64,
    #[serde(rename = "wRC+")]
    pub wrc_plus: i32,
    #[serde(rename = "wRC+_neutral")]
    pub wrc_plus_neutral: i32,
    #[serde(rename = "OPS+")]
    pub ops_plus: i32,
    #[serde(rename = "OPS+_neutral")]
    pub ops_plus_neutral: i32,
    pub avg_pf: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitPitching {
    #[serde(rename = "IP")]
    pub ip: f64,
    #[serde(rename = "ERA-")]
    pub era_minus: i32,
    #[serde(rename = "ERA-_neutral")]
    pub era_minus_neutral: i32,
    #[serde(rename = "FIP-")]
    pub fip_minus: i32,
    #[serde(rename = "FIP-_neutral")]
    pub fip_minus_neutral: i32,
    #[serde(rename = "WHIP")]
    pub whip: f64,
    #[serde(rename = "HR/9")]
    pub hr9: f64,
    pub avg_pf: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamSplit {
    pub split_type: SplitType,
    pub games: u32,
    pub reliability: Reliability,
    pub batting: SplitBatting,
    pub pitching: SplitPitching,
}

/// Average park factor over `lines`, weighted by `weight`. No weight at all
/// yields a neutral 1.0.
fn weighted_park_factor<L: CountingLine>(
    lines: &[&L],
    constants: &LeagueConstants,
    weight: impl Fn(&L) -> u32,
) -> f64 {
    let (sum, total) = lines.iter().copied().fold((0.0, 0u64), |(sum, total), line| {
        let w = weight(line);
        let pf = constants.park_factor(Some(line.ctx().venue.as_str()));
        (sum + pf * w as f64, total + u64::from(w))
    });
    if total > 0 {
        sum / total as f64
    } else {
        1.0
    }
}

fn split_for(
    split_type: SplitType,
    team: &str,
    batting: &[BattingLine],
    pitching: &[PitchingLine],
    constants: &LeagueConstants,
) -> TeamSplit {
    let home = split_type == SplitType::Home;
    let bat: Vec<&BattingLine> = batting
        .iter()
        .filter(|l| l.ctx.team == team && l.ctx.home == home)
        .collect();
    let pit: Vec<&PitchingLine> = pitching
        .iter()
        .filter(|l| l.ctx.team == team && l.ctx.home == home)
        .collect();

    let games: BTreeSet<&str> = bat
        .iter()
        .map(|l| l.ctx.game_id.as_str())
        .chain(pit.iter().map(|l| l.ctx.game_id.as_str()))
        .collect();

    let calc = SabermetricsCalculator::new(constants);

    let mut bat_totals = BattingStats::default();
    for l in &bat {
        bat_totals += l.stats;
    }
    let mut pit_totals = PitchingStats::default();
    for l in &pit {
        pit_totals += l.stats;
    }

    let bat_pf = weighted_park_factor(&bat, constants, |l: &BattingLine| l.stats.pa);
    let pit_pf = weighted_park_factor(&pit, constants, |l: &PitchingLine| l.stats.ip_outs);

    let wrc_plus = calc.wrc_plus(&bat_totals, None);
    let ops_plus = calc.ops_plus(&bat_totals, None);
    let era_minus = calc.era_minus(&pit_totals, None);
    let fip_minus = calc.fip_minus(&pit_totals, None);
    let basic_pitching = calc.basic_pitching(&pit_totals);

    TeamSplit {
        split_type,
        games: games.len() as u32,
        reliability: Reliability::from_pa(bat_totals.pa),
        batting: SplitBatting {
            pa: bat_totals.pa,
            woba: calc.woba(&bat_totals),
            wrc_plus,
            wrc_plus_neutral: calc.wrc_plus_with_pf(&bat_totals, bat_pf),
            ops_plus,
            ops_plus_neutral: calc.ops_plus_with_pf(&bat_totals, bat_pf),
            avg_pf: round_to(bat_pf, 3),
        },
        pitching: SplitPitching {
            ip: basic_pitching.ip,
            era_minus,
            era_minus_neutral: calc.era_minus_with_pf(&pit_totals, pit_pf),
            fip_minus,
            fip_minus_neutral: calc.fip_minus_with_pf(&pit_totals, pit_pf),
            whip: basic_pitching.whip,
            hr9: basic_pitching.hr9,
            avg_pf: round_to(pit_pf, 3),
        },
    }
}

/// Home and away splits for `team`, in that order. Lines are expected to
/// belong to one season; raw metrics ignore parks, `_neutral` metrics apply
/// the PA-weighted (batting) or out-weighted (pitching) average park factor.
pub fn team_splits(
    team: &str,
    batting: &[BattingLine],
    pitching: &[PitchingLine],
    constants: &LeagueConstants,
) -> Vec<TeamSplit> {
    vec![
        split_for(SplitType::Home, team, batting, pitching, constants),
        split_for(SplitType::Away, team, batting, pitching, constants),
    ]
}

// ---------------------------------------------------------------------------
// Leaders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BattingLeader {
    pub player_id: String,
    pub player_name: String,
    pub team: String,
    pub games: u32,
    #[serde(rename = "PA")]
    pub pa: u32,
    #[serde(rename = "AVG")]
    pub avg: f64,
    #[serde(rename = "OPS")]
    pub ops: f64,
    #[serde(rename = "wOBA")]
    pub woba: f64,
    #[serde(rename = "wRC+")]
    pub wrc_plus: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PitchingLeader {
    pub player_id: String,
    pub player_name: String,
    pub team: String,
    pub games: u32,
    #[serde(rename = "IP")]
    pub ip: f64,
    #[serde(rename = "ERA")]
    pub era: f64,
    #[serde(rename = "FIP")]
    pub fip: f64,
    #[serde(rename = "FIP-")]
    pub fip_minus: i32,
}

/// Batters with at least `MIN_LEADER_PA`, best wRC+ first, at most `limit`.
///
/// wRC+ is park-adjusted with each player's PA-weighted park factor.
pub fn batting_leaders(
    lines: &[BattingLine],
    constants: &LeagueConstants,
    limit: usize,
) -> Vec<BattingLeader> {
    let calc = SabermetricsCalculator::new(constants);

    let mut leaders: Vec<BattingLeader> = aggregate(lines, Grouping::PlayerSeason)
        .into_iter()
        .filter(|t| t.stats.pa >= MIN_LEADER_PA)
        .map(|t| {
            let player_id = t.key.player_id.clone().unwrap_or_default();
            let team = t.key.team.clone().unwrap_or_default();
            let own: Vec<&BattingLine> = lines
                .iter()
                .filter(|l| l.ctx.player_id == player_id && l.ctx.team == team)
                .collect();
            let pf = weighted_park_factor(&own, constants, |l: &BattingLine| l.stats.pa);
            let basic = calc.basic_batting(&t.stats);
            BattingLeader {
                player_name: t.player_name.clone().unwrap_or_else(|| player_id.clone()),
                player_id,
                team,
                games: t.games,
                pa: t.stats.pa,
                avg: basic.avg,
                ops: basic.ops,
                woba: calc.woba(&t.stats),
                wrc_plus: calc.wrc_plus_with_pf(&t.stats, pf),
            }
        })
        .collect();

    leaders.sort_by(|a, b| b.wrc_plus.cmp(&a.wrc_plus).then(b.pa.cmp(&a.pa)));
    leaders.truncate(limit);
    leaders
}

/// Pitchers with at least `MIN_LEADER_IP_OUTS`, lowest FIP- first, at most
/// `limit`.
pub fn pitching_leaders(
    lines: &[PitchingLine],
    constants: &LeagueConstants,
    limit: usize,
) -> Vec<PitchingLeader> {
    let calc = SabermetricsCalculator::new(constants);

    let mut leaders: Vec<PitchingLeader> = aggregate(lines, Grouping::PlayerSeason)
        .into_iter()
        .filter(|t| t.stats.ip_outs >= MIN_LEADER_IP_OUTS)
        .map(|t| {
            let player_id = t.key.player_id.clone().unwrap_or_default();
            let team = t.key.team.clone().unwrap_or_default();
            let own: Vec<&PitchingLine> = lines
                .iter()
                .filter(|l| l.ctx.player_id == player_id && l.ctx.team == team)
                .collect();
            let pf = weighted_park_factor(&own, constants, |l: &PitchingLine| l.stats.ip_outs);
            let basic = calc.basic_pitching(&t.stats);
            PitchingLeader {
                player_name: t.player_name.clone().unwrap_or_else(|| player_id.clone()),
                player_id,
                team,
                games: t.games,
                ip: basic.ip,
                era: basic.era,
                fip: calc.fip(&t.stats),
                fip_minus: calc.fip_minus_with_pf(&t.stats, pf),
            }
        })
        .collect();

    leaders.sort_by(|a, b| {
        a.fip_minus
            .cmp(&b.fip_minus)
            .then(b.ip.partial_cmp(&a.ip).unwrap_or(Ordering::Equal))
    });
    leaders.truncate(limit);
    leaders
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

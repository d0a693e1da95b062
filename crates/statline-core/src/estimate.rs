// Empirical league constants from one season's totals, and their
// stabilization against the previously accepted constants.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::constants::{LeagueConstants, WobaWeights};
use crate::formulas::SabermetricsCalculator;
use crate::shrink::{
    accepted_woba_weights, shrink_fip_constant, shrink_park_factors, shrink_with_guard,
    shrink_woba_weights, ShrinkConfig, ShrinkContext, ShrinkResult,
};
use crate::stats::{BattingStats, GameRecord, PitchingStats};

/// Result key prefix for per-venue park factors.
pub const PARK_KEY_PREFIX: &str = "PF:";

/// Constants observed in one season's data, before stabilization. `None`
/// marks a value the data cannot support (zero denominator).
#[derive(Debug, Clone, PartialEq)]
pub struct EmpiricalConstants {
    pub woba_weights: Option<WobaWeights>,
    pub fip_constant: Option<f64>,
    pub lg_r_pa: Option<f64>,
    pub lg_r_g: Option<f64>,
    pub park_factors: BTreeMap<String, f64>,
    /// Games played at each venue.
    pub park_games: BTreeMap<String, u32>,
    pub total_pa: u32,
    pub total_bf: u32,
    pub games: u32,
}

fn positive(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Estimate constants from league batting and pitching totals plus the
/// season's game rows.
///
/// - wOBA weights: `prior` weights rescaled so league wOBA equals league OBP.
/// - FIP constant: `lgERA - (13HR + 3(uBB+HBP) - 2SO) / IP`.
/// - `lg_r_pa = R / PA`, `lg_r_g = runs / team-games`.
/// - Park factor: runs per game at the venue over league runs per game.
pub fn estimate_constants(
    prior: &LeagueConstants,
    batting: &BattingStats,
    pitching: &PitchingStats,
    games: &[GameRecord],
) -> EmpiricalConstants {
    let calc = SabermetricsCalculator::new(prior);

    // wOBA weights
    let obp_den = batting.pa as f64 - batting.sh as f64;
    let league_obp = if obp_den > 0.0 {
        (batting.h + batting.bb + batting.hbp) as f64 / obp_den
    } else {
        0.0
    };
    let prior_woba = calc.raw_woba(batting);
    let woba_weights = (league_obp > 0.0 && prior_woba > 0.0)
        .then(|| prior.woba_weights().scaled(league_obp / prior_woba));

    // FIP constant
    let ip = pitching.innings();
    let fip_constant = if ip > 0.0 {
        let league_era = pitching.er as f64 * 9.0 / ip;
        let events = 13.0 * pitching.hr as f64
            + 3.0 * (pitching.unintentional_bb() + pitching.hbp) as f64
            - 2.0 * pitching.so as f64;
        positive(league_era - events / ip)
    } else {
        None
    };

    // Run environment
    let lg_r_pa = if batting.pa > 0 {
        positive(batting.r as f64 / batting.pa as f64)
    } else {
        None
    };
    let total_runs: u64 = games.iter().map(GameRecord::total_runs).sum();
    let lg_r_g = if games.is_empty() {
        None
    } else {
        positive(total_runs as f64 / (2 * games.len()) as f64)
    };

    // Park factors
    let mut venue_runs: BTreeMap<String, (u64, u32)> = BTreeMap::new();
    for g in games {
        let entry = venue_runs.entry(g.venue.clone()).or_insert((0, 0));
        entry.0 += g.total_runs();
        entry.1 += 1;
    }
    let league_rpg = if games.is_empty() {
        0.0
    } else {
        total_runs as f64 / games.len() as f64
    };
    let mut park_factors = BTreeMap::new();
    let mut park_games = BTreeMap::new();
    if league_rpg > 0.0 {
        for (venue, (runs, n)) in venue_runs {
            let pf = runs as f64 / n as f64 / league_rpg;
            debug!("empirical park factor {venue}: {pf:.3} over {n} games");
            park_factors.insert(venue.clone(), pf);
            park_games.insert(venue, n);
        }
    }

    EmpiricalConstants {
        woba_weights,
        fip_constant,
        lg_r_pa,
        lg_r_g,
        park_factors,
        park_games,
        total_pa: batting.pa,
        total_bf: pitching.bf,
        games: games.len() as u32,
    }
}

// ---------------------------------------------------------------------------
// Stabilization
// ---------------------------------------------------------------------------

/// Constants accepted for publication plus the per-coefficient decisions.
#[derive(Debug, Clone)]
pub struct Stabilized {
    pub constants: LeagueConstants,
    pub results: BTreeMap<String, ShrinkResult>,
}

/// Blend every estimable constant toward `prior` and keep only the moves the
/// guards allow. Values the data cannot support keep the prior and produce
/// no result entry.
pub fn stabilize_constants(
    prior: &LeagueConstants,
    empirical: &EmpiricalConstants,
    config: &ShrinkConfig,
    ctx: &ShrinkContext,
) -> Stabilized {
    let mut constants = prior.clone();
    constants.year = ctx.year;
    constants.league = ctx.league.clone();
    let mut results = BTreeMap::new();

    if let Some(weights) = &empirical.woba_weights {
        let prior_weights = prior.woba_weights();
        let batch = shrink_woba_weights(
            weights,
            &prior_weights,
            empirical.total_pa as f64,
            &config.woba_weights,
            ctx,
        );
        constants.set_woba_weights(&accepted_woba_weights(&batch, &prior_weights));
        results.extend(batch);
    }

    if let Some(fip) = empirical.fip_constant {
        let r = shrink_fip_constant(
            fip,
            prior.fip_constant,
            empirical.total_bf as f64,
            &config.fip_constant,
            ctx,
        );
        constants.fip_constant = r.value;
        results.insert("FIP".to_string(), r);
    }

    let pa = empirical.total_pa as f64;
    if let Some(r_pa) = empirical.lg_r_pa {
        let r = shrink_with_guard(r_pa, prior.lg_r_pa, pa, &config.run_environment, ctx);
        constants.lg_r_pa = r.value;
        results.insert("lg_r_pa".to_string(), r);
    }
    if let Some(r_g) = empirical.lg_r_g {
        let r = shrink_with_guard(r_g, prior.lg_r_g, pa, &config.run_environment, ctx);
        constants.lg_r_g = r.value;
        results.insert("lg_r_g".to_string(), r);
    }

    let parks = shrink_park_factors(
        &empirical.park_factors,
        &prior.park_factors,
        &empirical.park_games,
        &config.park_factors,
        ctx,
    );
    for (venue, r) in parks {
        constants.park_factors.insert(venue.clone(), r.value);
        results.insert(format!("{PARK_KEY_PREFIX}{venue}"), r);
    }

    let guarded = results.values().filter(|r| r.is_guarded).count();
    info!(
        "stabilized {} coefficients for {}/{} ({} guarded)",
        results.len(),
        ctx.year,
        ctx.league,
        guarded
    );

    Stabilized { constants, results }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

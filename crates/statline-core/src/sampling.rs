// Stratified selection of games for invariant checks.
//
// Recent games are checked in full, a seeded random draw covers the rest of
// history, and a few edge cases (blowouts, extra innings) are always
// included. The draw is reproducible for a given seed string.

use chrono::{Duration, NaiveDate};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

use crate::stats::GameRecord;
use crate::tolerance::InvariantsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stratum {
    Recent,
    HighScoring,
    ExtraInnings,
    Historic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampledGame {
    pub game: GameRecord,
    pub stratum: Stratum,
    pub weight: f64,
}

/// 64-bit FNV-1a, used to turn the configured seed string into an RNG seed.
fn seed_from_str(seed: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    seed.bytes()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

/// Select the games to check as of `today`.
///
/// Excluded games never appear. The result holds at most
/// `sampling.max_sample_size` games, prioritized recent, edge cases, then
/// historic.
pub fn stratified_sample(
    games: &[GameRecord],
    config: &InvariantsConfig,
    today: NaiveDate,
) -> Vec<SampledGame> {
    let strat = &config.stratified_sampling;
    let (recent_days, historic_count, recent_weight, historic_weight) = if strat.enabled {
        (
            strat.recent.days,
            strat.historic.random_count,
            strat.recent.weight,
            strat.historic.weight,
        )
    } else {
        (config.sampling.recent_days, config.sampling.random_historic, 1.0, 1.0)
    };

    let mut seen = BTreeSet::new();
    let mut candidates: Vec<&GameRecord> = games
        .iter()
        .filter(|g| !config.exclude.is_excluded(g))
        .filter(|g| seen.insert(g.game_id.as_str()))
        .collect();
    candidates.sort_by(|a, b| (a.date, &a.game_id).cmp(&(b.date, &b.game_id)));

    let cutoff = today - Duration::days(i64::from(recent_days));
    let mut picked: Vec<SampledGame> = Vec::new();
    let mut taken: BTreeSet<&str> = BTreeSet::new();

    // Recent, newest first
    for g in candidates.iter().rev().filter(|g| g.date > cutoff && g.date <= today) {
        taken.insert(g.game_id.as_str());
        picked.push(SampledGame {
            game: (*g).clone(),
            stratum: Stratum::Recent,
            weight: recent_weight,
        });
    }

    // Edge cases
    if strat.enabled {
        let edge = &strat.edge_cases;

        let mut high: Vec<&GameRecord> = candidates
            .iter()
            .copied()
            .filter(|g| !taken.contains(g.game_id.as_str()))
            .filter(|g| g.total_runs() >= u64::from(edge.high_scoring_min_runs))
            .collect();
        high.sort_by(|a, b| b.total_runs().cmp(&a.total_runs()));
        for g in high.into_iter().take(edge.high_scoring_count) {
            taken.insert(g.game_id.as_str());
            picked.push(SampledGame {
                game: g.clone(),
                stratum: Stratum::HighScoring,
                weight: edge.weight,
            });
        }

        let mut extra: Vec<&GameRecord> = candidates
            .iter()
            .copied()
            .filter(|g| !taken.contains(g.game_id.as_str()))
            .filter(|g| g.innings.is_some_and(|i| i >= edge.extra_innings_min))
            .collect();
        extra.sort_by(|a, b| b.innings.cmp(&a.innings));
        for g in extra.into_iter().take(edge.extra_innings_count) {
            taken.insert(g.game_id.as_str());
            picked.push(SampledGame {
                game: g.clone(),
                stratum: Stratum::ExtraInnings,
                weight: edge.weight,
            });
        }
    }

    // Seeded historic draw
    let pool: Vec<&GameRecord> = candidates
        .iter()
        .copied()
        .filter(|g| !taken.contains(g.game_id.as_str()) && g.date <= cutoff)
        .collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed_from_str(&config.sampling.seed));
    let mut historic: Vec<&GameRecord> = pool
        .choose_multiple(&mut rng, historic_count)
        .copied()
        .collect();
    historic.sort_by(|a, b| (a.date, &a.game_id).cmp(&(b.date, &b.game_id)));
    picked.extend(historic.into_iter().map(|g| SampledGame {
        game: g.clone(),
        stratum: Stratum::Historic,
        weight: historic_weight,
    }));

    picked.truncate(config.sampling.max_sample_size);
    debug!(
        "sampled {} of {} candidate games (recent window {} days)",
        picked.len(),
        candidates.len(),
        recent_days
    );
    picked
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

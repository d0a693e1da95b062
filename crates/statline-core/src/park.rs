// Park-factor adjustment policy and the raw-vs-neutral diff explainer.
//
// Every park adjustment in the crate goes through `park_adjust`. Batting
// metrics are divided by the park factor, pitching "minus" metrics are
// multiplied by it, with exponent 1.0 for every metric.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Adjustment policy
// ---------------------------------------------------------------------------

/// Metrics that carry a park adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParkMetric {
    WrcPlus,
    OpsPlus,
    EraMinus,
    FipMinus,
}

impl ParkMetric {
    pub fn label(&self) -> &'static str {
        match self {
            ParkMetric::WrcPlus => "wRC+",
            ParkMetric::OpsPlus => "OPS+",
            ParkMetric::EraMinus => "ERA-",
            ParkMetric::FipMinus => "FIP-",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "wRC+" => Some(ParkMetric::WrcPlus),
            "OPS+" => Some(ParkMetric::OpsPlus),
            "ERA-" => Some(ParkMetric::EraMinus),
            "FIP-" => Some(ParkMetric::FipMinus),
            _ => None,
        }
    }

    /// Lower-is-better pitching metrics.
    pub fn is_pitching(&self) -> bool {
        matches!(self, ParkMetric::EraMinus | ParkMetric::FipMinus)
    }
}

/// Exponent applied to the park factor for `metric`. Uniformly 1.0.
pub fn park_exponent(_metric: ParkMetric) -> f64 {
    1.0
}

/// Apply the park factor to a value expressed on a league-relative scale.
///
/// A non-positive or non-finite `pf` is treated as neutral.
pub fn park_adjust(metric: ParkMetric, value: f64, pf: f64) -> f64 {
    let pf = if pf.is_finite() && pf > 0.0 { pf } else { 1.0 };
    let factor = pf.powf(park_exponent(metric));
    if metric.is_pitching() {
        value * factor
    } else {
        value / factor
    }
}

// ---------------------------------------------------------------------------
// Diff explainer
// ---------------------------------------------------------------------------

/// Relative change below which raw and neutral values are called equal.
pub const DEFAULT_FLAT_THRESHOLD: f64 = 0.015;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

/// Human-readable judgment of how a park adjustment moved a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffExplanation {
    pub text: String,
    pub dir: Direction,
    /// Absolute relative change, `|neutral - raw| / |raw|`.
    pub pct: f64,
}

/// Describe the move from `raw` to park-`neutral` for `metric`.
///
/// For ERA- and FIP- a move up reads as "worse" since lower is better.
/// A zero `raw` yields a flat 0% judgment.
pub fn explain_park_diff(
    metric: &str,
    raw: f64,
    neutral: f64,
    pf: f64,
    threshold: f64,
) -> DiffExplanation {
    let delta = neutral - raw;
    let pct = if raw != 0.0 && delta.is_finite() {
        delta / raw.abs()
    } else {
        0.0
    };

    let dir = if pct.abs() < threshold {
        Direction::Flat
    } else if pct > 0.0 {
        Direction::Up
    } else {
        Direction::Down
    };

    let sign = match dir {
        Direction::Up => "↑",
        Direction::Down => "↓",
        Direction::Flat => "→",
    };

    let park_hint = if pf > 1.02 {
        "hitter-friendly"
    } else if pf < 0.98 {
        "pitcher-friendly"
    } else {
        "neutral"
    };

    let pitching = ParkMetric::from_label(metric).is_some_and(|m| m.is_pitching());
    let verb = match (pitching, dir) {
        (true, Direction::Up) => "worse",
        (true, Direction::Down) => "better",
        (true, Direction::Flat) => "unchanged",
        (false, Direction::Up) => "adjusted up",
        (false, Direction::Down) => "adjusted down",
        (false, Direction::Flat) => "about the same",
    };

    let text = format!(
        "{metric}: {verb} after park adjustment {sign} (diff {:.1}%, park: {park_hint})",
        pct.abs() * 100.0
    );

    DiffExplanation {
        text,
        dir,
        pct: pct.abs(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

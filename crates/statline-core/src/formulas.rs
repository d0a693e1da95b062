// Sabermetric formula engine.
//
// Pure functions over one aggregated stat bundle and one constants snapshot.
// Nothing here returns an error: zero or negative denominators produce 0 for
// the affected stat, league-relative metrics fall back to 100 when their
// league baseline is degenerate. Outputs are rounded to their display
// precision; callers must not round again.

use serde::Serialize;

use crate::constants::LeagueConstants;
use crate::park::{park_adjust, ParkMetric};
use crate::stats::{BattingStats, PitchingStats};

/// Offset added to `lg_r_pa / woba_scale` to approximate league wOBA.
const LEAGUE_WOBA_OFFSET: f64 = 0.320;

/// League OPS baseline for OPS+.
const LEAGUE_OPS_BASELINE: f64 = 0.720;

/// ERA derived from runs per game: `lg_r_g / 2 * 0.9`.
const RUNS_TO_EARNED: f64 = 0.9;

/// League FIP is approximated as the FIP constant plus this offset.
const LEAGUE_FIP_OFFSET: f64 = 1.0;

// ---------------------------------------------------------------------------
// Output bundles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BasicBatting {
    #[serde(rename = "AVG")]
    pub avg: f64,
    #[serde(rename = "OBP")]
    pub obp: f64,
    #[serde(rename = "SLG")]
    pub slg: f64,
    #[serde(rename = "OPS")]
    pub ops: f64,
    #[serde(rename = "ISO")]
    pub iso: f64,
    #[serde(rename = "BABIP")]
    pub babip: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BasicPitching {
    #[serde(rename = "IP")]
    pub ip: f64,
    #[serde(rename = "ERA")]
    pub era: f64,
    #[serde(rename = "WHIP")]
    pub whip: f64,
    #[serde(rename = "K9")]
    pub k9: f64,
    #[serde(rename = "BB9")]
    pub bb9: f64,
    #[serde(rename = "HR9")]
    pub hr9: f64,
    #[serde(rename = "K%")]
    pub k_pct: f64,
    #[serde(rename = "BB%")]
    pub bb_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdvancedBatting {
    #[serde(flatten)]
    pub basic: BasicBatting,
    #[serde(rename = "wOBA")]
    pub woba: f64,
    #[serde(rename = "wRC+")]
    pub wrc_plus: i32,
    #[serde(rename = "OPS+")]
    pub ops_plus: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdvancedPitching {
    #[serde(flatten)]
    pub basic: BasicPitching,
    #[serde(rename = "FIP")]
    pub fip: f64,
    #[serde(rename = "ERA-")]
    pub era_minus: i32,
    #[serde(rename = "FIP-")]
    pub fip_minus: i32,
}

/// Everything derivable for one entity under one constants snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batting: Option<AdvancedBatting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitching: Option<AdvancedPitching>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Round to `places` decimals. Non-finite input rounds to 0.
pub fn round_to(value: f64, places: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Round to an integer display value, floored at 0.
fn round_index(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    value.max(0.0).round() as i32
}

/// `num / den`, or 0 when the denominator is not positive.
fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Formula engine bound to one constants snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SabermetricsCalculator<'a> {
    constants: &'a LeagueConstants,
}

impl<'a> SabermetricsCalculator<'a> {
    pub fn new(constants: &'a LeagueConstants) -> Self {
        Self { constants }
    }

    pub fn constants(&self) -> &LeagueConstants {
        self.constants
    }

    // ---- Batting ----

    pub fn basic_batting(&self, s: &BattingStats) -> BasicBatting {
        let ab = s.ab as f64;
        let avg = ratio(s.h as f64, ab);
        let obp = ratio(
            s.h as f64 + s.bb as f64 + s.hbp as f64,
            s.pa as f64 - s.sh as f64,
        );
        let slg = ratio(s.total_bases() as f64, ab);

        // BABIP = (H - HR) / (AB - SO - HR + SF)
        let babip_den = ab - s.so as f64 - s.hr as f64 + s.sf as f64;
        let babip = ratio(s.h as f64 - s.hr as f64, babip_den);

        BasicBatting {
            avg: round_to(avg, 3),
            obp: round_to(obp, 3),
            slg: round_to(slg, 3),
            ops: round_to(obp + slg, 3),
            iso: round_to(slg - avg, 3),
            babip: round_to(babip, 3),
        }
    }

    /// Unrounded wOBA: linear weights over `PA - SH`.
    pub(crate) fn raw_woba(&self, s: &BattingStats) -> f64 {
        let c = self.constants;
        let numerator = c.woba_bb * s.unintentional_bb() as f64
            + c.woba_hbp * s.hbp as f64
            + c.woba_1b * s.singles() as f64
            + c.woba_2b * s.doubles as f64
            + c.woba_3b * s.triples as f64
            + c.woba_hr * s.hr as f64;
        ratio(numerator, s.pa as f64 - s.sh as f64)
    }

    pub fn woba(&self, s: &BattingStats) -> f64 {
        round_to(self.raw_woba(s), 3)
    }

    /// League-average wOBA implied by the run environment.
    pub fn league_woba(&self) -> f64 {
        let c = self.constants;
        if c.woba_scale > 0.0 {
            c.lg_r_pa / c.woba_scale + LEAGUE_WOBA_OFFSET
        } else {
            0.0
        }
    }

    /// wRC+ relative to league runs per PA, divided by the venue's park factor.
    pub fn wrc_plus(&self, s: &BattingStats, venue: Option<&str>) -> i32 {
        self.wrc_plus_with_pf(s, self.constants.park_factor(venue))
    }

    /// wRC+ against an explicit park factor, rounded once at the end.
    pub fn wrc_plus_with_pf(&self, s: &BattingStats, pf: f64) -> i32 {
        let c = self.constants;
        let lg_woba = self.league_woba();
        if lg_woba <= 0.0 || c.lg_r_pa <= 0.0 || c.woba_scale <= 0.0 {
            return 100;
        }
        let woba = self.raw_woba(s);
        let raw = ((woba - lg_woba) / c.woba_scale + c.lg_r_pa) / c.lg_r_pa * 100.0;
        round_index(park_adjust(ParkMetric::WrcPlus, raw, pf))
    }

    pub fn ops_plus(&self, s: &BattingStats, venue: Option<&str>) -> i32 {
        self.ops_plus_with_pf(s, self.constants.park_factor(venue))
    }

    pub fn ops_plus_with_pf(&self, s: &BattingStats, pf: f64) -> i32 {
        let basic = self.basic_batting(s);
        let raw = basic.ops / LEAGUE_OPS_BASELINE * 100.0;
        round_index(park_adjust(ParkMetric::OpsPlus, raw, pf))
    }

    pub fn advanced_batting(&self, s: &BattingStats, venue: Option<&str>) -> AdvancedBatting {
        AdvancedBatting {
            basic: self.basic_batting(s),
            woba: self.woba(s),
            wrc_plus: self.wrc_plus(s, venue),
            ops_plus: self.ops_plus(s, venue),
        }
    }

    // ---- Pitching ----

    fn raw_era(&self, s: &PitchingStats) -> f64 {
        ratio(s.er as f64 * 9.0, s.innings())
    }

    pub fn basic_pitching(&self, s: &PitchingStats) -> BasicPitching {
        let ip = s.innings();
        let bf = s.bf as f64;
        BasicPitching {
            ip: round_to(ip, 1),
            era: round_to(self.raw_era(s), 2),
            whip: round_to(ratio(s.h as f64 + s.bb as f64, ip), 2),
            k9: round_to(ratio(s.so as f64 * 9.0, ip), 1),
            bb9: round_to(ratio(s.bb as f64 * 9.0, ip), 1),
            hr9: round_to(ratio(s.hr as f64 * 9.0, ip), 1),
            k_pct: round_to(ratio(s.so as f64, bf) * 100.0, 1),
            bb_pct: round_to(ratio(s.bb as f64, bf) * 100.0, 1),
        }
    }

    /// Unrounded FIP, floored at 0. Zero innings yields 0.
    fn raw_fip(&self, s: &PitchingStats) -> f64 {
        let ip = s.innings();
        if ip <= 0.0 {
            return 0.0;
        }
        let events = 13.0 * s.hr as f64 + 3.0 * (s.unintentional_bb() as f64 + s.hbp as f64)
            - 2.0 * s.so as f64;
        (events / ip + self.constants.fip_constant).max(0.0)
    }

    pub fn fip(&self, s: &PitchingStats) -> f64 {
        round_to(self.raw_fip(s), 2)
    }

    pub fn league_era(&self) -> f64 {
        self.constants.lg_r_g / 2.0 * RUNS_TO_EARNED
    }

    pub fn league_fip(&self) -> f64 {
        self.constants.fip_constant + LEAGUE_FIP_OFFSET
    }

    /// ERA relative to league ERA, multiplied by the park factor.
    pub fn era_minus(&self, s: &PitchingStats, venue: Option<&str>) -> i32 {
        self.era_minus_with_pf(s, self.constants.park_factor(venue))
    }

    pub fn era_minus_with_pf(&self, s: &PitchingStats, pf: f64) -> i32 {
        let league_era = self.league_era();
        let era = self.raw_era(s);
        if league_era <= 0.0 || era <= 0.0 {
            return 100;
        }
        round_index(park_adjust(ParkMetric::EraMinus, era / league_era * 100.0, pf))
    }

    /// FIP relative to league FIP, multiplied by the park factor.
    pub fn fip_minus(&self, s: &PitchingStats, venue: Option<&str>) -> i32 {
        self.fip_minus_with_pf(s, self.constants.park_factor(venue))
    }

    pub fn fip_minus_with_pf(&self, s: &PitchingStats, pf: f64) -> i32 {
        let league_fip = self.league_fip();
        let fip = self.raw_fip(s);
        if league_fip <= 0.0 || fip <= 0.0 {
            return 100;
        }
        round_index(park_adjust(ParkMetric::FipMinus, fip / league_fip * 100.0, pf))
    }

    pub fn advanced_pitching(&self, s: &PitchingStats, venue: Option<&str>) -> AdvancedPitching {
        AdvancedPitching {
            basic: self.basic_pitching(s),
            fip: self.fip(s),
            era_minus: self.era_minus(s, venue),
            fip_minus: self.fip_minus(s, venue),
        }
    }
}

/// Compute whichever bundles are supplied under `constants`.
pub fn calculate_with_constants(
    constants: &LeagueConstants,
    batting: Option<&BattingStats>,
    pitching: Option<&PitchingStats>,
    venue: Option<&str>,
) -> DerivedMetrics {
    let calc = SabermetricsCalculator::new(constants);
    DerivedMetrics {
        batting: batting.map(|s| calc.advanced_batting(s, venue)),
        pitching: pitching.map(|s| calc.advanced_pitching(s, venue)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn constants() -> LeagueConstants {
        let mut c = LeagueConstants::seed(2024, "central");
        c.park_factors.insert("Jingu".into(), 1.10);
        c.park_factors.insert("Koshien".into(), 0.90);
        c
    }

    fn season_line() -> BattingStats {
        BattingStats {
            pa: 500,
            ab: 437,
            h: 120,
            doubles: 20,
            triples: 2,
            hr: 15,
            bb: 50,
            ibb: 5,
            hbp: 3,
            sf: 5,
            so: 90,
            ..Default::default()
        }
    }

    fn pitching_line() -> PitchingStats {
        PitchingStats {
            ip_outs: 150,
            bf: 210,
            h: 45,
            r: 22,
            er: 20,
            hr: 10,
            bb: 20,
            ibb: 3,
            hbp: 2,
            so: 60,
        }
    }

    #[test]
    fn woba_with_standard_weights() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        // 0.69*45 + 0.72*3 + 0.89*83 + 1.27*20 + 1.62*2 + 2.10*15 = 167.22 over 500
        assert_eq!(calc.woba(&season_line()), 0.334);
    }

    #[test]
    fn woba_subtracts_sacrifice_hits_from_denominator() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let mut s = season_line();
        s.sh = 20;
        assert_eq!(calc.woba(&s), round_to(167.22 / 480.0, 3));
    }

    #[test]
    fn basic_batting_line() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let b = calc.basic_batting(&season_line());
        assert_eq!(b.avg, round_to(120.0 / 437.0, 3));
        assert_eq!(b.obp, round_to(173.0 / 500.0, 3));
        assert_eq!(b.slg, round_to(189.0 / 437.0, 3));
        assert!(approx_eq(b.ops, b.obp + b.slg, 0.0015));
        assert_eq!(b.babip, round_to(105.0 / 337.0, 3));
    }

    #[test]
    fn zero_denominators_yield_zero() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let empty = BattingStats::default();
        let b = calc.basic_batting(&empty);
        for v in [b.avg, b.obp, b.slg, b.ops, b.iso, b.babip] {
            assert_eq!(v, 0.0);
        }
        assert_eq!(calc.woba(&empty), 0.0);

        let p = calc.basic_pitching(&PitchingStats::default());
        for v in [p.ip, p.era, p.whip, p.k9, p.bb9, p.hr9, p.k_pct, p.bb_pct] {
            assert_eq!(v, 0.0);
        }
        assert_eq!(calc.fip(&PitchingStats::default()), 0.0);
    }

    #[test]
    fn all_sacrifice_plate_appearances_do_not_divide_by_zero() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let s = BattingStats {
            pa: 2,
            sh: 2,
            ..Default::default()
        };
        let b = calc.basic_batting(&s);
        assert_eq!(b.obp, 0.0);
        assert_eq!(calc.woba(&s), 0.0);
        assert!(calc.wrc_plus(&s, None) >= 0);
    }

    #[test]
    fn fip_example() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        // (13*10 + 3*(17 + 2) - 2*60) / 50 + 3.10 = 4.44
        assert_eq!(calc.fip(&pitching_line()), 4.44);
    }

    #[test]
    fn fip_floors_at_zero() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let s = PitchingStats {
            ip_outs: 3,
            so: 3,
            ..Default::default()
        };
        assert_eq!(calc.fip(&s), 0.0);
        assert_eq!(calc.fip_minus(&s, None), 100);
    }

    #[test]
    fn league_average_hitter_is_100() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        // Find a bundle whose wOBA sits at the league baseline: 0.4070 * 1000 PA.
        let lg = calc.league_woba();
        let hr = (lg * 1000.0 / c.woba_hr).round() as u32;
        let s = BattingStats {
            pa: 1000,
            ab: 1000,
            h: hr,
            hr,
            ..Default::default()
        };
        let wrc = calc.wrc_plus(&s, None);
        assert!((98..=102).contains(&wrc), "wRC+ was {wrc}");
    }

    #[test]
    fn wrc_plus_park_adjustment_divides() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let s = season_line();
        let neutral = calc.wrc_plus(&s, None);
        let hitter_park = calc.wrc_plus(&s, Some("Jingu"));
        let unknown = calc.wrc_plus(&s, Some("Nowhere"));
        assert!(hitter_park < neutral);
        assert_eq!(unknown, neutral);
    }

    #[test]
    fn wrc_plus_degenerate_constants_are_neutral() {
        let mut c = constants();
        c.lg_r_pa = 0.0;
        c.woba_scale = 0.0;
        let calc = SabermetricsCalculator::new(&c);
        assert_eq!(calc.wrc_plus(&season_line(), None), 100);
    }

    #[test]
    fn wrc_plus_floors_at_zero() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let s = BattingStats {
            pa: 50,
            ab: 50,
            so: 50,
            ..Default::default()
        };
        assert_eq!(calc.wrc_plus(&s, None), 0);
    }

    #[test]
    fn era_minus_multiplies_by_park_factor() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let s = pitching_line();
        // ERA 3.60 vs league 4.5/2*0.9 = 2.025
        let neutral = calc.era_minus(&s, None);
        assert_eq!(neutral, (3.6 / 2.025 * 100.0_f64).round() as i32);
        assert!(calc.era_minus(&s, Some("Jingu")) > neutral);
        assert!(calc.era_minus(&s, Some("Koshien")) < neutral);
    }

    #[test]
    fn minus_metrics_default_to_100_without_innings() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let s = PitchingStats::default();
        assert_eq!(calc.era_minus(&s, None), 100);
        assert_eq!(calc.fip_minus(&s, Some("Jingu")), 100);
    }

    #[test]
    fn fip_minus_against_league_fip() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        assert_eq!(calc.fip_minus(&pitching_line(), None), 108);
    }

    #[test]
    fn basic_pitching_line() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let p = calc.basic_pitching(&pitching_line());
        assert_eq!(p.ip, 50.0);
        assert_eq!(p.era, 3.6);
        assert_eq!(p.whip, 1.3);
        assert_eq!(p.k9, 10.8);
        assert_eq!(p.k_pct, 28.6);
    }

    #[test]
    fn repeated_calls_are_identical() {
        let c = constants();
        let calc = SabermetricsCalculator::new(&c);
        let s = season_line();
        assert_eq!(
            calc.advanced_batting(&s, Some("Jingu")),
            calc.advanced_batting(&s, Some("Jingu"))
        );
    }

    #[test]
    fn derived_metrics_serialize_with_display_keys() {
        let c = constants();
        let m = calculate_with_constants(&c, Some(&season_line()), None, None);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["batting"]["wOBA"], 0.334);
        assert!(json["batting"].get("wRC+").is_some());
        assert!(json["batting"].get("AVG").is_some());
        assert!(json.get("pitching").is_none());
    }
}

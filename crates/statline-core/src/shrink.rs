// Shrinkage stabilizer for league constants.
//
// A freshly observed constant is blended toward the previously accepted one
// with weight n/(n+k). The blended value is only published when the sample
// is large enough and the move stays within the family's volatility
// threshold; otherwise the prior is kept and the result is marked guarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::constants::WobaWeights;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Shrink parameters for one family of constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShrinkParams {
    /// Smoothing constant in units of the family's sample-size metric.
    /// Larger values make updates more conservative.
    pub k: f64,
    /// Maximum relative move `|shrunk - prior| / |prior|` before guarding.
    pub threshold: f64,
    /// Samples below this keep the prior regardless of delta.
    pub min_samples: f64,
}

impl ShrinkParams {
    /// wOBA linear weights, sampled in plate appearances.
    pub const WOBA_WEIGHTS: ShrinkParams = ShrinkParams {
        k: 7500.0,
        threshold: 0.07,
        min_samples: 1000.0,
    };

    /// FIP constant, sampled in batters faced.
    pub const FIP_CONSTANT: ShrinkParams = ShrinkParams {
        k: 10000.0,
        threshold: 0.05,
        min_samples: 1000.0,
    };

    /// Park factors, sampled in games played at the venue.
    pub const PARK_FACTORS: ShrinkParams = ShrinkParams {
        k: 500.0,
        threshold: 0.10,
        min_samples: 50.0,
    };

    /// League run environment (runs per PA, runs per game), sampled in PA.
    pub const RUN_ENVIRONMENT: ShrinkParams = ShrinkParams {
        k: 7500.0,
        threshold: 0.07,
        min_samples: 1000.0,
    };
}

/// Per-family parameters, loaded from the `[shrink]` section of engine.toml.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShrinkConfig {
    #[serde(default = "default_woba")]
    pub woba_weights: ShrinkParams,
    #[serde(default = "default_fip")]
    pub fip_constant: ShrinkParams,
    #[serde(default = "default_park")]
    pub park_factors: ShrinkParams,
    #[serde(default = "default_run_env")]
    pub run_environment: ShrinkParams,
}

fn default_woba() -> ShrinkParams {
    ShrinkParams::WOBA_WEIGHTS
}

fn default_fip() -> ShrinkParams {
    ShrinkParams::FIP_CONSTANT
}

fn default_park() -> ShrinkParams {
    ShrinkParams::PARK_FACTORS
}

fn default_run_env() -> ShrinkParams {
    ShrinkParams::RUN_ENVIRONMENT
}

impl Default for ShrinkConfig {
    fn default() -> Self {
        Self {
            woba_weights: ShrinkParams::WOBA_WEIGHTS,
            fip_constant: ShrinkParams::FIP_CONSTANT,
            park_factors: ShrinkParams::PARK_FACTORS,
            run_environment: ShrinkParams::RUN_ENVIRONMENT,
        }
    }
}

/// League and season a stabilization run belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShrinkContext {
    pub league: String,
    pub year: i32,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Which rule decided the published value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardRule {
    MinSamples,
    VolatilityGuard,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShrinkMetadata {
    pub rule: GuardRule,
    pub k_value: f64,
    pub threshold: f64,
    pub min_samples: f64,
    pub timestamp: DateTime<Utc>,
    pub league: String,
    pub year: i32,
}

/// Outcome of stabilizing one scalar constant.
///
/// `value == prior` whenever `is_guarded`, otherwise `value == shrunk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShrinkResult {
    #[serde(with = "json_f64")]
    pub value: f64,
    #[serde(with = "json_f64")]
    pub shrunk: f64,
    #[serde(with = "json_f64")]
    pub empirical: f64,
    #[serde(with = "json_f64")]
    pub prior: f64,
    #[serde(with = "json_f64")]
    pub delta: f64,
    #[serde(with = "json_f64")]
    pub weight: f64,
    #[serde(with = "json_f64")]
    pub sample_size: f64,
    pub is_guarded: bool,
    pub metadata: ShrinkMetadata,
}

/// Floats that may be non-finite. JSON has no literal for them, so infinities
/// and NaN are written as the strings `"Infinity"`, `"-Infinity"` and `"NaN"`
/// instead of the `null` serde_json would emit.
mod json_f64 {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            s.serialize_f64(*value)
        } else if value.is_nan() {
            s.serialize_str("NaN")
        } else if *value > 0.0 {
            s.serialize_str("Infinity")
        } else {
            s.serialize_str("-Infinity")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(t) => match t.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("not a number: {other:?}"))),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Core estimator
// ---------------------------------------------------------------------------

/// Empirical weight `n / (n + k)`, or 0 when there is no usable sample.
fn empirical_weight(sample_size: f64, k: f64) -> f64 {
    if !(sample_size > 0.0) || !sample_size.is_finite() || sample_size + k <= 0.0 {
        return 0.0;
    }
    sample_size / (sample_size + k)
}

/// Blend `empirical` toward `prior`: `w * empirical + (1 - w) * prior` with
/// `w = n / (n + k)`. A non-positive sample returns `prior` unchanged.
pub fn shrink(empirical: f64, prior: f64, sample_size: f64, k: f64) -> f64 {
    let weight = empirical_weight(sample_size, k);
    if weight == 0.0 {
        return prior;
    }
    weight * empirical + (1.0 - weight) * prior
}

/// Shrink and then decide whether the result may replace `prior`.
///
/// Guarded when `sample_size < min_samples` or the relative move exceeds
/// `threshold`. A non-finite blend is treated as an unbounded move.
pub fn shrink_with_guard(
    empirical: f64,
    prior: f64,
    sample_size: f64,
    params: &ShrinkParams,
    ctx: &ShrinkContext,
) -> ShrinkResult {
    let weight = empirical_weight(sample_size, params.k);
    let shrunk = shrink(empirical, prior, sample_size, params.k);

    let base = if prior != 0.0 { prior.abs() } else { 1.0 };
    let delta = if shrunk.is_finite() {
        (shrunk - prior).abs() / base
    } else {
        f64::INFINITY
    };

    let under_sampled = sample_size < params.min_samples || sample_size.is_nan();
    let volatile = delta > params.threshold;
    let is_guarded = under_sampled || volatile;

    let rule = if under_sampled {
        GuardRule::MinSamples
    } else if volatile {
        GuardRule::VolatilityGuard
    } else {
        GuardRule::Normal
    };

    ShrinkResult {
        value: if is_guarded { prior } else { shrunk },
        shrunk,
        empirical,
        prior,
        delta,
        weight,
        sample_size,
        is_guarded,
        metadata: ShrinkMetadata {
            rule,
            k_value: params.k,
            threshold: params.threshold,
            min_samples: params.min_samples,
            timestamp: Utc::now(),
            league: ctx.league.clone(),
            year: ctx.year,
        },
    }
}

// ---------------------------------------------------------------------------
// Family helpers
// ---------------------------------------------------------------------------

/// Stabilize all six wOBA weights against `total_pa`.
pub fn shrink_woba_weights(
    empirical: &WobaWeights,
    prior: &WobaWeights,
    total_pa: f64,
    params: &ShrinkParams,
    ctx: &ShrinkContext,
) -> BTreeMap<String, ShrinkResult> {
    WobaWeights::KEYS
        .iter()
        .map(|&key| {
            let e = empirical.get(key).unwrap_or(0.0);
            let p = prior.get(key).unwrap_or(0.0);
            (key.to_string(), shrink_with_guard(e, p, total_pa, params, ctx))
        })
        .collect()
}

/// Accepted weights from a `shrink_woba_weights` batch. Missing keys keep
/// the prior.
pub fn accepted_woba_weights(
    results: &BTreeMap<String, ShrinkResult>,
    prior: &WobaWeights,
) -> WobaWeights {
    let mut accepted = *prior;
    for key in WobaWeights::KEYS {
        if let Some(r) = results.get(key) {
            accepted.set(key, r.value);
        }
    }
    accepted
}

/// Stabilize the FIP constant against `total_bf`.
pub fn shrink_fip_constant(
    empirical: f64,
    prior: f64,
    total_bf: f64,
    params: &ShrinkParams,
    ctx: &ShrinkContext,
) -> ShrinkResult {
    shrink_with_guard(empirical, prior, total_bf, params, ctx)
}

/// Stabilize every observed venue's park factor against games at that
/// venue. Unseen venues start from a neutral 1.0 prior and zero games.
pub fn shrink_park_factors(
    empirical: &BTreeMap<String, f64>,
    prior: &BTreeMap<String, f64>,
    games: &BTreeMap<String, u32>,
    params: &ShrinkParams,
    ctx: &ShrinkContext,
) -> BTreeMap<String, ShrinkResult> {
    empirical
        .iter()
        .map(|(venue, &e)| {
            let p = prior.get(venue).copied().unwrap_or(1.0);
            let n = games.get(venue).copied().unwrap_or(0) as f64;
            (venue.clone(), shrink_with_guard(e, p, n, params, ctx))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Thresholds for `check_alert_conditions`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Any delta above this is an error.
    pub large_change: f64,
    /// Samples below this raise a warning.
    pub low_sample_size: f64,
    /// More alerts than this escalate even without an error.
    pub max_alerts: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            large_change: 0.15,
            low_sample_size: 1000.0,
            max_alerts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub coefficient: String,
    pub severity: Severity,
    pub reason: String,
    #[serde(with = "json_f64")]
    pub delta: f64,
    #[serde(with = "json_f64")]
    pub sample_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCheck {
    pub alerts: Vec<Alert>,
    pub should_alert: bool,
}

pub const REASON_LARGE_CHANGE: &str = "Large change detected";
pub const REASON_VOLATILITY: &str = "Guarded due to volatility";
pub const REASON_LOW_SAMPLE: &str = "Low sample size";

/// Scan a batch with the default thresholds.
pub fn check_alert_conditions(results: &BTreeMap<String, ShrinkResult>) -> AlertCheck {
    check_alert_conditions_with(results, &AlertThresholds::default())
}

/// Scan a batch of results for operator-facing alerts.
///
/// A delta above `large_change` is an error. Otherwise a guarded result whose
/// delta exceeds its own family threshold is a warning. A small sample is a
/// separate warning. `should_alert` is set by any error or by more than
/// `max_alerts` alerts in total.
pub fn check_alert_conditions_with(
    results: &BTreeMap<String, ShrinkResult>,
    thresholds: &AlertThresholds,
) -> AlertCheck {
    let mut alerts = Vec::new();

    for (coefficient, r) in results {
        let mut push = |severity, reason: &str| {
            alerts.push(Alert {
                coefficient: coefficient.clone(),
                severity,
                reason: reason.to_string(),
                delta: r.delta,
                sample_size: r.sample_size,
            })
        };

        if r.delta > thresholds.large_change {
            push(Severity::Error, REASON_LARGE_CHANGE);
        } else if r.delta > r.metadata.threshold && r.is_guarded {
            push(Severity::Warning, REASON_VOLATILITY);
        }

        if r.sample_size < thresholds.low_sample_size {
            push(Severity::Warning, REASON_LOW_SAMPLE);
        }
    }

    let has_error = alerts.iter().any(|a| a.severity == Severity::Error);
    let should_alert = has_error || alerts.len() > thresholds.max_alerts;

    if should_alert {
        warn!(
            alerts = alerts.len(),
            has_error, "constant update raised alerts"
        );
    } else {
        debug!(alerts = alerts.len(), "constant update within alert limits");
    }

    AlertCheck {
        alerts,
        should_alert,
    }
}

// ---------------------------------------------------------------------------
// Update log
// ---------------------------------------------------------------------------

/// A published value counts as changed when it moved more than this.
const CHANGE_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetadata {
    pub league: String,
    pub year: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
    pub total_coefficients: usize,
    pub changed_coefficients: usize,
    pub guarded_coefficients: usize,
    #[serde(with = "json_f64")]
    pub max_delta: f64,
    pub avg_sample_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateLogMetadata {
    #[serde(flatten)]
    pub run: UpdateMetadata,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateLog {
    pub summary: UpdateSummary,
    pub coefficients: BTreeMap<String, ShrinkResult>,
    pub metadata: UpdateLogMetadata,
}

/// Summarize a stabilization batch. An empty batch reports zero max delta
/// and zero average sample size.
pub fn generate_update_log(
    results: &BTreeMap<String, ShrinkResult>,
    metadata: UpdateMetadata,
) -> UpdateLog {
    let changed = results
        .values()
        .filter(|r| (r.value - r.prior).abs() > CHANGE_EPSILON)
        .count();
    let guarded = results.values().filter(|r| r.is_guarded).count();
    let max_delta = results
        .values()
        .map(|r| r.delta)
        .fold(0.0_f64, f64::max);
    let avg_sample_size = if results.is_empty() {
        0
    } else {
        let total: f64 = results.values().map(|r| r.sample_size).sum();
        (total / results.len() as f64).round().max(0.0) as u64
    };

    UpdateLog {
        summary: UpdateSummary {
            total_coefficients: results.len(),
            changed_coefficients: changed,
            guarded_coefficients: guarded,
            max_delta,
            avg_sample_size,
        },
        coefficients: results.clone(),
        metadata: UpdateLogMetadata {
            run: metadata,
            timestamp: Utc::now(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ShrinkContext {
        ShrinkContext {
            league: "central".into(),
            year: 2024,
        }
    }

    fn params(k: f64, threshold: f64, min_samples: f64) -> ShrinkParams {
        ShrinkParams {
            k,
            threshold,
            min_samples,
        }
    }

    /// Build a result with the given delta / guard / sample size, bypassing
    /// the estimator.
    fn result(delta: f64, is_guarded: bool, sample_size: f64) -> ShrinkResult {
        let mut r = shrink_with_guard(1.0, 1.0, sample_size, &ShrinkParams::WOBA_WEIGHTS, &ctx());
        r.delta = delta;
        r.is_guarded = is_guarded;
        r
    }

    #[test]
    fn shrink_non_positive_sample_returns_prior() {
        assert_eq!(shrink(0.95, 0.89, 0.0, 7500.0), 0.89);
        assert_eq!(shrink(0.95, 0.89, -10.0, 7500.0), 0.89);
    }

    #[test]
    fn shrink_weights_by_sample() {
        // n = k gives an even blend.
        assert!((shrink(1.0, 0.0, 7500.0, 7500.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn shrink_is_monotonic_in_empirical() {
        let mut last = f64::NEG_INFINITY;
        for i in 0..50 {
            let e = 0.5 + i as f64 * 0.02;
            let v = shrink(e, 0.89, 5000.0, 7500.0);
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn shrink_converges_to_empirical() {
        let v = shrink(0.95, 0.89, 1e12, 7500.0);
        assert!((v - 0.95).abs() < 1e-6);
        assert_eq!(shrink(0.89, 0.89, 123.0, 7500.0), 0.89);
    }

    #[test]
    fn large_sample_small_move_is_accepted() {
        let r = shrink_with_guard(0.900, 0.890, 50000.0, &params(7500.0, 0.07, 1000.0), &ctx());
        assert!(!r.is_guarded);
        assert_eq!(r.metadata.rule, GuardRule::Normal);
        assert!(r.value > 0.890 && r.value < 0.900);
        assert!((r.value - 0.900).abs() < (r.value - 0.890).abs());
        assert_eq!(r.value, r.shrunk);
        assert!((r.weight - 50000.0 / 57500.0).abs() < 1e-12);
    }

    #[test]
    fn under_sampled_keeps_prior() {
        let r = shrink_with_guard(0.950, 0.890, 500.0, &params(7500.0, 0.07, 1000.0), &ctx());
        assert!(r.is_guarded);
        assert_eq!(r.metadata.rule, GuardRule::MinSamples);
        assert_eq!(r.value, 0.890);
        assert_eq!(r.value, r.prior);
    }

    #[test]
    fn volatile_move_keeps_prior() {
        let r = shrink_with_guard(1.50, 0.89, 1_000_000.0, &params(7500.0, 0.07, 1000.0), &ctx());
        assert!(r.is_guarded);
        assert_eq!(r.metadata.rule, GuardRule::VolatilityGuard);
        assert!(r.delta > 0.07);
        assert_eq!(r.value, 0.89);
    }

    #[test]
    fn zero_prior_uses_unit_base_for_delta() {
        let r = shrink_with_guard(0.01, 0.0, 1_000_000.0, &params(7500.0, 0.07, 1000.0), &ctx());
        assert!((r.delta - r.shrunk.abs()).abs() < 1e-12);
        assert!(!r.is_guarded);
    }

    #[test]
    fn non_finite_empirical_is_guarded() {
        let r = shrink_with_guard(f64::NAN, 0.89, 50000.0, &ShrinkParams::WOBA_WEIGHTS, &ctx());
        assert!(r.is_guarded);
        assert_eq!(r.value, 0.89);
        assert_eq!(r.delta, f64::INFINITY);
    }

    #[test]
    fn guard_iff_undersampled_or_volatile() {
        let p = params(2000.0, 0.05, 300.0);
        for n in [0.0, 100.0, 299.0, 300.0, 5000.0, 1e7] {
            for e in [0.5, 0.85, 0.89, 0.93, 1.4] {
                let r = shrink_with_guard(e, 0.89, n, &p, &ctx());
                let expected_delta = (shrink(e, 0.89, n, p.k) - 0.89).abs() / 0.89;
                let expected = n < p.min_samples || expected_delta > p.threshold;
                assert_eq!(r.is_guarded, expected, "n={n} e={e}");
                if r.is_guarded {
                    assert_eq!(r.value, r.prior);
                } else {
                    assert_eq!(r.value, r.shrunk);
                }
            }
        }
    }

    #[test]
    fn woba_family_produces_six_results() {
        let prior = WobaWeights {
            bb: 0.690,
            hbp: 0.720,
            single: 0.890,
            double: 1.270,
            triple: 1.620,
            hr: 2.100,
        };
        let empirical = WobaWeights {
            bb: 0.692,
            hbp: 0.722,
            single: 0.888,
            double: 1.271,
            triple: 1.616,
            hr: 2.101,
        };
        let results =
            shrink_woba_weights(&empirical, &prior, 50000.0, &ShrinkParams::WOBA_WEIGHTS, &ctx());
        assert_eq!(results.len(), 6);
        assert!(results.values().all(|r| !r.is_guarded));
        let accepted = accepted_woba_weights(&results, &prior);
        assert!(accepted.bb > prior.bb && accepted.bb < empirical.bb);
        assert!(!check_alert_conditions(&results).should_alert);
    }

    #[test]
    fn park_family_defaults_unknown_venue_to_neutral() {
        let mut empirical = BTreeMap::new();
        empirical.insert("Jingu".to_string(), 1.05);
        empirical.insert("NewDome".to_string(), 0.97);
        let mut prior = BTreeMap::new();
        prior.insert("Jingu".to_string(), 1.04);
        let mut games = BTreeMap::new();
        games.insert("Jingu".to_string(), 70);

        let results =
            shrink_park_factors(&empirical, &prior, &games, &ShrinkParams::PARK_FACTORS, &ctx());
        let jingu = &results["Jingu"];
        assert!(!jingu.is_guarded);
        assert!(jingu.value > 1.04 && jingu.value < 1.05);

        let new_dome = &results["NewDome"];
        assert_eq!(new_dome.prior, 1.0);
        assert_eq!(new_dome.sample_size, 0.0);
        assert!(new_dome.is_guarded);
        assert_eq!(new_dome.metadata.rule, GuardRule::MinSamples);
    }

    #[test]
    fn large_delta_is_an_error() {
        let mut batch = BTreeMap::new();
        batch.insert("wHR".to_string(), result(0.20, true, 50000.0));
        let check = check_alert_conditions(&batch);
        assert_eq!(check.alerts.len(), 1);
        assert_eq!(check.alerts[0].severity, Severity::Error);
        assert_eq!(check.alerts[0].reason, REASON_LARGE_CHANGE);
        assert!(check.should_alert);
    }

    #[test]
    fn guarded_volatility_is_a_warning_only() {
        let mut batch = BTreeMap::new();
        batch.insert("wBB".to_string(), result(0.08, true, 50000.0));
        let check = check_alert_conditions(&batch);
        assert_eq!(check.alerts.len(), 1);
        assert_eq!(check.alerts[0].severity, Severity::Warning);
        assert_eq!(check.alerts[0].reason, REASON_VOLATILITY);
        assert!(!check.should_alert);
    }

    #[test]
    fn more_than_three_warnings_escalate() {
        let mut batch = BTreeMap::new();
        for key in ["a", "b", "c"] {
            batch.insert(key.to_string(), result(0.0, true, 10.0));
        }
        assert!(!check_alert_conditions(&batch).should_alert);
        batch.insert("d".to_string(), result(0.0, true, 10.0));
        let check = check_alert_conditions(&batch);
        assert_eq!(check.alerts.len(), 4);
        assert!(check.should_alert);
    }

    #[test]
    fn update_log_summary() {
        let p = ShrinkParams::WOBA_WEIGHTS;
        let mut batch = BTreeMap::new();
        batch.insert("moved".to_string(), shrink_with_guard(0.95, 0.89, 50000.0, &p, &ctx()));
        batch.insert("guarded".to_string(), shrink_with_guard(0.95, 0.89, 500.0, &p, &ctx()));
        batch.insert("same".to_string(), shrink_with_guard(0.89, 0.89, 3500.0, &p, &ctx()));

        let log = generate_update_log(
            &batch,
            UpdateMetadata {
                league: "central".into(),
                year: 2024,
                month: Some(6),
            },
        );
        assert_eq!(log.summary.total_coefficients, 3);
        assert_eq!(log.summary.changed_coefficients, 1);
        assert_eq!(log.summary.guarded_coefficients, 1);
        assert_eq!(log.summary.avg_sample_size, 18000);
        assert!((log.summary.max_delta - batch["moved"].delta).abs() < 1e-12);
        assert_eq!(log.coefficients.len(), 3);

        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["summary"]["guardedCoefficients"], 1);
        assert_eq!(json["metadata"]["month"], 6);
        assert!(json["coefficients"]["moved"]["isGuarded"].is_boolean());
    }

    #[test]
    fn non_finite_values_serialize_as_strings() {
        // A NaN estimate blends to NaN and guards with an unbounded delta
        let r = shrink_with_guard(f64::NAN, 0.89, 10.0, &ShrinkParams::WOBA_WEIGHTS, &ctx());
        assert!(r.is_guarded);
        assert_eq!(r.value, 0.89);
        assert_eq!(r.delta, f64::INFINITY);

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["delta"], "Infinity");
        assert_eq!(json["shrunk"], "NaN");
        assert_eq!(json["empirical"], "NaN");
        assert_eq!(json["prior"], 0.89);

        let back: ShrinkResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.delta, f64::INFINITY);
        assert!(back.shrunk.is_nan());
        assert!(back.empirical.is_nan());
        assert_eq!(back.prior, 0.89);

        let mut r = back;
        r.shrunk = f64::NEG_INFINITY;
        assert_eq!(serde_json::to_value(&r).unwrap()["shrunk"], "-Infinity");

        let bad = serde_json::json!({"value": "lots"});
        assert!(serde_json::from_value::<ShrinkResult>(bad).is_err());
    }

    #[test]
    fn non_finite_max_delta_reaches_update_log_as_string() {
        let mut batch = BTreeMap::new();
        batch.insert("broken".to_string(), result(f64::INFINITY, true, 5000.0));
        let log = generate_update_log(
            &batch,
            UpdateMetadata {
                league: "central".into(),
                year: 2024,
                month: None,
            },
        );
        assert_eq!(log.summary.max_delta, f64::INFINITY);

        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["summary"]["maxDelta"], "Infinity");
        assert_eq!(json["coefficients"]["broken"]["delta"], "Infinity");
    }

    #[test]
    fn update_log_of_empty_batch() {
        let log = generate_update_log(
            &BTreeMap::new(),
            UpdateMetadata {
                league: "central".into(),
                year: 2024,
                month: None,
            },
        );
        assert_eq!(log.summary.total_coefficients, 0);
        assert_eq!(log.summary.max_delta, 0.0);
        assert_eq!(log.summary.avg_sample_size, 0);
    }
}

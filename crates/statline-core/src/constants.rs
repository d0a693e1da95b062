// League constants and the versioned on-disk constants store.
//
// A constants set is written once and never mutated. Accepting new values
// means writing a new version; older versions stay on disk so previously
// published numbers can be reproduced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constants version `{0}` is not a valid file name")]
    InvalidVersion(String),

    #[error("constants version `{0}` already exists")]
    VersionExists(String),

    #[error("constants version `{0}` not found")]
    NotFound(String),

    #[error("invalid constants for {year}/{league}: {message}")]
    Invalid {
        year: i32,
        league: String,
        message: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed constants file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// LeagueConstants
// ---------------------------------------------------------------------------

/// Per-(year, league) coefficients consumed by the formula engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueConstants {
    pub year: i32,
    pub league: String,
    pub woba_bb: f64,
    pub woba_hbp: f64,
    pub woba_1b: f64,
    pub woba_2b: f64,
    pub woba_3b: f64,
    pub woba_hr: f64,
    pub woba_scale: f64,
    pub fip_constant: f64,
    pub lg_r_pa: f64,
    pub lg_r_g: f64,
    /// Venue name -> park factor. 1.0 is neutral.
    #[serde(default)]
    pub park_factors: BTreeMap<String, f64>,
}

/// Key under which the neutral park factor is stored in the seed constants.
pub const NEUTRAL_VENUE: &str = "default";

impl LeagueConstants {
    /// Seed constants used when no accepted version exists yet.
    pub fn seed(year: i32, league: &str) -> Self {
        let mut park_factors = BTreeMap::new();
        park_factors.insert(NEUTRAL_VENUE.to_string(), 1.0);
        Self {
            year,
            league: league.to_string(),
            woba_bb: 0.69,
            woba_hbp: 0.72,
            woba_1b: 0.89,
            woba_2b: 1.27,
            woba_3b: 1.62,
            woba_hr: 2.10,
            woba_scale: 1.15,
            fip_constant: 3.10,
            lg_r_pa: 0.10,
            lg_r_g: 4.5,
            park_factors,
        }
    }

    /// Park factor for `venue`, or 1.0 when the venue is absent, unknown, or
    /// carries a non-positive / non-finite factor.
    pub fn park_factor(&self, venue: Option<&str>) -> f64 {
        venue
            .and_then(|v| self.park_factors.get(v))
            .copied()
            .filter(|pf| pf.is_finite() && *pf > 0.0)
            .unwrap_or(1.0)
    }

    pub fn woba_weights(&self) -> WobaWeights {
        WobaWeights {
            bb: self.woba_bb,
            hbp: self.woba_hbp,
            single: self.woba_1b,
            double: self.woba_2b,
            triple: self.woba_3b,
            hr: self.woba_hr,
        }
    }

    pub fn set_woba_weights(&mut self, w: &WobaWeights) {
        self.woba_bb = w.bb;
        self.woba_hbp = w.hbp;
        self.woba_1b = w.single;
        self.woba_2b = w.double;
        self.woba_3b = w.triple;
        self.woba_hr = w.hr;
    }

    /// Check that every coefficient is a finite, positive real.
    pub fn validate(&self) -> Result<(), StoreError> {
        let fields: &[(&str, f64)] = &[
            ("woba_bb", self.woba_bb),
            ("woba_hbp", self.woba_hbp),
            ("woba_1b", self.woba_1b),
            ("woba_2b", self.woba_2b),
            ("woba_3b", self.woba_3b),
            ("woba_hr", self.woba_hr),
            ("woba_scale", self.woba_scale),
            ("fip_constant", self.fip_constant),
            ("lg_r_pa", self.lg_r_pa),
            ("lg_r_g", self.lg_r_g),
        ];
        for (name, val) in fields {
            if !val.is_finite() || *val <= 0.0 {
                return Err(self.invalid(format!("{name} must be finite and > 0, got {val}")));
            }
        }
        for (venue, pf) in &self.park_factors {
            if !pf.is_finite() || *pf <= 0.0 {
                return Err(self.invalid(format!(
                    "park factor for {venue} must be finite and > 0, got {pf}"
                )));
            }
        }
        Ok(())
    }

    fn invalid(&self, message: String) -> StoreError {
        StoreError::Invalid {
            year: self.year,
            league: self.league.clone(),
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// wOBA weights view
// ---------------------------------------------------------------------------

/// The six linear weights, detached from the rest of the constants record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WobaWeights {
    pub bb: f64,
    pub hbp: f64,
    pub single: f64,
    pub double: f64,
    pub triple: f64,
    pub hr: f64,
}

impl WobaWeights {
    /// Coefficient names used in update logs and alerts.
    pub const KEYS: [&'static str; 6] = ["wBB", "wHBP", "w1B", "w2B", "w3B", "wHR"];

    pub fn get(&self, key: &str) -> Option<f64> {
        match key {
            "wBB" => Some(self.bb),
            "wHBP" => Some(self.hbp),
            "w1B" => Some(self.single),
            "w2B" => Some(self.double),
            "w3B" => Some(self.triple),
            "wHR" => Some(self.hr),
            _ => None,
        }
    }

    /// Set a weight by name. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: f64) {
        match key {
            "wBB" => self.bb = value,
            "wHBP" => self.hbp = value,
            "w1B" => self.single = value,
            "w2B" => self.double = value,
            "w3B" => self.triple = value,
            "wHR" => self.hr = value,
            _ => {}
        }
    }

    /// Multiply every weight by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            bb: self.bb * factor,
            hbp: self.hbp * factor,
            single: self.single * factor,
            double: self.double * factor,
            triple: self.triple * factor,
            hr: self.hr * factor,
        }
    }
}

// ---------------------------------------------------------------------------
// Versioned constants sets
// ---------------------------------------------------------------------------

/// One exported, immutable version of every (year, league) constants record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantsSet {
    pub version: String,
    pub updated: DateTime<Utc>,
    pub constants: Vec<LeagueConstants>,
}

impl ConstantsSet {
    /// Generate a version string from a timestamp.
    ///
    /// Format: `vYYYYMMDD_HHMMSS_SSS`. The millisecond suffix keeps two runs
    /// in the same second distinct.
    pub fn version_at(now: DateTime<Utc>) -> String {
        now.format("v%Y%m%d_%H%M%S_%3f").to_string()
    }

    pub fn get(&self, year: i32, league: &str) -> Option<&LeagueConstants> {
        self.constants
            .iter()
            .find(|c| c.year == year && c.league == league)
    }

    /// Build a successor set: every record is carried over except the one
    /// keyed like `replacement`, which is replaced (or appended).
    pub fn successor(
        &self,
        replacement: LeagueConstants,
        now: DateTime<Utc>,
    ) -> ConstantsSet {
        let mut constants: Vec<LeagueConstants> = self
            .constants
            .iter()
            .filter(|c| !(c.year == replacement.year && c.league == replacement.league))
            .cloned()
            .collect();
        constants.push(replacement);
        constants.sort_by(|a, b| (a.year, &a.league).cmp(&(b.year, &b.league)));
        ConstantsSet {
            version: Self::version_at(now),
            updated: now,
            constants,
        }
    }
}

/// Directory of `<version>.json` files, one per accepted constants set.
#[derive(Debug, Clone)]
pub struct ConstantsStore {
    dir: PathBuf,
}

impl ConstantsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a new version. Fails if the version already exists: versions
    /// are superseded, never rewritten.
    pub fn save(&self, set: &ConstantsSet) -> Result<PathBuf, StoreError> {
        for c in &set.constants {
            c.validate()?;
        }
        let path = self.path_for(&set.version)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::Io {
            path: self.dir.clone(),
            source: e,
        })?;

        let json = serde_json::to_string_pretty(set).map_err(|e| StoreError::Json {
            path: path.clone(),
            source: e,
        })?;

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::VersionExists(set.version.clone()));
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        std::io::Write::write_all(&mut file, json.as_bytes())
            .map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
        Ok(path)
    }

    pub fn load(&self, version: &str) -> Result<ConstantsSet, StoreError> {
        let path = self.path_for(version)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(version.to_string()));
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        serde_json::from_str(&text).map_err(|e| StoreError::Json { path, source: e })
    }

    /// All stored versions, sorted ascending by name. A missing directory is
    /// an empty store.
    pub fn list_versions(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source: e,
                })
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                versions.push(stem.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// The most recently updated set, if any.
    pub fn latest(&self) -> Result<Option<ConstantsSet>, StoreError> {
        let mut latest: Option<ConstantsSet> = None;
        for version in self.list_versions()? {
            let set = self.load(&version)?;
            if latest.as_ref().map_or(true, |l| set.updated > l.updated) {
                latest = Some(set);
            }
        }
        Ok(latest)
    }

    fn path_for(&self, version: &str) -> Result<PathBuf, StoreError> {
        let valid = !version.is_empty()
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !version.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidVersion(version.to_string()));
        }
        Ok(self.dir.join(format!("{version}.json")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("statline_constants_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn set_at(secs: i64, lg_r_pa: f64) -> ConstantsSet {
        let now = Utc.timestamp_opt(secs, 0).unwrap();
        let mut c = LeagueConstants::seed(2024, "central");
        c.lg_r_pa = lg_r_pa;
        ConstantsSet {
            version: ConstantsSet::version_at(now),
            updated: now,
            constants: vec![c],
        }
    }

    #[test]
    fn seed_constants_are_valid() {
        assert!(LeagueConstants::seed(2024, "central").validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_positive_weight() {
        let mut c = LeagueConstants::seed(2024, "central");
        c.woba_hr = 0.0;
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("woba_hr"));

        let mut c = LeagueConstants::seed(2024, "central");
        c.park_factors.insert("Jingu".into(), f64::NAN);
        assert!(c.validate().is_err());
    }

    #[test]
    fn park_factor_falls_back_to_neutral() {
        let mut c = LeagueConstants::seed(2024, "central");
        c.park_factors.insert("Jingu".into(), 1.08);
        c.park_factors.insert("Broken".into(), -1.0);
        assert_eq!(c.park_factor(Some("Jingu")), 1.08);
        assert_eq!(c.park_factor(Some("Nowhere")), 1.0);
        assert_eq!(c.park_factor(Some("Broken")), 1.0);
        assert_eq!(c.park_factor(None), 1.0);
    }

    #[test]
    fn woba_weights_round_trip_through_record() {
        let mut c = LeagueConstants::seed(2024, "central");
        let w = c.woba_weights().scaled(2.0);
        c.set_woba_weights(&w);
        assert_eq!(c.woba_hr, 4.2);
        assert_eq!(w.get("wBB"), Some(1.38));
        assert_eq!(w.get("wXX"), None);
    }

    #[test]
    fn version_format() {
        let now = Utc.with_ymd_and_hms(2024, 9, 30, 4, 5, 6).unwrap();
        assert_eq!(ConstantsSet::version_at(now), "v20240930_040506_000");
    }

    #[test]
    fn successor_replaces_matching_record_only() {
        let base = ConstantsSet {
            version: "v1".into(),
            updated: Utc.timestamp_opt(0, 0).unwrap(),
            constants: vec![
                LeagueConstants::seed(2024, "central"),
                LeagueConstants::seed(2024, "pacific"),
            ],
        };
        let mut replacement = LeagueConstants::seed(2024, "pacific");
        replacement.fip_constant = 3.2;
        let next = base.successor(replacement, Utc.timestamp_opt(60, 0).unwrap());
        assert_eq!(next.constants.len(), 2);
        assert_eq!(next.get(2024, "pacific").unwrap().fip_constant, 3.2);
        assert_eq!(next.get(2024, "central").unwrap().fip_constant, 3.10);
        assert_ne!(next.version, base.version);
    }

    #[test]
    fn store_save_load_and_refuse_overwrite() {
        let store = ConstantsStore::new(scratch_dir("save_load"));
        let set = set_at(1_700_000_000, 0.11);
        store.save(&set).unwrap();
        let loaded = store.load(&set.version).unwrap();
        assert_eq!(loaded.version, set.version);
        assert_eq!(loaded.updated, set.updated);
        assert!((loaded.constants[0].lg_r_pa - 0.11).abs() < 1e-12);
        assert!(matches!(
            store.save(&set),
            Err(StoreError::VersionExists(_))
        ));
    }

    #[test]
    fn store_latest_picks_most_recent() {
        let store = ConstantsStore::new(scratch_dir("latest"));
        assert!(store.latest().unwrap().is_none());
        store.save(&set_at(1_700_000_000, 0.11)).unwrap();
        store.save(&set_at(1_700_086_400, 0.12)).unwrap();
        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.constants[0].lg_r_pa, 0.12);
        assert_eq!(store.list_versions().unwrap().len(), 2);
    }

    #[test]
    fn store_rejects_path_like_versions() {
        let store = ConstantsStore::new(scratch_dir("bad_version"));
        assert!(matches!(
            store.load("../etc/passwd"),
            Err(StoreError::InvalidVersion(_))
        ));
        assert!(matches!(store.load("v_missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn store_refuses_invalid_constants() {
        let store = ConstantsStore::new(scratch_dir("invalid"));
        let mut set = set_at(1_700_000_000, 0.11);
        set.constants[0].woba_scale = f64::INFINITY;
        assert!(matches!(store.save(&set), Err(StoreError::Invalid { .. })));
    }
}

// Configuration loading and parsing (engine.toml, invariants.toml).

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::shrink::{AlertThresholds, ShrinkConfig, ShrinkParams};
use crate::tolerance::InvariantsConfig;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to write default config {path}: {source}")]
    Seed {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub constants_dir: String,
    pub quality: QualityConfig,
    pub shrink: ShrinkConfig,
    pub alerts: AlertThresholds,
    pub invariants: InvariantsConfig,
}

// ---------------------------------------------------------------------------
// engine.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct EngineFile {
    database: DatabaseSection,
    constants: ConstantsSection,
    quality: QualityConfig,
    #[serde(default)]
    shrink: ShrinkConfig,
    #[serde(default)]
    alerts: AlertThresholds,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ConstantsSection {
    dir: String,
}

/// Where the quality gate keeps its state and how it is pinned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QualityConfig {
    /// Holds `quality_status.json` and the version log.
    pub reports_dir: String,
    /// Holds the public `quality.json` read by the status page.
    pub public_status_dir: String,
    /// Environment variable that pins the constants version.
    #[serde(default = "default_pin_env")]
    pub pin_env: String,
    /// A recorded failure keeps the gate in fail-open mode for this long.
    #[serde(default = "default_degraded_window")]
    pub degraded_window_hours: u32,
}

fn default_pin_env() -> String {
    "CONSTANTS_PIN".to_string()
}

fn default_degraded_window() -> u32 {
    24
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Shipped defaults, written into `config/` when a file is missing.
const SHIPPED: [(&str, &str); 2] = [
    ("engine.toml", include_str!("../../../defaults/engine.toml")),
    ("invariants.toml", include_str!("../../../defaults/invariants.toml")),
];

/// SQLite path that never touches the filesystem.
const IN_MEMORY_DB: &str = ":memory:";

/// Parse and validate `config/engine.toml` and `config/invariants.toml`
/// under `base_dir`. Paths are returned exactly as written.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let engine_path = config_dir.join("engine.toml");
    let engine: EngineFile = parse(&engine_path)?;
    let invariants_path = config_dir.join("invariants.toml");
    let invariants: InvariantsConfig = parse(&invariants_path)?;

    let config = Config {
        db_path: engine.database.path,
        constants_dir: engine.constants.dir,
        quality: engine.quality,
        shrink: engine.shrink,
        alerts: engine.alerts,
        invariants,
    };
    validate(&config)?;
    Ok(config)
}

/// Write the shipped `engine.toml` and `invariants.toml` into
/// `base_dir/config/` where they are missing. Existing files are left alone.
/// Returns the files written.
pub fn seed_config(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let config_dir = base_dir.join("config");
    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::Seed {
        path: config_dir.clone(),
        source: e,
    })?;

    let mut written = Vec::new();
    for (name, contents) in SHIPPED {
        let target = config_dir.join(name);
        if target.exists() {
            continue;
        }
        std::fs::write(&target, contents).map_err(|e| ConfigError::Seed {
            path: target.clone(),
            source: e,
        })?;
        written.push(target);
    }
    Ok(written)
}

impl Config {
    /// Anchor every relative storage path at `base_dir`: the database, the
    /// constants store and both quality-gate directories.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if self.db_path != IN_MEMORY_DB {
            self.db_path = anchor(base_dir, &self.db_path);
        }
        self.constants_dir = anchor(base_dir, &self.constants_dir);
        self.quality.reports_dir = anchor(base_dir, &self.quality.reports_dir);
        self.quality.public_status_dir = anchor(base_dir, &self.quality.public_status_dir);
    }
}

/// Seed missing files, load, and resolve storage paths against `base_dir`.
pub fn load_config_in(base_dir: &Path) -> Result<Config, ConfigError> {
    for path in seed_config(base_dir)? {
        info!("wrote default config {}", path.display());
    }
    let mut config = load_config_from(base_dir)?;
    config.resolve_paths(base_dir);
    Ok(config)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

fn anchor(base_dir: &Path, path: &str) -> String {
    let p = Path::new(path);
    if p.is_absolute() {
        path.to_string()
    } else {
        base_dir.join(p).display().to_string()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_shrink(family: &str, p: &ShrinkParams) -> Result<(), ConfigError> {
    let fields: &[(&str, f64)] = &[
        ("k", p.k),
        ("threshold", p.threshold),
        ("min_samples", p.min_samples),
    ];
    for (name, val) in fields {
        if !val.is_finite() || *val < 0.0 {
            return Err(ConfigError::ValidationError {
                field: format!("shrink.{family}.{name}"),
                message: format!("must be a finite number >= 0, got {val}"),
            });
        }
    }
    if p.k == 0.0 {
        return Err(ConfigError::ValidationError {
            field: format!("shrink.{family}.k"),
            message: "must be > 0".into(),
        });
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.db_path.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "database.path".into(),
            message: "must not be empty".into(),
        });
    }
    if config.constants_dir.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "constants.dir".into(),
            message: "must not be empty".into(),
        });
    }
    if config.quality.pin_env.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "quality.pin_env".into(),
            message: "must not be empty".into(),
        });
    }

    validate_shrink("woba_weights", &config.shrink.woba_weights)?;
    validate_shrink("fip_constant", &config.shrink.fip_constant)?;
    validate_shrink("park_factors", &config.shrink.park_factors)?;
    validate_shrink("run_environment", &config.shrink.run_environment)?;

    if !(config.alerts.large_change > 0.0) {
        return Err(ConfigError::ValidationError {
            field: "alerts.large_change".into(),
            message: format!("must be > 0, got {}", config.alerts.large_change),
        });
    }

    // Invariant tolerances
    let inv = &config.invariants;
    for (metric, tol) in &inv.tolerance {
        if !tol.is_finite() || *tol < 0.0 {
            return Err(ConfigError::ValidationError {
                field: format!("tolerance.{metric}"),
                message: format!("must be >= 0, got {tol}"),
            });
        }
    }

    let auto = &inv.auto_relaxation;
    if auto.relaxation_factor < 1.0 {
        return Err(ConfigError::ValidationError {
            field: "auto_relaxation.relaxation_factor".into(),
            message: format!("must be >= 1.0, got {}", auto.relaxation_factor),
        });
    }
    if auto.max_relaxation < 1.0 {
        return Err(ConfigError::ValidationError {
            field: "auto_relaxation.max_relaxation".into(),
            message: format!("must be >= 1.0, got {}", auto.max_relaxation),
        });
    }

    for (year, window) in &inv.temporary_relaxation {
        if year.parse::<i32>().is_err() {
            return Err(ConfigError::ValidationError {
                field: format!("temporary_relaxation.{year}"),
                message: "key must be a season year".into(),
            });
        }
        if !(window.multiplier > 0.0) {
            return Err(ConfigError::ValidationError {
                field: format!("temporary_relaxation.{year}.multiplier"),
                message: format!("must be > 0, got {}", window.multiplier),
            });
        }
    }

    if inv.sampling.max_sample_size == 0 {
        return Err(ConfigError::ValidationError {
            field: "sampling.max_sample_size".into(),
            message: "must be > 0".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

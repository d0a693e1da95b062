// Statline entry point.
//
// Startup sequence:
// 1. Parse arguments
// 2. Initialize tracing (log to file, not terminal)
// 3. Load config (shipped defaults are written on first run)
// 4. Open database and the constants store
// 5. Dispatch the subcommand

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use statline_app::db::Database;
use statline_app::import;
use statline_app::recompute::{RecomputeJob, RecomputeOutcome, RecomputeRequest};
use statline_app::source::{CachedSource, SqliteSource};
use statline_core::config;
use statline_core::constants::ConstantsStore;
use statline_core::quality::{ConstantsInfo, FailOpenController, TestResults};

/// Season lines stay cached this long within one process.
const LINE_CACHE_TTL: Duration = Duration::from_secs(600);

/// League constants pipeline: box-score import, quality gate and recompute.
#[derive(Parser, Debug)]
#[command(name = "statline")]
#[command(about = "Recompute league constants behind a fail-open quality gate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load games, batting and pitching lines from CSV files
    Import {
        games: PathBuf,
        batting: PathBuf,
        pitching: PathBuf,
    },

    /// Check invariants and recompute one season's constants
    Recompute {
        #[arg(short, long)]
        year: i32,

        #[arg(short, long)]
        league: String,

        /// Month the run covers, recorded in the update log
        #[arg(short, long)]
        month: Option<u32>,
    },

    /// Print the quality gate report
    Status,

    /// Print the invariant configuration summary
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse arguments
    let cli = Cli::parse();

    // 2. Initialize tracing (log to file, not terminal)
    init_tracing()?;
    info!("statline starting: {:?}", cli.command);

    // 3. Load config
    let base_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let config = config::load_config_in(&base_dir).context("failed to load configuration")?;
    info!(
        "config loaded: db={}, constants={}, invariants v{}",
        config.db_path, config.constants_dir, config.invariants.version
    );

    let gate = FailOpenController::from_config(&base_dir, &config.quality);

    match cli.command {
        Commands::Config => {
            println!("{}", config.invariants.config_summary());
        }

        Commands::Status => {
            let status = gate.get_quality_status();
            let (tests, constants) = match gate.last_quality_version() {
                Some(last) => (last.test_results, last.constants),
                None => (
                    TestResults::default(),
                    ConstantsInfo {
                        baseline_version: "none".to_string(),
                        last_update: "never".to_string(),
                    },
                ),
            };
            println!("status: {}\n", status.label());
            println!("{}", gate.generate_quality_report(&tests, &constants));
        }

        Commands::Import {
            games,
            batting,
            pitching,
        } => {
            // 4. Open database
            let db = Database::open(&config.db_path).context("failed to open database")?;
            let summary = import::import_files(&db, &games, &batting, &pitching)
                .context("import failed")?;
            println!(
                "imported {} games, {} batting lines, {} pitching lines",
                summary.written.games, summary.written.batting, summary.written.pitching
            );
            let skipped =
                summary.skipped_games + summary.skipped_batting + summary.skipped_pitching;
            if skipped > 0 {
                println!("skipped {skipped} rows (see logs/statline.log)");
            }
        }

        Commands::Recompute {
            year,
            league,
            month,
        } => {
            // 4. Open database and the constants store
            let db = Database::open(&config.db_path).context("failed to open database")?;
            let source = CachedSource::new(SqliteSource::new(Arc::new(db)), LINE_CACHE_TTL);
            let store = ConstantsStore::new(&config.constants_dir);

            let job = RecomputeJob::new(
                &source,
                &store,
                &gate,
                &config,
                &config.quality.reports_dir,
            );
            let request = RecomputeRequest {
                year,
                league,
                month,
            };
            match job.run(&request, Utc::now()).await {
                Ok(RecomputeOutcome::Updated {
                    version,
                    baseline,
                    update_log,
                    log,
                    alerts,
                    results,
                }) => {
                    println!(
                        "accepted {version} (from {baseline}): {}/{} checks passed, \
                         {} of {} coefficients changed, {} guarded",
                        results.passed,
                        results.total,
                        log.summary.changed_coefficients,
                        log.summary.total_coefficients,
                        log.summary.guarded_coefficients
                    );
                    println!("update log: {}", update_log.display());
                    if alerts.should_alert {
                        println!(
                            "{} alerts raised, review before publishing",
                            alerts.alerts.len()
                        );
                    }
                }
                Ok(RecomputeOutcome::FailedOpen { pinned, reason, .. }) => {
                    warn!("recompute failed open: {reason}");
                    println!("quality gate failed: {reason}");
                    println!("serving pinned constants {pinned}");
                }
                Err(e) => {
                    error!("recompute failed: {e}");
                    return Err(e).context("recompute failed");
                }
            }
        }
    }

    info!("statline finished");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("statline.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("statline=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}

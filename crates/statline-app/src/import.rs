// CSV box-score import.
//
// Each file is read row by row through the raw record types; rows that fail
// to parse or violate a count invariant are skipped with a warning. Lines
// that reference a game neither in the games file nor already in the
// database are skipped too, so the import transaction never trips the
// foreign keys.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};

use statline_core::normalize::{
    normalize_batting, normalize_game, normalize_pitching, NormalizeError, RawBattingRecord,
    RawGameRecord, RawPitchingRecord,
};
use statline_core::stats::{BattingLine, GameRecord, PitchingLine};

use crate::db::{Database, ImportCounts};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv { path: String, source: csv::Error },

    #[error("database import failed: {0}")]
    Database(String),
}

/// Rows kept from one file and how many were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub written: ImportCounts,
    pub skipped_games: usize,
    pub skipped_batting: usize,
    pub skipped_pitching: usize,
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

fn read_rows<R, Raw, T>(
    rdr: R,
    kind: &str,
    normalize: impl Fn(Raw) -> Result<T, NormalizeError>,
) -> Result<Parsed<T>, csv::Error>
where
    R: Read,
    Raw: DeserializeOwned,
{
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    // Surface a broken header as an error rather than skipping every row
    reader.headers()?;

    let mut rows = Vec::new();
    let mut skipped = 0;
    for (i, result) in reader.deserialize::<Raw>().enumerate() {
        match result {
            Ok(raw) => match normalize(raw) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!("skipping {kind} row {}: {e}", i + 1);
                    skipped += 1;
                }
            },
            Err(e) => {
                warn!("skipping malformed {kind} row {}: {e}", i + 1);
                skipped += 1;
            }
        }
    }
    Ok(Parsed { rows, skipped })
}

pub fn read_games<R: Read>(rdr: R) -> Result<Parsed<GameRecord>, csv::Error> {
    read_rows::<_, RawGameRecord, _>(rdr, "game", normalize_game)
}

pub fn read_batting<R: Read>(rdr: R) -> Result<Parsed<BattingLine>, csv::Error> {
    read_rows::<_, RawBattingRecord, _>(rdr, "batting", normalize_batting)
}

pub fn read_pitching<R: Read>(rdr: R) -> Result<Parsed<PitchingLine>, csv::Error> {
    read_rows::<_, RawPitchingRecord, _>(rdr, "pitching", normalize_pitching)
}

fn open_and_read<T>(
    path: &Path,
    read: impl Fn(std::fs::File) -> Result<Parsed<T>, csv::Error>,
) -> Result<Parsed<T>, ImportError> {
    let file = std::fs::File::open(path).map_err(|e| ImportError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    read(file).map_err(|e| ImportError::Csv {
        path: path.display().to_string(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Drop lines whose game is unknown. Returns how many were dropped.
fn retain_known<L>(
    lines: &mut Vec<L>,
    game_id: impl Fn(&L) -> &str,
    known: &HashSet<String>,
    db: &Database,
    kind: &str,
) -> Result<usize, ImportError> {
    let before = lines.len();
    let mut missing: HashSet<String> = HashSet::new();
    for line in lines.iter() {
        let id = game_id(line);
        if !known.contains(id) && !missing.contains(id) {
            let exists = db
                .has_game(id)
                .map_err(|e| ImportError::Database(format!("{e:#}")))?;
            if !exists {
                warn!("skipping {kind} lines for unknown game {id}");
                missing.insert(id.to_string());
            }
        }
    }
    lines.retain(|l| !missing.contains(game_id(l)));
    Ok(before - lines.len())
}

/// Write parsed rows to the database in one transaction.
pub fn import_parsed(
    db: &Database,
    games: Parsed<GameRecord>,
    batting: Parsed<BattingLine>,
    pitching: Parsed<PitchingLine>,
) -> Result<ImportSummary, ImportError> {
    let known: HashSet<String> = games.rows.iter().map(|g| g.game_id.clone()).collect();

    let mut batting_rows = batting.rows;
    let orphan_batting = retain_known(
        &mut batting_rows,
        |l: &BattingLine| l.ctx.game_id.as_str(),
        &known,
        db,
        "batting",
    )?;
    let mut pitching_rows = pitching.rows;
    let orphan_pitching = retain_known(
        &mut pitching_rows,
        |l: &PitchingLine| l.ctx.game_id.as_str(),
        &known,
        db,
        "pitching",
    )?;

    let written = db
        .import_box_scores(&games.rows, &batting_rows, &pitching_rows)
        .map_err(|e| ImportError::Database(format!("{e:#}")))?;

    let summary = ImportSummary {
        written,
        skipped_games: games.skipped,
        skipped_batting: batting.skipped + orphan_batting,
        skipped_pitching: pitching.skipped + orphan_pitching,
    };
    info!(
        "imported {} games, {} batting lines, {} pitching lines ({} rows skipped)",
        written.games,
        written.batting,
        written.pitching,
        summary.skipped_games + summary.skipped_batting + summary.skipped_pitching
    );
    Ok(summary)
}

/// Read the three box-score CSV files and import them.
pub fn import_files(
    db: &Database,
    games_path: &Path,
    batting_path: &Path,
    pitching_path: &Path,
) -> Result<ImportSummary, ImportError> {
    let games = open_and_read(games_path, read_games)?;
    let batting = open_and_read(batting_path, read_batting)?;
    let pitching = open_and_read(pitching_path, read_pitching)?;
    import_parsed(db, games, batting, pitching)
}

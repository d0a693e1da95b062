// SQLite persistence layer for raw per-game box scores.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

use statline_core::stats::{
    BattingLine, BattingStats, GameRecord, LineContext, PitchingLine, PitchingStats,
};
use statline_core::tolerance::ExclusionClause;

/// SQLite-backed storage for game results and per-player batting and
/// pitching lines.
pub struct Database {
    conn: Mutex<Connection>,
}

/// Row counts written by one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub games: usize,
    pub batting: usize,
    pub pitching: usize,
}

const GAME_COLUMNS: &str =
    "game_id, date, year, league, venue, home_team, away_team, home_runs, away_runs, innings";

// Lines are read through the games table so venue, league, year and the
// home flag always agree with the game row.
const BATTING_SELECT: &str = "
    SELECT b.game_id, g.year, g.league, g.venue, b.team, b.player_id, b.player_name,
           b.team = g.home_team,
           b.pa, b.ab, b.h, b.doubles, b.triples, b.hr, b.bb, b.ibb, b.hbp,
           b.sf, b.sh, b.so, b.r, b.rbi, b.sb, b.cs
    FROM box_batting b JOIN games g ON g.game_id = b.game_id";

const PITCHING_SELECT: &str = "
    SELECT p.game_id, g.year, g.league, g.venue, p.team, p.player_id, p.player_name,
           p.team = g.home_team,
           p.ip_outs, p.bf, p.h, p.r, p.er, p.hr, p.bb, p.ibb, p.hbp, p.so
    FROM box_pitching p JOIN games g ON g.game_id = p.game_id";

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create database directory {}", parent.display())
                    })?;
                }
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS games (
                game_id   TEXT PRIMARY KEY,
                date      TEXT NOT NULL,
                year      INTEGER NOT NULL,
                league    TEXT NOT NULL,
                venue     TEXT NOT NULL,
                home_team TEXT NOT NULL,
                away_team TEXT NOT NULL,
                home_runs INTEGER NOT NULL,
                away_runs INTEGER NOT NULL,
                innings   INTEGER
            );

            CREATE TABLE IF NOT EXISTS box_batting (
                game_id     TEXT NOT NULL REFERENCES games(game_id),
                team        TEXT NOT NULL,
                player_id   TEXT NOT NULL,
                player_name TEXT NOT NULL DEFAULT '',
                pa      INTEGER NOT NULL,
                ab      INTEGER NOT NULL,
                h       INTEGER NOT NULL,
                doubles INTEGER NOT NULL,
                triples INTEGER NOT NULL,
                hr      INTEGER NOT NULL,
                bb      INTEGER NOT NULL,
                ibb     INTEGER NOT NULL,
                hbp     INTEGER NOT NULL,
                sf      INTEGER NOT NULL,
                sh      INTEGER NOT NULL,
                so      INTEGER NOT NULL,
                r       INTEGER NOT NULL,
                rbi     INTEGER NOT NULL,
                sb      INTEGER NOT NULL,
                cs      INTEGER NOT NULL,
                PRIMARY KEY (game_id, team, player_id)
            );

            CREATE TABLE IF NOT EXISTS box_pitching (
                game_id     TEXT NOT NULL REFERENCES games(game_id),
                team        TEXT NOT NULL,
                player_id   TEXT NOT NULL,
                player_name TEXT NOT NULL DEFAULT '',
                ip_outs INTEGER NOT NULL,
                bf      INTEGER NOT NULL,
                h       INTEGER NOT NULL,
                r       INTEGER NOT NULL,
                er      INTEGER NOT NULL,
                hr      INTEGER NOT NULL,
                bb      INTEGER NOT NULL,
                ibb     INTEGER NOT NULL,
                hbp     INTEGER NOT NULL,
                so      INTEGER NOT NULL,
                PRIMARY KEY (game_id, team, player_id)
            );

            CREATE INDEX IF NOT EXISTS idx_games_year_league ON games(year, league);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection. A poisoned lock still holds a usable
    /// connection; SQLite rolls back any half-finished transaction.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a game row, updating it in place if the id already exists.
    pub fn upsert_game(&self, game: &GameRecord) -> Result<()> {
        let conn = self.conn();
        insert_game(&conn, game).context("failed to upsert game")?;
        Ok(())
    }

    /// Import games and their box-score lines in a single transaction.
    ///
    /// Games are written first so the lines' foreign keys resolve. Existing
    /// games are updated in place and existing lines are replaced.
    pub fn import_box_scores(
        &self,
        games: &[GameRecord],
        batting: &[BattingLine],
        pitching: &[PitchingLine],
    ) -> Result<ImportCounts> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("failed to begin import transaction")?;

        for game in games {
            insert_game(&tx, game)
                .with_context(|| format!("failed to insert game {}", game.game_id))?;
        }

        for line in batting {
            let s = &line.stats;
            tx.execute(
                "INSERT OR REPLACE INTO box_batting
                    (game_id, team, player_id, player_name, pa, ab, h, doubles, triples, hr,
                     bb, ibb, hbp, sf, sh, so, r, rbi, sb, cs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                params![
                    line.ctx.game_id,
                    line.ctx.team,
                    line.ctx.player_id,
                    line.ctx.player_name,
                    s.pa,
                    s.ab,
                    s.h,
                    s.doubles,
                    s.triples,
                    s.hr,
                    s.bb,
                    s.ibb,
                    s.hbp,
                    s.sf,
                    s.sh,
                    s.so,
                    s.r,
                    s.rbi,
                    s.sb,
                    s.cs,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert batting line {}/{}",
                    line.ctx.game_id, line.ctx.player_id
                )
            })?;
        }

        for line in pitching {
            let s = &line.stats;
            tx.execute(
                "INSERT OR REPLACE INTO box_pitching
                    (game_id, team, player_id, player_name, ip_outs, bf, h, r, er, hr,
                     bb, ibb, hbp, so)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    line.ctx.game_id,
                    line.ctx.team,
                    line.ctx.player_id,
                    line.ctx.player_name,
                    s.ip_outs,
                    s.bf,
                    s.h,
                    s.r,
                    s.er,
                    s.hr,
                    s.bb,
                    s.ibb,
                    s.hbp,
                    s.so,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert pitching line {}/{}",
                    line.ctx.game_id, line.ctx.player_id
                )
            })?;
        }

        tx.commit().context("failed to commit import")?;
        Ok(ImportCounts {
            games: games.len(),
            batting: batting.len(),
            pitching: pitching.len(),
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn has_game(&self, game_id: &str) -> Result<bool> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM games WHERE game_id = ?1",
                params![game_id],
                |row| row.get(0),
            )
            .context("failed to query game")?;
        Ok(count > 0)
    }

    /// Games for one season and league, oldest first, with `exclusion`
    /// applied in SQL.
    pub fn games(
        &self,
        year: i32,
        league: &str,
        exclusion: &ExclusionClause,
    ) -> Result<Vec<GameRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {GAME_COLUMNS} FROM games
             WHERE year = ? AND league = ? AND {}
             ORDER BY date, game_id",
            exclusion.sql
        );
        let mut stmt = conn.prepare(&sql).context("failed to prepare games query")?;

        let mut values = vec![
            Value::Integer(i64::from(year)),
            Value::Text(league.to_string()),
        ];
        values.extend(exclusion.params.iter().cloned().map(Value::Text));

        let games = stmt
            .query_map(params_from_iter(values.iter()), game_from_row)
            .context("failed to query games")?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read game row")?;
        Ok(games)
    }

    pub fn game(&self, game_id: &str) -> Result<Option<GameRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {GAME_COLUMNS} FROM games WHERE game_id = ?1"))
            .context("failed to prepare game query")?;
        let mut rows = stmt
            .query_map(params![game_id], game_from_row)
            .context("failed to query game")?;
        rows.next()
            .transpose()
            .context("failed to read game row")
    }

    /// Every batting line of a season and league.
    pub fn batting_lines(&self, year: i32, league: &str) -> Result<Vec<BattingLine>> {
        let conn = self.conn();
        let sql = format!(
            "{BATTING_SELECT} WHERE g.year = ?1 AND g.league = ?2
             ORDER BY g.date, b.game_id, b.team, b.player_id"
        );
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare batting query")?;
        let lines = stmt
            .query_map(params![year, league], batting_from_row)
            .context("failed to query batting lines")?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read batting row")?;
        Ok(lines)
    }

    /// Every pitching line of a season and league.
    pub fn pitching_lines(&self, year: i32, league: &str) -> Result<Vec<PitchingLine>> {
        let conn = self.conn();
        let sql = format!(
            "{PITCHING_SELECT} WHERE g.year = ?1 AND g.league = ?2
             ORDER BY g.date, p.game_id, p.team, p.player_id"
        );
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare pitching query")?;
        let lines = stmt
            .query_map(params![year, league], pitching_from_row)
            .context("failed to query pitching lines")?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read pitching row")?;
        Ok(lines)
    }

    pub fn batting_lines_for_game(&self, game_id: &str) -> Result<Vec<BattingLine>> {
        let conn = self.conn();
        let sql = format!("{BATTING_SELECT} WHERE b.game_id = ?1 ORDER BY b.team, b.player_id");
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare batting query")?;
        let lines = stmt
            .query_map(params![game_id], batting_from_row)
            .context("failed to query batting lines")?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read batting row")?;
        Ok(lines)
    }

    pub fn pitching_lines_for_game(&self, game_id: &str) -> Result<Vec<PitchingLine>> {
        let conn = self.conn();
        let sql = format!("{PITCHING_SELECT} WHERE p.game_id = ?1 ORDER BY p.team, p.player_id");
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare pitching query")?;
        let lines = stmt
            .query_map(params![game_id], pitching_from_row)
            .context("failed to query pitching lines")?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read pitching row")?;
        Ok(lines)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn insert_game(conn: &Connection, game: &GameRecord) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO games
            (game_id, date, year, league, venue, home_team, away_team, home_runs, away_runs, innings)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(game_id) DO UPDATE SET
            date      = excluded.date,
            year      = excluded.year,
            league    = excluded.league,
            venue     = excluded.venue,
            home_team = excluded.home_team,
            away_team = excluded.away_team,
            home_runs = excluded.home_runs,
            away_runs = excluded.away_runs,
            innings   = excluded.innings",
        params![
            game.game_id,
            game.date.format("%Y-%m-%d").to_string(),
            game.year,
            game.league,
            game.venue,
            game.home_team,
            game.away_team,
            game.home_runs,
            game.away_runs,
            game.innings,
        ],
    )
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<GameRecord> {
    let date_text: String = row.get(1)?;
    let date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(GameRecord {
        game_id: row.get(0)?,
        date,
        year: row.get(2)?,
        league: row.get(3)?,
        venue: row.get(4)?,
        home_team: row.get(5)?,
        away_team: row.get(6)?,
        home_runs: row.get(7)?,
        away_runs: row.get(8)?,
        innings: row.get(9)?,
    })
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<LineContext> {
    Ok(LineContext {
        game_id: row.get(0)?,
        year: row.get(1)?,
        league: row.get(2)?,
        venue: row.get(3)?,
        team: row.get(4)?,
        player_id: row.get(5)?,
        player_name: row.get(6)?,
        home: row.get(7)?,
    })
}

fn batting_from_row(row: &Row<'_>) -> rusqlite::Result<BattingLine> {
    Ok(BattingLine {
        ctx: context_from_row(row)?,
        stats: BattingStats {
            pa: row.get(8)?,
            ab: row.get(9)?,
            h: row.get(10)?,
            doubles: row.get(11)?,
            triples: row.get(12)?,
            hr: row.get(13)?,
            bb: row.get(14)?,
            ibb: row.get(15)?,
            hbp: row.get(16)?,
            sf: row.get(17)?,
            sh: row.get(18)?,
            so: row.get(19)?,
            r: row.get(20)?,
            rbi: row.get(21)?,
            sb: row.get(22)?,
            cs: row.get(23)?,
        },
    })
}

fn pitching_from_row(row: &Row<'_>) -> rusqlite::Result<PitchingLine> {
    Ok(PitchingLine {
        ctx: context_from_row(row)?,
        stats: PitchingStats {
            ip_outs: row.get(8)?,
            bf: row.get(9)?,
            h: row.get(10)?,
            r: row.get(11)?,
            er: row.get(12)?,
            hr: row.get(13)?,
            bb: row.get(14)?,
            ibb: row.get(15)?,
            hbp: row.get(16)?,
            so: row.get(17)?,
        },
    })
}

// Async boundary between the batch job and the box-score store.
//
// Callers see `Result<_, FetchError>`; the SQLite implementation runs each
// query on the blocking pool. `CachedSource` keeps season-wide line sets in
// memory for a fixed TTL and can be invalidated explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use statline_core::stats::{BattingLine, GameRecord, PitchingLine};
use statline_core::tolerance::ExclusionRules;

use crate::db::Database;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{what} query failed: {message}")]
    Query { what: &'static str, message: String },

    #[error("query task failed: {0}")]
    Join(String),
}

/// All lines of one game.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoxScore {
    pub batting: Vec<BattingLine>,
    pub pitching: Vec<PitchingLine>,
}

#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Games of a season and league that survive `exclude`, oldest first.
    async fn games(
        &self,
        year: i32,
        league: &str,
        exclude: &ExclusionRules,
    ) -> Result<Vec<GameRecord>, FetchError>;

    async fn batting_lines(&self, year: i32, league: &str) -> Result<Vec<BattingLine>, FetchError>;

    async fn pitching_lines(&self, year: i32, league: &str)
        -> Result<Vec<PitchingLine>, FetchError>;

    async fn box_score(&self, game_id: &str) -> Result<BoxScore, FetchError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteSource {
    db: Arc<Database>,
}

impl SqliteSource {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T, FetchError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| FetchError::Join(e.to_string()))?
            .map_err(|e| FetchError::Query {
                what,
                message: format!("{e:#}"),
            })
    }
}

#[async_trait]
impl StatsSource for SqliteSource {
    async fn games(
        &self,
        year: i32,
        league: &str,
        exclude: &ExclusionRules,
    ) -> Result<Vec<GameRecord>, FetchError> {
        let league = league.to_string();
        let clause = exclude.build_exclusion_clause();
        self.blocking("games", move |db| db.games(year, &league, &clause))
            .await
    }

    async fn batting_lines(&self, year: i32, league: &str) -> Result<Vec<BattingLine>, FetchError> {
        let league = league.to_string();
        self.blocking("batting", move |db| db.batting_lines(year, &league))
            .await
    }

    async fn pitching_lines(
        &self,
        year: i32,
        league: &str,
    ) -> Result<Vec<PitchingLine>, FetchError> {
        let league = league.to_string();
        self.blocking("pitching", move |db| db.pitching_lines(year, &league))
            .await
    }

    async fn box_score(&self, game_id: &str) -> Result<BoxScore, FetchError> {
        let game_id = game_id.to_string();
        self.blocking("box score", move |db| {
            Ok(BoxScore {
                batting: db.batting_lines_for_game(&game_id)?,
                pitching: db.pitching_lines_for_game(&game_id)?,
            })
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

type SeasonKey = (i32, String);

struct Cached<T> {
    fetched: Instant,
    value: Arc<Vec<T>>,
}

/// Season-level line cache in front of another source.
///
/// Entries older than `ttl` are refetched. Games and box scores always go to
/// the inner source.
pub struct CachedSource<S> {
    inner: S,
    ttl: Duration,
    batting: Mutex<HashMap<SeasonKey, Cached<BattingLine>>>,
    pitching: Mutex<HashMap<SeasonKey, Cached<PitchingLine>>>,
}

impl<S: StatsSource> CachedSource<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            batting: Mutex::new(HashMap::new()),
            pitching: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every cached season.
    pub fn invalidate(&self) {
        self.batting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.pitching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("stats cache invalidated");
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

fn lookup<T>(
    map: &Mutex<HashMap<SeasonKey, Cached<T>>>,
    key: &SeasonKey,
    ttl: Duration,
) -> Option<Arc<Vec<T>>> {
    let map = map.lock().unwrap_or_else(PoisonError::into_inner);
    map.get(key)
        .filter(|c| c.fetched.elapsed() < ttl)
        .map(|c| Arc::clone(&c.value))
}

fn store<T>(map: &Mutex<HashMap<SeasonKey, Cached<T>>>, key: SeasonKey, value: Arc<Vec<T>>) {
    map.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(
            key,
            Cached {
                fetched: Instant::now(),
                value,
            },
        );
}

#[async_trait]
impl<S: StatsSource> StatsSource for CachedSource<S> {
    async fn games(
        &self,
        year: i32,
        league: &str,
        exclude: &ExclusionRules,
    ) -> Result<Vec<GameRecord>, FetchError> {
        self.inner.games(year, league, exclude).await
    }

    async fn batting_lines(&self, year: i32, league: &str) -> Result<Vec<BattingLine>, FetchError> {
        let key = (year, league.to_string());
        if let Some(hit) = lookup(&self.batting, &key, self.ttl) {
            debug!("batting cache hit for {year}/{league}");
            return Ok(hit.as_ref().clone());
        }
        let lines = Arc::new(self.inner.batting_lines(year, league).await?);
        store(&self.batting, key, Arc::clone(&lines));
        Ok(lines.as_ref().clone())
    }

    async fn pitching_lines(
        &self,
        year: i32,
        league: &str,
    ) -> Result<Vec<PitchingLine>, FetchError> {
        let key = (year, league.to_string());
        if let Some(hit) = lookup(&self.pitching, &key, self.ttl) {
            debug!("pitching cache hit for {year}/{league}");
            return Ok(hit.as_ref().clone());
        }
        let lines = Arc::new(self.inner.pitching_lines(year, league).await?);
        store(&self.pitching, key, Arc::clone(&lines));
        Ok(lines.as_ref().clone())
    }

    async fn box_score(&self, game_id: &str) -> Result<BoxScore, FetchError> {
        self.inner.box_score(game_id).await
    }
}

// Normalization of raw scraped rows into typed games and per-game lines.
//
// Sources disagree on column names (English abbreviations or Japanese
// headers) and on numeric types (counts sometimes arrive as floats). The raw
// structs below absorb that variety; everything past this module sees only
// `GameRecord`, `BattingLine` and `PitchingLine`.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use crate::stats::{BattingLine, BattingStats, GameRecord, LineContext, PitchingLine, PitchingStats};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("field `{field}` is negative ({value})")]
    Negative { field: &'static str, value: f64 },

    #[error("field `{field}` is not a finite whole number ({value})")]
    NotWhole { field: &'static str, value: f64 },

    #[error("invalid innings pitched {0}")]
    InvalidInnings(f64),

    #[error("missing innings pitched")]
    MissingInnings,

    #[error("unreadable date `{0}`")]
    InvalidDate(String),

    #[error("count invariant violated: {0}")]
    Invariant(&'static str),

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Raw serde structs
// ---------------------------------------------------------------------------

/// Accept text columns that a source typed as numbers (numeric IDs, dates
/// like `20240601`).
fn string_like<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringLike {
        Text(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
    }

    Ok(match StringLike::deserialize(d)? {
        StringLike::Text(s) => s,
        StringLike::Unsigned(n) => n.to_string(),
        StringLike::Signed(n) => n.to_string(),
        StringLike::Float(n) => n.to_string(),
    })
}

/// Raw game header row. Extra columns are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGameRecord {
    #[serde(deserialize_with = "string_like", alias = "試合ID")]
    pub game_id: String,
    #[serde(deserialize_with = "string_like", alias = "日付")]
    pub date: String,
    #[serde(default, alias = "年度")]
    pub year: Option<i32>,
    #[serde(deserialize_with = "string_like", alias = "リーグ")]
    pub league: String,
    #[serde(deserialize_with = "string_like", alias = "球場")]
    pub venue: String,
    #[serde(deserialize_with = "string_like", alias = "ホーム")]
    pub home_team: String,
    #[serde(deserialize_with = "string_like", alias = "ビジター")]
    pub away_team: String,
    #[serde(alias = "ホーム得点")]
    pub home_runs: f64,
    #[serde(alias = "ビジター得点")]
    pub away_runs: f64,
    #[serde(default, alias = "イニング")]
    pub innings: Option<f64>,
    #[serde(flatten)]
    _extra: HashMap<String, serde_json::Value>,
}

/// Identity columns shared by batting and pitching rows.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLineContext {
    #[serde(deserialize_with = "string_like", alias = "試合ID")]
    pub game_id: String,
    #[serde(alias = "年度")]
    pub year: i32,
    #[serde(deserialize_with = "string_like", alias = "リーグ")]
    pub league: String,
    #[serde(deserialize_with = "string_like", default, alias = "球場")]
    pub venue: String,
    #[serde(deserialize_with = "string_like", alias = "チーム", alias = "球団")]
    pub team: String,
    #[serde(deserialize_with = "string_like", alias = "選手ID")]
    pub player_id: String,
    #[serde(deserialize_with = "string_like", default, alias = "選手名")]
    pub player_name: String,
    #[serde(default, alias = "ホーム")]
    pub home: Option<bool>,
}

/// Raw per-game batting row.
#[derive(Debug, Clone, Deserialize)]
#[allow(non_snake_case)]
pub struct RawBattingRecord {
    #[serde(flatten)]
    pub ctx: RawLineContext,
    #[serde(alias = "打席")]
    pub PA: f64,
    #[serde(alias = "打数")]
    pub AB: f64,
    #[serde(alias = "安打")]
    pub H: f64,
    #[serde(default, rename = "2B", alias = "二塁打")]
    pub doubles: f64,
    #[serde(default, rename = "3B", alias = "三塁打")]
    pub triples: f64,
    #[serde(default, alias = "本塁打")]
    pub HR: f64,
    #[serde(default, alias = "四球")]
    pub BB: f64,
    #[serde(default, alias = "故意四球")]
    pub IBB: f64,
    #[serde(default, alias = "死球")]
    pub HBP: f64,
    #[serde(default, alias = "犠飛")]
    pub SF: f64,
    #[serde(default, alias = "犠打")]
    pub SH: f64,
    #[serde(default, alias = "三振", alias = "K")]
    pub SO: f64,
    #[serde(default, alias = "得点")]
    pub R: f64,
    #[serde(default, alias = "打点")]
    pub RBI: f64,
    #[serde(default, alias = "盗塁")]
    pub SB: f64,
    #[serde(default, alias = "盗塁死")]
    pub CS: f64,
    #[serde(flatten)]
    _extra: HashMap<String, serde_json::Value>,
}

/// Raw per-game pitching row. Innings come either as outs or in the
/// box-score `IP` notation (`6.2` = six and two-thirds).
#[derive(Debug, Clone, Deserialize)]
#[allow(non_snake_case)]
pub struct RawPitchingRecord {
    #[serde(flatten)]
    pub ctx: RawLineContext,
    #[serde(default, alias = "アウト数")]
    pub IP_outs: Option<f64>,
    #[serde(default, alias = "投球回")]
    pub IP: Option<f64>,
    #[serde(default, alias = "打者")]
    pub BF: f64,
    #[serde(default, alias = "被安打")]
    pub H: f64,
    #[serde(default, alias = "失点")]
    pub R: f64,
    #[serde(default, alias = "自責点")]
    pub ER: f64,
    #[serde(default, alias = "被本塁打")]
    pub HR: f64,
    #[serde(default, alias = "与四球")]
    pub BB: f64,
    #[serde(default, alias = "故意四球")]
    pub IBB: f64,
    #[serde(default, alias = "与死球")]
    pub HBP: f64,
    #[serde(default, alias = "奪三振", alias = "K")]
    pub SO: f64,
    #[serde(flatten)]
    _extra: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn count(field: &'static str, value: f64) -> Result<u32, NormalizeError> {
    if value < 0.0 {
        return Err(NormalizeError::Negative { field, value });
    }
    if !value.is_finite() || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(NormalizeError::NotWhole { field, value });
    }
    Ok(value as u32)
}

/// Convert box-score innings notation to outs: the digit after the point
/// counts outs (`.1`, `.2`). Decimal thirds (`.333`, `.667`) are accepted.
pub fn innings_to_outs(ip: f64) -> Result<u32, NormalizeError> {
    if !ip.is_finite() || ip < 0.0 {
        return Err(NormalizeError::InvalidInnings(ip));
    }
    let whole = ip.trunc();
    let frac = ip - whole;
    let extra = if frac < 0.05 {
        0
    } else if (frac - 0.1).abs() < 0.05 || (frac - 1.0 / 3.0).abs() < 0.01 {
        1
    } else if (frac - 0.2).abs() < 0.05 || (frac - 2.0 / 3.0).abs() < 0.01 {
        2
    } else {
        return Err(NormalizeError::InvalidInnings(ip));
    };
    Ok(whole as u32 * 3 + extra)
}

fn parse_date(raw: &str) -> Result<NaiveDate, NormalizeError> {
    let s = raw.trim();
    ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .ok_or_else(|| NormalizeError::InvalidDate(raw.to_string()))
}

fn line_context(raw: RawLineContext) -> LineContext {
    let player_name = if raw.player_name.trim().is_empty() {
        raw.player_id.trim().to_string()
    } else {
        raw.player_name.trim().to_string()
    };
    LineContext {
        game_id: raw.game_id.trim().to_string(),
        year: raw.year,
        league: raw.league.trim().to_string(),
        venue: raw.venue.trim().to_string(),
        team: raw.team.trim().to_string(),
        player_id: raw.player_id.trim().to_string(),
        player_name,
        home: raw.home.unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// Normalizers
// ---------------------------------------------------------------------------

pub fn normalize_game(raw: RawGameRecord) -> Result<GameRecord, NormalizeError> {
    let date = parse_date(&raw.date)?;
    let innings = raw.innings.map(|i| count("innings", i)).transpose()?;
    Ok(GameRecord {
        game_id: raw.game_id.trim().to_string(),
        date,
        year: raw.year.unwrap_or_else(|| date.year()),
        league: raw.league.trim().to_string(),
        venue: raw.venue.trim().to_string(),
        home_team: raw.home_team.trim().to_string(),
        away_team: raw.away_team.trim().to_string(),
        home_runs: count("home_runs", raw.home_runs)?,
        away_runs: count("away_runs", raw.away_runs)?,
        innings,
    })
}

pub fn normalize_batting(raw: RawBattingRecord) -> Result<BattingLine, NormalizeError> {
    let stats = BattingStats {
        pa: count("PA", raw.PA)?,
        ab: count("AB", raw.AB)?,
        h: count("H", raw.H)?,
        doubles: count("2B", raw.doubles)?,
        triples: count("3B", raw.triples)?,
        hr: count("HR", raw.HR)?,
        bb: count("BB", raw.BB)?,
        ibb: count("IBB", raw.IBB)?,
        hbp: count("HBP", raw.HBP)?,
        sf: count("SF", raw.SF)?,
        sh: count("SH", raw.SH)?,
        so: count("SO", raw.SO)?,
        r: count("R", raw.R)?,
        rbi: count("RBI", raw.RBI)?,
        sb: count("SB", raw.SB)?,
        cs: count("CS", raw.CS)?,
    };
    if let Some(violation) = stats.invariant_violation() {
        return Err(NormalizeError::Invariant(violation));
    }
    Ok(BattingLine {
        ctx: line_context(raw.ctx),
        stats,
    })
}

pub fn normalize_pitching(raw: RawPitchingRecord) -> Result<PitchingLine, NormalizeError> {
    let ip_outs = match (raw.IP_outs, raw.IP) {
        (Some(outs), _) => count("IP_outs", outs)?,
        (None, Some(ip)) => innings_to_outs(ip)?,
        (None, None) => return Err(NormalizeError::MissingInnings),
    };
    let stats = PitchingStats {
        ip_outs,
        bf: count("BF", raw.BF)?,
        h: count("H", raw.H)?,
        r: count("R", raw.R)?,
        er: count("ER", raw.ER)?,
        hr: count("HR", raw.HR)?,
        bb: count("BB", raw.BB)?,
        ibb: count("IBB", raw.IBB)?,
        hbp: count("HBP", raw.HBP)?,
        so: count("SO", raw.SO)?,
    };
    if let Some(violation) = stats.invariant_violation() {
        return Err(NormalizeError::Invariant(violation));
    }
    Ok(PitchingLine {
        ctx: line_context(raw.ctx),
        stats,
    })
}

// ---------------------------------------------------------------------------
// JSON blobs
// ---------------------------------------------------------------------------

/// Normalize heterogeneous JSON batting rows, skipping invalid ones.
pub fn batting_lines_from_json(rows: &[serde_json::Value]) -> Vec<BattingLine> {
    rows.iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let parsed = serde_json::from_value::<RawBattingRecord>(row.clone())
                .map_err(NormalizeError::from)
                .and_then(normalize_batting);
            match parsed {
                Ok(line) => Some(line),
                Err(e) => {
                    warn!("skipping batting row {i}: {e}");
                    None
                }
            }
        })
        .collect()
}

/// Normalize heterogeneous JSON pitching rows, skipping invalid ones.
pub fn pitching_lines_from_json(rows: &[serde_json::Value]) -> Vec<PitchingLine> {
    rows.iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let parsed = serde_json::from_value::<RawPitchingRecord>(row.clone())
                .map_err(NormalizeError::from)
                .and_then(normalize_pitching);
            match parsed {
                Ok(line) => Some(line),
                Err(e) => {
                    warn!("skipping pitching row {i}: {e}");
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn japanese_keys_map_to_batting_line() {
        let rows = vec![json!({
            "試合ID": "2024-0601-01",
            "年度": 2024,
            "リーグ": "central",
            "球場": "神宮",
            "球団": "ヤクルト",
            "選手ID": "p100",
            "選手名": "村上",
            "打席": 5,
            "打数": 4,
            "安打": 2,
            "二塁打": 1,
            "本塁打": 1,
            "四球": 1,
            "三振": 1,
            "打点": 3,
            "備考": "extra column"
        })];
        let lines = batting_lines_from_json(&rows);
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line.ctx.team, "ヤクルト");
        assert_eq!(line.ctx.venue, "神宮");
        assert_eq!(line.stats.pa, 5);
        assert_eq!(line.stats.doubles, 1);
        assert_eq!(line.stats.hr, 1);
        assert_eq!(line.stats.rbi, 3);
        assert!(!line.ctx.home);
    }

    #[test]
    fn english_keys_and_float_counts() {
        let rows = vec![json!({
            "game_id": "g1", "year": 2024, "league": "pacific", "team": "Hawks",
            "player_id": "p1", "PA": 4.0, "AB": 4.0, "H": 1.0, "2B": 0, "K": 2,
            "home": true
        })];
        let lines = batting_lines_from_json(&rows);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].stats.so, 2);
        assert_eq!(lines[0].ctx.player_name, "p1");
        assert!(lines[0].ctx.home);
    }

    #[test]
    fn invalid_rows_are_skipped() {
        let rows = vec![
            // PA < AB
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "a", "PA": 3, "AB": 4, "H": 1}),
            // negative count
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "b", "PA": 4, "AB": 4, "H": -1}),
            // missing required field
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "c", "PA": 4}),
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "d", "PA": 4, "AB": 4, "H": 1}),
        ];
        let lines = batting_lines_from_json(&rows);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].ctx.player_id, "d");
    }

    #[test]
    fn innings_notation() {
        assert_eq!(innings_to_outs(6.0).unwrap(), 18);
        assert_eq!(innings_to_outs(6.1).unwrap(), 19);
        assert_eq!(innings_to_outs(6.2).unwrap(), 20);
        assert_eq!(innings_to_outs(150.0 + 2.0 / 3.0).unwrap(), 452);
        assert!(innings_to_outs(6.5).is_err());
        assert!(innings_to_outs(-1.0).is_err());
    }

    #[test]
    fn pitching_prefers_outs_then_innings() {
        let rows = vec![
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "p1", "投球回": 7.1, "被安打": 5, "失点": 2,
                   "自責点": 2, "奪三振": 8, "打者": 28}),
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "p2", "IP_outs": 5, "IP": 9.0, "H": 1}),
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "p3", "H": 1}),
            // ER > R
            json!({"game_id": "g1", "year": 2024, "league": "c", "team": "T",
                   "player_id": "p4", "IP": 1.0, "R": 1, "ER": 2}),
        ];
        let lines = pitching_lines_from_json(&rows);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].stats.ip_outs, 22);
        assert_eq!(lines[0].stats.so, 8);
        assert_eq!(lines[1].stats.ip_outs, 5);
    }

    #[test]
    fn game_rows_parse_dates_and_default_year() {
        let raw: RawGameRecord = serde_json::from_value(json!({
            "試合ID": "2024-0601-01", "日付": "2024/06/01", "リーグ": "central",
            "球場": "神宮", "ホーム": "ヤクルト", "ビジター": "巨人",
            "ホーム得点": 5, "ビジター得点": 3, "イニング": 9
        }))
        .unwrap();
        let game = normalize_game(raw).unwrap();
        assert_eq!(game.year, 2024);
        assert_eq!(game.date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(game.innings, Some(9));
        assert_eq!(game.total_runs(), 8);

        let bad: RawGameRecord = serde_json::from_value(json!({
            "game_id": "x", "date": "June 1", "league": "c", "venue": "v",
            "home_team": "a", "away_team": "b", "home_runs": 1, "away_runs": 0
        }))
        .unwrap();
        assert!(matches!(normalize_game(bad), Err(NormalizeError::InvalidDate(_))));
    }
}

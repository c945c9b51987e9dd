use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Widest zero-padding the formatter accepts.
pub const MAX_WIDTH: i64 = 32;

/// Largest block a single reservation may take.
pub const MAX_BLOCK: i64 = 1_000_000;

#[derive(Debug, Error)]
pub enum SequenceError {
    /// The counter statement could not run: busy past the timeout, locked,
    /// unopenable or failing I/O. Never retried here.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Advancing the counter would leave the i64 range. Nothing was written.
    #[error("counter exhausted: {0}")]
    Exhausted(String),
}

impl SequenceError {
    pub fn code(&self) -> &'static str {
        match self {
            SequenceError::StoreUnavailable(_) => "store_unavailable",
            SequenceError::InvalidArgument(_) => "invalid_argument",
            SequenceError::Exhausted(_) => "sequence_exhausted",
        }
    }
}

impl From<rusqlite::Error> for SequenceError {
    fn from(e: rusqlite::Error) -> Self {
        SequenceError::StoreUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub key: String,
    pub sequence_value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSettings {
    pub prefix: String,
    pub width: i64,
    pub counter_key_prefix: String,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            prefix: "abu/s".to_string(),
            width: 3,
            counter_key_prefix: "student_regno".to_string(),
        }
    }
}

fn check_key(key: &str) -> Result<(), SequenceError> {
    if key.trim().is_empty() {
        return Err(SequenceError::InvalidArgument(
            "counter key must not be empty".into(),
        ));
    }
    Ok(())
}

/// Atomically bumps the counter for `key` (creating it at zero first if
/// absent) and returns the new value.
pub fn next_in_sequence(conn: &Connection, key: &str) -> Result<i64, SequenceError> {
    let range = next_block(conn, key, 1)?;
    Ok(*range.end())
}

/// Reserves `count` consecutive values in one upsert. The returned range is
/// owned exclusively by this caller.
pub fn next_block(
    conn: &Connection,
    key: &str,
    count: i64,
) -> Result<RangeInclusive<i64>, SequenceError> {
    check_key(key)?;
    if count <= 0 {
        return Err(SequenceError::InvalidArgument(format!(
            "count must be positive, got {}",
            count
        )));
    }
    if count > MAX_BLOCK {
        return Err(SequenceError::InvalidArgument(format!(
            "count must be <= {}, got {}",
            MAX_BLOCK, count
        )));
    }

    // Single statement: locate-or-create and increment can not interleave
    // with another writer. The WHERE keeps the sum inside i64; SQLite would
    // otherwise store it as REAL.
    let last: Option<i64> = conn
        .query_row(
            "INSERT INTO counters(key, sequence_value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE
                SET sequence_value = sequence_value + excluded.sequence_value
                WHERE counters.sequence_value <= ?3
             RETURNING sequence_value",
            (key, count, i64::MAX - count),
            |r| r.get(0),
        )
        .optional()?;
    let Some(last) = last else {
        return Err(SequenceError::Exhausted(format!(
            "{} can not advance by {}",
            key, count
        )));
    };
    let first = last - count + 1;
    tracing::debug!(key, first, last, "counter advanced");
    Ok(first..=last)
}

/// Last issued value for `key`, 0 when nothing was issued yet. Informational
/// only: the next value must always come from [`next_in_sequence`].
pub fn current_value(conn: &Connection, key: &str) -> Result<i64, SequenceError> {
    check_key(key)?;
    let v: Option<i64> = conn
        .query_row(
            "SELECT sequence_value FROM counters WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or(0))
}

pub fn list_counters(conn: &Connection) -> Result<Vec<Counter>, SequenceError> {
    let mut stmt = conn.prepare("SELECT key, sequence_value FROM counters ORDER BY key")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Counter {
                key: r.get(0)?,
                sequence_value: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn format_registration_number(
    prefix: &str,
    year: i32,
    sequence: i64,
    width: i64,
) -> Result<String, SequenceError> {
    if sequence < 0 {
        return Err(SequenceError::InvalidArgument(format!(
            "sequence must not be negative, got {}",
            sequence
        )));
    }
    if width <= 0 {
        return Err(SequenceError::InvalidArgument(format!(
            "width must be positive, got {}",
            width
        )));
    }
    if width > MAX_WIDTH {
        return Err(SequenceError::InvalidArgument(format!(
            "width must be <= {}, got {}",
            MAX_WIDTH, width
        )));
    }
    Ok(format!(
        "{}/{}/{:0width$}",
        prefix,
        year,
        sequence,
        width = width as usize
    ))
}

/// Each year numbers from 1 on its own counter row.
pub fn registration_key(counter_key_prefix: &str, year: i32) -> String {
    format!("{}_{}", counter_key_prefix, year)
}

pub fn allocate_registration_number(
    conn: &Connection,
    settings: &RegistrationSettings,
    year: i32,
) -> Result<String, SequenceError> {
    let key = registration_key(&settings.counter_key_prefix, year);
    let seq = next_in_sequence(conn, &key)?;
    format_registration_number(&settings.prefix, year, seq, settings.width)
}

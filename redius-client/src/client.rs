//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing Redis-compatible
//! commands over a shared connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `StoreClient` hides pooling and protocol details.
//! 2. **One Command per Call**: Each method checks out a connection, sends a
//!    single command, and parses the reply; no retries, no pipelining.
//! 3. **Fail Fast**: Error replies surface verbatim as `ClientError::Server`.
//! 4. **Explicit Pool Ownership**: The pool is passed in, never global.

use std::fmt;
use std::time::Duration;

use tracing::warn;

use crate::config::{ClientConfig, ErrorMode};
use crate::error::{ClientError, ClientResult};
use crate::pool::ConnectionPool;
use crate::resp::{format_score, Command, RespValue, ToArg};

/// One end of a sorted-set score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    /// Scores equal to the value are included.
    Inclusive(f64),
    /// Scores equal to the value are excluded, written `(value`.
    Exclusive(f64),
    PosInf,
    NegInf,
}

impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBound::Inclusive(score) => f.write_str(&format_score(*score)),
            ScoreBound::Exclusive(score) => write!(f, "({}", format_score(*score)),
            ScoreBound::PosInf => write!(f, "+inf"),
            ScoreBound::NegInf => write!(f, "-inf"),
        }
    }
}

impl ScoreBound {
    fn checked(self) -> ClientResult<Self> {
        match self {
            ScoreBound::Inclusive(score) | ScoreBound::Exclusive(score) => {
                check_score(score)?;
                Ok(self)
            }
            _ => Ok(self),
        }
    }
}

fn check_score(score: f64) -> ClientResult<f64> {
    if score.is_nan() {
        return Err(ClientError::InvalidScore);
    }
    Ok(score)
}

impl From<f64> for ScoreBound {
    fn from(score: f64) -> Self {
        ScoreBound::Inclusive(score)
    }
}

impl From<i64> for ScoreBound {
    fn from(score: i64) -> Self {
        ScoreBound::Inclusive(score as f64)
    }
}

impl ToArg for ScoreBound {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.to_string().as_bytes());
    }
}

/// `LIMIT offset count` window for score range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub offset: i64,
    pub count: i64,
}

impl Limit {
    pub fn new(offset: i64, count: i64) -> Self {
        Limit { offset, count }
    }
}

/// One page of a cursor-based scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; zero once the iteration is complete.
    pub cursor: u64,
    /// Keys for `SCAN`; interleaved field/value pairs for `HSCAN`.
    pub items: Vec<String>,
}

impl ScanPage {
    pub fn is_last(&self) -> bool {
        self.cursor == 0
    }

    fn from_reply(reply: RespValue) -> ClientResult<Self> {
        let mut parts = reply.into_array()?.into_iter();
        let (cursor, items) = match (parts.next(), parts.next(), parts.next()) {
            (Some(cursor), Some(items), None) => (cursor, items),
            _ => return Err(ClientError::UnexpectedResponse),
        };
        let cursor = cursor.into_string()?;
        let cursor: u64 = cursor
            .parse()
            .map_err(|_| ClientError::InvalidNumber(cursor))?;
        Ok(ScanPage {
            cursor,
            items: items.into_list()?,
        })
    }
}

/// Synchronous client over a connection pool.
///
/// Each call acquires a connection, executes one command, and returns the
/// connection to the pool, even when the command failed.
#[derive(Clone)]
pub struct StoreClient {
    pool: ConnectionPool,
    error_mode: ErrorMode,
}

impl StoreClient {
    /// Validates `config`, starts its pool, and returns a client over it.
    ///
    /// No connection is opened until the first command.
    pub fn initialize(config: ClientConfig) -> ClientResult<Self> {
        let pool = ConnectionPool::new(config.pool)?;
        Ok(StoreClient::new(pool).with_error_mode(config.error_mode))
    }

    /// Creates a client over an existing pool.
    pub fn new(pool: ConnectionPool) -> Self {
        StoreClient {
            pool,
            error_mode: ErrorMode::Surface,
        }
    }

    pub fn with_error_mode(mut self, error_mode: ErrorMode) -> Self {
        self.error_mode = error_mode;
        self
    }

    /// The shared pool, for manual checkout/checkin.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Drains the pool. Later calls fail with `PoolClosed`.
    pub fn shutdown(&self) {
        self.pool.close();
    }

    /// Sends an arbitrary command and returns the raw reply.
    ///
    /// Error replies are returned as `RespValue::Error`, not as `Err`.
    pub fn command(&self, command: &Command) -> ClientResult<RespValue> {
        let mut conn = self.pool.checkout()?;
        conn.exec(command)
    }

    fn fire_and_forget(&self, command: &Command, result: ClientResult<()>) -> ClientResult<()> {
        match (result, self.error_mode) {
            (Err(err), ErrorMode::FireAndForget) => {
                warn!(?command, error = %err, "ignoring failed command");
                Ok(())
            }
            (result, _) => result,
        }
    }

    /// Pings the store. Returns the reply text, normally "PONG".
    pub fn ping(&self) -> ClientResult<String> {
        self.command(&Command::new("PING"))?.into_string()
    }

    // ── strings ─────────────────────────────────────────────────────

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &str, value: &str) -> ClientResult<()> {
        self.command(&Command::new("SET").arg(key).arg(value))?
            .into_ack()
    }

    /// Sets a value that expires after `ttl` (whole seconds).
    pub fn set_ex(&self, key: &str, ttl: Duration, value: &str) -> ClientResult<()> {
        let cmd = Command::new("SETEX").arg(key).arg(ttl.as_secs()).arg(value);
        self.command(&cmd)?.into_ack()
    }

    /// Fetches a value by key.
    ///
    /// Returns `ClientError::Nil` when the key is missing.
    pub fn get(&self, key: &str) -> ClientResult<String> {
        self.command(&Command::new("GET").arg(key))?.into_string()
    }

    /// Fetches several keys at once, in the order given.
    pub fn mget<K: AsRef<str>>(&self, keys: &[K]) -> ClientResult<Vec<Option<String>>> {
        let cmd = Command::new("MGET").args(as_strs(keys));
        self.command(&cmd)?.into_optional_list()
    }

    // ── hashes ──────────────────────────────────────────────────────

    /// Sets a hash field. Returns true when the field was created.
    pub fn hset(&self, key: &str, field: &str, value: &str) -> ClientResult<bool> {
        let cmd = Command::new("HSET").arg(key).arg(field).arg(value);
        Ok(self.command(&cmd)?.into_integer()? > 0)
    }

    /// Sets a hash field only if it does not exist yet.
    pub fn hset_nx(&self, key: &str, field: &str, value: &str) -> ClientResult<bool> {
        let cmd = Command::new("HSETNX").arg(key).arg(field).arg(value);
        Ok(self.command(&cmd)?.into_integer()? == 1)
    }

    /// Sets several hash fields, in the order given.
    pub fn hmset<F, V>(&self, key: &str, pairs: &[(F, V)]) -> ClientResult<()>
    where
        F: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cmd = Command::new("HMSET").arg(key);
        for (field, value) in pairs {
            let (field, value): (&str, &str) = (field.as_ref(), value.as_ref());
            cmd = cmd.arg(field).arg(value);
        }
        self.command(&cmd)?.into_ack()
    }

    /// Returns `ClientError::Nil` when the key or field is missing.
    pub fn hget(&self, key: &str, field: &str) -> ClientResult<String> {
        self.command(&Command::new("HGET").arg(key).arg(field))?
            .into_string()
    }

    pub fn hmget<F: AsRef<str>>(
        &self,
        key: &str,
        fields: &[F],
    ) -> ClientResult<Vec<Option<String>>> {
        let cmd = Command::new("HMGET").arg(key).args(as_strs(fields));
        self.command(&cmd)?.into_optional_list()
    }

    /// Returns every field/value pair in store order.
    pub fn hgetall(&self, key: &str) -> ClientResult<Vec<(String, String)>> {
        self.command(&Command::new("HGETALL").arg(key))?.into_pairs()
    }

    pub fn hkeys(&self, key: &str) -> ClientResult<Vec<String>> {
        self.command(&Command::new("HKEYS").arg(key))?.into_list()
    }

    /// Removes a hash field. Returns true when the field existed.
    pub fn hdel(&self, key: &str, field: &str) -> ClientResult<bool> {
        let cmd = Command::new("HDEL").arg(key).arg(field);
        Ok(self.command(&cmd)?.into_integer()? > 0)
    }

    /// Removes an entire hash. Honors `ErrorMode::FireAndForget`.
    pub fn hdel_all(&self, key: &str) -> ClientResult<()> {
        let cmd = Command::new("DEL").arg(key);
        let result = self.command(&cmd).and_then(RespValue::into_ack);
        self.fire_and_forget(&cmd, result)
    }

    /// Increments a numeric hash field. Honors `ErrorMode::FireAndForget`.
    pub fn hincr_by(&self, key: &str, field: &str, increment: i64) -> ClientResult<()> {
        let cmd = Command::new("HINCRBY").arg(key).arg(field).arg(increment);
        let result = self.command(&cmd).and_then(RespValue::into_ack);
        self.fire_and_forget(&cmd, result)
    }

    // ── lists ───────────────────────────────────────────────────────

    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> ClientResult<Vec<String>> {
        let cmd = Command::new("LRANGE").arg(key).arg(start).arg(stop);
        self.command(&cmd)?.into_list()
    }

    /// Pushes values onto the head of a list. Returns the new length.
    pub fn lpush<V: ToArg>(&self, key: &str, values: &[V]) -> ClientResult<i64> {
        let cmd = Command::new("LPUSH").arg(key).args(values);
        self.command(&cmd)?.into_integer()
    }

    /// Pops from the tail of a list; `ClientError::Nil` when empty.
    pub fn rpop(&self, key: &str) -> ClientResult<String> {
        self.command(&Command::new("RPOP").arg(key))?.into_string()
    }

    // ── sorted sets ─────────────────────────────────────────────────

    /// Adds a member with `score`. Returns true when the member is new.
    pub fn zadd(&self, key: &str, score: f64, member: impl ToArg) -> ClientResult<bool> {
        let cmd = Command::new("ZADD").arg(key).arg(check_score(score)?).arg(member);
        Ok(self.command(&cmd)?.into_integer()? > 0)
    }

    /// Adds `increment` to a member's score. Returns the new score.
    pub fn zincr_by(&self, key: &str, increment: f64, member: impl ToArg) -> ClientResult<f64> {
        let cmd = Command::new("ZINCRBY")
            .arg(key)
            .arg(check_score(increment)?)
            .arg(member);
        self.command(&cmd)?.into_f64()
    }

    /// Members with scores in `[min, max]`, lowest score first.
    pub fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<Limit>,
    ) -> ClientResult<Vec<String>> {
        let cmd = score_range("ZRANGEBYSCORE", key, min, max, false, limit)?;
        self.command(&cmd)?.into_list()
    }

    pub fn zrange_by_score_with_scores(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<Limit>,
    ) -> ClientResult<Vec<(String, f64)>> {
        let cmd = score_range("ZRANGEBYSCORE", key, min, max, true, limit)?;
        scored_members(self.command(&cmd)?)
    }

    /// Members with scores in `[min, max]`, highest score first.
    ///
    /// Note the argument order: `max` comes before `min`, as on the wire.
    pub fn zrevrange_by_score(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<Limit>,
    ) -> ClientResult<Vec<String>> {
        let cmd = score_range("ZREVRANGEBYSCORE", key, max, min, false, limit)?;
        self.command(&cmd)?.into_list()
    }

    pub fn zrevrange_by_score_with_scores(
        &self,
        key: &str,
        max: ScoreBound,
        min: ScoreBound,
        limit: Option<Limit>,
    ) -> ClientResult<Vec<(String, f64)>> {
        let cmd = score_range("ZREVRANGEBYSCORE", key, max, min, true, limit)?;
        scored_members(self.command(&cmd)?)
    }

    /// Removes members with scores in `[min, max]`. Returns how many.
    pub fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> ClientResult<i64> {
        let cmd = Command::new("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min.checked()?)
            .arg(max.checked()?);
        self.command(&cmd)?.into_integer()
    }

    // ── keys ────────────────────────────────────────────────────────

    /// Deletes a key. Returns true when a key was removed; absent keys are not an error.
    pub fn del(&self, key: &str) -> ClientResult<bool> {
        Ok(self.command(&Command::new("DEL").arg(key))?.into_integer()? > 0)
    }

    /// Deletes several keys in one command. Returns how many existed.
    pub fn del_all<K: AsRef<str>>(&self, keys: &[K]) -> ClientResult<i64> {
        let cmd = Command::new("DEL").args(as_strs(keys));
        self.command(&cmd)?.into_integer()
    }

    /// Expires a key at a unix timestamp in seconds. Honors `ErrorMode::FireAndForget`.
    pub fn expire_at(&self, key: &str, timestamp: i64) -> ClientResult<()> {
        let cmd = Command::new("EXPIREAT").arg(key).arg(timestamp);
        let result = self.command(&cmd).and_then(RespValue::into_ack);
        self.fire_and_forget(&cmd, result)
    }

    /// Every key matching a glob pattern.
    pub fn keys(&self, pattern: &str) -> ClientResult<Vec<String>> {
        self.command(&Command::new("KEYS").arg(pattern))?.into_list()
    }

    /// One step of incremental key iteration. Start with cursor 0.
    pub fn scan(&self, cursor: u64, pattern: &str, count: usize) -> ClientResult<ScanPage> {
        let cmd = Command::new("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);
        ScanPage::from_reply(self.command(&cmd)?)
    }

    /// One step of incremental hash field iteration.
    pub fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> ClientResult<ScanPage> {
        let cmd = Command::new("HSCAN")
            .arg(key)
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);
        ScanPage::from_reply(self.command(&cmd)?)
    }
}

fn as_strs<K: AsRef<str>>(items: &[K]) -> impl Iterator<Item = &str> {
    items.iter().map(|item| item.as_ref())
}

fn score_range(
    name: &str,
    key: &str,
    from: ScoreBound,
    to: ScoreBound,
    with_scores: bool,
    limit: Option<Limit>,
) -> ClientResult<Command> {
    let mut cmd = Command::new(name).arg(key).arg(from.checked()?).arg(to.checked()?);
    if with_scores {
        cmd = cmd.arg("WITHSCORES");
    }
    if let Some(limit) = limit {
        cmd = cmd.arg("LIMIT").arg(limit.offset).arg(limit.count);
    }
    Ok(cmd)
}

fn scored_members(reply: RespValue) -> ClientResult<Vec<(String, f64)>> {
    reply
        .into_pairs()?
        .into_iter()
        .map(|(member, score)| {
            RespValue::Bulk(Some(score.into_bytes()))
                .into_f64()
                .map(|parsed| (member, parsed))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bounds_render_like_the_store_expects() {
        assert_eq!(ScoreBound::Inclusive(1.0).to_string(), "1");
        assert_eq!(ScoreBound::Exclusive(2.5).to_string(), "(2.5");
        assert_eq!(ScoreBound::PosInf.to_string(), "+inf");
        assert_eq!(ScoreBound::NegInf.to_string(), "-inf");
        assert_eq!(ScoreBound::from(3i64), ScoreBound::Inclusive(3.0));
    }

    #[test]
    fn infinite_scores_render_as_inf_and_nan_is_rejected() {
        assert_eq!(ScoreBound::Inclusive(f64::INFINITY).to_string(), "+inf");
        assert_eq!(ScoreBound::Exclusive(f64::NEG_INFINITY).to_string(), "(-inf");
        assert_eq!(ScoreBound::Inclusive(-0.5).to_string(), "-0.5");

        let bound = ScoreBound::from(f64::NAN);
        let nan = score_range("ZRANGEBYSCORE", "z", bound, ScoreBound::PosInf, false, None);
        assert!(matches!(nan, Err(ClientError::InvalidScore)));
        let nan = score_range(
            "ZRANGEBYSCORE",
            "z",
            ScoreBound::NegInf,
            ScoreBound::Exclusive(f64::NAN),
            false,
            None,
        );
        assert!(matches!(nan, Err(ClientError::InvalidScore)));
    }

    #[test]
    fn score_range_puts_withscores_before_limit() {
        let cmd = score_range(
            "ZREVRANGEBYSCORE",
            "board",
            ScoreBound::PosInf,
            ScoreBound::NegInf,
            true,
            Some(Limit::new(0, 10)),
        )
        .expect("finite bounds");
        let parts: Vec<String> = cmd
            .parts()
            .iter()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        assert_eq!(
            parts,
            vec!["ZREVRANGEBYSCORE", "board", "+inf", "-inf", "WITHSCORES", "LIMIT", "0", "10"]
        );
    }

    #[test]
    fn scan_page_parses_cursor_and_items() {
        let reply = RespValue::Array(vec![
            RespValue::Bulk(Some(b"17".to_vec())),
            RespValue::Array(vec![
                RespValue::Bulk(Some(b"a".to_vec())),
                RespValue::Bulk(Some(b"b".to_vec())),
            ]),
        ]);
        let page = ScanPage::from_reply(reply).unwrap();
        assert_eq!(page.cursor, 17);
        assert_eq!(page.items, vec!["a", "b"]);
        assert!(!page.is_last());
    }

    #[test]
    fn scan_page_rejects_flat_reply() {
        let reply = RespValue::Array(vec![RespValue::Bulk(Some(b"0".to_vec()))]);
        assert!(matches!(
            ScanPage::from_reply(reply),
            Err(ClientError::UnexpectedResponse)
        ));
    }

    #[test]
    fn scored_members_parse_scores() {
        let reply = RespValue::Array(vec![
            RespValue::Bulk(Some(b"c".to_vec())),
            RespValue::Bulk(Some(b"3".to_vec())),
            RespValue::Bulk(Some(b"b".to_vec())),
            RespValue::Bulk(Some(b"2.5".to_vec())),
        ]);
        assert_eq!(
            scored_members(reply).unwrap(),
            vec![("c".to_string(), 3.0), ("b".to_string(), 2.5)]
        );
    }
}

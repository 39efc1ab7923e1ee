//! # Connection Handling and Dispatch
//!
//! Accept RESP2 connections, enforce `AUTH` when a password is configured,
//! parse commands, and dispatch them to the keyspace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::db::{Db, DbError, ScoreBound};
use crate::protocol::{
    resp_array, resp_bulk, resp_error, resp_integer, resp_optional, resp_scan,
    resp_simple, RespError, RespParser,
};

/// Server-wide settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// When set, every connection must `AUTH` with this password first.
    pub password: Option<String>,
}

/// Counters exposed for tests and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: u64,
    pub commands: u64,
    pub auth_attempts: u64,
}

/// Shared state for every connection.
#[derive(Debug, Default)]
pub struct Server {
    config: ServerConfig,
    db: Db,
    connections: AtomicU64,
    commands: AtomicU64,
    auth_attempts: AtomicU64,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            ..Server::default()
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.connections.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            auth_attempts: self.auth_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection session state.
struct Session {
    authenticated: bool,
}

/// Handles a single client connection until EOF or a protocol error.
pub async fn handle_connection<S>(stream: S, server: Arc<Server>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();
    let mut session = Session {
        authenticated: server.config.password.is_none(),
    };
    server.connections.fetch_add(1, Ordering::Relaxed);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    let response = dispatch_command(&args, &server, &mut session);
                    stream.write_all(&response).await?;
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    warn!("closing connection after protocol error");
                    stream.write_all(&resp_error("ERR Protocol error")).await?;
                    return Ok(());
                }
            }
        }
    }

    debug!("client disconnected");
    Ok(())
}

fn dispatch_command(args: &[Vec<u8>], server: &Server, session: &mut Session) -> Vec<u8> {
    let (cmd, rest) = match args.split_first() {
        Some((cmd, rest)) => (String::from_utf8_lossy(cmd).to_ascii_uppercase(), rest),
        None => return resp_error("ERR empty command"),
    };
    server.commands.fetch_add(1, Ordering::Relaxed);

    if cmd == "AUTH" {
        return handle_auth(rest, server, session);
    }
    if !session.authenticated {
        return resp_error("NOAUTH Authentication required.");
    }

    let db = &server.db;
    let result = match cmd.as_str() {
        "PING" => handle_ping(rest),
        "SET" => handle_set(rest, db),
        "SETEX" => handle_setex(rest, db),
        "GET" => arity(&cmd, rest, 1, false)
            .and_then(|_| Ok(resp_optional(db.get(&rest[0])?.as_deref()))),
        "MGET" => arity(&cmd, rest, 1, true).map(|_| bulk_array(db.mget(rest))),
        "HSET" => handle_hset(&cmd, rest, db),
        "HMSET" => handle_hset(&cmd, rest, db).map(|_| resp_simple("OK")),
        "HSETNX" => arity(&cmd, rest, 3, false).and_then(|_| {
            Ok(resp_bool(db.hset_nx(&rest[0], rest[1].clone(), rest[2].clone())?))
        }),
        "HGET" => arity(&cmd, rest, 2, false)
            .and_then(|_| Ok(resp_optional(db.hget(&rest[0], &rest[1])?.as_deref()))),
        "HMGET" => arity(&cmd, rest, 2, true)
            .and_then(|_| Ok(bulk_array(db.hmget(&rest[0], &rest[1..])?))),
        "HGETALL" => arity(&cmd, rest, 1, false).and_then(|_| {
            let pairs = db.hgetall(&rest[0])?;
            Ok(bulk_array(pairs.into_iter().flat_map(|(f, v)| [Some(f), Some(v)]).collect()))
        }),
        "HKEYS" => arity(&cmd, rest, 1, false).and_then(|_| {
            let pairs = db.hgetall(&rest[0])?;
            Ok(bulk_array(pairs.into_iter().map(|(f, _)| Some(f)).collect()))
        }),
        "HDEL" => arity(&cmd, rest, 2, true)
            .and_then(|_| Ok(resp_integer(db.hdel(&rest[0], &rest[1..])?))),
        "HINCRBY" => arity(&cmd, rest, 3, false).and_then(|_| {
            let increment = parse_int(&rest[2])?;
            Ok(resp_integer(db.hincr_by(&rest[0], &rest[1], increment)?))
        }),
        "HSCAN" => handle_hscan(rest, db),
        "LPUSH" => arity(&cmd, rest, 2, true)
            .and_then(|_| Ok(resp_integer(db.lpush(&rest[0], rest[1..].to_vec())?))),
        "RPOP" => arity(&cmd, rest, 1, false)
            .and_then(|_| Ok(resp_optional(db.rpop(&rest[0])?.as_deref()))),
        "LRANGE" => arity(&cmd, rest, 3, false).and_then(|_| {
            let (start, stop) = (parse_int(&rest[1])?, parse_int(&rest[2])?);
            Ok(bulk_array(db.lrange(&rest[0], start, stop)?.into_iter().map(Some).collect()))
        }),
        "ZADD" => handle_zadd(&cmd, rest, db),
        "ZINCRBY" => arity(&cmd, rest, 3, false).and_then(|_| {
            let increment = parse_float(&rest[1])?;
            Ok(resp_bulk(format_score(db.zincr_by(&rest[0], increment, &rest[2])?).as_bytes()))
        }),
        "ZRANGEBYSCORE" => handle_zrange_by_score(&cmd, rest, db, false),
        "ZREVRANGEBYSCORE" => handle_zrange_by_score(&cmd, rest, db, true),
        "ZREMRANGEBYSCORE" => arity(&cmd, rest, 3, false).and_then(|_| {
            let (min, max) = (parse_bound(&rest[1])?, parse_bound(&rest[2])?);
            Ok(resp_integer(db.zrem_range_by_score(&rest[0], min, max)?))
        }),
        "DEL" => arity(&cmd, rest, 1, true).map(|_| resp_integer(db.del(rest))),
        "EXPIREAT" => arity(&cmd, rest, 2, false).and_then(|_| {
            let timestamp = parse_int(&rest[1])?;
            let deadline = UNIX_EPOCH
                .checked_add(Duration::from_secs(timestamp.max(0) as u64))
                .ok_or_else(|| invalid_expire("expireat"))?;
            Ok(resp_bool(db.expire_at(&rest[0], deadline)))
        }),
        "KEYS" => arity(&cmd, rest, 1, false)
            .map(|_| bulk_array(db.keys(&rest[0]).into_iter().map(Some).collect())),
        "SCAN" => handle_scan(rest, db),
        _ => Err(format!("ERR unknown command '{}'", cmd.to_ascii_lowercase())),
    };

    match result {
        Ok(reply) => reply,
        Err(message) => resp_error(&message),
    }
}

type Reply = Result<Vec<u8>, String>;

impl From<DbError> for String {
    fn from(err: DbError) -> Self {
        err.to_string()
    }
}

// Checks the argument count (command name excluded).
fn arity(cmd: &str, rest: &[Vec<u8>], min: usize, variadic: bool) -> Result<(), String> {
    let ok = if variadic { rest.len() >= min } else { rest.len() == min };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "ERR wrong number of arguments for '{}' command",
            cmd.to_ascii_lowercase()
        ))
    }
}

fn handle_auth(rest: &[Vec<u8>], server: &Server, session: &mut Session) -> Vec<u8> {
    if rest.len() != 1 {
        return resp_error("ERR wrong number of arguments for 'auth' command");
    }
    server.auth_attempts.fetch_add(1, Ordering::Relaxed);

    let expected = match &server.config.password {
        Some(password) => password,
        None => {
            return resp_error(
                "ERR AUTH <password> called without any password configured for the default user. \
                 Are you sure your configuration is correct?",
            )
        }
    };
    if rest[0] == expected.as_bytes() {
        session.authenticated = true;
        resp_simple("OK")
    } else {
        warn!("rejected AUTH attempt");
        resp_error("WRONGPASS invalid username-password pair or user is disabled.")
    }
}

fn handle_ping(rest: &[Vec<u8>]) -> Reply {
    match rest.len() {
        0 => Ok(resp_simple("PONG")),
        1 => Ok(resp_bulk(&rest[0])),
        _ => Err("ERR wrong number of arguments for 'ping' command".to_string()),
    }
}

fn handle_set(rest: &[Vec<u8>], db: &Db) -> Reply {
    match rest.len() {
        2 => {
            db.set(&rest[0], rest[1].clone(), None);
            Ok(resp_simple("OK"))
        }
        4 if rest[2].eq_ignore_ascii_case(b"EX") => {
            let deadline = deadline_after("set", parse_int(&rest[3])?)?;
            db.set(&rest[0], rest[1].clone(), Some(deadline));
            Ok(resp_simple("OK"))
        }
        0 | 1 => Err("ERR wrong number of arguments for 'set' command".to_string()),
        _ => Err("ERR syntax error".to_string()),
    }
}

fn handle_setex(rest: &[Vec<u8>], db: &Db) -> Reply {
    arity("SETEX", rest, 3, false)?;
    let deadline = deadline_after("setex", parse_int(&rest[1])?)?;
    db.set(&rest[0], rest[2].clone(), Some(deadline));
    Ok(resp_simple("OK"))
}

// Relative TTLs must be positive and land on a representable instant.
fn deadline_after(cmd: &str, seconds: i64) -> Result<SystemTime, String> {
    if seconds <= 0 {
        return Err(invalid_expire(cmd));
    }
    SystemTime::now()
        .checked_add(Duration::from_secs(seconds as u64))
        .ok_or_else(|| invalid_expire(cmd))
}

fn invalid_expire(cmd: &str) -> String {
    format!("ERR invalid expire time in '{cmd}' command")
}

fn handle_hset(cmd: &str, rest: &[Vec<u8>], db: &Db) -> Reply {
    if rest.len() < 3 || (rest.len() - 1) % 2 != 0 {
        return Err(format!(
            "ERR wrong number of arguments for '{}' command",
            cmd.to_ascii_lowercase()
        ));
    }
    let pairs = rest[1..]
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    Ok(resp_integer(db.hset(&rest[0], pairs)?))
}

fn handle_zadd(cmd: &str, rest: &[Vec<u8>], db: &Db) -> Reply {
    if rest.len() < 3 || (rest.len() - 1) % 2 != 0 {
        return Err(format!(
            "ERR wrong number of arguments for '{}' command",
            cmd.to_ascii_lowercase()
        ));
    }
    let mut members = Vec::with_capacity((rest.len() - 1) / 2);
    for pair in rest[1..].chunks(2) {
        members.push((parse_float(&pair[0])?, pair[1].clone()));
    }
    Ok(resp_integer(db.zadd(&rest[0], members)?))
}

fn handle_zrange_by_score(cmd: &str, rest: &[Vec<u8>], db: &Db, reverse: bool) -> Reply {
    arity(cmd, rest, 3, true)?;
    // ZREVRANGEBYSCORE takes max before min.
    let (first, second) = (parse_bound(&rest[1])?, parse_bound(&rest[2])?);
    let (min, max) = if reverse { (second, first) } else { (first, second) };

    let mut with_scores = false;
    let mut limit: Option<(i64, i64)> = None;
    let mut idx = 3;
    while idx < rest.len() {
        if rest[idx].eq_ignore_ascii_case(b"WITHSCORES") {
            with_scores = true;
            idx += 1;
        } else if rest[idx].eq_ignore_ascii_case(b"LIMIT") && idx + 2 < rest.len() {
            limit = Some((parse_int(&rest[idx + 1])?, parse_int(&rest[idx + 2])?));
            idx += 3;
        } else {
            return Err("ERR syntax error".to_string());
        }
    }

    let mut members = db.zrange_by_score(&rest[0], min, max, reverse)?;
    if let Some((offset, count)) = limit {
        if offset < 0 {
            members.clear();
        } else {
            let count = if count < 0 { usize::MAX } else { count as usize };
            members = members.into_iter().skip(offset as usize).take(count).collect();
        }
    }

    let mut items = Vec::with_capacity(members.len() * 2);
    for (member, score) in members {
        items.push(Some(member));
        if with_scores {
            items.push(Some(format_score(score).into_bytes()));
        }
    }
    Ok(bulk_array(items))
}

fn handle_scan(rest: &[Vec<u8>], db: &Db) -> Reply {
    arity("SCAN", rest, 1, true)?;
    let cursor = parse_cursor(&rest[0])?;
    let (pattern, count) = scan_options(&rest[1..])?;
    let page = db.scan(cursor, pattern, count);
    Ok(resp_scan(page.cursor, &page.items))
}

fn handle_hscan(rest: &[Vec<u8>], db: &Db) -> Reply {
    arity("HSCAN", rest, 2, true)?;
    let cursor = parse_cursor(&rest[1])?;
    let (pattern, count) = scan_options(&rest[2..])?;
    let page = db.hscan(&rest[0], cursor, pattern, count)?;
    Ok(resp_scan(page.cursor, &page.items))
}

fn scan_options(options: &[Vec<u8>]) -> Result<(Option<&[u8]>, usize), String> {
    let mut pattern = None;
    let mut count = 10;
    for pair in options.chunks(2) {
        match pair {
            [name, value] if name.eq_ignore_ascii_case(b"MATCH") => {
                pattern = Some(value.as_slice())
            }
            [name, value] if name.eq_ignore_ascii_case(b"COUNT") => {
                let parsed = parse_int(value)?;
                if parsed < 1 {
                    return Err("ERR syntax error".to_string());
                }
                count = parsed as usize;
            }
            _ => return Err("ERR syntax error".to_string()),
        }
    }
    Ok((pattern, count))
}

fn bulk_array(items: Vec<Option<Vec<u8>>>) -> Vec<u8> {
    resp_array(items.iter().map(|item| item.as_deref()))
}

fn resp_bool(value: bool) -> Vec<u8> {
    resp_integer(value as i64)
}

fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn parse_int(arg: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| "ERR value is not an integer or out of range".to_string())
}

fn parse_cursor(arg: &[u8]) -> Result<u64, String> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| "ERR invalid cursor".to_string())
}

fn parse_float(arg: &[u8]) -> Result<f64, String> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse::<f64>().ok())
        .filter(|value| !value.is_nan())
        .ok_or_else(|| "ERR value is not a valid float".to_string())
}

fn parse_bound(arg: &[u8]) -> Result<ScoreBound, String> {
    let (exclusive, number) = match arg.split_first() {
        Some((b'(', rest)) => (true, rest),
        _ => (false, arg),
    };
    let value = parse_float(number).map_err(|_| "ERR min or max is not a float".to_string())?;
    Ok(ScoreBound { value, exclusive })
}

//! # In-Memory Keyspace
//!
//! Strings, hashes, lists and sorted sets behind a single lock, with lazy
//! expiration checked on every access.
//!
//! ```text
//! Db
//!   └── entries: Mutex<HashMap<Vec<u8>, Entry>>
//!         └── Entry { value: Value, expires_at: Option<SystemTime> }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::time::SystemTime;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::glob::glob_match;

/// Errors returned to clients as RESP error replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR hash value is not an integer")]
    HashNotInteger,
    #[error("ERR increment or decrement would overflow")]
    Overflow,
    #[error("ERR resulting score is not a number (NaN)")]
    NotANumber,
}

pub type DbResult<T> = Result<T, DbError>;

/// A sorted-set score range endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    fn admits_min(&self, score: f64) -> bool {
        if self.exclusive {
            score > self.value
        } else {
            score >= self.value
        }
    }

    fn admits_max(&self, score: f64) -> bool {
        if self.exclusive {
            score < self.value
        } else {
            score <= self.value
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    ZSet(HashMap<Vec<u8>, f64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<SystemTime>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Entry {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(false, |deadline| deadline <= now)
    }
}

/// One page of a cursor scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub cursor: u64,
    pub items: Vec<Vec<u8>>,
}

type Entries = HashMap<Vec<u8>, Entry>;

/// Thread-safe keyspace shared by every connection.
#[derive(Debug, Default)]
pub struct Db {
    entries: Mutex<Entries>,
}

// Looks up a live entry, dropping it first if it has expired.
fn live<'a>(entries: &'a mut Entries, key: &[u8]) -> Option<&'a mut Entry> {
    let now = SystemTime::now();
    if entries.get(key).map_or(false, |entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

macro_rules! typed {
    ($entries:expr, $key:expr, $variant:ident) => {
        match live($entries, $key) {
            None => None,
            Some(Entry { value: Value::$variant(inner), .. }) => Some(inner),
            Some(_) => return Err(DbError::WrongType),
        }
    };
}

macro_rules! typed_or_insert {
    ($entries:expr, $key:expr, $variant:ident) => {{
        if live($entries, $key).is_none() {
            $entries.insert($key.to_vec(), Entry::new(Value::$variant(Default::default())));
        }
        match $entries.get_mut($key) {
            Some(Entry { value: Value::$variant(inner), .. }) => inner,
            _ => return Err(DbError::WrongType),
        }
    }};
}

impl Db {
    pub fn new() -> Self {
        Db::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock()
    }

    // ── strings ─────────────────────────────────────────────────────

    pub fn set(&self, key: &[u8], value: Vec<u8>, expires_at: Option<SystemTime>) {
        let mut entry = Entry::new(Value::Str(value));
        entry.expires_at = expires_at;
        self.lock().insert(key.to_vec(), entry);
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let mut entries = self.lock();
        Ok(typed!(&mut entries, key, Str).cloned())
    }

    /// Like `GET` for many keys; non-string keys read as nil.
    pub fn mget(&self, keys: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
        let mut entries = self.lock();
        keys.iter()
            .map(|key| match live(&mut entries, key) {
                Some(Entry { value: Value::Str(data), .. }) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    // ── keys ────────────────────────────────────────────────────────

    pub fn del(&self, keys: &[Vec<u8>]) -> i64 {
        let mut entries = self.lock();
        let mut removed = 0;
        for key in keys {
            if live(&mut entries, key).is_some() {
                entries.remove(key.as_slice());
                removed += 1;
            }
        }
        removed
    }

    /// Sets an absolute deadline. A deadline in the past deletes the key.
    pub fn expire_at(&self, key: &[u8], deadline: SystemTime) -> bool {
        let mut entries = self.lock();
        let expired = deadline <= SystemTime::now();
        let exists = match live(&mut entries, key) {
            Some(entry) => {
                if !expired {
                    entry.expires_at = Some(deadline);
                }
                true
            }
            None => false,
        };
        if exists && expired {
            entries.remove(key);
        }
        exists
    }

    pub fn keys(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let mut keys = self.live_keys();
        keys.retain(|key| glob_match(pattern, key));
        keys
    }

    /// Walks the keyspace in key order; the cursor is an offset into it.
    pub fn scan(&self, cursor: u64, pattern: Option<&[u8]>, count: usize) -> ScanResult {
        let keys = self.live_keys();
        page(keys, cursor, count, |key| {
            pattern.map_or(true, |pattern| glob_match(pattern, key))
        })
        .map_items(|key| vec![key])
    }

    fn live_keys(&self) -> Vec<Vec<u8>> {
        let now = SystemTime::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        let mut keys: Vec<Vec<u8>> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ── hashes ──────────────────────────────────────────────────────

    /// Sets fields, returning how many were new.
    pub fn hset(&self, key: &[u8], pairs: Vec<(Vec<u8>, Vec<u8>)>) -> DbResult<i64> {
        let mut entries = self.lock();
        let hash = typed_or_insert!(&mut entries, key, Hash);
        let mut created = 0;
        for (field, value) in pairs {
            if hash.insert(field, value).is_none() {
                created += 1;
            }
        }
        Ok(created)
    }

    pub fn hset_nx(&self, key: &[u8], field: Vec<u8>, value: Vec<u8>) -> DbResult<bool> {
        let mut entries = self.lock();
        let hash = typed_or_insert!(&mut entries, key, Hash);
        if hash.contains_key(&field) {
            return Ok(false);
        }
        hash.insert(field, value);
        Ok(true)
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let mut entries = self.lock();
        Ok(typed!(&mut entries, key, Hash).and_then(|hash| hash.get(field).cloned()))
    }

    pub fn hmget(&self, key: &[u8], fields: &[Vec<u8>]) -> DbResult<Vec<Option<Vec<u8>>>> {
        let mut entries = self.lock();
        let hash = typed!(&mut entries, key, Hash);
        Ok(fields
            .iter()
            .map(|field| hash.as_ref().and_then(|hash| hash.get(field).cloned()))
            .collect())
    }

    pub fn hgetall(&self, key: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = self.lock();
        Ok(typed!(&mut entries, key, Hash)
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    pub fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> DbResult<i64> {
        let mut entries = self.lock();
        let (removed, now_empty) = match typed!(&mut entries, key, Hash) {
            Some(hash) => {
                let removed = fields.iter().filter(|f| hash.remove(f.as_slice()).is_some()).count();
                (removed as i64, hash.is_empty())
            }
            None => return Ok(0),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    pub fn hincr_by(&self, key: &[u8], field: &[u8], increment: i64) -> DbResult<i64> {
        let mut entries = self.lock();
        let hash = typed_or_insert!(&mut entries, key, Hash);
        let current = match hash.get(field) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or(DbError::HashNotInteger)?,
            None => 0,
        };
        let next = current.checked_add(increment).ok_or(DbError::Overflow)?;
        hash.insert(field.to_vec(), next.to_string().into_bytes());
        Ok(next)
    }

    pub fn hscan(
        &self,
        key: &[u8],
        cursor: u64,
        pattern: Option<&[u8]>,
        count: usize,
    ) -> DbResult<ScanResult> {
        let pairs = self.hgetall(key)?;
        Ok(page(pairs, cursor, count, |(field, _)| {
            pattern.map_or(true, |pattern| glob_match(pattern, field))
        })
        .map_items(|(field, value)| vec![field, value]))
    }

    // ── lists ───────────────────────────────────────────────────────

    pub fn lpush(&self, key: &[u8], values: Vec<Vec<u8>>) -> DbResult<i64> {
        let mut entries = self.lock();
        let list = typed_or_insert!(&mut entries, key, List);
        for value in values {
            list.push_front(value);
        }
        Ok(list.len() as i64)
    }

    pub fn rpop(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let mut entries = self.lock();
        let (value, now_empty) = match typed!(&mut entries, key, List) {
            Some(list) => (list.pop_back(), list.is_empty()),
            None => return Ok(None),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(value)
    }

    /// Inclusive range with negative indexes counting from the tail.
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> DbResult<Vec<Vec<u8>>> {
        let mut entries = self.lock();
        let list = match typed!(&mut entries, key, List) {
            Some(list) => list,
            None => return Ok(Vec::new()),
        };
        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    // ── sorted sets ─────────────────────────────────────────────────

    /// Adds or updates members, returning how many were new.
    pub fn zadd(&self, key: &[u8], members: Vec<(f64, Vec<u8>)>) -> DbResult<i64> {
        let mut entries = self.lock();
        let zset = typed_or_insert!(&mut entries, key, ZSet);
        let mut added = 0;
        for (score, member) in members {
            if zset.insert(member, score).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn zincr_by(&self, key: &[u8], increment: f64, member: &[u8]) -> DbResult<f64> {
        let mut entries = self.lock();
        let zset = typed_or_insert!(&mut entries, key, ZSet);
        let score = zset.get(member).copied().unwrap_or(0.0) + increment;
        if score.is_nan() {
            return Err(DbError::NotANumber);
        }
        zset.insert(member.to_vec(), score);
        Ok(score)
    }

    /// Members within `[min, max]`, ordered by score then member.
    pub fn zrange_by_score(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
        reverse: bool,
    ) -> DbResult<Vec<(Vec<u8>, f64)>> {
        let mut entries = self.lock();
        let zset = match typed!(&mut entries, key, ZSet) {
            Some(zset) => zset,
            None => return Ok(Vec::new()),
        };
        let mut members: Vec<(Vec<u8>, f64)> = zset
            .iter()
            .filter(|&(_, &score)| min.admits_min(score) && max.admits_max(score))
            .map(|(member, &score)| (member.clone(), score))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if reverse {
            members.reverse();
        }
        Ok(members)
    }

    pub fn zrem_range_by_score(
        &self,
        key: &[u8],
        min: ScoreBound,
        max: ScoreBound,
    ) -> DbResult<i64> {
        let mut entries = self.lock();
        let (removed, now_empty) = match typed!(&mut entries, key, ZSet) {
            Some(zset) => {
                let before = zset.len();
                zset.retain(|_, score| !(min.admits_min(*score) && max.admits_max(*score)));
                ((before - zset.len()) as i64, zset.is_empty())
            }
            None => return Ok(0),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }
}

struct Page<T> {
    cursor: u64,
    items: Vec<T>,
}

impl<T> Page<T> {
    fn map_items(self, f: impl Fn(T) -> Vec<Vec<u8>>) -> ScanResult {
        ScanResult {
            cursor: self.cursor,
            items: self.items.into_iter().flat_map(f).collect(),
        }
    }
}

// Visits `count` positions from `cursor`, keeping those that pass `keep`.
fn page<T>(items: Vec<T>, cursor: u64, count: usize, keep: impl Fn(&T) -> bool) -> Page<T> {
    let start = cursor as usize;
    let count = count.max(1);
    let end = start.saturating_add(count).min(items.len());
    let next = if end >= items.len() { 0 } else { end as u64 };
    let items = items
        .into_iter()
        .skip(start)
        .take(end.saturating_sub(start))
        .filter(|item| keep(item))
        .collect();
    Page { cursor: next, items }
}

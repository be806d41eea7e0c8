use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::{Client, CustomRedisError};

const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An in-memory stand-in for Redis.
///
/// Unlike a canned-response mock, this one keeps state: keys expire (using
/// `tokio::time`, so paused-time tests can advance past TTLs), lists behave
/// like Redis lists, and the conditional scripts are applied atomically under
/// one mutex. Every call is recorded for assertions, and individual
/// operations can be made to fail.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
    failures: Arc<Mutex<HashMap<String, CustomRedisError>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

#[derive(Default)]
struct MockState {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    streams: HashMap<String, Vec<(String, Vec<(String, String)>)>>,
    stream_seq: u64,
}

impl MockState {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(v, _)| v)
    }
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
    VecString(Vec<String>),
    MinMax(String, String),
    Score(String, f64),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of `op` fail with `err`.
    pub fn fail_op(&self, op: &str, err: CustomRedisError) -> Self {
        lock(&self.failures).insert(op.to_owned(), err);
        self.clone()
    }

    /// Undo a previous `fail_op`.
    pub fn clear_failure(&self, op: &str) {
        lock(&self.failures).remove(op);
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        lock(&self.calls).clone()
    }

    /// Current contents of a list, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        lock(&self.state)
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries appended to a stream, oldest first.
    pub fn stream(&self, key: &str) -> Vec<Vec<(String, String)>> {
        lock(&self.state)
            .streams
            .get(key)
            .map(|entries| entries.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default()
    }

    fn record(&self, op: &str, key: &str, value: MockRedisValue) -> Result<(), CustomRedisError> {
        lock(&self.calls).push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });

        match lock(&self.failures).get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn try_move(&self, source: &str, destination: &str) -> Option<String> {
        let mut state = lock(&self.state);
        let item = state.lists.get_mut(source)?.pop_back()?;
        state
            .lists
            .entry(destination.to_owned())
            .or_default()
            .push_front(item.clone());
        Some(item)
    }
}

fn parse_bound(bound: &str) -> Result<(f64, bool), CustomRedisError> {
    let (raw, exclusive) = match bound.strip_prefix('(') {
        Some(rest) => (rest, true),
        None => (bound, false),
    };
    let value = match raw {
        "-inf" => f64::NEG_INFINITY,
        "+inf" | "inf" => f64::INFINITY,
        other => other
            .parse::<f64>()
            .map_err(|e| CustomRedisError::ParseError(e.to_string()))?,
    };
    Ok((value, exclusive))
}

fn clamp_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", &key, MockRedisValue::None)?;

        lock(&self.state)
            .live_string(&key)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn setex(
        &self,
        key: String,
        value: String,
        seconds: u64,
    ) -> Result<(), CustomRedisError> {
        self.record(
            "setex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        )?;

        let deadline = Instant::now() + Duration::from_secs(seconds);
        lock(&self.state)
            .strings
            .insert(key, (value, Some(deadline)));
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: String,
        value: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "set_nx_ex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        )?;

        let mut state = lock(&self.state);
        if state.live_string(&key).is_some() {
            return Ok(false);
        }
        let deadline = Instant::now() + Duration::from_secs(seconds);
        state.strings.insert(key, (value, Some(deadline)));
        Ok(true)
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        self.record("del", &key, MockRedisValue::None)?;

        let mut state = lock(&self.state);
        state.strings.remove(&key);
        state.lists.remove(&key);
        state.zsets.remove(&key);
        Ok(())
    }

    async fn del_if_eq(&self, key: String, value: String) -> Result<bool, CustomRedisError> {
        self.record("del_if_eq", &key, MockRedisValue::String(value.clone()))?;

        let mut state = lock(&self.state);
        if state.live_string(&key) == Some(&value) {
            state.strings.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn exists(&self, key: String) -> Result<bool, CustomRedisError> {
        self.record("exists", &key, MockRedisValue::None)?;

        let mut state = lock(&self.state);
        Ok(state.live_string(&key).is_some()
            || state.lists.get(&key).is_some_and(|l| !l.is_empty())
            || state.zsets.get(&key).is_some_and(|z| !z.is_empty()))
    }

    async fn lpush(&self, key: String, value: String) -> Result<(), CustomRedisError> {
        self.record("lpush", &key, MockRedisValue::String(value.clone()))?;

        lock(&self.state)
            .lists
            .entry(key)
            .or_default()
            .push_front(value);
        Ok(())
    }

    async fn blmove(
        &self,
        source: String,
        destination: String,
        timeout: Duration,
    ) -> Result<Option<String>, CustomRedisError> {
        self.record(
            "blmove",
            &source,
            MockRedisValue::String(destination.clone()),
        )?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_move(&source, &destination) {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BLOCKING_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn lrange(
        &self,
        key: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CustomRedisError> {
        self.record(
            "lrange",
            &key,
            MockRedisValue::MinMax(start.to_string(), stop.to_string()),
        )?;

        let state = lock(&self.state);
        let Some(list) = state.lists.get(&key) else {
            return Ok(vec![]);
        };
        Ok(match clamp_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => vec![],
        })
    }

    async fn llen(&self, key: String) -> Result<u64, CustomRedisError> {
        self.record("llen", &key, MockRedisValue::None)?;

        Ok(lock(&self.state)
            .lists
            .get(&key)
            .map(|l| l.len() as u64)
            .unwrap_or(0))
    }

    async fn lrem(&self, key: String, value: String) -> Result<bool, CustomRedisError> {
        self.record("lrem", &key, MockRedisValue::String(value.clone()))?;

        let mut state = lock(&self.state);
        let Some(list) = state.lists.get_mut(&key) else {
            return Ok(false);
        };
        match list.iter().position(|item| *item == value) {
            Some(idx) => {
                list.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn lrem_lpush(
        &self,
        source: String,
        value: String,
        destination: String,
        replacement: String,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "lrem_lpush",
            &source,
            MockRedisValue::VecString(vec![value.clone(), destination.clone()]),
        )?;

        let mut state = lock(&self.state);
        let removed = match state.lists.get_mut(&source) {
            Some(list) => match list.iter().position(|item| *item == value) {
                Some(idx) => list.remove(idx).is_some(),
                None => false,
            },
            None => false,
        };
        if removed {
            state
                .lists
                .entry(destination)
                .or_default()
                .push_front(replacement);
        }
        Ok(removed)
    }

    async fn zadd(&self, key: String, member: String, score: f64) -> Result<(), CustomRedisError> {
        self.record("zadd", &key, MockRedisValue::Score(member.clone(), score))?;

        lock(&self.state)
            .zsets
            .entry(key)
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrem(&self, key: String, member: String) -> Result<(), CustomRedisError> {
        self.record("zrem", &key, MockRedisValue::String(member.clone()))?;

        if let Some(zset) = lock(&self.state).zsets.get_mut(&key) {
            zset.remove(&member);
        }
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, CustomRedisError> {
        self.record(
            "zrangebyscore",
            &key,
            MockRedisValue::MinMax(min.clone(), max.clone()),
        )?;

        let (min, min_exclusive) = parse_bound(&min)?;
        let (max, max_exclusive) = parse_bound(&max)?;

        let state = lock(&self.state);
        let Some(zset) = state.zsets.get(&key) else {
            return Ok(vec![]);
        };
        let mut members: Vec<(&String, f64)> = zset
            .iter()
            .map(|(m, s)| (m, *s))
            .filter(|(_, s)| if min_exclusive { *s > min } else { *s >= min })
            .filter(|(_, s)| if max_exclusive { *s < max } else { *s <= max })
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn xadd(
        &self,
        stream: String,
        max_len: usize,
        fields: Vec<(String, String)>,
    ) -> Result<String, CustomRedisError> {
        self.record(
            "xadd",
            &stream,
            MockRedisValue::VecString(fields.iter().map(|(f, _)| f.clone()).collect()),
        )?;

        let mut state = lock(&self.state);
        state.stream_seq += 1;
        let id = format!("0-{}", state.stream_seq);
        let entries = state.streams.entry(stream).or_default();
        entries.push((id.clone(), fields));
        if entries.len() > max_len {
            let excess = entries.len() - max_len;
            entries.drain(..excess);
        }
        Ok(id)
    }
}

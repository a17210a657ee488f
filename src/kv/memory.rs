//! In-process implementation of the key-value collaborator.

use super::{KeyValueStore, KvResult, Lease};
use crate::error::KvError;
use crate::types::now_ms;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Minimum spacing between sweeps of expired values.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Value {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Value {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct LeaseEntry {
    holder: String,
    fencing_token: u64,
    deadline_ms: u64,
}

#[derive(Debug, Default)]
struct State {
    values: BTreeMap<String, Value>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    leases: HashMap<String, LeaseEntry>,
    /// Last fencing token handed out per lease name. Survives release.
    fencing: HashMap<String, u64>,
    next_sweep: Option<Instant>,
}

impl State {
    /// Drop expired values nobody has read since they expired, at most once
    /// per [`SWEEP_INTERVAL`].
    fn sweep_expired(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        let before = self.values.len();
        self.values.retain(|_, v| v.is_live(now));
        let swept = before - self.values.len();
        if swept > 0 {
            tracing::trace!(swept, "Swept expired values");
        }
        self.next_sweep = Some(now + SWEEP_INTERVAL);
    }
}

/// Key-value store held in memory behind a single mutex.
///
/// Every operation is atomic with respect to every other. Availability can be
/// toggled to exercise `MapUnavailable` paths.
#[derive(Debug)]
pub struct MemoryKv {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> KvResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("memory kv disabled".into()))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let found = state
            .values
            .get(key)
            .map(|v| (v.is_live(now), v.data.clone()));
        match found {
            Some((true, data)) => Ok(Some(data)),
            Some((false, _)) => {
                state.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep_expired(now);
        state.values.insert(
            key.to_string(),
            Value {
                data: value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> KvResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let current = state
            .values
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.data.as_slice());
        if current != expected {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Value {
                data: value,
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .values
            .remove(key)
            .is_some_and(|v| v.is_live(now)))
    }

    async fn incr(&self, key: &str, by: u64) -> KvResult<u64> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let current = match state.values.get(key).filter(|v| v.is_live(now)) {
            Some(v) => {
                let bytes: [u8; 8] = v.data.as_slice().try_into().map_err(|_| KvError::Corrupted {
                    key: key.to_string(),
                    reason: "counter is not 8 bytes".into(),
                })?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        let next = current.saturating_add(by);
        state.values.insert(
            key.to_string(),
            Value {
                data: next.to_be_bytes().to_vec(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep_expired(now);
        Ok(state
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.is_live(now))
            .map(|(k, v)| (k.clone(), v.data.clone()))
            .collect())
    }

    async fn list_push_back(&self, key: &str, value: Vec<u8>) -> KvResult<usize> {
        self.check()?;
        let mut state = self.state.lock();
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        Ok(list.len())
    }

    async fn list_set(&self, key: &str, index: usize, value: Vec<u8>) -> KvResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.lists.get_mut(key).and_then(|list| list.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_range(&self, key: &str, start: usize, count: usize) -> KvResult<Vec<Vec<u8>>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().skip(start).take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_pop_front(&self, key: &str, count: usize) -> KvResult<Vec<Vec<u8>>> {
        self.check()?;
        let mut state = self.state.lock();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let n = count.min(list.len());
        let popped: Vec<Vec<u8>> = list.drain(..n).collect();
        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(popped)
    }

    async fn list_len(&self, key: &str) -> KvResult<usize> {
        self.check()?;
        Ok(self.state.lock().lists.get(key).map_or(0, |l| l.len()))
    }

    async fn list_keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        self.check()?;
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .lists
            .iter()
            .filter(|(k, l)| k.starts_with(prefix) && !l.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> KvResult<Option<Lease>> {
        self.check()?;
        let now = now_ms();
        let mut state = self.state.lock();
        if let Some(entry) = state.leases.get(name) {
            if entry.deadline_ms > now {
                return Ok(None);
            }
        }
        let token = state.fencing.entry(name.to_string()).or_insert(0);
        *token = token.saturating_add(1);
        let fencing_token = *token;
        let deadline_ms = now.saturating_add(ttl.as_millis() as u64);
        state.leases.insert(
            name.to_string(),
            LeaseEntry {
                holder: holder.to_string(),
                fencing_token,
                deadline_ms,
            },
        );
        Ok(Some(Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            fencing_token,
            deadline_ms,
        }))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> KvResult<Option<Lease>> {
        self.check()?;
        let now = now_ms();
        let mut state = self.state.lock();
        match state.leases.get_mut(&lease.name) {
            Some(entry)
                if entry.fencing_token == lease.fencing_token && entry.deadline_ms > now =>
            {
                entry.deadline_ms = now.saturating_add(ttl.as_millis() as u64);
                Ok(Some(Lease {
                    deadline_ms: entry.deadline_ms,
                    ..lease.clone()
                }))
            }
            _ => Ok(None),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> KvResult<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.leases.get(&lease.name) {
            Some(entry) if entry.fencing_token == lease.fencing_token => {
                let held = entry.holder == lease.holder && entry.deadline_ms > now_ms();
                state.leases.remove(&lease.name);
                Ok(held)
            }
            _ => Ok(false),
        }
    }
}

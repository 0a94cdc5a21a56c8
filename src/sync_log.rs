//! Ordered, deduplicated change log backing the state sync stream.
//!
//! Each key holds at most one entry: a new value for a key drops the old
//! entry and appends at the next sequence number, so a subscriber that last
//! saw sequence `n` catches up by reading every entry at or after `n`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct SyncState {
    seq_next: u64,
    key_seq: HashMap<String, u64>,
    entries: BTreeMap<u64, (String, String)>,
    /// Bumped on every append; waiters compare against the value they saw.
    generation: u64,
}

/// Catch-up answer for a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRefresh {
    /// Pass back as `since` on the next refresh.
    pub seq: u64,
    pub update: BTreeMap<String, String>,
    /// Pass to [`SyncLog::wait_for_change`] to wait for the next append.
    pub generation: u64,
}

impl SyncRefresh {
    /// Render the update as one JSON object; values are already JSON text.
    pub fn to_json(&self) -> String {
        let mut out = String::from("{");
        for (i, (key, value)) in self.update.iter().enumerate() {
            if i > 0 {
                out.push_str(",\n");
            }
            // Serializing a plain string cannot fail.
            out.push_str(&serde_json::to_string(key).unwrap_or_default());
            out.push_str(": ");
            out.push_str(value);
        }
        out.push('}');
        out
    }
}

pub struct SyncLog {
    state: Mutex<SyncState>,
    changed: Condvar,
}

impl SyncLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SyncState {
                seq_next: 1,
                key_seq: HashMap::new(),
                entries: BTreeMap::new(),
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Record `data` under `key`; identical data for the key is ignored.
    pub fn notify(&self, key: &str, data: String) -> bool {
        let mut guard = self.state.lock().expect("sync log mutex poisoned");
        if let Some(prev_seq) = guard.key_seq.get(key).copied() {
            if guard
                .entries
                .get(&prev_seq)
                .is_some_and(|(_, prev)| *prev == data)
            {
                return false;
            }
            guard.entries.remove(&prev_seq);
        }
        let seq = guard.seq_next;
        guard.seq_next += 1;
        guard.key_seq.insert(key.to_string(), seq);
        guard.entries.insert(seq, (key.to_string(), data));
        guard.generation += 1;
        self.changed.notify_all();
        true
    }

    /// Everything appended at or after `since`.
    pub fn refresh(&self, since: u64) -> SyncRefresh {
        let guard = self.state.lock().expect("sync log mutex poisoned");
        let update = guard
            .entries
            .range(since..)
            .map(|(_, (key, data))| (key.clone(), data.clone()))
            .collect();
        SyncRefresh {
            seq: guard.seq_next,
            update,
            generation: guard.generation,
        }
    }

    /// Block until the log moves past `generation` or the timeout elapses.
    /// Returns true when a change happened.
    pub fn wait_for_change(&self, generation: u64, timeout: Duration) -> bool {
        let guard = self.state.lock().expect("sync log mutex poisoned");
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| state.generation == generation)
            .expect("condvar wait failed");
        guard.generation != generation
    }

    pub fn len(&self) -> usize {
        let guard = self.state.lock().expect("sync log mutex poisoned");
        guard.entries.len()
    }
}

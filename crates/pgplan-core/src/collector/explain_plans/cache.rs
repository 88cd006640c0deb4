//! Candidate bookkeeping for the explain engine.
//!
//! Every candidate identity lives in exactly one bucket:
//! - `Active`: queued for processing in this or a later tick
//! - `Finished`: last attempt was recoverable; kept to compare `calls`
//! - `Denylisted`: last attempt failed permanently; never queued again

use std::collections::{HashMap, VecDeque};

/// Candidate identity. Query ids are only unique within a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    pub datname: String,
    pub queryid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCandidate {
    pub datname: String,
    pub queryid: String,
    pub query_text: String,
    pub calls: i64,
    /// Epoch seconds of the statistics reset the `calls` counter is relative to.
    pub stats_reset: i64,
    pub failure_count: u32,
}

impl QueryCandidate {
    pub fn key(&self) -> QueryKey {
        QueryKey {
            datname: self.datname.clone(),
            queryid: self.queryid.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Active,
    Finished,
    Denylisted,
}

/// Where a processed candidate goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Finished,
    Denylisted,
}

/// What the catalog refresh should do with an observed candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    Enqueue,
    /// Already denylisted: report a skip, do not queue.
    ReportDenylisted,
    /// Nothing new since the last attempt.
    Ignore,
}

#[derive(Debug)]
struct Entry {
    candidate: QueryCandidate,
    state: CacheState,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: HashMap<QueryKey, Entry>,
    /// Keys in `Active` state, in enqueue order.
    queue: VecDeque<QueryKey>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &QueryKey) -> Option<CacheState> {
        self.entries.get(key).map(|e| e.state)
    }

    pub fn active_len(&self) -> usize {
        self.queue.len()
    }

    pub fn finished_len(&self) -> usize {
        self.count(CacheState::Finished)
    }

    pub fn denylisted_len(&self) -> usize {
        self.count(CacheState::Denylisted)
    }

    fn count(&self, state: CacheState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    /// Decides how a freshly observed candidate is handled.
    ///
    /// A finished candidate is re-queued only when `calls` moved: it grew, or it
    /// shrank because statistics were reset after the recorded reset time.
    pub fn refresh_action(&self, observed: &QueryCandidate) -> RefreshAction {
        let Some(entry) = self.entries.get(&observed.key()) else {
            return RefreshAction::Enqueue;
        };
        match entry.state {
            CacheState::Denylisted => RefreshAction::ReportDenylisted,
            CacheState::Active => RefreshAction::Enqueue,
            CacheState::Finished => {
                let previous = &entry.candidate;
                if observed.calls == previous.calls {
                    RefreshAction::Ignore
                } else if observed.calls < previous.calls
                    && observed.stats_reset <= previous.stats_reset
                {
                    RefreshAction::Ignore
                } else {
                    RefreshAction::Enqueue
                }
            }
        }
    }

    /// Moves a candidate into the active set.
    ///
    /// Replaces the stored attributes if the identity is already active, and
    /// takes it out of the finished set otherwise. Denylisted identities are
    /// left untouched and `false` is returned.
    pub fn enqueue(&mut self, candidate: QueryCandidate) -> bool {
        let key = candidate.key();
        match self.entries.get_mut(&key) {
            Some(entry) if entry.state == CacheState::Denylisted => false,
            Some(entry) if entry.state == CacheState::Active => {
                entry.candidate = candidate;
                true
            }
            Some(entry) => {
                entry.candidate = candidate;
                entry.state = CacheState::Active;
                self.queue.push_back(key);
                true
            }
            None => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        candidate,
                        state: CacheState::Active,
                    },
                );
                self.queue.push_back(key);
                true
            }
        }
    }

    /// Takes the next active candidate out of the cache.
    ///
    /// The identity is absent from every bucket until [`settle`](Self::settle)
    /// puts it back.
    pub fn pop_active(&mut self) -> Option<QueryCandidate> {
        let key = self.queue.pop_front()?;
        self.entries.remove(&key).map(|e| e.candidate)
    }

    /// Records a processed candidate in the finished set or the denylist.
    pub fn settle(&mut self, mut candidate: QueryCandidate, disposition: Disposition) {
        let state = match disposition {
            Disposition::Finished => CacheState::Finished,
            Disposition::Denylisted => {
                candidate.failure_count += 1;
                CacheState::Denylisted
            }
        };
        let key = candidate.key();
        if self.entries.get(&key).map(|e| e.state) == Some(CacheState::Active) {
            self.queue.retain(|k| k != &key);
        }
        self.entries.insert(key, Entry { candidate, state });
    }
}

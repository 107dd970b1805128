//! Waiting local callers and their completed-call history.

use std::collections::VecDeque;

use serde::Serialize;

use seclevel_core::{DeviceIdentity, ErrorCode};

/// Outcome delivered to a local caller: the peer's level or a failure code.
pub type LevelResult = Result<u32, ErrorCode>;

/// Callback invoked exactly once with the caller's outcome.
pub type LevelCallback = Box<dyn FnOnce(&DeviceIdentity, LevelResult) + Send + 'static>;

/// Identity of a local caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CallerId {
    pub owner: u32,
    pub cookie: u32,
}

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.cookie)
    }
}

/// A caller waiting for a device's level.
pub struct NotifyEntry {
    pub caller: CallerId,
    pub start_ms: u64,
    /// Personal timeout budget.
    pub keep_ms: u64,
    callback: LevelCallback,
}

impl NotifyEntry {
    /// Create an entry.
    pub fn new(caller: CallerId, start_ms: u64, keep_ms: u64, callback: LevelCallback) -> Self {
        Self {
            caller,
            start_ms,
            keep_ms,
            callback,
        }
    }

    /// When the caller stops waiting.
    pub fn deadline_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.keep_ms)
    }

    fn record(&self, finish_ms: u64, result: LevelResult) -> CallRecord {
        CallRecord {
            caller: self.caller,
            start_ms: self.start_ms,
            keep_ms: self.keep_ms,
            finish_ms,
            result,
        }
    }
}

impl std::fmt::Debug for NotifyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyEntry")
            .field("caller", &self.caller)
            .field("start_ms", &self.start_ms)
            .field("keep_ms", &self.keep_ms)
            .finish_non_exhaustive()
    }
}

/// A completed local call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub caller: CallerId,
    pub start_ms: u64,
    pub keep_ms: u64,
    pub finish_ms: u64,
    pub result: LevelResult,
}

/// A resolved caller whose callback still has to run.
///
/// Produced under the device lock, fired after it is released so callbacks
/// may call back into the service.
#[must_use = "resolved callers must be fired"]
pub struct Resolved {
    callback: LevelCallback,
    result: LevelResult,
}

impl Resolved {
    /// Invoke the callback.
    pub fn fire(self, identity: &DeviceIdentity) {
        (self.callback)(identity, self.result);
    }
}

/// Fire every resolved caller.
pub fn fire_all(resolved: Vec<Resolved>, identity: &DeviceIdentity) {
    for r in resolved {
        r.fire(identity);
    }
}

/// Pending callers plus bounded history.
#[derive(Debug)]
pub struct CallerQueues {
    pending: Vec<NotifyEntry>,
    history: VecDeque<CallRecord>,
    history_capacity: usize,
}

impl CallerQueues {
    /// Empty queues keeping at most `history_capacity` completed calls.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            pending: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
        }
    }

    /// Add a waiting caller.
    pub fn push(&mut self, entry: NotifyEntry) {
        self.pending.push(entry);
    }

    /// Waiting callers.
    pub fn pending(&self) -> &[NotifyEntry] {
        &self.pending
    }

    /// Completed calls, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &CallRecord> {
        self.history.iter()
    }

    /// Number of completed calls kept.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn archive(&mut self, record: CallRecord) {
        if self.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    fn resolve(&mut self, entry: NotifyEntry, now_ms: u64, result: LevelResult) -> Resolved {
        self.archive(entry.record(now_ms, result));
        Resolved {
            callback: entry.callback,
            result,
        }
    }

    /// Resolve every waiting caller with `result`.
    pub fn flush_all(&mut self, now_ms: u64, result: LevelResult) -> Vec<Resolved> {
        let entries = std::mem::take(&mut self.pending);
        entries
            .into_iter()
            .map(|entry| self.resolve(entry, now_ms, result))
            .collect()
    }

    /// Resolve the first waiting entry of `caller` with `Timeout`.
    pub fn expire(&mut self, caller: CallerId, now_ms: u64) -> Option<Resolved> {
        let index = self.pending.iter().position(|e| e.caller == caller)?;
        let entry = self.pending.remove(index);
        Some(self.resolve(entry, now_ms, Err(ErrorCode::Timeout)))
    }

    /// Resolve only callers whose deadline has passed, with `Timeout`.
    pub fn flush_expired(&mut self, now_ms: u64) -> Vec<Resolved> {
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|entry| entry.deadline_ms() <= now_ms);
        self.pending = waiting;
        expired
            .into_iter()
            .map(|entry| self.resolve(entry, now_ms, Err(ErrorCode::Timeout)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(u32, LevelResult)>>>;

    fn entry(cookie: u32, start_ms: u64, keep_ms: u64, seen: &Seen) -> NotifyEntry {
        let seen = Arc::clone(seen);
        NotifyEntry::new(
            CallerId { owner: 1, cookie },
            start_ms,
            keep_ms,
            Box::new(move |_, result| seen.lock().unwrap().push((cookie, result))),
        )
    }

    fn id() -> DeviceIdentity {
        DeviceIdentity::new(b"peer").unwrap()
    }

    #[test]
    fn flush_all_resolves_everyone() {
        let seen = Seen::default();
        let mut queues = CallerQueues::new(30);
        queues.push(entry(1, 0, 100, &seen));
        queues.push(entry(2, 0, 100, &seen));

        fire_all(queues.flush_all(50, Ok(3)), &id());

        assert!(queues.pending().is_empty());
        assert_eq!(queues.history_len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, Ok(3)), (2, Ok(3))]);
    }

    #[test]
    fn flush_expired_keeps_live_callers() {
        let seen = Seen::default();
        let mut queues = CallerQueues::new(30);
        queues.push(entry(1, 0, 100, &seen));
        queues.push(entry(2, 0, 500, &seen));

        fire_all(queues.flush_expired(200), &id());

        assert_eq!(queues.pending().len(), 1);
        assert_eq!(queues.pending()[0].caller.cookie, 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, Err(ErrorCode::Timeout))]);
    }

    #[test]
    fn expire_named_caller_ignores_clock() {
        let seen = Seen::default();
        let mut queues = CallerQueues::new(30);
        queues.push(entry(1, 0, 100, &seen));
        queues.push(entry(2, 0, 100, &seen));

        let resolved = queues.expire(CallerId { owner: 1, cookie: 2 }, 50).unwrap();
        resolved.fire(&id());

        assert_eq!(queues.pending().len(), 1);
        assert!(queues.expire(CallerId { owner: 1, cookie: 2 }, 50).is_none());
        assert_eq!(*seen.lock().unwrap(), vec![(2, Err(ErrorCode::Timeout))]);
    }

    #[test]
    fn history_drops_oldest() {
        let seen = Seen::default();
        let mut queues = CallerQueues::new(3);
        for cookie in 0..5 {
            queues.push(entry(cookie, 0, 100, &seen));
        }
        fire_all(queues.flush_all(10, Err(ErrorCode::DeviceOffline)), &id());

        let kept: Vec<u32> = queues.history().map(|r| r.caller.cookie).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(seen.lock().unwrap().len(), 5);
    }
}

//! Debounced revision log for local deltas.
//!
//! Every `append` restarts a single timer. The timer fires either one
//! debounce period after the last append or `max_wait` after the last
//! commit, whichever comes first, and commits the whole batch as one
//! revision. An append arriving when `max_wait` has already passed since
//! the last commit is committed on the spot.
//!
//! A generation counter is bumped whenever the timer is replaced or the
//! batch is committed or cleared; a timer only commits if its generation
//! is still current.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use verso_core::{Replica, YrsReplica};

use crate::HistoryError;

/// Batching parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Quiet period after the last append before committing
    #[serde(with = "millis")]
    pub debounce: Duration,
    /// Longest stretch between two commits while edits keep arriving
    #[serde(with = "millis")]
    pub max_wait: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            max_wait: Duration::from_millis(5000),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// One committed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub revision: u64,
    pub timestamp: SystemTime,
    /// All deltas of the batch, merged
    pub delta: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Committed { revision: u64 },
    Cleared,
}

type Listener = Arc<dyn Fn(&LogEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: LogEvent) {
        let snapshot: Vec<Listener> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            listener(&event);
        }
    }
}

/// Handle returned by [`UpdateLog::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

struct State {
    entries: Vec<UpdateRecord>,
    pending: Vec<Vec<u8>>,
    revision: u64,
    /// Log creation, last `clear` or last non-empty commit
    last_commit: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            pending: Vec::new(),
            revision: 0,
            last_commit: Instant::now(),
            generation: 0,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Shared<D> {
    config: LogConfig,
    state: Mutex<State>,
    listeners: Arc<Listeners>,
    _replica: PhantomData<fn() -> D>,
}

impl<D: Replica> Shared<D> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commit the pending batch. `generation` restricts the commit to the
    /// timer that was armed with it.
    fn commit(&self, generation: Option<u64>) -> Result<Option<u64>, HistoryError> {
        let committed = {
            let mut state = self.lock();
            if generation.is_some_and(|g| g != state.generation) {
                return Ok(None);
            }
            state.generation += 1;
            // Detach rather than abort: this may be the timer task itself.
            state.timer = None;

            if state.pending.is_empty() {
                return Ok(None);
            }
            state.last_commit = Instant::now();
            let pending = std::mem::take(&mut state.pending);
            let delta = match D::merge_updates(&pending) {
                Ok(delta) => delta,
                Err(source) => {
                    log::error!("Dropping {} pending deltas that failed to merge: {source}", pending.len());
                    return Err(HistoryError::Merge {
                        dropped: pending.len(),
                        source,
                    });
                }
            };

            state.revision += 1;
            let revision = state.revision;
            state.entries.push(UpdateRecord {
                revision,
                timestamp: SystemTime::now(),
                delta,
            });
            log::debug!("Committed revision {revision} from {} deltas", pending.len());
            revision
        };

        self.listeners.notify(LogEvent::Committed { revision: committed });
        Ok(Some(committed))
    }
}

/// Client-side log of committed revisions. Clones share the same log.
pub struct UpdateLog<D: Replica = YrsReplica> {
    shared: Arc<Shared<D>>,
}

impl<D: Replica> Clone for UpdateLog<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Replica> Default for UpdateLog<D> {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

impl<D: Replica> UpdateLog<D> {
    pub fn new(config: LogConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::new()),
                listeners: Arc::new(Listeners::default()),
                _replica: PhantomData,
            }),
        }
    }

    pub fn config(&self) -> LogConfig {
        self.shared.config
    }

    /// Buffer a delta and (re)arm the commit timer.
    ///
    /// A delta that does not decode is rejected and leaves the pending
    /// batch untouched. Outside a tokio runtime there is nothing to run the
    /// timer on, so the delta is committed right away.
    pub fn append(&self, delta: Vec<u8>) -> Result<(), HistoryError> {
        D::merge_updates(&[&delta])?;
        let now = Instant::now();
        let config = self.shared.config;

        let mut state = self.shared.lock();
        state.pending.push(delta);
        let deadline = (now + config.debounce).min(state.last_commit + config.max_wait);

        state.cancel_timer();
        let handle = match Handle::try_current() {
            Ok(handle) if deadline > now => handle,
            _ => {
                drop(state);
                return self.shared.commit(None).map(|_| ());
            }
        };

        let generation = state.generation;
        let weak = Arc::downgrade(&self.shared);
        state.timer = Some(handle.spawn(async move {
            sleep_until(deadline).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Err(e) = shared.commit(Some(generation)) {
                log::warn!("Timed commit failed: {e}");
            }
        }));
        Ok(())
    }

    /// Commit pending deltas now. Returns the new revision, if any.
    pub fn flush(&self) -> Result<Option<u64>, HistoryError> {
        {
            let mut state = self.shared.lock();
            state.cancel_timer();
        }
        self.shared.commit(None)
    }

    /// Drop every revision and pending delta; numbering restarts at 1.
    /// Subscribers stay registered.
    pub fn clear(&self) {
        {
            let mut state = self.shared.lock();
            state.cancel_timer();
            state.entries.clear();
            state.pending.clear();
            state.revision = 0;
            state.last_commit = Instant::now();
        }
        log::debug!("Update log cleared");
        self.shared.listeners.notify(LogEvent::Cleared);
    }

    /// Highest committed revision, 0 when empty.
    pub fn latest_revision(&self) -> u64 {
        self.shared.lock().revision
    }

    pub fn entries(&self) -> Vec<UpdateRecord> {
        self.shared.lock().entries.clone()
    }

    /// Records with `revision <= revision`, in commit order.
    pub fn entries_up_to(&self, revision: u64) -> Vec<UpdateRecord> {
        self.shared
            .lock()
            .entries
            .iter()
            .take_while(|r| r.revision <= revision)
            .cloned()
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Register a listener called synchronously after each commit or clear,
    /// outside the log's lock.
    pub fn subscribe(&self, listener: impl Fn(&LogEvent) + Send + Sync + 'static) -> Subscription {
        let listeners = &self.shared.listeners;
        let id = listeners.next_id.fetch_add(1, Ordering::Relaxed);
        listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(listeners),
        }
    }

    /// A callback appending every delta it receives, for wiring into a
    /// sync client's update hook.
    pub fn sink(&self) -> impl Fn(&[u8]) + Send + Sync + 'static {
        let target = self.clone();
        move |delta: &[u8]| {
            if let Err(e) = target.append(delta.to_vec()) {
                log::warn!("Failed to record update: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use yrs::{Text, Transact, WriteTxn};

    /// A replica plus a helper to type into it.
    struct Typist(YrsReplica);

    impl Typist {
        fn new() -> Self {
            Self(YrsReplica::empty().unwrap())
        }

        fn type_str(&self, chunk: &str) -> Vec<u8> {
            {
                let mut txn = self.0.doc().transact_mut();
                let text = txn.get_or_insert_text("content");
                let len = text.len(&txn);
                text.insert(&mut txn, len, chunk);
            }
            self.0.take_emitted().remove(0)
        }
    }

    fn record_events(log: &UpdateLog) -> (Arc<StdMutex<Vec<LogEvent>>>, Subscription) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let sub = log.subscribe(move |e| sink.lock().unwrap().push(*e));
        (events, sub)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_burst_coalesces_into_one_revision() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();
        let (events, _sub) = record_events(&log);

        for ch in ["a", "b", "c", "d", "e"] {
            log.append(typist.type_str(ch)).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(log.latest_revision(), 0);
        assert_eq!(log.pending_len(), 5);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(log.latest_revision(), 1);
        assert_eq!(log.pending_len(), 0);
        assert_eq!(*events.lock().unwrap(), vec![LogEvent::Committed { revision: 1 }]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_debounce_restarts_on_append() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();

        log.append(typist.type_str("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        log.append(typist.type_str("b")).unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(log.latest_revision(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(log.latest_revision(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_max_wait_forces_commit() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();
        let start = Instant::now();
        let commits = Arc::new(StdMutex::new(Vec::new()));
        let sink = commits.clone();
        let _sub = log.subscribe(move |_| sink.lock().unwrap().push(Instant::now() - start));

        // One append every 800 ms keeps resetting the 1000 ms debounce.
        for i in 0..8 {
            log.append(typist.type_str(&i.to_string())).unwrap();
            tokio::time::sleep(Duration::from_millis(800)).await;
        }

        let commits = commits.lock().unwrap().clone();
        assert_eq!(commits.len(), 1);
        assert!(commits[0] >= Duration::from_millis(5000));
        assert!(commits[0] < Duration::from_millis(5010));
        assert_eq!(log.entries()[0].revision, 1);
        assert_eq!(log.pending_len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_append_after_idle_commits_at_once() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();

        log.append(typist.type_str("first")).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(log.latest_revision(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        log.append(typist.type_str("second")).unwrap();
        assert_eq!(log.latest_revision(), 2);
        assert_eq!(log.pending_len(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_max_wait_counts_from_last_commit() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();

        log.append(typist.type_str("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(log.latest_revision(), 1);

        // Three seconds of quiet, then steady typing from 4.1 s to 5.6 s.
        // The debounce alone would commit at 6.6 s; max-wait counted from
        // the commit at 1 s forces it at 6 s.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        for i in 0..4 {
            log.append(typist.type_str(&i.to_string())).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(log.latest_revision(), 2);
        assert_eq!(log.pending_len(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_revisions_are_gapless() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();

        for round in 0..4 {
            log.append(typist.type_str(&round.to_string())).unwrap();
            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
        let revisions: Vec<u64> = log.entries().iter().map(|r| r.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3, 4]);
        assert_eq!(log.entries_up_to(2).len(), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_flush_cancels_timer() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();
        let (events, _sub) = record_events(&log);

        log.append(typist.type_str("x")).unwrap();
        assert_eq!(log.flush().unwrap(), Some(1));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(log.latest_revision(), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(log.flush().unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_clear_discards_pending_and_resets_numbering() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();
        let (events, _sub) = record_events(&log);

        log.append(typist.type_str("one")).unwrap();
        log.flush().unwrap();
        log.append(typist.type_str("two")).unwrap();
        log.clear();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(log.latest_revision(), 0);
        assert!(log.entries().is_empty());

        log.append(typist.type_str("three")).unwrap();
        log.flush().unwrap();
        assert_eq!(log.latest_revision(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                LogEvent::Committed { revision: 1 },
                LogEvent::Cleared,
                LogEvent::Committed { revision: 1 },
            ]
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_unsubscribe_stops_notifications() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();
        let (events, sub) = record_events(&log);

        log.append(typist.type_str("a")).unwrap();
        log.flush().unwrap();
        sub.unsubscribe();
        log.append(typist.type_str("b")).unwrap();
        log.flush().unwrap();

        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_append_without_runtime_commits_immediately() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();
        log.append(typist.type_str("sync")).unwrap();
        assert_eq!(log.latest_revision(), 1);
    }

    #[test]
    fn test_bad_delta_is_rejected() {
        let log: UpdateLog = UpdateLog::default();
        let err = log.append(vec![0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, HistoryError::Document(_)));
        assert_eq!(log.pending_len(), 0);
        assert_eq!(log.latest_revision(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_bad_delta_keeps_pending_batch() {
        let log: UpdateLog = UpdateLog::default();
        let typist = Typist::new();

        log.append(typist.type_str("keep me")).unwrap();
        assert!(log.append(vec![0xFF, 0xFF]).is_err());
        assert_eq!(log.pending_len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.latest_revision(), 1);
        assert_eq!(log.pending_len(), 0);
    }

    #[test]
    fn test_config_serde_in_millis() {
        let config: LogConfig = serde_json::from_str(r#"{"debounce":250}"#).unwrap();
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.max_wait, Duration::from_millis(5000));
    }
}

//! Deterministic test doubles for the scheduler, transport, and storage.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use bytes::Bytes;

use crate::resources::{
    DeleteCallback, MessageReceiver, NetworkChannel, NetworkStatusReceiver, ReadAllCallback,
    ReadCallback, Scheduler, Storage, StorageStatus, Task, WriteCallback,
};

struct QueuedTask {
    fire_at_ms: u64,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ms == other.fire_at_ms && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.fire_at_ms, other.seq).cmp(&(self.fire_at_ms, self.seq))
    }
}

struct SchedulerState {
    now_ms: u64,
    next_seq: u64,
    queue: BinaryHeap<QueuedTask>,
}

/// Scheduler with a simulated clock. Time only advances through
/// `pass_time`, which runs due tasks in deadline order on the calling
/// thread. The thread that constructed the scheduler counts as the
/// internal thread.
pub struct DeterministicScheduler {
    owner: ThreadId,
    state: Mutex<SchedulerState>,
}

impl DeterministicScheduler {
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            state: Mutex::new(SchedulerState {
                now_ms: 0,
                next_seq: 0,
                queue: BinaryHeap::new(),
            }),
        }
    }

    /// Advances the simulated clock, running every task that comes due.
    /// Tasks scheduled by running tasks run too if they fall inside the
    /// window.
    pub fn pass_time(&self, delta: Duration) {
        let target_ms = {
            let state = self.state.lock().expect("scheduler state lock");
            state.now_ms + delta.as_millis() as u64
        };
        loop {
            let due = {
                let mut state = self.state.lock().expect("scheduler state lock");
                match state.queue.peek() {
                    Some(queued) if queued.fire_at_ms <= target_ms => {
                        let queued = state.queue.pop().expect("peeked task");
                        state.now_ms = state.now_ms.max(queued.fire_at_ms);
                        Some(queued.task)
                    }
                    _ => None,
                }
            };
            match due {
                Some(task) => task(),
                None => break,
            }
        }
        let mut state = self.state.lock().expect("scheduler state lock");
        state.now_ms = target_ms;
    }

    /// Runs tasks already due without advancing the clock.
    pub fn run_ready(&self) {
        self.pass_time(Duration::ZERO);
    }

    pub fn pending_tasks(&self) -> usize {
        self.state.lock().expect("scheduler state lock").queue.len()
    }
}

impl Default for DeterministicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for DeterministicScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock().expect("scheduler state lock");
        let fire_at_ms = state.now_ms + delay.as_millis() as u64;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(QueuedTask {
            fire_at_ms,
            seq,
            task,
        });
    }

    fn is_running_on_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn now_ms(&self) -> u64 {
        self.state.lock().expect("scheduler state lock").now_ms
    }
}

struct RecordingNetworkState {
    sent: Vec<Bytes>,
    receiver: Option<MessageReceiver>,
    status_receivers: Vec<NetworkStatusReceiver>,
}

/// Transport double that records outbound bytes and lets tests inject
/// inbound bytes and network-status changes.
pub struct RecordingNetwork {
    state: Mutex<RecordingNetworkState>,
}

impl RecordingNetwork {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecordingNetworkState {
                sent: Vec::new(),
                receiver: None,
                status_receivers: Vec::new(),
            }),
        }
    }

    /// Returns and clears the recorded outbound messages.
    pub fn take_sent(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().expect("network state lock").sent)
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().expect("network state lock").sent.len()
    }

    /// Hands inbound bytes to the installed message receiver.
    pub fn deliver(&self, bytes: Bytes) {
        let state = self.state.lock().expect("network state lock");
        let receiver = state.receiver.as_ref().expect("no message receiver set");
        receiver(bytes);
    }

    pub fn set_network_status(&self, online: bool) {
        let state = self.state.lock().expect("network state lock");
        for receiver in &state.status_receivers {
            receiver(online);
        }
    }
}

impl Default for RecordingNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkChannel for RecordingNetwork {
    fn send_message(&self, message: Bytes) {
        self.state
            .lock()
            .expect("network state lock")
            .sent
            .push(message);
    }

    fn set_message_receiver(&self, receiver: MessageReceiver) {
        self.state.lock().expect("network state lock").receiver = Some(receiver);
    }

    fn add_network_status_receiver(&self, receiver: NetworkStatusReceiver) {
        self.state
            .lock()
            .expect("network state lock")
            .status_receivers
            .push(receiver);
    }
}

/// In-memory storage delegate that completes inline on the caller's thread.
pub struct MemoryStorage {
    data: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn write_key(&self, key: &str, value: Bytes, done: WriteCallback) {
        self.data
            .lock()
            .expect("storage lock")
            .insert(key.to_owned(), value);
        done(StorageStatus::Ok);
    }

    fn read_key(&self, key: &str, done: ReadCallback) {
        let value = self.data.lock().expect("storage lock").get(key).cloned();
        match value {
            Some(value) => done(Ok(value)),
            None => done(Err(StorageStatus::PermanentFailure(format!(
                "no such key: {key}"
            )))),
        }
    }

    fn delete_key(&self, key: &str, done: DeleteCallback) {
        let removed = self
            .data
            .lock()
            .expect("storage lock")
            .remove(key)
            .is_some();
        done(removed);
    }

    fn read_all_keys(&self, done: ReadAllCallback) {
        let keys = self
            .data
            .lock()
            .expect("storage lock")
            .keys()
            .cloned()
            .collect();
        done(Ok(keys));
    }
}

/// Wraps a storage delegate so every completion is invoked from a freshly
/// spawned thread, the way a real asynchronous store behaves.
pub struct ForeignThreadStorage {
    inner: Arc<dyn Storage>,
}

impl ForeignThreadStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self { inner }
    }
}

impl Storage for ForeignThreadStorage {
    fn write_key(&self, key: &str, value: Bytes, done: WriteCallback) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        thread::spawn(move || inner.write_key(&key, value, done));
    }

    fn read_key(&self, key: &str, done: ReadCallback) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        thread::spawn(move || inner.read_key(&key, done));
    }

    fn delete_key(&self, key: &str, done: DeleteCallback) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        thread::spawn(move || inner.delete_key(&key, done));
    }

    fn read_all_keys(&self, done: ReadAllCallback) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.read_all_keys(done));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_time_runs_tasks_in_deadline_order() {
        let scheduler = DeterministicScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay_ms) in [("c", 30u64), ("a", 10), ("b", 20)] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Duration::from_millis(delay_ms),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        scheduler.pass_time(Duration::from_millis(25));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(scheduler.pending_tasks(), 1);

        scheduler.pass_time(Duration::from_millis(5));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn tasks_scheduled_by_tasks_run_in_the_same_window() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let ran = Arc::new(Mutex::new(Vec::new()));

        let inner_scheduler = Arc::clone(&scheduler);
        let inner_ran = Arc::clone(&ran);
        scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                inner_ran.lock().unwrap().push("outer");
                let ran = Arc::clone(&inner_ran);
                inner_scheduler.schedule(
                    Duration::from_millis(10),
                    Box::new(move || ran.lock().unwrap().push("inner")),
                );
            }),
        );

        scheduler.pass_time(Duration::from_millis(30));
        assert_eq!(*ran.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn clock_only_advances_through_pass_time() {
        let scheduler = DeterministicScheduler::new();
        assert_eq!(scheduler.now_ms(), 0);
        scheduler.pass_time(Duration::from_millis(250));
        assert_eq!(scheduler.now_ms(), 250);
    }
}

//! The internal scheduler: a single worker thread running deferred tasks.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::resources::{Scheduler, Task};

/// Upper bound on how long the worker sleeps with an empty queue; new work
/// arriving over the channel wakes it earlier.
const IDLE_WAIT: Duration = Duration::from_secs(60);

enum WorkerMessage {
    Run { fire_at_ms: u64, task: Task },
    Shutdown,
}

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
    // Reversed so the BinaryHeap pops the earliest deadline; seq keeps
    // equal deadlines FIFO.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.fire_at_ms, other.seq).cmp(&(self.fire_at_ms, self.seq))
    }
}

/// Serial executor backed by a dedicated worker thread. Tasks run to
/// completion in deadline order; equal deadlines run in submission order.
pub struct ThreadScheduler {
    sender: Sender<WorkerMessage>,
    worker_id: ThreadId,
    start: Instant,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        let start = Instant::now();
        let handle = thread::Builder::new()
            .name("ticl-internal".to_owned())
            .spawn(move || worker_loop(receiver, start))
            .expect("failed to spawn internal scheduler thread");
        Self {
            sender,
            worker_id: handle.thread().id(),
            start,
            join: Mutex::new(Some(handle)),
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let fire_at_ms = self.now_ms().saturating_add(delay.as_millis() as u64);
        // Send failure means the worker is gone (shutdown); drop the task.
        let _ = self.sender.send(WorkerMessage::Run { fire_at_ms, task });
    }

    fn is_running_on_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.join.lock().expect("scheduler join lock").take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: Receiver<WorkerMessage>, start: Instant) {
    let mut heap: BinaryHeap<QueuedTask> = BinaryHeap::new();
    let mut next_seq: u64 = 0;

    loop {
        let now_ms = start.elapsed().as_millis() as u64;

        while heap
            .peek()
            .is_some_and(|queued| queued.fire_at_ms <= now_ms)
        {
            let queued = heap.pop().expect("peeked task");
            (queued.task)();
        }

        let wait = match heap.peek() {
            Some(queued) => {
                let now_ms = start.elapsed().as_millis() as u64;
                Duration::from_millis(queued.fire_at_ms.saturating_sub(now_ms))
            }
            None => IDLE_WAIT,
        };

        match receiver.recv_timeout(wait) {
            Ok(WorkerMessage::Run { fire_at_ms, task }) => {
                heap.push(QueuedTask {
                    fire_at_ms,
                    seq: next_seq,
                    task,
                });
                next_seq += 1;
            }
            Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;

    #[test]
    fn tasks_run_on_the_worker_thread() {
        let scheduler = Arc::new(ThreadScheduler::new());
        let (tx, rx) = mpsc::channel();

        assert!(!scheduler.is_running_on_thread());

        let inner = Arc::clone(&scheduler);
        scheduler.schedule(
            Duration::ZERO,
            Box::new(move || {
                tx.send(inner.is_running_on_thread()).unwrap();
            }),
        );

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn equal_deadlines_run_in_submission_order() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();

        for i in 0..4 {
            let tx = tx.clone();
            scheduler.schedule(
                Duration::from_millis(20),
                Box::new(move || {
                    tx.send(i).unwrap();
                }),
            );
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn shorter_delay_runs_first() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();

        let tx_slow = tx.clone();
        scheduler.schedule(
            Duration::from_millis(60),
            Box::new(move || {
                tx_slow.send("slow").unwrap();
            }),
        );
        scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                tx.send("fast").unwrap();
            }),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fast");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "slow");
    }
}

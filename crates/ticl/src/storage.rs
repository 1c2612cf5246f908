//! Storage wrapper that forces completions onto the internal scheduler.

use std::sync::Arc;

use bytes::Bytes;

use crate::resources::{
    DeleteCallback, NO_DELAY, ReadAllCallback, ReadCallback, Scheduler, Storage, WriteCallback,
};

/// Wraps a storage delegate whose completions may arrive on any thread and
/// re-posts every completion onto the internal scheduler with zero delay.
///
/// The completion value is moved into the scheduled task; it runs exactly
/// once on the internal thread, or is dropped unrun if the scheduler shuts
/// down first. It is never invoked synchronously on the caller's thread and
/// never on the delegate's completion thread.
pub struct SafeStorage {
    delegate: Arc<dyn Storage>,
    scheduler: Arc<dyn Scheduler>,
}

impl SafeStorage {
    pub fn new(delegate: Arc<dyn Storage>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            delegate,
            scheduler,
        }
    }
}

impl Storage for SafeStorage {
    fn write_key(&self, key: &str, value: Bytes, done: WriteCallback) {
        let scheduler = Arc::clone(&self.scheduler);
        self.delegate.write_key(
            key,
            value,
            Box::new(move |status| {
                scheduler.schedule(NO_DELAY, Box::new(move || done(status)));
            }),
        );
    }

    fn read_key(&self, key: &str, done: ReadCallback) {
        let scheduler = Arc::clone(&self.scheduler);
        self.delegate.read_key(
            key,
            Box::new(move |result| {
                scheduler.schedule(NO_DELAY, Box::new(move || done(result)));
            }),
        );
    }

    fn delete_key(&self, key: &str, done: DeleteCallback) {
        let scheduler = Arc::clone(&self.scheduler);
        self.delegate.delete_key(
            key,
            Box::new(move |deleted| {
                scheduler.schedule(NO_DELAY, Box::new(move || done(deleted)));
            }),
        );
    }

    fn read_all_keys(&self, done: ReadAllCallback) {
        let scheduler = Arc::clone(&self.scheduler);
        self.delegate.read_all_keys(Box::new(move |result| {
            scheduler.schedule(NO_DELAY, Box::new(move || done(result)));
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::resources::StorageStatus;
    use crate::testing::{DeterministicScheduler, MemoryStorage};

    #[test]
    fn completion_is_never_synchronous() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let storage = SafeStorage::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        );

        let done = Arc::new(AtomicBool::new(false));
        let done_in_callback = Arc::clone(&done);
        storage.write_key(
            "k",
            Bytes::from_static(b"v"),
            Box::new(move |status| {
                assert!(status.is_ok());
                done_in_callback.store(true, Ordering::Relaxed);
            }),
        );

        // The in-memory delegate completed inline, but the completion only
        // runs once the scheduler does.
        assert!(!done.load(Ordering::Relaxed));
        scheduler.run_ready();
        assert!(done.load(Ordering::Relaxed));
    }

    #[test]
    fn read_sees_written_value_via_scheduler() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let storage = SafeStorage::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        );

        storage.write_key("k", Bytes::from_static(b"v"), Box::new(|_| {}));
        scheduler.run_ready();

        let read = Arc::new(Mutex::new(None));
        let read_in_callback = Arc::clone(&read);
        storage.read_key(
            "k",
            Box::new(move |result| {
                *read_in_callback.lock().unwrap() = Some(result);
            }),
        );
        assert!(read.lock().unwrap().is_none());
        scheduler.run_ready();
        assert_eq!(
            read.lock().unwrap().take().unwrap().unwrap(),
            Bytes::from_static(b"v")
        );
    }

    #[test]
    fn missing_key_reports_failure_status() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let storage = SafeStorage::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        );

        let read = Arc::new(Mutex::new(None));
        let read_in_callback = Arc::clone(&read);
        storage.read_key(
            "absent",
            Box::new(move |result| {
                *read_in_callback.lock().unwrap() = Some(result);
            }),
        );
        scheduler.run_ready();
        match read.lock().unwrap().take().unwrap() {
            Err(StorageStatus::PermanentFailure(_)) => {}
            other => panic!("unexpected read result: {other:?}"),
        }
    }
}

//! Deduplicating scheduler for recurring maintenance operations.
//!
//! Each registered operation has a fixed delay; scheduling an operation that
//! is already pending is a no-op, so bursts of schedule requests coalesce
//! into a single deferred run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::resources::Scheduler;

pub type Operation = Arc<dyn Fn() + Send + Sync>;

/// Handle for a registered operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

struct OperationScheduleInfo {
    name: &'static str,
    delay: Duration,
    has_been_scheduled: bool,
    operation: Operation,
}

struct OperationTable {
    next_id: u64,
    operations: BTreeMap<OperationId, OperationScheduleInfo>,
}

pub struct OperationScheduler {
    scheduler: Arc<dyn Scheduler>,
    table: Mutex<OperationTable>,
}

impl OperationScheduler {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            table: Mutex::new(OperationTable {
                next_id: 0,
                operations: BTreeMap::new(),
            }),
        }
    }

    /// Registers `operation` under `name` with the given delay.
    ///
    /// Panics when `delay` is zero or when `name` is already registered;
    /// both are programming errors.
    pub fn register(
        &self,
        name: &'static str,
        delay: Duration,
        operation: Operation,
    ) -> OperationId {
        assert!(delay > Duration::ZERO, "operation delay must be positive");
        let mut table = self.table.lock().expect("operation table lock");
        assert!(
            table.operations.values().all(|info| info.name != name),
            "operation {name:?} already registered"
        );
        let id = OperationId(table.next_id);
        table.next_id += 1;
        table.operations.insert(
            id,
            OperationScheduleInfo {
                name,
                delay,
                has_been_scheduled: false,
                operation,
            },
        );
        id
    }

    /// Changes the delay used by subsequent `schedule` calls. An in-flight
    /// deferred firing keeps its original deadline.
    pub fn change_delay(&self, id: OperationId, delay: Duration) {
        assert!(delay > Duration::ZERO, "operation delay must be positive");
        let mut table = self.table.lock().expect("operation table lock");
        let info = table
            .operations
            .get_mut(&id)
            .expect("change_delay on unregistered operation");
        info.delay = delay;
    }

    /// Schedules the operation unless a firing is already pending.
    pub fn schedule(self: &Arc<Self>, id: OperationId) {
        let delay = {
            let mut table = self.table.lock().expect("operation table lock");
            let info = table
                .operations
                .get_mut(&id)
                .expect("schedule on unregistered operation");
            if info.has_been_scheduled {
                return;
            }
            info.has_been_scheduled = true;
            info.delay
        };

        let this = Arc::clone(self);
        self.scheduler
            .schedule(delay, Box::new(move || this.run_and_clear(id)));
    }

    fn run_and_clear(&self, id: OperationId) {
        let operation = {
            let table = self.table.lock().expect("operation table lock");
            Arc::clone(&table.operations[&id].operation)
        };
        operation();
        let mut table = self.table.lock().expect("operation table lock");
        if let Some(info) = table.operations.get_mut(&id) {
            info.has_been_scheduled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::testing::DeterministicScheduler;

    fn counting_operation() -> (Operation, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let count_in_op = Arc::clone(&count);
        let operation: Operation = Arc::new(move || {
            count_in_op.fetch_add(1, Ordering::Relaxed);
        });
        (operation, count)
    }

    #[test]
    fn burst_of_schedules_fires_once() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let ops = Arc::new(OperationScheduler::new(
            Arc::clone(&scheduler) as Arc<dyn Scheduler>
        ));
        let (operation, count) = counting_operation();
        let id = ops.register("batching", Duration::from_millis(100), operation);

        for _ in 0..5 {
            ops.schedule(id);
        }
        scheduler.pass_time(Duration::from_millis(99));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        scheduler.pass_time(Duration::from_millis(1));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        // After the run the operation is schedulable again, exactly once.
        ops.schedule(id);
        ops.schedule(id);
        scheduler.pass_time(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn change_delay_affects_subsequent_schedules() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let ops = Arc::new(OperationScheduler::new(
            Arc::clone(&scheduler) as Arc<dyn Scheduler>
        ));
        let (operation, count) = counting_operation();
        let id = ops.register("batching", Duration::from_millis(100), operation);

        ops.schedule(id);
        ops.change_delay(id, Duration::from_millis(10));
        // In-flight firing keeps the original 100ms deadline.
        scheduler.pass_time(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        scheduler.pass_time(Duration::from_millis(90));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        ops.schedule(id);
        scheduler.pass_time(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let ops = OperationScheduler::new(scheduler as Arc<dyn Scheduler>);
        let (operation, _) = counting_operation();
        ops.register("batching", Duration::from_millis(100), Arc::clone(&operation));
        ops.register("batching", Duration::from_millis(200), operation);
    }

    #[test]
    #[should_panic(expected = "delay must be positive")]
    fn zero_delay_registration_panics() {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let ops = OperationScheduler::new(scheduler as Arc<dyn Scheduler>);
        let (operation, _) = counting_operation();
        ops.register("batching", Duration::ZERO, operation);
    }
}

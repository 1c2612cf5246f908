//! Capability seams the client core is built against: scheduling, network
//! transport, and persistent storage.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Delay for work that should run as soon as the internal thread is free.
pub const NO_DELAY: Duration = Duration::ZERO;

pub type Task = Box<dyn FnOnce() + Send>;

/// A single-threaded serial executor with a monotonic clock. All client
/// state is owned by the thread this scheduler runs its tasks on.
pub trait Scheduler: Send + Sync {
    /// Runs `task` on the internal thread after at least `delay`.
    fn schedule(&self, delay: Duration, task: Task);

    /// Whether the caller is on the internal thread.
    fn is_running_on_thread(&self) -> bool;

    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u64;
}

pub type MessageReceiver = Box<dyn Fn(Bytes) + Send + Sync>;
pub type NetworkStatusReceiver = Box<dyn Fn(bool) + Send + Sync>;

/// Byte-oriented transport to the invalidation server. Sending is
/// fire-and-forget at this layer; receivers may be invoked on any thread.
pub trait NetworkChannel: Send + Sync {
    fn send_message(&self, message: Bytes);
    fn set_message_receiver(&self, receiver: MessageReceiver);
    fn add_network_status_receiver(&self, receiver: NetworkStatusReceiver);
}

/// Completion status reported by a storage delegate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageStatus {
    Ok,
    TransientFailure(String),
    PermanentFailure(String),
}

impl StorageStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, StorageStatus::Ok)
    }
}

pub type WriteCallback = Box<dyn FnOnce(StorageStatus) + Send>;
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes, StorageStatus>) + Send>;
pub type DeleteCallback = Box<dyn FnOnce(bool) + Send>;
pub type ReadAllCallback = Box<dyn FnOnce(Result<Vec<String>, StorageStatus>) + Send>;

/// Persistent key-value store. Completions may be invoked on any thread,
/// including synchronously on the caller's; see `SafeStorage` for the
/// wrapper that re-posts them onto the internal scheduler.
pub trait Storage: Send + Sync {
    fn write_key(&self, key: &str, value: Bytes, done: WriteCallback);
    fn read_key(&self, key: &str, done: ReadCallback);
    fn delete_key(&self, key: &str, done: DeleteCallback);
    fn read_all_keys(&self, done: ReadAllCallback);
}

/// Bundle of the injected capabilities handed to the client core at
/// construction.
#[derive(Clone)]
pub struct SystemResources {
    pub scheduler: Arc<dyn Scheduler>,
    pub network: Arc<dyn NetworkChannel>,
    pub storage: Arc<dyn Storage>,
    pub platform: String,
}

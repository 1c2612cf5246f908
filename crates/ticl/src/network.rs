//! Tracks outbound-data readiness, heartbeats, and invalidation polling.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ticl_core::proto::{ClientToServerMessage, ServerToClientMessage};

use crate::config::Config;
use crate::resources::{NO_DELAY, Scheduler};
use crate::throttle::{RateLimit, Throttle};

/// Smallest gap between two "outbound data ready" notifications.
const MIN_NOTIFY_GAP: Duration = Duration::from_secs(1);
/// Storm bound: at most this many notifications per storm window.
const STORM_WINDOW: Duration = Duration::from_secs(60);
const STORM_COUNT: u32 = 30;

pub type OutboundListener = Arc<dyn Fn() + Send + Sync>;

struct NetworkState {
    has_outbound_data: bool,
    outbound_listener: Option<OutboundListener>,
    last_poll_ms: u64,
    last_send_ms: u64,
    poll_delay: Duration,
    heartbeat_delay: Duration,
}

/// Keeps track of whether there is data to send and informs the registered
/// listener when appropriate, rate-limited by a throttle. Also owns the
/// heartbeat and poll intervals, which the server may retune.
pub struct NetworkManager {
    scheduler: Arc<dyn Scheduler>,
    throttle: Arc<Throttle>,
    state: Mutex<NetworkState>,
}

impl NetworkManager {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: &Config) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<NetworkManager>| {
            let weak = weak.clone();
            let throttle = Arc::new(Throttle::new(
                vec![
                    RateLimit::new(MIN_NOTIFY_GAP, 1),
                    RateLimit::new(STORM_WINDOW, STORM_COUNT),
                ],
                Arc::clone(&scheduler),
                Arc::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.do_inform_outbound_listener();
                    }
                }),
            ));
            let now_ms = scheduler.now_ms();
            NetworkManager {
                scheduler,
                throttle,
                state: Mutex::new(NetworkState {
                    has_outbound_data: false,
                    outbound_listener: None,
                    last_poll_ms: now_ms,
                    last_send_ms: now_ms,
                    poll_delay: config.polling_interval(),
                    heartbeat_delay: config.heartbeat_interval(),
                }),
            }
        })
    }

    /// Finalizes an outbound message at the point it is handed to the
    /// transport: stamps a poll request on object-control messages when the
    /// client holds a session and the poll interval has elapsed, notes the
    /// send time, and clears the outbound-data flag.
    pub fn handle_outbound_message(&self, message: &mut ClientToServerMessage) {
        let now_ms = self.scheduler.now_ms();
        let mut state = self.state.lock().expect("network state lock");

        let has_session = message
            .header
            .as_ref()
            .is_some_and(|header| header.client_token.is_some());
        if message.is_object_control()
            && has_session
            && now_ms.saturating_sub(state.last_poll_ms) >= state.poll_delay.as_millis() as u64
        {
            message.poll_invalidations = true;
            state.last_poll_ms = now_ms;
        }
        state.last_send_ms = now_ms;
        state.has_outbound_data = false;
    }

    /// Adopts heartbeat and poll intervals when the server supplies them.
    pub fn handle_inbound_message(&self, message: &ServerToClientMessage) {
        let mut state = self.state.lock().expect("network state lock");
        if let Some(heartbeat_ms) = message.heartbeat_interval_ms {
            tracing::debug!(heartbeat_ms, "adopting server heartbeat interval");
            state.heartbeat_delay = Duration::from_millis(heartbeat_ms);
        }
        if let Some(poll_ms) = message.poll_interval_ms {
            tracing::debug!(poll_ms, "adopting server poll interval");
            state.poll_delay = Duration::from_millis(poll_ms);
        }
    }

    /// Whether enough time has passed since the last send that a heartbeat
    /// contact is warranted.
    pub fn heartbeat_needed(&self) -> bool {
        let state = self.state.lock().expect("network state lock");
        self.scheduler.now_ms()
            >= state
                .last_send_ms
                .saturating_add(state.heartbeat_delay.as_millis() as u64)
    }

    /// Notes that the client has data ready for the server and informs the
    /// listener if one is registered and has not been told since it last
    /// drained a message.
    pub fn outbound_data_ready(self: &Arc<Self>) {
        let inform = {
            let mut state = self.state.lock().expect("network state lock");
            if state.has_outbound_data {
                false
            } else {
                state.has_outbound_data = true;
                state.outbound_listener.is_some()
            }
        };
        if inform {
            self.inform_outbound_listener();
        }
    }

    /// Registers the listener to notify when outbound data becomes
    /// available; notifies immediately if data is already waiting.
    pub fn register_outbound_listener(self: &Arc<Self>, listener: OutboundListener) {
        let inform = {
            let mut state = self.state.lock().expect("network state lock");
            state.outbound_listener = Some(listener);
            state.has_outbound_data
        };
        if inform {
            self.inform_outbound_listener();
        }
    }

    fn inform_outbound_listener(self: &Arc<Self>) {
        self.throttle.fire();
    }

    fn do_inform_outbound_listener(&self) {
        let listener = {
            let state = self.state.lock().expect("network state lock");
            state.outbound_listener.clone()
        };
        if let Some(listener) = listener {
            self.scheduler
                .schedule(NO_DELAY, Box::new(move || listener()));
        }
    }

    #[cfg(test)]
    fn poll_delay(&self) -> Duration {
        self.state.lock().unwrap().poll_delay
    }

    #[cfg(test)]
    fn heartbeat_delay(&self) -> Duration {
        self.state.lock().unwrap().heartbeat_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use bytes::Bytes;
    use ticl_core::proto::{
        ClientHeader, InvalidationMessage, ProtocolVersion, ServerHeader, ServerToClientMessage,
    };

    use crate::testing::DeterministicScheduler;

    fn outbound_with_token() -> ClientToServerMessage {
        ClientToServerMessage {
            header: Some(ClientHeader {
                protocol_version: ProtocolVersion::current(),
                client_token: Some(Bytes::from_static(b"T")),
                registration_summary: None,
                client_time_ms: 0,
                max_known_server_time_ms: 0,
                message_id: "1".to_owned(),
            }),
            invalidation_ack_message: Some(InvalidationMessage::default()),
            ..Default::default()
        }
    }

    fn inbound(heartbeat: Option<u64>, poll: Option<u64>) -> ServerToClientMessage {
        let mut message = ServerToClientMessage::new(ServerHeader {
            protocol_version: ProtocolVersion::current(),
            client_token: Bytes::from_static(b"T"),
            registration_summary: None,
            server_time_ms: 0,
            message_id: None,
        });
        message.heartbeat_interval_ms = heartbeat;
        message.poll_interval_ms = poll;
        message
    }

    fn manager_with(
        config: &Config,
    ) -> (Arc<NetworkManager>, Arc<DeterministicScheduler>) {
        let scheduler = Arc::new(DeterministicScheduler::new());
        let manager = NetworkManager::new(Arc::clone(&scheduler) as Arc<dyn Scheduler>, config);
        (manager, scheduler)
    }

    #[test]
    fn poll_is_stamped_after_poll_delay() {
        let config = Config {
            polling_interval_ms: 1000,
            ..Default::default()
        };
        let (manager, scheduler) = manager_with(&config);

        // Immediately after construction the interval has not elapsed.
        let mut message = outbound_with_token();
        manager.handle_outbound_message(&mut message);
        assert!(!message.poll_invalidations);

        scheduler.pass_time(Duration::from_millis(1000));
        let mut message = outbound_with_token();
        manager.handle_outbound_message(&mut message);
        assert!(message.poll_invalidations);

        // Polling just happened, so the next message is not stamped.
        let mut message = outbound_with_token();
        manager.handle_outbound_message(&mut message);
        assert!(!message.poll_invalidations);
    }

    #[test]
    fn poll_is_not_stamped_without_session() {
        let config = Config {
            polling_interval_ms: 10,
            ..Default::default()
        };
        let (manager, scheduler) = manager_with(&config);
        scheduler.pass_time(Duration::from_millis(100));

        let mut message = outbound_with_token();
        message.header.as_mut().unwrap().client_token = None;
        manager.handle_outbound_message(&mut message);
        assert!(!message.poll_invalidations);
    }

    #[test]
    fn server_intervals_replace_defaults() {
        let (manager, _scheduler) = manager_with(&Config::default());

        manager.handle_inbound_message(&inbound(Some(60_000), Some(30_000)));
        assert_eq!(manager.heartbeat_delay(), Duration::from_millis(60_000));
        assert_eq!(manager.poll_delay(), Duration::from_millis(30_000));

        // A bundle without intervals leaves them untouched.
        manager.handle_inbound_message(&inbound(None, None));
        assert_eq!(manager.heartbeat_delay(), Duration::from_millis(60_000));
    }

    #[test]
    fn heartbeat_needed_after_quiet_stretch() {
        let config = Config {
            heartbeat_interval_ms: 1000,
            ..Default::default()
        };
        let (manager, scheduler) = manager_with(&config);

        assert!(!manager.heartbeat_needed());
        scheduler.pass_time(Duration::from_millis(999));
        assert!(!manager.heartbeat_needed());
        scheduler.pass_time(Duration::from_millis(1));
        assert!(manager.heartbeat_needed());

        let mut message = outbound_with_token();
        manager.handle_outbound_message(&mut message);
        assert!(!manager.heartbeat_needed());
    }

    #[test]
    fn listener_is_informed_once_per_drain() {
        let (manager, scheduler) = manager_with(&Config::default());
        let informed = Arc::new(AtomicU64::new(0));
        let informed_in_listener = Arc::clone(&informed);
        manager.register_outbound_listener(Arc::new(move || {
            informed_in_listener.fetch_add(1, Ordering::Relaxed);
        }));

        manager.outbound_data_ready();
        manager.outbound_data_ready();
        manager.outbound_data_ready();
        scheduler.run_ready();
        assert_eq!(informed.load(Ordering::Relaxed), 1);

        // Draining a message resets the edge; new data informs again.
        let mut message = outbound_with_token();
        manager.handle_outbound_message(&mut message);
        scheduler.pass_time(Duration::from_secs(2));
        manager.outbound_data_ready();
        scheduler.run_ready();
        assert_eq!(informed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn late_listener_registration_sees_waiting_data() {
        let (manager, scheduler) = manager_with(&Config::default());

        manager.outbound_data_ready();
        let informed = Arc::new(AtomicU64::new(0));
        let informed_in_listener = Arc::clone(&informed);
        manager.register_outbound_listener(Arc::new(move || {
            informed_in_listener.fetch_add(1, Ordering::Relaxed);
        }));
        scheduler.run_ready();
        assert_eq!(informed.load(Ordering::Relaxed), 1);
    }
}

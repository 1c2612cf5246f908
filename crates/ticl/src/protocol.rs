//! The protocol handler: single entry point for wire messages in both
//! directions, enforcing the protocol's gating rules.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use ticl_core::object::{
    ClientToken, Invalidation, ObjectId, Registration, RegistrationOp, RegistrationStatus,
    RegistrationSubtree, RegistrationSummary, Status,
};
use ticl_core::proto::{
    ApplicationClientId, ClientHeader, ClientToServerMessage, ClientVersion,
    DigestSerializationType, ErrorCode, InfoMessage, InfoRequestType, InitializeMessage,
    InvalidationMessage, PropertyRecord, ProtocolVersion, RegistrationMessage,
    RegistrationSyncMessage, decode_server_message, encode_client_message,
};

use crate::config::Config;
use crate::network::NetworkManager;
use crate::operation::{OperationId, OperationScheduler};
use crate::resources::{NO_DELAY, NetworkChannel, Scheduler, SystemResources};
use crate::statistics::{ClientErrorType, ReceivedMessageType, SentMessageType, Statistics};
use crate::validation::MessageValidator;

/// The token and registration summary of an inbound message's header, as
/// handed to the listener.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerMessageHeader {
    pub token: Bytes,
    pub registration_summary: Option<RegistrationSummary>,
}

/// Callback surface the embedding client provides. The listener owns the
/// client token; the protocol handler only reads it.
pub trait ProtocolListener: Send + Sync {
    fn get_client_token(&self) -> ClientToken;

    fn get_registration_summary(&self) -> RegistrationSummary;

    fn handle_token_changed(
        &self,
        header: &ServerMessageHeader,
        new_token: Option<Bytes>,
        status: Status,
    );

    fn handle_invalidations(&self, header: &ServerMessageHeader, invalidations: Vec<Invalidation>);

    fn handle_registration_status(
        &self,
        header: &ServerMessageHeader,
        statuses: Vec<RegistrationStatus>,
    );

    fn handle_registration_sync_request(&self, header: &ServerMessageHeader);

    fn handle_info_message(&self, header: &ServerMessageHeader, info_types: Vec<InfoRequestType>);

    fn handle_error_message(
        &self,
        header: &ServerMessageHeader,
        code: ErrorCode,
        description: &str,
    );
}

struct HandlerState {
    message_id: u64,
    last_known_server_time_ms: u64,
    next_message_send_time_ms: u64,
    pending_registrations: BTreeMap<ObjectId, RegistrationOp>,
    acked_invalidations: BTreeSet<Invalidation>,
    registration_subtrees: BTreeSet<RegistrationSubtree>,
}

pub struct ProtocolHandler {
    scheduler: Arc<dyn Scheduler>,
    network: Arc<dyn NetworkChannel>,
    network_manager: Arc<NetworkManager>,
    operations: Arc<OperationScheduler>,
    statistics: Arc<Statistics>,
    listener: Arc<dyn ProtocolListener>,
    validator: Arc<dyn MessageValidator>,
    client_version: ClientVersion,
    protocol_version: ProtocolVersion,
    batching_op: OperationId,
    state: Mutex<HandlerState>,
}

impl ProtocolHandler {
    /// Builds the handler, registers the batching task, and installs itself
    /// as the transport's message and network-status receiver.
    pub fn new(
        config: &Config,
        resources: &SystemResources,
        statistics: Arc<Statistics>,
        application_name: &str,
        listener: Arc<dyn ProtocolListener>,
        validator: Arc<dyn MessageValidator>,
    ) -> Arc<Self> {
        let scheduler = Arc::clone(&resources.scheduler);
        let operations = Arc::new(OperationScheduler::new(Arc::clone(&scheduler)));
        let network_manager = NetworkManager::new(Arc::clone(&scheduler), config);

        let client_version = ClientVersion {
            version: ProtocolVersion {
                major: config.client_major_version,
                minor: config.client_minor_version,
            },
            platform: resources.platform.clone(),
            language: "Rust".to_owned(),
            application_info: application_name.to_owned(),
        };
        let protocol_version = ProtocolVersion {
            major: config.protocol_major_version,
            minor: config.protocol_minor_version,
        };

        let handler = Arc::new_cyclic(|weak: &Weak<ProtocolHandler>| {
            let batching_weak = weak.clone();
            let batching_op = operations.register(
                "batching",
                config.batching_delay(),
                Arc::new(move || {
                    if let Some(handler) = batching_weak.upgrade() {
                        handler.batching_task();
                    }
                }),
            );
            ProtocolHandler {
                scheduler: Arc::clone(&scheduler),
                network: Arc::clone(&resources.network),
                network_manager,
                operations: Arc::clone(&operations),
                statistics,
                listener,
                validator,
                client_version,
                protocol_version,
                batching_op,
                state: Mutex::new(HandlerState {
                    message_id: 1,
                    last_known_server_time_ms: 0,
                    next_message_send_time_ms: 0,
                    pending_registrations: BTreeMap::new(),
                    acked_invalidations: BTreeSet::new(),
                    registration_subtrees: BTreeSet::new(),
                }),
            }
        });

        // Raw bytes arrive on an arbitrary transport thread; re-post onto
        // the internal scheduler before touching any handler state.
        let receiver_weak = Arc::downgrade(&handler);
        let receiver_scheduler = Arc::clone(&scheduler);
        resources.network.set_message_receiver(Box::new(move |bytes: Bytes| {
            let weak = receiver_weak.clone();
            receiver_scheduler.schedule(
                NO_DELAY,
                Box::new(move || {
                    if let Some(handler) = weak.upgrade() {
                        handler.handle_incoming_message(&bytes);
                    }
                }),
            );
        }));
        resources
            .network
            .add_network_status_receiver(Box::new(|online| {
                tracing::debug!(online, "network status changed");
            }));

        handler
    }

    pub fn network_manager(&self) -> &Arc<NetworkManager> {
        &self.network_manager
    }

    /// Parses, validates, and dispatches one inbound message.
    pub fn handle_incoming_message(&self, bytes: &[u8]) {
        assert!(
            self.scheduler.is_running_on_thread(),
            "handle_incoming_message called off the internal thread"
        );

        let message = match decode_server_message(bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(%err, len = bytes.len(), "dropping unparseable inbound message");
                return;
            }
        };
        if let Err(err) = self.validator.validate_inbound(&message) {
            self.statistics
                .record_error(ClientErrorType::IncomingMessageFailure);
            tracing::warn!(%err, "dropping invalid inbound message");
            return;
        }
        self.statistics
            .record_received_message(ReceivedMessageType::Total);

        let header = ServerMessageHeader {
            token: message.header.client_token.clone(),
            registration_summary: message.header.registration_summary.clone(),
        };

        if message.header.protocol_version.major != self.protocol_version.major {
            self.statistics
                .record_error(ClientErrorType::ProtocolVersionFailure);
            tracing::warn!(
                major = message.header.protocol_version.major,
                expected = self.protocol_version.major,
                "dropping message with incompatible protocol version"
            );
            return;
        }

        // Quiet-period handling comes before the token check so that server
        // backpressure cannot be evaded by a message with a stale token.
        if let Some(config_change) = &message.config_change_message {
            self.statistics
                .record_received_message(ReceivedMessageType::ConfigChange);
            if let Some(delay_ms) = config_change.next_message_delay_ms {
                let mut state = self.state.lock().expect("handler state lock");
                state.next_message_send_time_ms =
                    self.scheduler.now_ms().saturating_add(delay_ms);
            }
            // All other envelope contents are ignored.
            return;
        }

        if !self.check_server_token(&message.header.client_token) {
            return;
        }

        {
            let mut state = self.state.lock().expect("handler state lock");
            if message.header.server_time_ms > state.last_known_server_time_ms {
                state.last_known_server_time_ms = message.header.server_time_ms;
            }
        }
        self.network_manager.handle_inbound_message(&message);

        if let Some(token_control) = message.token_control_message {
            self.statistics
                .record_received_message(ReceivedMessageType::TokenControl);
            self.listener
                .handle_token_changed(&header, token_control.new_token, token_control.status);
        }

        // Whether we now hold a valid token is only known after the
        // token-control upcall: the listener may have acquired one, lost
        // one, or rejected an assignment with the wrong nonce.
        if self.listener.get_client_token().is_empty() {
            return;
        }

        if let Some(invalidations) = message.invalidation_message {
            self.statistics
                .record_received_message(ReceivedMessageType::Invalidation);
            self.listener
                .handle_invalidations(&header, invalidations.invalidations);
        }
        if let Some(statuses) = message.registration_status_message {
            self.statistics
                .record_received_message(ReceivedMessageType::RegistrationStatus);
            self.listener
                .handle_registration_status(&header, statuses.registration_statuses);
        }
        if message.registration_sync_request_message.is_some() {
            self.statistics
                .record_received_message(ReceivedMessageType::RegistrationSyncRequest);
            self.listener.handle_registration_sync_request(&header);
        }
        if let Some(info_request) = message.info_request_message {
            self.statistics
                .record_received_message(ReceivedMessageType::InfoRequest);
            self.listener
                .handle_info_message(&header, info_request.info_types);
        }
        if let Some(error) = message.error_message {
            self.statistics
                .record_received_message(ReceivedMessageType::Error);
            self.listener
                .handle_error_message(&header, error.code, &error.description);
        }
    }

    fn check_server_token(&self, server_token: &Bytes) -> bool {
        assert!(
            self.scheduler.is_running_on_thread(),
            "check_server_token called off the internal thread"
        );
        let client_token = self.listener.get_client_token();
        // Without a token there is nothing to compare; a token-control
        // message may be on its way to the listener.
        if client_token.is_empty() {
            return true;
        }
        if client_token.as_bytes() != server_token {
            tracing::warn!("inbound message token does not match client token");
            self.statistics.record_error(ClientErrorType::TokenMismatch);
            return false;
        }
        true
    }

    /// Requests a session from the server. The only message permitted to
    /// travel without a client token.
    pub fn send_initialize_message(
        &self,
        client_type: i32,
        application_client_id: ApplicationClientId,
        nonce: Bytes,
        debug_string: &str,
    ) {
        assert!(
            self.scheduler.is_running_on_thread(),
            "send_initialize_message called off the internal thread"
        );
        let init = InitializeMessage {
            client_type,
            application_client_id,
            nonce,
            digest_serialization_type: DigestSerializationType::ByteBased,
        };
        self.statistics
            .record_sent_message(SentMessageType::Initialize);
        let message = ClientToServerMessage {
            initialize_message: Some(init),
            ..Default::default()
        };
        self.send_message_to_server(message, &format!("Init-{debug_string}"));
    }

    /// Sends client version, configuration, and performance counters.
    pub fn send_info_message(
        &self,
        performance_counters: Vec<PropertyRecord>,
        config_parameters: Vec<PropertyRecord>,
        server_registration_summary_requested: bool,
    ) {
        assert!(
            self.scheduler.is_running_on_thread(),
            "send_info_message called off the internal thread"
        );
        let info = InfoMessage {
            client_version: self.client_version.clone(),
            config_parameters,
            performance_counters,
            server_registration_summary_requested,
        };
        self.statistics.record_sent_message(SentMessageType::Info);
        let message = ClientToServerMessage {
            info_message: Some(info),
            ..Default::default()
        };
        self.send_message_to_server(message, "Info");
    }

    /// Queues registration operations for the next batch. The latest
    /// operation wins per object id.
    pub fn send_registrations(&self, object_ids: Vec<ObjectId>, op: RegistrationOp) {
        assert!(
            self.scheduler.is_running_on_thread(),
            "send_registrations called off the internal thread"
        );
        {
            let mut state = self.state.lock().expect("handler state lock");
            for object_id in object_ids {
                state.pending_registrations.insert(object_id, op);
            }
        }
        self.operations.schedule(self.batching_op);
    }

    /// Queues an invalidation ack for the next batch, deduplicated by value.
    pub fn send_invalidation_ack(&self, invalidation: Invalidation) {
        assert!(
            self.scheduler.is_running_on_thread(),
            "send_invalidation_ack called off the internal thread"
        );
        {
            let mut state = self.state.lock().expect("handler state lock");
            state.acked_invalidations.insert(invalidation);
        }
        self.operations.schedule(self.batching_op);
    }

    /// Queues a registration subtree for the next batch.
    pub fn send_registration_sync_subtree(&self, subtree: RegistrationSubtree) {
        assert!(
            self.scheduler.is_running_on_thread(),
            "send_registration_sync_subtree called off the internal thread"
        );
        tracing::debug!(
            objects = subtree.registered_objects.len(),
            "queueing registration subtree"
        );
        {
            let mut state = self.state.lock().expect("handler state lock");
            state.registration_subtrees.insert(subtree);
        }
        self.operations.schedule(self.batching_op);
    }

    fn batching_task(&self) {
        self.send_message_to_server(ClientToServerMessage::default(), "BatchingTask");
    }

    /// Assembles and sends one outbound message, draining the pending
    /// batches into it. The batches are cleared whether or not the
    /// transport ultimately accepts the bytes.
    fn send_message_to_server(&self, mut message: ClientToServerMessage, debug_string: &str) {
        assert!(
            self.scheduler.is_running_on_thread(),
            "send_message_to_server called off the internal thread"
        );
        let now_ms = self.scheduler.now_ms();

        {
            let state = self.state.lock().expect("handler state lock");
            if state.next_message_send_time_ms > now_ms {
                tracing::warn!(
                    debug = debug_string,
                    until_ms = state.next_message_send_time_ms,
                    now_ms,
                    "in quiet period, not sending message to server"
                );
                return;
            }
        }

        let client_token = self.listener.get_client_token();
        if client_token.is_empty() && message.initialize_message.is_none() {
            tracing::warn!(
                debug = debug_string,
                "cannot send message without a token or an initialize message"
            );
            self.statistics
                .record_error(ClientErrorType::TokenMissingFailure);
            return;
        }

        let summary = self.listener.get_registration_summary();
        {
            let mut state = self.state.lock().expect("handler state lock");
            self.init_client_header(&mut state, &mut message, &client_token, summary, now_ms);

            if !state.acked_invalidations.is_empty() {
                let acked = std::mem::take(&mut state.acked_invalidations);
                message.invalidation_ack_message = Some(InvalidationMessage {
                    invalidations: acked.into_iter().collect(),
                });
                self.statistics
                    .record_sent_message(SentMessageType::InvalidationAck);
            }
            if !state.pending_registrations.is_empty() {
                let pending = std::mem::take(&mut state.pending_registrations);
                message.registration_message = Some(RegistrationMessage {
                    registrations: pending
                        .into_iter()
                        .map(|(object_id, op)| Registration { object_id, op })
                        .collect(),
                });
                self.statistics
                    .record_sent_message(SentMessageType::Registration);
            }
            if !state.registration_subtrees.is_empty() {
                let subtrees = std::mem::take(&mut state.registration_subtrees);
                message.registration_sync_message = Some(RegistrationSyncMessage {
                    subtrees: subtrees.into_iter().collect(),
                });
                self.statistics
                    .record_sent_message(SentMessageType::RegistrationSync);
            }
        }

        if let Err(err) = self.validator.validate_outbound(&message) {
            tracing::warn!(
                debug = debug_string,
                %err,
                "assembled outbound message failed validation"
            );
            self.statistics
                .record_error(ClientErrorType::OutgoingMessageFailure);
            return;
        }

        self.network_manager.handle_outbound_message(&mut message);

        let bytes = match encode_client_message(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(debug = debug_string, %err, "failed to serialize outbound message");
                self.statistics
                    .record_error(ClientErrorType::OutgoingMessageFailure);
                return;
            }
        };
        self.statistics.record_sent_message(SentMessageType::Total);
        self.network.send_message(Bytes::from(bytes));
    }

    fn init_client_header(
        &self,
        state: &mut HandlerState,
        message: &mut ClientToServerMessage,
        client_token: &ClientToken,
        summary: RegistrationSummary,
        now_ms: u64,
    ) {
        let message_id = state.message_id.to_string();
        state.message_id += 1;
        message.header = Some(ClientHeader {
            protocol_version: self.protocol_version,
            client_token: (!client_token.is_empty())
                .then(|| client_token.as_bytes().clone()),
            registration_summary: Some(summary),
            client_time_ms: now_ms,
            max_known_server_time_ms: state.last_known_server_time_ms,
            message_id,
        });
    }
}

//! Client-side performance counters.
//!
//! Protocol failures are recorded here rather than raised; the counters are
//! also exported into outbound info messages.

use std::sync::atomic::{AtomicU64, Ordering};

use ticl_core::proto::PropertyRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentMessageType {
    Initialize,
    Info,
    InvalidationAck,
    Registration,
    RegistrationSync,
    Total,
}

impl SentMessageType {
    pub const ALL: [Self; 6] = [
        Self::Initialize,
        Self::Info,
        Self::InvalidationAck,
        Self::Registration,
        Self::RegistrationSync,
        Self::Total,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Initialize => "sent.initialize",
            Self::Info => "sent.info",
            Self::InvalidationAck => "sent.invalidation_ack",
            Self::Registration => "sent.registration",
            Self::RegistrationSync => "sent.registration_sync",
            Self::Total => "sent.total",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceivedMessageType {
    TokenControl,
    Invalidation,
    RegistrationStatus,
    RegistrationSyncRequest,
    InfoRequest,
    ConfigChange,
    Error,
    Total,
}

impl ReceivedMessageType {
    pub const ALL: [Self; 8] = [
        Self::TokenControl,
        Self::Invalidation,
        Self::RegistrationStatus,
        Self::RegistrationSyncRequest,
        Self::InfoRequest,
        Self::ConfigChange,
        Self::Error,
        Self::Total,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::TokenControl => "received.token_control",
            Self::Invalidation => "received.invalidation",
            Self::RegistrationStatus => "received.registration_status",
            Self::RegistrationSyncRequest => "received.registration_sync_request",
            Self::InfoRequest => "received.info_request",
            Self::ConfigChange => "received.config_change",
            Self::Error => "received.error",
            Self::Total => "received.total",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientErrorType {
    IncomingMessageFailure,
    OutgoingMessageFailure,
    ProtocolVersionFailure,
    RegistrationDiscrepancy,
    TokenMismatch,
    TokenMissingFailure,
}

impl ClientErrorType {
    pub const ALL: [Self; 6] = [
        Self::IncomingMessageFailure,
        Self::OutgoingMessageFailure,
        Self::ProtocolVersionFailure,
        Self::RegistrationDiscrepancy,
        Self::TokenMismatch,
        Self::TokenMissingFailure,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::IncomingMessageFailure => "error.incoming_message_failure",
            Self::OutgoingMessageFailure => "error.outgoing_message_failure",
            Self::ProtocolVersionFailure => "error.protocol_version_failure",
            Self::RegistrationDiscrepancy => "error.registration_discrepancy",
            Self::TokenMismatch => "error.token_mismatch",
            Self::TokenMissingFailure => "error.token_missing_failure",
        }
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    sent: [AtomicU64; SentMessageType::ALL.len()],
    received: [AtomicU64; ReceivedMessageType::ALL.len()],
    errors: [AtomicU64; ClientErrorType::ALL.len()],
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent_message(&self, kind: SentMessageType) {
        self.sent[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received_message(&self, kind: ReceivedMessageType) {
        self.received[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ClientErrorType) {
        self.errors[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_count(&self, kind: SentMessageType) -> u64 {
        self.sent[kind as usize].load(Ordering::Relaxed)
    }

    pub fn received_count(&self, kind: ReceivedMessageType) -> u64 {
        self.received[kind as usize].load(Ordering::Relaxed)
    }

    pub fn error_count(&self, kind: ClientErrorType) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    /// Snapshot of every counter, for `send_info_message`.
    pub fn performance_counters(&self) -> Vec<PropertyRecord> {
        let mut records = Vec::new();
        for kind in SentMessageType::ALL {
            records.push(PropertyRecord {
                name: kind.name().to_owned(),
                value: self.sent_count(kind) as i64,
            });
        }
        for kind in ReceivedMessageType::ALL {
            records.push(PropertyRecord {
                name: kind.name().to_owned(),
                value: self.received_count(kind) as i64,
            });
        }
        for kind in ClientErrorType::ALL {
            records.push(PropertyRecord {
                name: kind.name().to_owned(),
                value: self.error_count(kind) as i64,
            });
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let stats = Statistics::new();
        stats.record_sent_message(SentMessageType::Initialize);
        stats.record_sent_message(SentMessageType::Total);
        stats.record_sent_message(SentMessageType::Total);
        stats.record_error(ClientErrorType::TokenMismatch);

        assert_eq!(stats.sent_count(SentMessageType::Initialize), 1);
        assert_eq!(stats.sent_count(SentMessageType::Total), 2);
        assert_eq!(stats.error_count(ClientErrorType::TokenMismatch), 1);
        assert_eq!(stats.received_count(ReceivedMessageType::Total), 0);
    }

    #[test]
    fn snapshot_names_are_unique() {
        use std::collections::BTreeSet;

        let stats = Statistics::new();
        let names: BTreeSet<String> = stats
            .performance_counters()
            .into_iter()
            .map(|record| record.name)
            .collect();
        assert_eq!(
            names.len(),
            SentMessageType::ALL.len() + ReceivedMessageType::ALL.len() + ClientErrorType::ALL.len()
        );
    }
}

//! Structural validation of inbound and outbound messages.

use thiserror::Error;

use ticl_core::proto::{ClientToServerMessage, ServerToClientMessage};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Structural checks applied after decode (inbound) and before serialization
/// (outbound). Pluggable so embedders can tighten or relax the rules.
pub trait MessageValidator: Send + Sync {
    fn validate_inbound(&self, message: &ServerToClientMessage) -> Result<(), ValidationError>;
    fn validate_outbound(&self, message: &ClientToServerMessage) -> Result<(), ValidationError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMessageValidator;

impl MessageValidator for DefaultMessageValidator {
    fn validate_inbound(&self, message: &ServerToClientMessage) -> Result<(), ValidationError> {
        if let Some(config_change) = &message.config_change_message
            && config_change.next_message_delay_ms == Some(0)
        {
            return Err(ValidationError::Invalid {
                field: "next_message_delay_ms",
                reason: "must be positive",
            });
        }
        if let Some(invalidations) = &message.invalidation_message {
            if invalidations.invalidations.is_empty() {
                return Err(ValidationError::MissingField("invalidation"));
            }
            for invalidation in &invalidations.invalidations {
                if invalidation.version < 0 {
                    return Err(ValidationError::Invalid {
                        field: "version",
                        reason: "must be non-negative",
                    });
                }
            }
        }
        if let Some(statuses) = &message.registration_status_message
            && statuses.registration_statuses.is_empty()
        {
            return Err(ValidationError::MissingField("registration_status"));
        }
        Ok(())
    }

    fn validate_outbound(&self, message: &ClientToServerMessage) -> Result<(), ValidationError> {
        let header = message
            .header
            .as_ref()
            .ok_or(ValidationError::MissingField("header"))?;
        if header.message_id.is_empty() {
            return Err(ValidationError::MissingField("message_id"));
        }
        if let Some(init) = &message.initialize_message {
            if init.nonce.is_empty() {
                return Err(ValidationError::MissingField("nonce"));
            }
            if init.application_client_id.client_name.is_empty() {
                return Err(ValidationError::MissingField("client_name"));
            }
            if init.client_type < 0 {
                return Err(ValidationError::Invalid {
                    field: "client_type",
                    reason: "must be non-negative",
                });
            }
        }
        if let Some(registrations) = &message.registration_message
            && registrations.registrations.is_empty()
        {
            return Err(ValidationError::MissingField("registration"));
        }
        if let Some(acks) = &message.invalidation_ack_message
            && acks.invalidations.is_empty()
        {
            return Err(ValidationError::MissingField("invalidation"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use ticl_core::object::{Invalidation, ObjectId};
    use ticl_core::proto::{
        ApplicationClientId, ClientHeader, ConfigChangeMessage, DigestSerializationType,
        InitializeMessage, InvalidationMessage, ProtocolVersion, ServerHeader,
    };

    fn outbound_with_header() -> ClientToServerMessage {
        ClientToServerMessage {
            header: Some(ClientHeader {
                protocol_version: ProtocolVersion::current(),
                client_token: Some(Bytes::from_static(b"T")),
                registration_summary: None,
                client_time_ms: 1,
                max_known_server_time_ms: 0,
                message_id: "1".to_owned(),
            }),
            ..Default::default()
        }
    }

    fn inbound() -> ServerToClientMessage {
        ServerToClientMessage::new(ServerHeader {
            protocol_version: ProtocolVersion::current(),
            client_token: Bytes::from_static(b"T"),
            registration_summary: None,
            server_time_ms: 0,
            message_id: None,
        })
    }

    #[test]
    fn outbound_without_header_is_rejected() {
        let validator = DefaultMessageValidator;
        assert_eq!(
            validator.validate_outbound(&ClientToServerMessage::default()),
            Err(ValidationError::MissingField("header"))
        );
        assert!(validator.validate_outbound(&outbound_with_header()).is_ok());
    }

    #[test]
    fn initialize_requires_nonce_and_client_name() {
        let validator = DefaultMessageValidator;
        let mut message = outbound_with_header();
        message.initialize_message = Some(InitializeMessage {
            client_type: 4,
            application_client_id: ApplicationClientId {
                client_name: Bytes::from_static(b"app"),
            },
            nonce: Bytes::new(),
            digest_serialization_type: DigestSerializationType::ByteBased,
        });
        assert_eq!(
            validator.validate_outbound(&message),
            Err(ValidationError::MissingField("nonce"))
        );
    }

    #[test]
    fn zero_quiet_delay_is_rejected() {
        let validator = DefaultMessageValidator;
        let mut message = inbound();
        message.config_change_message = Some(ConfigChangeMessage {
            next_message_delay_ms: Some(0),
        });
        assert!(validator.validate_inbound(&message).is_err());

        message.config_change_message = Some(ConfigChangeMessage {
            next_message_delay_ms: Some(1),
        });
        assert!(validator.validate_inbound(&message).is_ok());
    }

    #[test]
    fn negative_invalidation_version_is_rejected() {
        let validator = DefaultMessageValidator;
        let mut message = inbound();
        message.invalidation_message = Some(InvalidationMessage {
            invalidations: vec![Invalidation {
                object_id: ObjectId::new(4, &b"x"[..]),
                version: -1,
                is_known_version: true,
                payload: None,
            }],
        });
        assert!(validator.validate_inbound(&message).is_err());
    }
}

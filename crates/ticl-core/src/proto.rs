//! Wire message schemas and CBOR encoding for the client/server protocol.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::object::{
    Invalidation, ObjectId, Registration, RegistrationOp, RegistrationStatus, RegistrationSubtree,
    RegistrationSummary, Status, StatusCode,
};

pub const PROTOCOL_MAJOR_VERSION: u32 = 3;
pub const PROTOCOL_MINOR_VERSION: u32 = 2;
pub const CLIENT_MAJOR_VERSION: u32 = 3;
pub const CLIENT_MINOR_VERSION: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub fn current() -> Self {
        Self {
            major: PROTOCOL_MAJOR_VERSION,
            minor: PROTOCOL_MINOR_VERSION,
        }
    }
}

/// Identifies the client software to the server, carried in info messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientVersion {
    pub version: ProtocolVersion,
    pub platform: String,
    pub language: String,
    pub application_info: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientHeader {
    pub protocol_version: ProtocolVersion,
    pub client_token: Option<Bytes>,
    pub registration_summary: Option<RegistrationSummary>,
    pub client_time_ms: u64,
    pub max_known_server_time_ms: u64,
    pub message_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerHeader {
    pub protocol_version: ProtocolVersion,
    pub client_token: Bytes,
    pub registration_summary: Option<RegistrationSummary>,
    pub server_time_ms: u64,
    pub message_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestSerializationType {
    ByteBased,
    NumberBased,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationClientId {
    pub client_name: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InitializeMessage {
    pub client_type: i32,
    pub application_client_id: ApplicationClientId,
    pub nonce: Bytes,
    pub digest_serialization_type: DigestSerializationType,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrationMessage {
    pub registrations: Vec<Registration>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrationSyncMessage {
    pub subtrees: Vec<RegistrationSubtree>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvalidationMessage {
    pub invalidations: Vec<Invalidation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyRecord {
    pub name: String,
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InfoMessage {
    pub client_version: ClientVersion,
    pub config_parameters: Vec<PropertyRecord>,
    pub performance_counters: Vec<PropertyRecord>,
    pub server_registration_summary_requested: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenControlMessage {
    pub new_token: Option<Bytes>,
    pub status: Status,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrationStatusMessage {
    pub registration_statuses: Vec<RegistrationStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrationSyncRequestMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoRequestType {
    GetPerformanceCounters,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InfoRequestMessage {
    pub info_types: Vec<InfoRequestType>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigChangeMessage {
    pub next_message_delay_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    AuthFailure,
    UnknownFailure,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub description: String,
}

/// Outbound envelope. The header is absent until the protocol handler
/// assembles the message for sending.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientToServerMessage {
    pub header: Option<ClientHeader>,
    pub initialize_message: Option<InitializeMessage>,
    pub registration_message: Option<RegistrationMessage>,
    pub registration_sync_message: Option<RegistrationSyncMessage>,
    pub invalidation_ack_message: Option<InvalidationMessage>,
    pub info_message: Option<InfoMessage>,
    pub poll_invalidations: bool,
}

impl ClientToServerMessage {
    /// Whether the message carries object-control content (registrations,
    /// acks, or sync subtrees).
    pub fn is_object_control(&self) -> bool {
        self.registration_message.is_some()
            || self.registration_sync_message.is_some()
            || self.invalidation_ack_message.is_some()
    }
}

/// Inbound envelope. Heartbeat and poll intervals ride on the envelope so
/// the server can retune the client without a dedicated message.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerToClientMessage {
    pub header: ServerHeader,
    pub token_control_message: Option<TokenControlMessage>,
    pub invalidation_message: Option<InvalidationMessage>,
    pub registration_status_message: Option<RegistrationStatusMessage>,
    pub registration_sync_request_message: Option<RegistrationSyncRequestMessage>,
    pub info_request_message: Option<InfoRequestMessage>,
    pub config_change_message: Option<ConfigChangeMessage>,
    pub error_message: Option<ErrorMessage>,
    pub heartbeat_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl ServerToClientMessage {
    pub fn new(header: ServerHeader) -> Self {
        Self {
            header,
            token_control_message: None,
            invalidation_message: None,
            registration_status_message: None,
            registration_sync_request_message: None,
            info_request_message: None,
            config_change_message: None,
            error_message: None,
            heartbeat_interval_ms: None,
            poll_interval_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode error: {0}")]
    Cbor(String),
}

impl From<minicbor::encode::Error<Infallible>> for ProtoEncodeError {
    fn from(err: minicbor::encode::Error<Infallible>) -> Self {
        Self::Cbor(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("cbor decode error: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("indefinite-length item rejected")]
    IndefiniteLength,
    #[error("unknown enum value for {field}: {value}")]
    UnknownEnum { field: &'static str, value: u64 },
}

type EncodeResult = Result<(), ProtoEncodeError>;
type Enc<'a> = Encoder<&'a mut Vec<u8>>;

pub fn encode_client_message(message: &ClientToServerMessage) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    let mut len = 0;
    len += u64::from(message.header.is_some());
    len += u64::from(message.initialize_message.is_some());
    len += u64::from(message.registration_message.is_some());
    len += u64::from(message.registration_sync_message.is_some());
    len += u64::from(message.invalidation_ack_message.is_some());
    len += u64::from(message.info_message.is_some());
    len += u64::from(message.poll_invalidations);
    enc.map(len)?;

    if let Some(header) = &message.header {
        enc.str("header")?;
        encode_client_header(&mut enc, header)?;
    }
    if let Some(init) = &message.initialize_message {
        enc.str("initialize_message")?;
        encode_initialize(&mut enc, init)?;
    }
    if let Some(reg) = &message.registration_message {
        enc.str("registration_message")?;
        encode_registration_message(&mut enc, reg)?;
    }
    if let Some(sync) = &message.registration_sync_message {
        enc.str("registration_sync_message")?;
        encode_registration_sync(&mut enc, sync)?;
    }
    if let Some(acks) = &message.invalidation_ack_message {
        enc.str("invalidation_ack_message")?;
        encode_invalidation_message(&mut enc, acks)?;
    }
    if let Some(info) = &message.info_message {
        enc.str("info_message")?;
        encode_info_message(&mut enc, info)?;
    }
    if message.poll_invalidations {
        enc.str("poll_invalidations")?;
        enc.bool(true)?;
    }

    Ok(buf)
}

pub fn decode_client_message(bytes: &[u8]) -> Result<ClientToServerMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut message = ClientToServerMessage::default();
    for _ in 0..map_len {
        match dec.str()? {
            "header" => message.header = Some(decode_client_header(&mut dec)?),
            "initialize_message" => {
                message.initialize_message = Some(decode_initialize(&mut dec)?)
            }
            "registration_message" => {
                message.registration_message = Some(decode_registration_message(&mut dec)?)
            }
            "registration_sync_message" => {
                message.registration_sync_message = Some(decode_registration_sync(&mut dec)?)
            }
            "invalidation_ack_message" => {
                message.invalidation_ack_message = Some(decode_invalidation_message(&mut dec)?)
            }
            "info_message" => message.info_message = Some(decode_info_message(&mut dec)?),
            "poll_invalidations" => message.poll_invalidations = dec.bool()?,
            _ => dec.skip()?,
        }
    }
    Ok(message)
}

pub fn encode_server_message(message: &ServerToClientMessage) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    let mut len = 1;
    len += u64::from(message.token_control_message.is_some());
    len += u64::from(message.invalidation_message.is_some());
    len += u64::from(message.registration_status_message.is_some());
    len += u64::from(message.registration_sync_request_message.is_some());
    len += u64::from(message.info_request_message.is_some());
    len += u64::from(message.config_change_message.is_some());
    len += u64::from(message.error_message.is_some());
    len += u64::from(message.heartbeat_interval_ms.is_some());
    len += u64::from(message.poll_interval_ms.is_some());
    enc.map(len)?;

    enc.str("header")?;
    encode_server_header(&mut enc, &message.header)?;

    if let Some(token_control) = &message.token_control_message {
        enc.str("token_control_message")?;
        encode_token_control(&mut enc, token_control)?;
    }
    if let Some(invalidations) = &message.invalidation_message {
        enc.str("invalidation_message")?;
        encode_invalidation_message(&mut enc, invalidations)?;
    }
    if let Some(statuses) = &message.registration_status_message {
        enc.str("registration_status_message")?;
        encode_registration_status_message(&mut enc, statuses)?;
    }
    if message.registration_sync_request_message.is_some() {
        enc.str("registration_sync_request_message")?;
        enc.map(0)?;
    }
    if let Some(info_request) = &message.info_request_message {
        enc.str("info_request_message")?;
        encode_info_request(&mut enc, info_request)?;
    }
    if let Some(config_change) = &message.config_change_message {
        enc.str("config_change_message")?;
        encode_config_change(&mut enc, config_change)?;
    }
    if let Some(error) = &message.error_message {
        enc.str("error_message")?;
        encode_error_message(&mut enc, error)?;
    }
    if let Some(heartbeat) = message.heartbeat_interval_ms {
        enc.str("heartbeat_interval_ms")?;
        enc.u64(heartbeat)?;
    }
    if let Some(poll) = message.poll_interval_ms {
        enc.str("poll_interval_ms")?;
        enc.u64(poll)?;
    }

    Ok(buf)
}

pub fn decode_server_message(bytes: &[u8]) -> Result<ServerToClientMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut header = None;
    let mut token_control_message = None;
    let mut invalidation_message = None;
    let mut registration_status_message = None;
    let mut registration_sync_request_message = None;
    let mut info_request_message = None;
    let mut config_change_message = None;
    let mut error_message = None;
    let mut heartbeat_interval_ms = None;
    let mut poll_interval_ms = None;

    for _ in 0..map_len {
        match dec.str()? {
            "header" => header = Some(decode_server_header(&mut dec)?),
            "token_control_message" => {
                token_control_message = Some(decode_token_control(&mut dec)?)
            }
            "invalidation_message" => {
                invalidation_message = Some(decode_invalidation_message(&mut dec)?)
            }
            "registration_status_message" => {
                registration_status_message = Some(decode_registration_status_message(&mut dec)?)
            }
            "registration_sync_request_message" => {
                let len = decode_map_len(&mut dec)?;
                for _ in 0..len {
                    dec.str()?;
                    dec.skip()?;
                }
                registration_sync_request_message = Some(RegistrationSyncRequestMessage);
            }
            "info_request_message" => info_request_message = Some(decode_info_request(&mut dec)?),
            "config_change_message" => {
                config_change_message = Some(decode_config_change(&mut dec)?)
            }
            "error_message" => error_message = Some(decode_error_message(&mut dec)?),
            "heartbeat_interval_ms" => heartbeat_interval_ms = Some(dec.u64()?),
            "poll_interval_ms" => poll_interval_ms = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }

    Ok(ServerToClientMessage {
        header: header.ok_or(ProtoDecodeError::MissingField("header"))?,
        token_control_message,
        invalidation_message,
        registration_status_message,
        registration_sync_request_message,
        info_request_message,
        config_change_message,
        error_message,
        heartbeat_interval_ms,
        poll_interval_ms,
    })
}

fn encode_protocol_version(enc: &mut Enc<'_>, version: &ProtocolVersion) -> EncodeResult {
    enc.map(2)?;
    enc.str("major_version")?;
    enc.u32(version.major)?;
    enc.str("minor_version")?;
    enc.u32(version.minor)?;
    Ok(())
}

fn decode_protocol_version(dec: &mut Decoder) -> Result<ProtocolVersion, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut major = None;
    let mut minor = None;
    for _ in 0..map_len {
        match dec.str()? {
            "major_version" => major = Some(dec.u32()?),
            "minor_version" => minor = Some(dec.u32()?),
            _ => dec.skip()?,
        }
    }
    Ok(ProtocolVersion {
        major: major.ok_or(ProtoDecodeError::MissingField("major_version"))?,
        minor: minor.ok_or(ProtoDecodeError::MissingField("minor_version"))?,
    })
}

fn encode_registration_summary(enc: &mut Enc<'_>, summary: &RegistrationSummary) -> EncodeResult {
    enc.map(2)?;
    enc.str("num_registrations")?;
    enc.u32(summary.num_registrations)?;
    enc.str("registration_digest")?;
    enc.bytes(&summary.digest)?;
    Ok(())
}

fn decode_registration_summary(dec: &mut Decoder) -> Result<RegistrationSummary, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut num_registrations = None;
    let mut digest = None;
    for _ in 0..map_len {
        match dec.str()? {
            "num_registrations" => num_registrations = Some(dec.u32()?),
            "registration_digest" => digest = Some(decode_bytes(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(RegistrationSummary {
        num_registrations: num_registrations
            .ok_or(ProtoDecodeError::MissingField("num_registrations"))?,
        digest: digest.ok_or(ProtoDecodeError::MissingField("registration_digest"))?,
    })
}

fn encode_client_header(enc: &mut Enc<'_>, header: &ClientHeader) -> EncodeResult {
    let mut len = 4;
    len += u64::from(header.client_token.is_some());
    len += u64::from(header.registration_summary.is_some());
    enc.map(len)?;

    enc.str("protocol_version")?;
    encode_protocol_version(enc, &header.protocol_version)?;
    if let Some(token) = &header.client_token {
        enc.str("client_token")?;
        enc.bytes(token)?;
    }
    if let Some(summary) = &header.registration_summary {
        enc.str("registration_summary")?;
        encode_registration_summary(enc, summary)?;
    }
    enc.str("client_time_ms")?;
    enc.u64(header.client_time_ms)?;
    enc.str("max_known_server_time_ms")?;
    enc.u64(header.max_known_server_time_ms)?;
    enc.str("message_id")?;
    enc.str(&header.message_id)?;
    Ok(())
}

fn decode_client_header(dec: &mut Decoder) -> Result<ClientHeader, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut protocol_version = None;
    let mut client_token = None;
    let mut registration_summary = None;
    let mut client_time_ms = None;
    let mut max_known_server_time_ms = None;
    let mut message_id = None;
    for _ in 0..map_len {
        match dec.str()? {
            "protocol_version" => protocol_version = Some(decode_protocol_version(dec)?),
            "client_token" => client_token = Some(decode_bytes(dec)?),
            "registration_summary" => {
                registration_summary = Some(decode_registration_summary(dec)?)
            }
            "client_time_ms" => client_time_ms = Some(dec.u64()?),
            "max_known_server_time_ms" => max_known_server_time_ms = Some(dec.u64()?),
            "message_id" => message_id = Some(dec.str()?.to_owned()),
            _ => dec.skip()?,
        }
    }
    Ok(ClientHeader {
        protocol_version: protocol_version
            .ok_or(ProtoDecodeError::MissingField("protocol_version"))?,
        client_token,
        registration_summary,
        client_time_ms: client_time_ms.ok_or(ProtoDecodeError::MissingField("client_time_ms"))?,
        max_known_server_time_ms: max_known_server_time_ms
            .ok_or(ProtoDecodeError::MissingField("max_known_server_time_ms"))?,
        message_id: message_id.ok_or(ProtoDecodeError::MissingField("message_id"))?,
    })
}

fn encode_server_header(enc: &mut Enc<'_>, header: &ServerHeader) -> EncodeResult {
    let mut len = 3;
    len += u64::from(header.registration_summary.is_some());
    len += u64::from(header.message_id.is_some());
    enc.map(len)?;

    enc.str("protocol_version")?;
    encode_protocol_version(enc, &header.protocol_version)?;
    enc.str("client_token")?;
    enc.bytes(&header.client_token)?;
    if let Some(summary) = &header.registration_summary {
        enc.str("registration_summary")?;
        encode_registration_summary(enc, summary)?;
    }
    enc.str("server_time_ms")?;
    enc.u64(header.server_time_ms)?;
    if let Some(message_id) = &header.message_id {
        enc.str("message_id")?;
        enc.str(message_id)?;
    }
    Ok(())
}

fn decode_server_header(dec: &mut Decoder) -> Result<ServerHeader, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut protocol_version = None;
    let mut client_token = None;
    let mut registration_summary = None;
    let mut server_time_ms = None;
    let mut message_id = None;
    for _ in 0..map_len {
        match dec.str()? {
            "protocol_version" => protocol_version = Some(decode_protocol_version(dec)?),
            "client_token" => client_token = Some(decode_bytes(dec)?),
            "registration_summary" => {
                registration_summary = Some(decode_registration_summary(dec)?)
            }
            "server_time_ms" => server_time_ms = Some(dec.u64()?),
            "message_id" => message_id = Some(dec.str()?.to_owned()),
            _ => dec.skip()?,
        }
    }
    Ok(ServerHeader {
        protocol_version: protocol_version
            .ok_or(ProtoDecodeError::MissingField("protocol_version"))?,
        client_token: client_token.ok_or(ProtoDecodeError::MissingField("client_token"))?,
        registration_summary,
        server_time_ms: server_time_ms.ok_or(ProtoDecodeError::MissingField("server_time_ms"))?,
        message_id,
    })
}

fn encode_object_id(enc: &mut Enc<'_>, object_id: &ObjectId) -> EncodeResult {
    enc.map(2)?;
    enc.str("source")?;
    enc.i32(object_id.source())?;
    enc.str("name")?;
    enc.bytes(object_id.name())?;
    Ok(())
}

fn decode_object_id(dec: &mut Decoder) -> Result<ObjectId, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut source = None;
    let mut name = None;
    for _ in 0..map_len {
        match dec.str()? {
            "source" => source = Some(dec.i32()?),
            "name" => name = Some(decode_bytes(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(ObjectId::new(
        source.ok_or(ProtoDecodeError::MissingField("source"))?,
        name.ok_or(ProtoDecodeError::MissingField("name"))?,
    ))
}

fn encode_invalidation(enc: &mut Enc<'_>, invalidation: &Invalidation) -> EncodeResult {
    let len = 3 + u64::from(invalidation.payload.is_some());
    enc.map(len)?;
    enc.str("object_id")?;
    encode_object_id(enc, &invalidation.object_id)?;
    enc.str("version")?;
    enc.i64(invalidation.version)?;
    enc.str("is_known_version")?;
    enc.bool(invalidation.is_known_version)?;
    if let Some(payload) = &invalidation.payload {
        enc.str("payload")?;
        enc.bytes(payload)?;
    }
    Ok(())
}

fn decode_invalidation(dec: &mut Decoder) -> Result<Invalidation, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut object_id = None;
    let mut version = None;
    let mut is_known_version = None;
    let mut payload = None;
    for _ in 0..map_len {
        match dec.str()? {
            "object_id" => object_id = Some(decode_object_id(dec)?),
            "version" => version = Some(dec.i64()?),
            "is_known_version" => is_known_version = Some(dec.bool()?),
            "payload" => payload = Some(decode_bytes(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(Invalidation {
        object_id: object_id.ok_or(ProtoDecodeError::MissingField("object_id"))?,
        version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        is_known_version: is_known_version
            .ok_or(ProtoDecodeError::MissingField("is_known_version"))?,
        payload,
    })
}

fn encode_invalidation_message(enc: &mut Enc<'_>, message: &InvalidationMessage) -> EncodeResult {
    enc.map(1)?;
    enc.str("invalidation")?;
    enc.array(message.invalidations.len() as u64)?;
    for invalidation in &message.invalidations {
        encode_invalidation(enc, invalidation)?;
    }
    Ok(())
}

fn decode_invalidation_message(dec: &mut Decoder) -> Result<InvalidationMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut invalidations = Vec::new();
    for _ in 0..map_len {
        match dec.str()? {
            "invalidation" => {
                let len = decode_array_len(dec)?;
                for _ in 0..len {
                    invalidations.push(decode_invalidation(dec)?);
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(InvalidationMessage { invalidations })
}

fn registration_op_to_wire(op: RegistrationOp) -> u32 {
    match op {
        RegistrationOp::Register => 1,
        RegistrationOp::Unregister => 2,
    }
}

fn registration_op_from_wire(value: u32) -> Result<RegistrationOp, ProtoDecodeError> {
    match value {
        1 => Ok(RegistrationOp::Register),
        2 => Ok(RegistrationOp::Unregister),
        other => Err(ProtoDecodeError::UnknownEnum {
            field: "op_type",
            value: u64::from(other),
        }),
    }
}

fn encode_registration(enc: &mut Enc<'_>, registration: &Registration) -> EncodeResult {
    enc.map(2)?;
    enc.str("object_id")?;
    encode_object_id(enc, &registration.object_id)?;
    enc.str("op_type")?;
    enc.u32(registration_op_to_wire(registration.op))?;
    Ok(())
}

fn decode_registration(dec: &mut Decoder) -> Result<Registration, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut object_id = None;
    let mut op = None;
    for _ in 0..map_len {
        match dec.str()? {
            "object_id" => object_id = Some(decode_object_id(dec)?),
            "op_type" => op = Some(registration_op_from_wire(dec.u32()?)?),
            _ => dec.skip()?,
        }
    }
    Ok(Registration {
        object_id: object_id.ok_or(ProtoDecodeError::MissingField("object_id"))?,
        op: op.ok_or(ProtoDecodeError::MissingField("op_type"))?,
    })
}

fn encode_registration_message(enc: &mut Enc<'_>, message: &RegistrationMessage) -> EncodeResult {
    enc.map(1)?;
    enc.str("registration")?;
    enc.array(message.registrations.len() as u64)?;
    for registration in &message.registrations {
        encode_registration(enc, registration)?;
    }
    Ok(())
}

fn decode_registration_message(dec: &mut Decoder) -> Result<RegistrationMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut registrations = Vec::new();
    for _ in 0..map_len {
        match dec.str()? {
            "registration" => {
                let len = decode_array_len(dec)?;
                for _ in 0..len {
                    registrations.push(decode_registration(dec)?);
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(RegistrationMessage { registrations })
}

fn encode_registration_subtree(enc: &mut Enc<'_>, subtree: &RegistrationSubtree) -> EncodeResult {
    enc.map(1)?;
    enc.str("registered_object")?;
    enc.array(subtree.registered_objects.len() as u64)?;
    for object_id in &subtree.registered_objects {
        encode_object_id(enc, object_id)?;
    }
    Ok(())
}

fn decode_registration_subtree(dec: &mut Decoder) -> Result<RegistrationSubtree, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut registered_objects = Vec::new();
    for _ in 0..map_len {
        match dec.str()? {
            "registered_object" => {
                let len = decode_array_len(dec)?;
                for _ in 0..len {
                    registered_objects.push(decode_object_id(dec)?);
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(RegistrationSubtree { registered_objects })
}

fn encode_registration_sync(enc: &mut Enc<'_>, message: &RegistrationSyncMessage) -> EncodeResult {
    enc.map(1)?;
    enc.str("subtree")?;
    enc.array(message.subtrees.len() as u64)?;
    for subtree in &message.subtrees {
        encode_registration_subtree(enc, subtree)?;
    }
    Ok(())
}

fn decode_registration_sync(dec: &mut Decoder) -> Result<RegistrationSyncMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut subtrees = Vec::new();
    for _ in 0..map_len {
        match dec.str()? {
            "subtree" => {
                let len = decode_array_len(dec)?;
                for _ in 0..len {
                    subtrees.push(decode_registration_subtree(dec)?);
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(RegistrationSyncMessage { subtrees })
}

fn status_code_to_wire(code: StatusCode) -> u32 {
    match code {
        StatusCode::Success => 1,
        StatusCode::TransientFailure => 2,
        StatusCode::PermanentFailure => 3,
    }
}

fn status_code_from_wire(value: u32) -> Result<StatusCode, ProtoDecodeError> {
    match value {
        1 => Ok(StatusCode::Success),
        2 => Ok(StatusCode::TransientFailure),
        3 => Ok(StatusCode::PermanentFailure),
        other => Err(ProtoDecodeError::UnknownEnum {
            field: "code",
            value: u64::from(other),
        }),
    }
}

fn encode_status(enc: &mut Enc<'_>, status: &Status) -> EncodeResult {
    enc.map(2)?;
    enc.str("code")?;
    enc.u32(status_code_to_wire(status.code))?;
    enc.str("description")?;
    enc.str(&status.description)?;
    Ok(())
}

fn decode_status(dec: &mut Decoder) -> Result<Status, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut code = None;
    let mut description = None;
    for _ in 0..map_len {
        match dec.str()? {
            "code" => code = Some(status_code_from_wire(dec.u32()?)?),
            "description" => description = Some(dec.str()?.to_owned()),
            _ => dec.skip()?,
        }
    }
    Ok(Status {
        code: code.ok_or(ProtoDecodeError::MissingField("code"))?,
        description: description.unwrap_or_default(),
    })
}

fn encode_registration_status_message(
    enc: &mut Enc<'_>,
    message: &RegistrationStatusMessage,
) -> EncodeResult {
    enc.map(1)?;
    enc.str("registration_status")?;
    enc.array(message.registration_statuses.len() as u64)?;
    for status in &message.registration_statuses {
        enc.map(2)?;
        enc.str("registration")?;
        encode_registration(enc, &status.registration)?;
        enc.str("status")?;
        encode_status(enc, &status.status)?;
    }
    Ok(())
}

fn decode_registration_status_message(
    dec: &mut Decoder,
) -> Result<RegistrationStatusMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut registration_statuses = Vec::new();
    for _ in 0..map_len {
        match dec.str()? {
            "registration_status" => {
                let len = decode_array_len(dec)?;
                for _ in 0..len {
                    let entry_len = decode_map_len(dec)?;
                    let mut registration = None;
                    let mut status = None;
                    for _ in 0..entry_len {
                        match dec.str()? {
                            "registration" => registration = Some(decode_registration(dec)?),
                            "status" => status = Some(decode_status(dec)?),
                            _ => dec.skip()?,
                        }
                    }
                    registration_statuses.push(RegistrationStatus {
                        registration: registration
                            .ok_or(ProtoDecodeError::MissingField("registration"))?,
                        status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
                    });
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(RegistrationStatusMessage {
        registration_statuses,
    })
}

fn encode_initialize(enc: &mut Enc<'_>, message: &InitializeMessage) -> EncodeResult {
    enc.map(4)?;
    enc.str("client_type")?;
    enc.i32(message.client_type)?;
    enc.str("application_client_id")?;
    enc.map(1)?;
    enc.str("client_name")?;
    enc.bytes(&message.application_client_id.client_name)?;
    enc.str("nonce")?;
    enc.bytes(&message.nonce)?;
    enc.str("digest_serialization_type")?;
    enc.u32(match message.digest_serialization_type {
        DigestSerializationType::ByteBased => 1,
        DigestSerializationType::NumberBased => 2,
    })?;
    Ok(())
}

fn decode_initialize(dec: &mut Decoder) -> Result<InitializeMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut client_type = None;
    let mut application_client_id = None;
    let mut nonce = None;
    let mut digest_serialization_type = None;
    for _ in 0..map_len {
        match dec.str()? {
            "client_type" => client_type = Some(dec.i32()?),
            "application_client_id" => {
                let inner_len = decode_map_len(dec)?;
                let mut client_name = None;
                for _ in 0..inner_len {
                    match dec.str()? {
                        "client_name" => client_name = Some(decode_bytes(dec)?),
                        _ => dec.skip()?,
                    }
                }
                application_client_id = Some(ApplicationClientId {
                    client_name: client_name
                        .ok_or(ProtoDecodeError::MissingField("client_name"))?,
                });
            }
            "nonce" => nonce = Some(decode_bytes(dec)?),
            "digest_serialization_type" => {
                digest_serialization_type = Some(match dec.u32()? {
                    1 => DigestSerializationType::ByteBased,
                    2 => DigestSerializationType::NumberBased,
                    other => {
                        return Err(ProtoDecodeError::UnknownEnum {
                            field: "digest_serialization_type",
                            value: u64::from(other),
                        });
                    }
                })
            }
            _ => dec.skip()?,
        }
    }
    Ok(InitializeMessage {
        client_type: client_type.ok_or(ProtoDecodeError::MissingField("client_type"))?,
        application_client_id: application_client_id
            .ok_or(ProtoDecodeError::MissingField("application_client_id"))?,
        nonce: nonce.ok_or(ProtoDecodeError::MissingField("nonce"))?,
        digest_serialization_type: digest_serialization_type
            .ok_or(ProtoDecodeError::MissingField("digest_serialization_type"))?,
    })
}

fn encode_property_records(enc: &mut Enc<'_>, records: &[PropertyRecord]) -> EncodeResult {
    enc.array(records.len() as u64)?;
    for record in records {
        enc.map(2)?;
        enc.str("name")?;
        enc.str(&record.name)?;
        enc.str("value")?;
        enc.i64(record.value)?;
    }
    Ok(())
}

fn decode_property_records(dec: &mut Decoder) -> Result<Vec<PropertyRecord>, ProtoDecodeError> {
    let len = decode_array_len(dec)?;
    let mut records = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let map_len = decode_map_len(dec)?;
        let mut name = None;
        let mut value = None;
        for _ in 0..map_len {
            match dec.str()? {
                "name" => name = Some(dec.str()?.to_owned()),
                "value" => value = Some(dec.i64()?),
                _ => dec.skip()?,
            }
        }
        records.push(PropertyRecord {
            name: name.ok_or(ProtoDecodeError::MissingField("name"))?,
            value: value.ok_or(ProtoDecodeError::MissingField("value"))?,
        });
    }
    Ok(records)
}

fn encode_client_version(enc: &mut Enc<'_>, version: &ClientVersion) -> EncodeResult {
    enc.map(4)?;
    enc.str("version")?;
    encode_protocol_version(enc, &version.version)?;
    enc.str("platform")?;
    enc.str(&version.platform)?;
    enc.str("language")?;
    enc.str(&version.language)?;
    enc.str("application_info")?;
    enc.str(&version.application_info)?;
    Ok(())
}

fn decode_client_version(dec: &mut Decoder) -> Result<ClientVersion, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut version = None;
    let mut platform = None;
    let mut language = None;
    let mut application_info = None;
    for _ in 0..map_len {
        match dec.str()? {
            "version" => version = Some(decode_protocol_version(dec)?),
            "platform" => platform = Some(dec.str()?.to_owned()),
            "language" => language = Some(dec.str()?.to_owned()),
            "application_info" => application_info = Some(dec.str()?.to_owned()),
            _ => dec.skip()?,
        }
    }
    Ok(ClientVersion {
        version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        platform: platform.ok_or(ProtoDecodeError::MissingField("platform"))?,
        language: language.ok_or(ProtoDecodeError::MissingField("language"))?,
        application_info: application_info
            .ok_or(ProtoDecodeError::MissingField("application_info"))?,
    })
}

fn encode_info_message(enc: &mut Enc<'_>, message: &InfoMessage) -> EncodeResult {
    enc.map(4)?;
    enc.str("client_version")?;
    encode_client_version(enc, &message.client_version)?;
    enc.str("config_parameter")?;
    encode_property_records(enc, &message.config_parameters)?;
    enc.str("performance_counter")?;
    encode_property_records(enc, &message.performance_counters)?;
    enc.str("server_registration_summary_requested")?;
    enc.bool(message.server_registration_summary_requested)?;
    Ok(())
}

fn decode_info_message(dec: &mut Decoder) -> Result<InfoMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut client_version = None;
    let mut config_parameters = Vec::new();
    let mut performance_counters = Vec::new();
    let mut server_registration_summary_requested = false;
    for _ in 0..map_len {
        match dec.str()? {
            "client_version" => client_version = Some(decode_client_version(dec)?),
            "config_parameter" => config_parameters = decode_property_records(dec)?,
            "performance_counter" => performance_counters = decode_property_records(dec)?,
            "server_registration_summary_requested" => {
                server_registration_summary_requested = dec.bool()?
            }
            _ => dec.skip()?,
        }
    }
    Ok(InfoMessage {
        client_version: client_version.ok_or(ProtoDecodeError::MissingField("client_version"))?,
        config_parameters,
        performance_counters,
        server_registration_summary_requested,
    })
}

fn encode_token_control(enc: &mut Enc<'_>, message: &TokenControlMessage) -> EncodeResult {
    let len = 1 + u64::from(message.new_token.is_some());
    enc.map(len)?;
    if let Some(token) = &message.new_token {
        enc.str("new_token")?;
        enc.bytes(token)?;
    }
    enc.str("status")?;
    encode_status(enc, &message.status)?;
    Ok(())
}

fn decode_token_control(dec: &mut Decoder) -> Result<TokenControlMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut new_token = None;
    let mut status = None;
    for _ in 0..map_len {
        match dec.str()? {
            "new_token" => new_token = Some(decode_bytes(dec)?),
            "status" => status = Some(decode_status(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(TokenControlMessage {
        new_token,
        status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
    })
}

fn encode_info_request(enc: &mut Enc<'_>, message: &InfoRequestMessage) -> EncodeResult {
    enc.map(1)?;
    enc.str("info_type")?;
    enc.array(message.info_types.len() as u64)?;
    for info_type in &message.info_types {
        enc.u32(match info_type {
            InfoRequestType::GetPerformanceCounters => 1,
        })?;
    }
    Ok(())
}

fn decode_info_request(dec: &mut Decoder) -> Result<InfoRequestMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut info_types = Vec::new();
    for _ in 0..map_len {
        match dec.str()? {
            "info_type" => {
                let len = decode_array_len(dec)?;
                for _ in 0..len {
                    info_types.push(match dec.u32()? {
                        1 => InfoRequestType::GetPerformanceCounters,
                        other => {
                            return Err(ProtoDecodeError::UnknownEnum {
                                field: "info_type",
                                value: u64::from(other),
                            });
                        }
                    });
                }
            }
            _ => dec.skip()?,
        }
    }
    Ok(InfoRequestMessage { info_types })
}

fn encode_config_change(enc: &mut Enc<'_>, message: &ConfigChangeMessage) -> EncodeResult {
    enc.map(u64::from(message.next_message_delay_ms.is_some()))?;
    if let Some(delay) = message.next_message_delay_ms {
        enc.str("next_message_delay_ms")?;
        enc.u64(delay)?;
    }
    Ok(())
}

fn decode_config_change(dec: &mut Decoder) -> Result<ConfigChangeMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut next_message_delay_ms = None;
    for _ in 0..map_len {
        match dec.str()? {
            "next_message_delay_ms" => next_message_delay_ms = Some(dec.u64()?),
            _ => dec.skip()?,
        }
    }
    Ok(ConfigChangeMessage {
        next_message_delay_ms,
    })
}

fn encode_error_message(enc: &mut Enc<'_>, message: &ErrorMessage) -> EncodeResult {
    enc.map(2)?;
    enc.str("code")?;
    enc.u32(match message.code {
        ErrorCode::AuthFailure => 1,
        ErrorCode::UnknownFailure => 10_000,
    })?;
    enc.str("description")?;
    enc.str(&message.description)?;
    Ok(())
}

fn decode_error_message(dec: &mut Decoder) -> Result<ErrorMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut code = None;
    let mut description = None;
    for _ in 0..map_len {
        match dec.str()? {
            "code" => {
                code = Some(match dec.u32()? {
                    1 => ErrorCode::AuthFailure,
                    10_000 => ErrorCode::UnknownFailure,
                    other => {
                        return Err(ProtoDecodeError::UnknownEnum {
                            field: "code",
                            value: u64::from(other),
                        });
                    }
                })
            }
            "description" => description = Some(dec.str()?.to_owned()),
            _ => dec.skip()?,
        }
    }
    Ok(ErrorMessage {
        code: code.ok_or(ProtoDecodeError::MissingField("code"))?,
        description: description.unwrap_or_default(),
    })
}

fn decode_map_len(dec: &mut Decoder) -> Result<u64, ProtoDecodeError> {
    dec.map()?.ok_or(ProtoDecodeError::IndefiniteLength)
}

fn decode_array_len(dec: &mut Decoder) -> Result<u64, ProtoDecodeError> {
    dec.array()?.ok_or(ProtoDecodeError::IndefiniteLength)
}

fn decode_bytes(dec: &mut Decoder) -> Result<Bytes, ProtoDecodeError> {
    Ok(Bytes::copy_from_slice(dec.bytes()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_header(token: &[u8]) -> ServerHeader {
        ServerHeader {
            protocol_version: ProtocolVersion::current(),
            client_token: Bytes::copy_from_slice(token),
            registration_summary: Some(RegistrationSummary {
                num_registrations: 1,
                digest: Bytes::from_static(b"\x01\x02"),
            }),
            server_time_ms: 300_000,
            message_id: Some("srv-1".to_owned()),
        }
    }

    #[test]
    fn composite_server_message_round_trips() {
        let mut message = ServerToClientMessage::new(server_header(b"T"));
        message.token_control_message = Some(TokenControlMessage {
            new_token: Some(Bytes::from_static(b"T")),
            status: Status::success(),
        });
        message.invalidation_message = Some(InvalidationMessage {
            invalidations: vec![Invalidation::new(ObjectId::new(4, &b"oid"[..]), 17)],
        });
        message.registration_status_message = Some(RegistrationStatusMessage {
            registration_statuses: vec![RegistrationStatus {
                registration: Registration {
                    object_id: ObjectId::new(4, &b"oid"[..]),
                    op: RegistrationOp::Register,
                },
                status: Status::new(StatusCode::TransientFailure, "retry"),
            }],
        });
        message.registration_sync_request_message = Some(RegistrationSyncRequestMessage);
        message.info_request_message = Some(InfoRequestMessage {
            info_types: vec![InfoRequestType::GetPerformanceCounters],
        });
        message.heartbeat_interval_ms = Some(60_000);

        let bytes = encode_server_message(&message).expect("encode");
        let decoded = decode_server_message(&bytes).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn client_message_with_batches_round_trips() {
        let oid = ObjectId::new(4, &b"oid"[..]);
        let message = ClientToServerMessage {
            header: Some(ClientHeader {
                protocol_version: ProtocolVersion::current(),
                client_token: Some(Bytes::from_static(b"T")),
                registration_summary: Some(RegistrationSummary {
                    num_registrations: 0,
                    digest: Bytes::from_static(b"\x00"),
                }),
                client_time_ms: 42,
                max_known_server_time_ms: 7,
                message_id: "1".to_owned(),
            }),
            initialize_message: None,
            registration_message: Some(RegistrationMessage {
                registrations: vec![Registration {
                    object_id: oid.clone(),
                    op: RegistrationOp::Unregister,
                }],
            }),
            registration_sync_message: Some(RegistrationSyncMessage {
                subtrees: vec![RegistrationSubtree {
                    registered_objects: vec![oid.clone()],
                }],
            }),
            invalidation_ack_message: Some(InvalidationMessage {
                invalidations: vec![Invalidation {
                    object_id: oid,
                    version: 3,
                    is_known_version: true,
                    payload: Some(Bytes::from_static(b"p")),
                }],
            }),
            info_message: None,
            poll_invalidations: true,
        };

        let bytes = encode_client_message(&message).expect("encode");
        let decoded = decode_client_message(&bytes).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("future_field").unwrap();
        enc.str("ignored").unwrap();
        enc.str("header").unwrap();
        encode_server_header(&mut enc, &server_header(b"T")).unwrap();

        let decoded = decode_server_message(&buf).expect("decode");
        assert_eq!(decoded.header.client_token, Bytes::from_static(b"T"));
    }

    #[test]
    fn missing_header_is_an_error() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(0).unwrap();

        match decode_server_message(&buf) {
            Err(ProtoDecodeError::MissingField("header")) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(decode_server_message(b"\xff\xff\xff").is_err());
    }
}

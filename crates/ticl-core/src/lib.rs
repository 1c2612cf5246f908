//! Shared protocol vocabulary for the Ticl cache-invalidation client: object
//! identities, registration types, digest functions, and the wire codec.

pub mod digest;
pub mod object;
pub mod proto;

pub use digest::{DigestFunction, Sha256Digest, object_id_digest, set_digest};
pub use object::{
    ClientToken, Invalidation, ObjectId, Registration, RegistrationOp, RegistrationStatus,
    RegistrationSubtree, RegistrationSummary, Status, StatusCode,
};
pub use proto::{
    ApplicationClientId, CLIENT_MAJOR_VERSION, CLIENT_MINOR_VERSION, ClientHeader,
    ClientToServerMessage, ClientVersion, ConfigChangeMessage, DigestSerializationType, ErrorCode,
    ErrorMessage, InfoMessage, InfoRequestMessage, InfoRequestType, InitializeMessage,
    InvalidationMessage, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION, PropertyRecord,
    ProtoDecodeError, ProtoEncodeError, ProtocolVersion, RegistrationMessage,
    RegistrationStatusMessage, RegistrationSyncMessage, RegistrationSyncRequestMessage,
    ServerHeader, ServerToClientMessage, TokenControlMessage, decode_client_message,
    decode_server_message, encode_client_message, encode_server_message,
};

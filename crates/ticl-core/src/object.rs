//! Object identities, invalidations, and registration value types.

use std::fmt;

use bytes::Bytes;

/// Identity of an object the application cares about: the numeric source
/// that issued the name, plus the opaque name bytes. Compared by value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    source: i32,
    name: Bytes,
}

impl ObjectId {
    pub fn new(source: i32, name: impl Into<Bytes>) -> Self {
        Self {
            source,
            name: name.into(),
        }
    }

    pub fn source(&self) -> i32 {
        self.source
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectId({}, {})",
            self.source,
            String::from_utf8_lossy(&self.name)
        )
    }
}

/// Registration operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegistrationOp {
    Register,
    Unregister,
}

/// A single registration operation on an object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Registration {
    pub object_id: ObjectId,
    pub op: RegistrationOp,
}

/// Fingerprint of a registration set: how many objects it holds and a
/// digest over their identities. Two equal summaries imply (probabilistically)
/// equal sets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationSummary {
    pub num_registrations: u32,
    pub digest: Bytes,
}

/// The registered objects whose per-object digest shares a given prefix,
/// exchanged during client/server reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegistrationSubtree {
    pub registered_objects: Vec<ObjectId>,
}

/// Object-scoped notification that a cached value is stale. Compared by
/// value so pending acks deduplicate.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Invalidation {
    pub object_id: ObjectId,
    pub version: i64,
    pub is_known_version: bool,
    pub payload: Option<Bytes>,
}

impl Invalidation {
    pub fn new(object_id: ObjectId, version: i64) -> Self {
        Self {
            object_id,
            version,
            is_known_version: true,
            payload: None,
        }
    }

    pub fn unknown_version(object_id: ObjectId) -> Self {
        Self {
            object_id,
            version: 0,
            is_known_version: false,
            payload: None,
        }
    }
}

/// Server-issued opaque session identifier. An empty token means the client
/// holds no session.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ClientToken(Bytes);

impl ClientToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientToken(")?;
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Outcome the server reports for an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    TransientFailure,
    PermanentFailure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub description: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            description: String::new(),
        }
    }

    pub fn new(code: StatusCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }
}

/// Per-registration outcome reported by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationStatus {
    pub registration: Registration,
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_equality_is_by_value() {
        let a = ObjectId::new(4, "alpha".as_bytes().to_vec());
        let b = ObjectId::new(4, "alpha".as_bytes().to_vec());
        let c = ObjectId::new(5, "alpha".as_bytes().to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn invalidation_dedup_is_by_value() {
        use std::collections::BTreeSet;

        let oid = ObjectId::new(1, "x".as_bytes().to_vec());
        let mut acks = BTreeSet::new();
        assert!(acks.insert(Invalidation::new(oid.clone(), 7)));
        assert!(!acks.insert(Invalidation::new(oid.clone(), 7)));
        assert!(acks.insert(Invalidation::new(oid, 8)));
        assert_eq!(acks.len(), 2);
    }

    #[test]
    fn empty_token_means_no_session() {
        assert!(ClientToken::empty().is_empty());
        assert!(ClientToken::default().is_empty());
        assert!(!ClientToken::new("T".as_bytes().to_vec()).is_empty());
    }
}

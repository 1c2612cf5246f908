//! Digest functions for object identities and registration-set summaries.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::object::ObjectId;

/// Hash primitive used for registration digests. Injected so that embedders
/// can substitute a cheaper or wire-mandated function.
pub trait DigestFunction: Send + Sync {
    fn digest(&self, data: &[u8]) -> Bytes;
}

/// Default digest function.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Digest;

impl DigestFunction for Sha256Digest {
    fn digest(&self, data: &[u8]) -> Bytes {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Bytes::copy_from_slice(&hasher.finalize())
    }
}

/// Digest of a single object id. The canonical serialization is the source
/// as a big-endian i32 followed by the raw name bytes, so that equal ids
/// digest identically on every platform.
pub fn object_id_digest(digest_fn: &dyn DigestFunction, object_id: &ObjectId) -> Bytes {
    let mut buf = Vec::with_capacity(4 + object_id.name().len());
    buf.extend_from_slice(&object_id.source().to_be_bytes());
    buf.extend_from_slice(object_id.name());
    digest_fn.digest(&buf)
}

/// Digest of a set of per-object digests, fed in ascending order. Callers
/// must present the digests sorted; the result is then independent of the
/// order in which objects were added to the set.
pub fn set_digest<'a>(
    digest_fn: &dyn DigestFunction,
    sorted_object_digests: impl Iterator<Item = &'a Bytes>,
) -> Bytes {
    let mut buf = Vec::new();
    for digest in sorted_object_digests {
        buf.extend_from_slice(digest);
    }
    digest_fn.digest(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_digest_distinguishes_source() {
        let f = Sha256Digest;
        let a = object_id_digest(&f, &ObjectId::new(1, "x".as_bytes().to_vec()));
        let b = object_id_digest(&f, &ObjectId::new(2, "x".as_bytes().to_vec()));
        assert_ne!(a, b);
    }

    #[test]
    fn set_digest_of_empty_iterator_is_digest_of_nothing() {
        let f = Sha256Digest;
        let empty = set_digest(&f, std::iter::empty());
        assert_eq!(empty, f.digest(&[]));
    }
}

//! The authoritative desired-registration set and its reconciliation with
//! server-reported registration status.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use ticl_core::digest::{DigestFunction, object_id_digest, set_digest};
use ticl_core::object::{
    ObjectId, RegistrationOp, RegistrationStatus, RegistrationSubtree, RegistrationSummary,
};

use crate::statistics::{ClientErrorType, Statistics};

/// Desired registrations keyed by per-object digest. Keeping the map sorted
/// by digest makes the set digest independent of insertion order and lets
/// subtree queries walk digest prefixes directly.
pub struct SimpleRegistrationStore {
    digest_fn: Arc<dyn DigestFunction>,
    registrations: BTreeMap<Bytes, ObjectId>,
    digest: Bytes,
}

impl SimpleRegistrationStore {
    pub fn new(digest_fn: Arc<dyn DigestFunction>) -> Self {
        let digest = set_digest(digest_fn.as_ref(), std::iter::empty());
        Self {
            digest_fn,
            registrations: BTreeMap::new(),
            digest,
        }
    }

    pub fn add(&mut self, object_id: ObjectId) -> bool {
        let key = object_id_digest(self.digest_fn.as_ref(), &object_id);
        let added = self.registrations.insert(key, object_id).is_none();
        if added {
            self.recompute_digest();
        }
        added
    }

    pub fn remove(&mut self, object_id: &ObjectId) -> bool {
        let key = object_id_digest(self.digest_fn.as_ref(), object_id);
        let removed = self.registrations.remove(&key).is_some();
        if removed {
            self.recompute_digest();
        }
        removed
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        let key = object_id_digest(self.digest_fn.as_ref(), object_id);
        self.registrations.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn digest(&self) -> Bytes {
        self.digest.clone()
    }

    /// Objects whose digest matches the leading `prefix_len` bits of
    /// `digest_prefix`. The empty prefix selects every registration.
    pub fn elements(&self, digest_prefix: &[u8], prefix_len: usize) -> Vec<ObjectId> {
        self.registrations
            .iter()
            .filter(|(digest, _)| digest_prefix_matches(digest, digest_prefix, prefix_len))
            .map(|(_, object_id)| object_id.clone())
            .collect()
    }

    fn recompute_digest(&mut self) {
        self.digest = set_digest(self.digest_fn.as_ref(), self.registrations.keys());
    }
}

fn digest_prefix_matches(digest: &[u8], prefix: &[u8], prefix_len: usize) -> bool {
    if prefix_len == 0 {
        return true;
    }
    let full_bytes = prefix_len / 8;
    let rem_bits = prefix_len % 8;
    if digest.len() * 8 < prefix_len || prefix.len() * 8 < prefix_len {
        return false;
    }
    if digest[..full_bytes] != prefix[..full_bytes] {
        return false;
    }
    if rem_bits == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem_bits);
    (digest[full_bytes] & mask) == (prefix[full_bytes] & mask)
}

/// Tracks what the client wants registered and reconciles server-reported
/// status against it. Not internally synchronized; the owner must call it
/// from the internal thread only.
pub struct RegistrationManager {
    desired_registrations: SimpleRegistrationStore,
    last_known_server_summary: RegistrationSummary,
    statistics: Arc<Statistics>,
}

impl RegistrationManager {
    pub fn new(digest_fn: Arc<dyn DigestFunction>, statistics: Arc<Statistics>) -> Self {
        let desired_registrations = SimpleRegistrationStore::new(digest_fn);
        // Start from the summary of an empty set rather than a zeroed
        // default, so the first comparison against a server summary is
        // meaningful.
        let last_known_server_summary = RegistrationSummary {
            num_registrations: 0,
            digest: desired_registrations.digest(),
        };
        Self {
            desired_registrations,
            last_known_server_summary,
            statistics,
        }
    }

    /// Applies a batch of register/unregister operations to the desired set.
    pub fn perform_operations(&mut self, object_ids: Vec<ObjectId>, op: RegistrationOp) {
        for object_id in object_ids {
            match op {
                RegistrationOp::Register => {
                    self.desired_registrations.add(object_id);
                }
                RegistrationOp::Unregister => {
                    self.desired_registrations.remove(&object_id);
                }
            }
        }
    }

    /// The subtree of desired registrations whose digest shares the given
    /// bit prefix, for a registration sync.
    pub fn get_registrations(&self, digest_prefix: &[u8], prefix_len: usize) -> RegistrationSubtree {
        RegistrationSubtree {
            registered_objects: self.desired_registrations.elements(digest_prefix, prefix_len),
        }
    }

    /// Reconciles server-reported statuses against the desired set.
    ///
    /// Returns one boolean per status: whether the server outcome is
    /// compatible with what the client wants. A successful server operation
    /// that disagrees with the desired set (confirmed registration we no
    /// longer want, or confirmed unregistration for something we still
    /// want) removes the local entry and reports failure so the application
    /// re-negotiates.
    pub fn handle_registration_status(&mut self, statuses: &[RegistrationStatus]) -> Vec<bool> {
        let mut results = Vec::with_capacity(statuses.len());
        for status in statuses {
            let object_id = &status.registration.object_id;
            let mut is_success = true;
            if status.status.is_success() {
                let in_desired = self.desired_registrations.contains(object_id);
                let is_register = status.registration.op == RegistrationOp::Register;
                if is_register ^ in_desired {
                    self.desired_registrations.remove(object_id);
                    self.statistics
                        .record_error(ClientErrorType::RegistrationDiscrepancy);
                    tracing::info!(
                        registered = is_register,
                        requested = in_desired,
                        ?object_id,
                        "registration discrepancy, removing from requested"
                    );
                    is_success = false;
                }
            } else {
                self.desired_registrations.remove(object_id);
                tracing::debug!(?object_id, "server rejected operation, removing");
                is_success = false;
            }
            results.push(is_success);
        }
        results
    }

    /// Summary of the current desired set.
    pub fn get_client_summary(&self) -> RegistrationSummary {
        RegistrationSummary {
            num_registrations: self.desired_registrations.len() as u32,
            digest: self.desired_registrations.digest(),
        }
    }

    pub fn last_known_server_summary(&self) -> &RegistrationSummary {
        &self.last_known_server_summary
    }

    /// Records the registration summary the server most recently reported.
    pub fn inform_server_summary(&mut self, summary: RegistrationSummary) {
        self.last_known_server_summary = summary;
    }
}

impl fmt::Display for RegistrationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "last known server summary: ({}, {} digest bytes), requested: {}",
            self.last_known_server_summary.num_registrations,
            self.last_known_server_summary.digest.len(),
            self.desired_registrations.len()
        )
    }
}

//! Incrementally maintained copy of the prefix → identity cache

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, info_span, warn, Span};

use super::event::{ChangeEvent, EncryptKey, Identity, K8sMetadata, ModificationKind};
use super::listener::CacheListener;
use super::prefix::Prefix;

/// Authoritative answer to "what does this prefix map to right now?"
pub trait IdentitySource: Send + Sync {
    /// Current identity of `prefix`, or `None` if it is not mapped
    fn lookup(&self, prefix: &Prefix) -> Option<Identity>;
}

impl<F> IdentitySource for F
where
    F: Fn(&Prefix) -> Option<Identity> + Send + Sync,
{
    fn lookup(&self, prefix: &Prefix) -> Option<Identity> {
        self(prefix)
    }
}

impl IdentitySource for HashMap<Prefix, Identity> {
    fn lookup(&self, prefix: &Prefix) -> Option<Identity> {
        self.get(prefix).copied()
    }
}

impl IdentitySource for RwLock<HashMap<Prefix, Identity>> {
    fn lookup(&self, prefix: &Prefix) -> Option<Identity> {
        self.read().get(prefix).copied()
    }
}

/// A mapping as last reported to the view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewEntry {
    /// Identity the prefix maps to
    pub identity: Identity,
    /// Host the prefix lives on, if known
    pub host_ip: Option<IpAddr>,
    /// Key epoch in effect when the mapping was written
    pub encrypt_key: EncryptKey,
    /// Workload behind the prefix, if known
    pub k8s_meta: Option<K8sMetadata>,
}

/// Listener that keeps its own copy of the cache
///
/// Entries learned from change events are provisional: on full sync each one
/// is checked against the [`IdentitySource`] and dropped unless the source
/// still maps the prefix to the same identity.
pub struct IdentityView {
    entries: RwLock<BTreeMap<Prefix, ViewEntry>>,
    source: Arc<dyn IdentitySource>,
    span: Span,
}

impl IdentityView {
    /// Create an empty view reconciled against `source`
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            source,
            span: info_span!("identity_view"),
        }
    }

    /// Log inside `span` instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Identity `prefix` maps to
    pub fn get(&self, prefix: &Prefix) -> Option<Identity> {
        self.entries.read().get(prefix).map(|e| e.identity)
    }

    /// Full entry for `prefix`
    pub fn entry(&self, prefix: &Prefix) -> Option<ViewEntry> {
        self.entries.read().get(prefix).cloned()
    }

    /// Number of mapped prefixes
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no prefix is mapped
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of all mappings, ordered by prefix
    pub fn snapshot(&self) -> BTreeMap<Prefix, Identity> {
        self.entries
            .read()
            .iter()
            .map(|(prefix, e)| (*prefix, e.identity))
            .collect()
    }
}

impl CacheListener for IdentityView {
    fn on_change(&self, event: &ChangeEvent) {
        let mut entries = self.entries.write();
        match (event.kind(), event.new_id()) {
            (ModificationKind::Upsert, Some(identity)) => {
                entries.insert(
                    event.cidr(),
                    ViewEntry {
                        identity,
                        host_ip: event.new_host_ip(),
                        encrypt_key: event.encrypt_key(),
                        k8s_meta: event.k8s_meta().cloned(),
                    },
                );
            }
            (ModificationKind::Upsert, None) => {
                warn!(parent: &self.span, event = %event, "Ignoring upsert without identity");
            }
            (ModificationKind::Delete, _) => {
                let current = entries.get(&event.cidr()).map(|e| e.identity);
                if current.is_some() && current == event.old_id() {
                    entries.remove(&event.cidr());
                } else {
                    // Leave it for the next full sync to settle
                    warn!(
                        parent: &self.span,
                        event = %event,
                        current = ?current,
                        "Delete does not match the mapping in view"
                    );
                }
            }
        }
    }

    fn on_full_sync(&self) {
        // The source may take the producer's lock, and the producer holds it
        // while calling on_change, so never consult it with entries locked.
        let snapshot: Vec<(Prefix, ViewEntry)> = self
            .entries
            .read()
            .iter()
            .map(|(prefix, entry)| (*prefix, entry.clone()))
            .collect();

        let unconfirmed: Vec<(Prefix, ViewEntry)> = snapshot
            .into_iter()
            .filter(|(prefix, entry)| self.source.lookup(prefix) != Some(entry.identity))
            .collect();

        let mut entries = self.entries.write();
        let mut discarded = 0;
        for (prefix, seen) in unconfirmed {
            // Changed since the snapshot: the newer event wins
            if entries.get(&prefix) != Some(&seen) {
                continue;
            }
            entries.remove(&prefix);
            discarded += 1;
            debug!(parent: &self.span, prefix = %prefix, identity = %seen.identity, "Discarding unconfirmed mapping");
        }
        info!(
            parent: &self.span,
            kept = entries.len(),
            discarded,
            "Reconciled identity view"
        );
    }
}

//! IP cache change events
//!
//! A [`ChangeEvent`] describes one mutation of the prefix → identity cache.
//! Events can only be obtained through [`ChangeEventBuilder::build`] (or the
//! `upsert`/`delete` shorthands), which reject events that break the
//! notification protocol.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::prefix::Prefix;
use crate::{Error, Result};

/// Numeric security identity of a workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u32);

impl Identity {
    /// The unset identity. Never valid in a change event.
    pub const UNKNOWN: Identity = Identity(0);

    /// Wrap a numeric identity
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The numeric value
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is [`Identity::UNKNOWN`]
    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Identity {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encryption key epoch in effect when a mapping was written. Zero means
/// traffic to the prefix is not encrypted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EncryptKey(u8);

impl EncryptKey {
    /// No encryption
    pub const NONE: EncryptKey = EncryptKey(0);

    /// Wrap a key index
    pub const fn new(key: u8) -> Self {
        Self(key)
    }

    /// The key index
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Whether a key is in effect
    pub const fn is_enabled(self) -> bool {
        self.0 != 0
    }
}

/// Kubernetes workload behind an address
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct K8sMetadata {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
}

impl K8sMetadata {
    /// Create metadata for a pod
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

/// Kind of mutation applied to the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModificationKind {
    /// Insert or update a mapping
    Upsert,
    /// Remove a mapping
    Delete,
}

impl ModificationKind {
    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            ModificationKind::Upsert => "Upsert",
            ModificationKind::Delete => "Delete",
        }
    }
}

impl fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModificationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Upsert" => Ok(ModificationKind::Upsert),
            "Delete" => Ok(ModificationKind::Delete),
            other => Err(Error::invalid_event(format!(
                "unknown modification kind {:?}, expected Upsert or Delete",
                other
            ))),
        }
    }
}

/// One atomic mutation of the IP cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    kind: ModificationKind,
    cidr: Prefix,
    old_id: Option<Identity>,
    new_id: Option<Identity>,
    old_host_ip: Option<IpAddr>,
    new_host_ip: Option<IpAddr>,
    encrypt_key: EncryptKey,
    k8s_meta: Option<K8sMetadata>,
}

impl ChangeEvent {
    /// Start building an event
    pub fn builder(kind: ModificationKind, cidr: Prefix) -> ChangeEventBuilder {
        ChangeEventBuilder {
            event: ChangeEvent {
                kind,
                cidr,
                old_id: None,
                new_id: None,
                old_host_ip: None,
                new_host_ip: None,
                encrypt_key: EncryptKey::NONE,
                k8s_meta: None,
            },
        }
    }

    /// Upsert mapping `cidr` to `new_id`, replacing `old_id` if the prefix
    /// was already mapped
    pub fn upsert(cidr: Prefix, old_id: Option<Identity>, new_id: Identity) -> Result<Self> {
        let mut builder = Self::builder(ModificationKind::Upsert, cidr).new_id(new_id);
        if let Some(old) = old_id {
            builder = builder.old_id(old);
        }
        builder.build()
    }

    /// Delete the mapping of `cidr`, which pointed to `old_id`
    pub fn delete(cidr: Prefix, old_id: Identity) -> Result<Self> {
        Self::builder(ModificationKind::Delete, cidr)
            .old_id(old_id)
            .build()
    }

    /// Kind of mutation
    pub fn kind(&self) -> ModificationKind {
        self.kind
    }

    /// Affected prefix
    pub fn cidr(&self) -> Prefix {
        self.cidr
    }

    /// Identity the prefix mapped to before this event
    pub fn old_id(&self) -> Option<Identity> {
        self.old_id
    }

    /// Identity the prefix maps to after this event (always set on Upsert)
    pub fn new_id(&self) -> Option<Identity> {
        self.new_id
    }

    /// Host IP of the previous mapping
    pub fn old_host_ip(&self) -> Option<IpAddr> {
        self.old_host_ip
    }

    /// Host IP of the new mapping
    pub fn new_host_ip(&self) -> Option<IpAddr> {
        self.new_host_ip
    }

    /// Key epoch in effect at mutation time
    pub fn encrypt_key(&self) -> EncryptKey {
        self.encrypt_key
    }

    /// Workload behind the prefix, if known
    pub fn k8s_meta(&self) -> Option<&K8sMetadata> {
        self.k8s_meta.as_ref()
    }

    /// Whether this upsert replaces an existing mapping
    pub fn is_replacement(&self) -> bool {
        self.kind == ModificationKind::Upsert && self.old_id.is_some()
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |id: Option<Identity>| id.map_or_else(|| "-".to_string(), |i| i.to_string());
        write!(
            f,
            "{} {} {} -> {}",
            self.kind,
            self.cidr,
            show(self.old_id),
            show(self.new_id)
        )
    }
}

/// Builder for [`ChangeEvent`]
#[derive(Clone, Debug)]
pub struct ChangeEventBuilder {
    event: ChangeEvent,
}

impl ChangeEventBuilder {
    /// Identity of the mapping being replaced or removed
    pub fn old_id(mut self, id: Identity) -> Self {
        self.event.old_id = Some(id);
        self
    }

    /// Identity of the new mapping
    pub fn new_id(mut self, id: Identity) -> Self {
        self.event.new_id = Some(id);
        self
    }

    /// Host IP of the mapping being replaced or removed
    pub fn old_host_ip(mut self, ip: IpAddr) -> Self {
        self.event.old_host_ip = Some(ip);
        self
    }

    /// Host IP of the new mapping
    pub fn new_host_ip(mut self, ip: IpAddr) -> Self {
        self.event.new_host_ip = Some(ip);
        self
    }

    /// Key epoch in effect at mutation time
    pub fn encrypt_key(mut self, key: EncryptKey) -> Self {
        self.event.encrypt_key = key;
        self
    }

    /// Workload behind the prefix
    pub fn k8s_meta(mut self, meta: K8sMetadata) -> Self {
        self.event.k8s_meta = Some(meta);
        self
    }

    /// Validate and produce the event.
    ///
    /// Upsert requires `new_id`; `old_id` and `old_host_ip` only appear when
    /// a mapping is replaced. Delete requires `old_id` and carries no new
    /// identity or host IP. The unknown identity is never accepted.
    pub fn build(self) -> Result<ChangeEvent> {
        let e = self.event;

        for id in [e.old_id, e.new_id].into_iter().flatten() {
            if id.is_unknown() {
                return Err(Error::invalid_event(format!(
                    "{} for {} uses the unknown identity",
                    e.kind, e.cidr
                )));
            }
        }

        match e.kind {
            ModificationKind::Upsert => {
                if e.new_id.is_none() {
                    return Err(Error::invalid_event(format!(
                        "Upsert for {} has no new identity",
                        e.cidr
                    )));
                }
                if e.old_host_ip.is_some() && e.old_id.is_none() {
                    return Err(Error::invalid_event(format!(
                        "Upsert for {} has a previous host IP but no previous identity",
                        e.cidr
                    )));
                }
            }
            ModificationKind::Delete => {
                if e.old_id.is_none() {
                    return Err(Error::invalid_event(format!(
                        "Delete for {} does not name the removed identity",
                        e.cidr
                    )));
                }
                if e.new_id.is_some() || e.new_host_ip.is_some() {
                    return Err(Error::invalid_event(format!(
                        "Delete for {} carries a new mapping",
                        e.cidr
                    )));
                }
            }
        }

        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    // ==========================================================================
    // Story: Building valid events
    // ==========================================================================

    #[test]
    fn fresh_upsert_has_no_previous_mapping() {
        let event = ChangeEvent::upsert(prefix("10.0.1.5"), None, Identity::new(5)).unwrap();
        assert_eq!(event.kind(), ModificationKind::Upsert);
        assert_eq!(event.new_id(), Some(Identity::new(5)));
        assert_eq!(event.old_id(), None);
        assert!(!event.is_replacement());
        assert_eq!(event.encrypt_key(), EncryptKey::NONE);
    }

    #[test]
    fn replacing_upsert_carries_both_identities_and_host_ips() {
        let event = ChangeEvent::builder(ModificationKind::Upsert, prefix("10.0.1.0/24"))
            .old_id(Identity::new(5))
            .new_id(Identity::new(9))
            .old_host_ip("192.168.0.1".parse().unwrap())
            .new_host_ip("192.168.0.2".parse().unwrap())
            .encrypt_key(EncryptKey::new(3))
            .k8s_meta(K8sMetadata::new("default", "web-0"))
            .build()
            .unwrap();

        assert!(event.is_replacement());
        assert_eq!(event.old_host_ip(), Some("192.168.0.1".parse().unwrap()));
        assert_eq!(event.new_host_ip(), Some("192.168.0.2".parse().unwrap()));
        assert!(event.encrypt_key().is_enabled());
        assert_eq!(event.k8s_meta().unwrap().pod_name, "web-0");
        assert_eq!(event.to_string(), "Upsert 10.0.1.0/24 5 -> 9");
    }

    #[test]
    fn delete_moves_removed_mapping_into_old_fields() {
        let event = ChangeEvent::builder(ModificationKind::Delete, prefix("fd00::1"))
            .old_id(Identity::new(9))
            .old_host_ip("fd00::100".parse().unwrap())
            .build()
            .unwrap();

        assert_eq!(event.old_id(), Some(Identity::new(9)));
        assert_eq!(event.new_id(), None);
        assert_eq!(event.new_host_ip(), None);
        assert_eq!(event.to_string(), "Delete fd00::1/128 9 -> -");
    }

    #[test]
    fn event_prefix_is_canonical() {
        let event = ChangeEvent::upsert(prefix("10.9.8.7/16"), None, Identity::new(1)).unwrap();
        assert_eq!(event.cidr().to_string(), "10.9.0.0/16");
    }

    // ==========================================================================
    // Story: Protocol misuse is rejected at construction
    // ==========================================================================

    #[test]
    fn upsert_without_new_identity_is_rejected() {
        let err = ChangeEvent::builder(ModificationKind::Upsert, prefix("10.0.0.1"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));
        assert!(err.to_string().contains("no new identity"));
    }

    #[test]
    fn unknown_identity_counts_as_missing() {
        assert!(ChangeEvent::upsert(prefix("10.0.0.1"), None, Identity::UNKNOWN).is_err());
        assert!(ChangeEvent::delete(prefix("10.0.0.1"), Identity::UNKNOWN).is_err());
        assert!(ChangeEvent::upsert(prefix("10.0.0.1"), Some(Identity::UNKNOWN), Identity::new(2))
            .is_err());
    }

    #[test]
    fn previous_host_ip_requires_previous_identity() {
        let result = ChangeEvent::builder(ModificationKind::Upsert, prefix("10.0.0.1"))
            .new_id(Identity::new(2))
            .old_host_ip("192.168.0.1".parse().unwrap())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn delete_must_name_removed_identity_and_carry_no_new_mapping() {
        let missing_old = ChangeEvent::builder(ModificationKind::Delete, prefix("10.0.0.1")).build();
        assert!(missing_old.is_err());

        let with_new = ChangeEvent::builder(ModificationKind::Delete, prefix("10.0.0.1"))
            .old_id(Identity::new(4))
            .new_id(Identity::new(5))
            .build();
        assert!(with_new.is_err());

        let with_new_host = ChangeEvent::builder(ModificationKind::Delete, prefix("10.0.0.1"))
            .old_id(Identity::new(4))
            .new_host_ip("192.168.0.1".parse().unwrap())
            .build();
        assert!(with_new_host.is_err());
    }

    #[test]
    fn modification_kind_parses_only_known_names() {
        assert_eq!("Upsert".parse::<ModificationKind>().unwrap(), ModificationKind::Upsert);
        assert_eq!("Delete".parse::<ModificationKind>().unwrap(), ModificationKind::Delete);
        assert_eq!(ModificationKind::Delete.to_string(), "Delete");

        let err = "Update".parse::<ModificationKind>().unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));
        assert!("upsert".parse::<ModificationKind>().is_err());
        assert!("".parse::<ModificationKind>().is_err());
    }
}

//! IP cache change notification
//!
//! Defines what listeners of the prefix → identity cache receive and how they
//! are registered. How the cache itself stores and indexes mappings is not
//! part of this module.
//!
//! - [`event`] - Change events and their validation
//! - [`listener`] - The [`CacheListener`] trait and [`ListenerSet`] dispatch
//! - [`view`] - [`IdentityView`], a listener keeping a reconciled copy
//! - [`prefix`] - Canonical network prefixes

pub mod event;
pub mod listener;
pub mod prefix;
pub mod view;

pub use event::{
    ChangeEvent, ChangeEventBuilder, EncryptKey, Identity, K8sMetadata, ModificationKind,
};
pub use listener::{CacheListener, ListenerSet};
pub use prefix::Prefix;
pub use view::{IdentitySource, IdentityView, ViewEntry};

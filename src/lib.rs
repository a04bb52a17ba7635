//! Multi-tenant authorization decision engine.
//!
//! Every decision is scoped to an organization. A subject (user id or
//! username) is allowed an `(action, resource)` pair if a role it belongs to,
//! directly or through a group, holds the pair, or if an explicit relation
//! tuple grants it. Decisions are deny-by-default and memoized in a pluggable
//! cache that mutations invalidate before returning.
//!
//! # Examples
//!
//! Basic check using the in-memory store (enable `memory-store`):
//! ```no_run
//! use tenant_authz::{ActionId, EngineBuilder, OrgId, ResourceId, SubjectRef};
//! # #[cfg(feature = "memory-store")]
//! # {
//! use tenant_authz::MemoryStore;
//! let store = MemoryStore::new();
//! let engine = EngineBuilder::new(store).build();
//! let org = OrgId::try_from("acme").unwrap();
//! let subject = SubjectRef::username("alice").unwrap();
//! let action = ActionId::try_from("approve").unwrap();
//! let resource = ResourceId::try_from("invoices").unwrap();
//! let _ = engine.check(org, subject, action, resource);
//! # }
//! ```
//!
//! Creating a process-local cache (enable `memory-cache`):
//! ```no_run
//! # #[cfg(feature = "memory-cache")]
//! # {
//! use tenant_authz::MemoryCache;
//! use std::time::Duration;
//! let cache = MemoryCache::new(1024)
//!     .with_ttl(Duration::from_secs(30))
//!     .with_shards(8);
//! # let _ = cache;
//! # }
//! ```
#![forbid(unsafe_code)]

mod cache;
mod engine;
mod error;
mod fence;
mod gateway;
mod grant;
mod model;
mod permission;
mod request;
mod store;
mod subject;
mod types;
#[cfg(feature = "memory-cache")]
mod memory_cache;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::cache::{Cache, CacheKey, CachedValue, Invalidation, NoCache};
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::{Error, ErrorKind, Result, StoreError};
pub use crate::grant::{GrantSource, RoleGrants, TupleGrants};
pub use crate::model::{Action, Group, Organization, PropertyValue, Resource, Role, Tuple, User};
pub use crate::permission::Permission;
pub use crate::request::{
    CheckActionsRequest, CheckRequest, CheckRequestAll, CheckRequestWithPermissions,
    GroupPatchRequest, PermissionPatchRequest, RoleUpdateRequest, TupleRequest,
};
pub use crate::store::{
    DirectoryStore, GroupMembershipChange, MutationStore, OrganizationStore, PermissionChange,
    ResourceStore, RoleMembershipChange, Store, TupleStore,
};
pub use crate::subject::{ResolvedSubject, SubjectToken, resolve_subject};
pub use crate::types::{
    ActionId, GroupId, OrgId, ResourceId, RoleId, SubjectRef, UserId, Username,
};
pub use tokio_util::sync::CancellationToken;

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;

#[cfg(feature = "memory-cache")]
pub use crate::memory_cache::MemoryCache;

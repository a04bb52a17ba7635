use crate::permission::Permission;
use crate::types::{ActionId, OrgId, ResourceId, UserId};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};

/// Key of a memoized decision or listing. Every variant is scoped by
/// organization.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum CacheKey {
    /// Single `(user, action, resource)` decision.
    Decision {
        org: OrgId,
        user: UserId,
        action: ActionId,
        resource: ResourceId,
    },
    /// Resources `user` may act on with `action`.
    Objects {
        org: OrgId,
        user: UserId,
        action: ActionId,
    },
    /// Users that may act on `resource` with `action`.
    Subjects {
        org: OrgId,
        resource: ResourceId,
        action: ActionId,
    },
}

impl CacheKey {
    pub fn decision(org: &OrgId, user: &UserId, action: &ActionId, resource: &ResourceId) -> Self {
        Self::Decision {
            org: org.clone(),
            user: user.clone(),
            action: action.clone(),
            resource: resource.clone(),
        }
    }

    pub fn objects(org: &OrgId, user: &UserId, action: &ActionId) -> Self {
        Self::Objects {
            org: org.clone(),
            user: user.clone(),
            action: action.clone(),
        }
    }

    pub fn subjects(org: &OrgId, resource: &ResourceId, action: &ActionId) -> Self {
        Self::Subjects {
            org: org.clone(),
            resource: resource.clone(),
            action: action.clone(),
        }
    }

    /// Returns the owning organization.
    pub fn org(&self) -> &OrgId {
        match self {
            Self::Decision { org, .. } | Self::Objects { org, .. } | Self::Subjects { org, .. } => {
                org
            }
        }
    }
}

/// Memoized value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedValue {
    Decision(bool),
    Objects(HashSet<ResourceId>),
    Subjects(HashSet<UserId>),
}

/// Set of cache entries a mutation may have changed.
///
/// Matching is conservative: a decision entry is dropped when its user and its
/// `(action, resource)` pair are both named; an objects listing when its user
/// and action are named; a subjects listing when its pair is named.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invalidation {
    pub org: OrgId,
    pub users: BTreeSet<UserId>,
    pub permissions: BTreeSet<Permission>,
}

impl Invalidation {
    pub fn new(org: OrgId) -> Self {
        Self {
            org,
            users: BTreeSet::new(),
            permissions: BTreeSet::new(),
        }
    }

    /// Returns true if nothing would be invalidated.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.permissions.is_empty()
    }

    /// Returns whether `key` may be affected.
    pub fn matches(&self, key: &CacheKey) -> bool {
        if key.org() != &self.org {
            return false;
        }
        match key {
            CacheKey::Decision {
                user,
                action,
                resource,
                ..
            } => {
                self.users.contains(user)
                    && self
                        .permissions
                        .iter()
                        .any(|p| &p.action == action && &p.resource == resource)
            }
            CacheKey::Objects { user, action, .. } => {
                self.users.contains(user) && self.permissions.iter().any(|p| p.has_action(action))
            }
            CacheKey::Subjects {
                resource, action, ..
            } => self
                .permissions
                .iter()
                .any(|p| &p.action == action && &p.resource == resource),
        }
    }
}

/// Cache interface for decisions and listings.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Gets a cached value.
    async fn get(&self, key: &CacheKey) -> Option<CachedValue>;

    /// Sets a cached value.
    async fn set(&self, key: CacheKey, value: CachedValue);

    /// Removes a single entry.
    async fn remove(&self, key: &CacheKey);

    /// Removes every entry matched by `invalidation`.
    async fn invalidate(&self, invalidation: &Invalidation);

    /// Removes every entry of an organization.
    async fn invalidate_organization(&self, org: &OrgId);
}

/// No-op cache implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get(&self, _key: &CacheKey) -> Option<CachedValue> {
        None
    }

    async fn set(&self, _key: CacheKey, _value: CachedValue) {}

    async fn remove(&self, _key: &CacheKey) {}

    async fn invalidate(&self, _invalidation: &Invalidation) {}

    async fn invalidate_organization(&self, _org: &OrgId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id<T: From<String>>(value: &str) -> T {
        T::from(value.to_string())
    }

    #[test]
    fn invalidation_should_not_match_other_organizations() {
        let mut invalidation = Invalidation::new(id("acme"));
        invalidation.users.insert(id("alice"));
        invalidation
            .permissions
            .insert(Permission::parse("invoices:approve").unwrap());

        let same = CacheKey::decision(&id("acme"), &id("alice"), &id("approve"), &id("invoices"));
        let other = CacheKey::decision(&id("globex"), &id("alice"), &id("approve"), &id("invoices"));

        assert!(invalidation.matches(&same));
        assert!(!invalidation.matches(&other));
    }

    #[test]
    fn invalidation_should_match_listings_by_action() {
        let mut invalidation = Invalidation::new(id("acme"));
        invalidation.users.insert(id("alice"));
        invalidation
            .permissions
            .insert(Permission::parse("invoices:approve").unwrap());

        assert!(invalidation.matches(&CacheKey::objects(&id("acme"), &id("alice"), &id("approve"))));
        assert!(!invalidation.matches(&CacheKey::objects(&id("acme"), &id("alice"), &id("view"))));
        assert!(!invalidation.matches(&CacheKey::objects(&id("acme"), &id("bob"), &id("approve"))));
        assert!(invalidation.matches(&CacheKey::subjects(
            &id("acme"),
            &id("invoices"),
            &id("approve")
        )));
    }
}

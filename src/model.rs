//! Organization-scoped entity records.
//!
//! Every record here lives inside exactly one organization; the organization id
//! is carried by the store key rather than by the record itself.

use crate::permission::Permission;
use crate::types::{ActionId, GroupId, OrgId, ResourceId, RoleId, UserId, Username};
use std::collections::{BTreeMap, BTreeSet};

/// Tenant root.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Organization {
    pub id: OrgId,
    pub display_name: String,
    /// Secret presented by non-interactive callers.
    #[cfg_attr(feature = "serde", serde(skip_serializing))]
    pub api_key: String,
}

impl Organization {
    pub fn new(id: OrgId, display_name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            api_key: api_key.into(),
        }
    }
}

/// Action declared on a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Action {
    pub id: ActionId,
    pub display_name: String,
}

impl Action {
    pub fn new(id: ActionId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Resource type with its declared actions.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resource {
    pub id: ResourceId,
    pub display_name: String,
    pub actions: Vec<Action>,
}

impl Resource {
    pub fn new(id: ResourceId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            actions: Vec::new(),
        }
    }

    /// Adds a declared action.
    pub fn with_action(mut self, action: Action) -> Self {
        if !self.declares(&action.id) {
            self.actions.push(action);
        }
        self
    }

    /// Returns whether `action` is declared on this resource.
    pub fn declares(&self, action: &ActionId) -> bool {
        self.actions.iter().any(|declared| &declared.id == action)
    }
}

/// Value stored in a user's property map.
///
/// The engine never inspects these.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    String(String),
}

/// User with denormalized membership back-references.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct User {
    pub id: UserId,
    pub username: Username,
    #[cfg_attr(feature = "serde", serde(default))]
    pub properties: BTreeMap<String, PropertyValue>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub roles: BTreeSet<RoleId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub groups: BTreeSet<GroupId>,
}

impl User {
    pub fn new(id: UserId, username: Username) -> Self {
        Self {
            id,
            username,
            properties: BTreeMap::new(),
            roles: BTreeSet::new(),
            groups: BTreeSet::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Group of users that can be attached to roles.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Group {
    pub id: GroupId,
    pub display_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub users: BTreeSet<UserId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub roles: BTreeSet<RoleId>,
}

impl Group {
    pub fn new(id: GroupId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            users: BTreeSet::new(),
            roles: BTreeSet::new(),
        }
    }
}

/// Unit of grant.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Role {
    pub id: RoleId,
    pub display_name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub users: BTreeSet<UserId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub groups: BTreeSet<GroupId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub permissions: BTreeSet<Permission>,
}

impl Role {
    pub fn new(id: RoleId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            users: BTreeSet::new(),
            groups: BTreeSet::new(),
            permissions: BTreeSet::new(),
        }
    }

    /// Returns whether the role holds `(action, resource)`.
    pub fn grants(&self, action: &ActionId, resource: &ResourceId) -> bool {
        self.permissions
            .iter()
            .any(|permission| &permission.action == action && &permission.resource == resource)
    }
}

/// Standalone `(subject, action, resource)` grant outside the role model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tuple {
    pub subject: UserId,
    pub action: ActionId,
    pub resource: ResourceId,
}

impl Tuple {
    pub fn new(subject: UserId, action: ActionId, resource: ResourceId) -> Self {
        Self {
            subject,
            action,
            resource,
        }
    }

    pub fn permission(&self) -> Permission {
        Permission::new(self.action.clone(), self.resource.clone())
    }
}

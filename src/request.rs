//! Request shapes accepted by the engine's batch, tuple and patch operations.

use crate::permission::Permission;
use crate::types::{ActionId, GroupId, ResourceId, SubjectRef, UserId};

/// `(subject, relation, object)` as supplied by a caller.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TupleRequest {
    pub subject: SubjectRef,
    #[cfg_attr(feature = "serde", serde(alias = "relation"))]
    pub action: ActionId,
    #[cfg_attr(feature = "serde", serde(alias = "object"))]
    pub resource: ResourceId,
}

impl TupleRequest {
    pub fn new(subject: SubjectRef, action: ActionId, resource: ResourceId) -> Self {
        Self {
            subject,
            action,
            resource,
        }
    }
}

/// Single check, as carried by the machine channel.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CheckRequest {
    pub subject: SubjectRef,
    pub action: ActionId,
    pub resource: ResourceId,
}

/// Several actions against one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CheckRequestWithPermissions {
    pub subject: SubjectRef,
    pub resource: ResourceId,
    pub actions: Vec<ActionId>,
}

/// Independent `(action, resource)` pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CheckRequestAll {
    pub subject: SubjectRef,
    pub permissions: Vec<Permission>,
}

/// Effective actions of a subject on one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CheckActionsRequest {
    pub subject: SubjectRef,
    pub resource: ResourceId,
}

/// Additions and removals against a role's permission set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PermissionPatchRequest {
    #[cfg_attr(feature = "serde", serde(default))]
    pub added_permissions: Vec<Permission>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub removed_permissions: Vec<Permission>,
}

/// Role metadata and membership update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoleUpdateRequest {
    #[cfg_attr(feature = "serde", serde(default))]
    pub display_name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub added_users: Vec<UserId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub removed_users: Vec<UserId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub added_groups: Vec<GroupId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub removed_groups: Vec<GroupId>,
}

/// Group membership update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupPatchRequest {
    #[cfg_attr(feature = "serde", serde(default))]
    pub added_users: Vec<UserId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub removed_users: Vec<UserId>,
}

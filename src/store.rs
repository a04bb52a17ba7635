use crate::error::StoreError;
use crate::model::{Group, Organization, Resource, Role, Tuple, User};
use crate::permission::Permission;
use crate::types::{ActionId, GroupId, OrgId, ResourceId, RoleId, UserId, Username};
use async_trait::async_trait;

/// Store interface for organizations.
#[async_trait]
pub trait OrganizationStore {
    /// Returns an organization by id.
    async fn organization(
        &self,
        org: OrgId,
    ) -> std::result::Result<Option<Organization>, StoreError>;

    /// Resolves a machine-caller API key to its organization.
    async fn organization_by_api_key(
        &self,
        api_key: String,
    ) -> std::result::Result<Option<OrgId>, StoreError>;
}

/// Store interface for resources and their declared actions.
#[async_trait]
pub trait ResourceStore {
    /// Returns a resource with its declared actions.
    async fn resource(
        &self,
        org: OrgId,
        resource: ResourceId,
    ) -> std::result::Result<Option<Resource>, StoreError>;

    /// Returns whether `action` is declared on `resource`.
    async fn action_declared(
        &self,
        org: OrgId,
        resource: ResourceId,
        action: ActionId,
    ) -> std::result::Result<bool, StoreError>;
}

/// Store interface for users, groups and roles.
#[async_trait]
pub trait DirectoryStore {
    /// Returns a user by stable id.
    async fn user(&self, org: OrgId, user: UserId)
    -> std::result::Result<Option<User>, StoreError>;

    /// Returns a user by username.
    async fn user_by_username(
        &self,
        org: OrgId,
        username: Username,
    ) -> std::result::Result<Option<User>, StoreError>;

    /// Returns whether a user exists.
    async fn user_exists(&self, org: OrgId, user: UserId) -> std::result::Result<bool, StoreError>;

    /// Returns a group by id.
    async fn group(
        &self,
        org: OrgId,
        group: GroupId,
    ) -> std::result::Result<Option<Group>, StoreError>;

    /// Returns groups whose member list contains `user`.
    async fn groups_with_user(
        &self,
        org: OrgId,
        user: UserId,
    ) -> std::result::Result<Vec<GroupId>, StoreError>;

    /// Returns a role by id.
    async fn role(&self, org: OrgId, role: RoleId)
    -> std::result::Result<Option<Role>, StoreError>;

    /// Returns roles whose member users intersect `users` or whose member
    /// groups intersect `groups`.
    async fn roles_with_members(
        &self,
        org: OrgId,
        users: Vec<UserId>,
        groups: Vec<GroupId>,
    ) -> std::result::Result<Vec<Role>, StoreError>;

    /// Returns roles whose permission set contains `(action, resource)`.
    async fn roles_granting(
        &self,
        org: OrgId,
        action: ActionId,
        resource: ResourceId,
    ) -> std::result::Result<Vec<Role>, StoreError>;
}

/// Store interface for relation tuples.
#[async_trait]
pub trait TupleStore {
    /// Returns whether the exact tuple is recorded.
    async fn tuple_exists(&self, org: OrgId, tuple: Tuple)
    -> std::result::Result<bool, StoreError>;

    /// Inserts a tuple. Returns `false` without writing if it already exists.
    async fn insert_tuple(&self, org: OrgId, tuple: Tuple)
    -> std::result::Result<bool, StoreError>;

    /// Deletes a tuple. Returns `false` if it was not recorded.
    async fn delete_tuple(&self, org: OrgId, tuple: Tuple)
    -> std::result::Result<bool, StoreError>;

    /// Returns tuples naming `subject` with `action`.
    async fn tuples_for_subject(
        &self,
        org: OrgId,
        subject: UserId,
        action: ActionId,
    ) -> std::result::Result<Vec<Tuple>, StoreError>;

    /// Returns tuples naming `(action, resource)`.
    async fn tuples_for_object(
        &self,
        org: OrgId,
        resource: ResourceId,
        action: ActionId,
    ) -> std::result::Result<Vec<Tuple>, StoreError>;
}

/// Net change to a role's permission set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionChange {
    pub added: Vec<Permission>,
    pub removed: Vec<Permission>,
}

impl PermissionChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Net change to a role's metadata and membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleMembershipChange {
    pub display_name: Option<String>,
    pub added_users: Vec<UserId>,
    pub removed_users: Vec<UserId>,
    pub added_groups: Vec<GroupId>,
    pub removed_groups: Vec<GroupId>,
}

impl RoleMembershipChange {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.added_users.is_empty()
            && self.removed_users.is_empty()
            && self.added_groups.is_empty()
            && self.removed_groups.is_empty()
    }
}

/// Net change to a group's user membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupMembershipChange {
    pub added_users: Vec<UserId>,
    pub removed_users: Vec<UserId>,
}

impl GroupMembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added_users.is_empty() && self.removed_users.is_empty()
    }
}

/// Store interface for atomic writes issued by the mutation gateway.
///
/// Each call must update both sides of a membership relationship (the role
/// or group and the user back-references) as one atomic write.
#[async_trait]
pub trait MutationStore {
    /// Applies a permission change. Returns `false` if the role is absent.
    async fn apply_role_permissions(
        &self,
        org: OrgId,
        role: RoleId,
        change: PermissionChange,
    ) -> std::result::Result<bool, StoreError>;

    /// Applies a membership change. Returns `false` if the role is absent.
    async fn apply_role_membership(
        &self,
        org: OrgId,
        role: RoleId,
        change: RoleMembershipChange,
    ) -> std::result::Result<bool, StoreError>;

    /// Applies a membership change. Returns `false` if the group is absent.
    async fn apply_group_membership(
        &self,
        org: OrgId,
        group: GroupId,
        change: GroupMembershipChange,
    ) -> std::result::Result<bool, StoreError>;
}

/// Composite store trait.
pub trait Store:
    OrganizationStore + ResourceStore + DirectoryStore + TupleStore + MutationStore + Send + Sync
{
}

impl<T> Store for T where
    T: OrganizationStore + ResourceStore + DirectoryStore + TupleStore + MutationStore + Send + Sync
{
}

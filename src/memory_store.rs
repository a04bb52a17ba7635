use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{Error, Result, StoreError};
use crate::model::{Group, Organization, Resource, Role, Tuple, User};
use crate::store::{
    DirectoryStore, GroupMembershipChange, MutationStore, OrganizationStore, PermissionChange,
    ResourceStore, RoleMembershipChange, TupleStore,
};
use crate::types::{ActionId, GroupId, OrgId, ResourceId, RoleId, UserId, Username};

/// In-memory store implementation for tests and demos.
///
/// All organizations share one lock, so every mutation (including both sides
/// of a membership change) is applied atomically. Setup methods such as
/// [`MemoryStore::create_role`] stand in for the CRUD layer; they do not touch
/// any engine cache, so call `Engine::invalidate_organization` after using the
/// deletion helpers on a live engine.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<OrgId, OrgState>>>,
}

#[derive(Debug)]
struct OrgState {
    organization: Organization,
    resources: HashMap<ResourceId, Resource>,
    users: HashMap<UserId, User>,
    usernames: HashMap<Username, UserId>,
    groups: HashMap<GroupId, Group>,
    roles: HashMap<RoleId, Role>,
    tuples: BTreeSet<Tuple>,
}

impl OrgState {
    fn new(organization: Organization) -> Self {
        Self {
            organization,
            resources: HashMap::new(),
            users: HashMap::new(),
            usernames: HashMap::new(),
            groups: HashMap::new(),
            roles: HashMap::new(),
            tuples: BTreeSet::new(),
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::from("memory store lock poisoned")
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::result::Result<RwLockReadGuard<'_, HashMap<OrgId, OrgState>>, StoreError> {
        self.inner.read().map_err(|_| poisoned())
    }

    fn write(
        &self,
    ) -> std::result::Result<RwLockWriteGuard<'_, HashMap<OrgId, OrgState>>, StoreError> {
        self.inner.write().map_err(|_| poisoned())
    }

    fn with_org_mut<T>(
        &self,
        org: &OrgId,
        apply: impl FnOnce(&mut OrgState) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.write()?;
        let state = guard
            .get_mut(org)
            .ok_or_else(|| Error::not_found("organization", org))?;
        apply(state)
    }

    /// Registers an organization.
    pub fn create_organization(&self, organization: Organization) -> Result<()> {
        let mut guard = self.write()?;
        if guard.contains_key(&organization.id) {
            return Err(Error::AlreadyExists(format!(
                "organization {}",
                organization.id
            )));
        }
        if guard
            .values()
            .any(|state| state.organization.api_key == organization.api_key)
        {
            return Err(Error::AlreadyExists("api key".to_string()));
        }
        guard.insert(organization.id.clone(), OrgState::new(organization));
        Ok(())
    }

    /// Registers a resource with its declared actions.
    pub fn create_resource(&self, org: &OrgId, resource: Resource) -> Result<()> {
        self.with_org_mut(org, |state| {
            if state.resources.contains_key(&resource.id) {
                return Err(Error::AlreadyExists(format!("resource {}", resource.id)));
            }
            state.resources.insert(resource.id.clone(), resource);
            Ok(())
        })
    }

    /// Registers a user. Membership back-references are cleared; memberships
    /// are only created through role and group patches.
    pub fn create_user(&self, org: &OrgId, mut user: User) -> Result<()> {
        self.with_org_mut(org, |state| {
            if state.users.contains_key(&user.id) {
                return Err(Error::AlreadyExists(format!("user {}", user.id)));
            }
            if state.usernames.contains_key(&user.username) {
                return Err(Error::AlreadyExists(format!("username {}", user.username)));
            }
            user.roles.clear();
            user.groups.clear();
            state.usernames.insert(user.username.clone(), user.id.clone());
            state.users.insert(user.id.clone(), user);
            Ok(())
        })
    }

    /// Registers an empty group.
    pub fn create_group(&self, org: &OrgId, group: GroupId, display_name: &str) -> Result<()> {
        self.with_org_mut(org, |state| {
            if state.groups.contains_key(&group) {
                return Err(Error::AlreadyExists(format!("group {group}")));
            }
            state
                .groups
                .insert(group.clone(), Group::new(group, display_name));
            Ok(())
        })
    }

    /// Registers an empty role.
    pub fn create_role(&self, org: &OrgId, role: RoleId, display_name: &str) -> Result<()> {
        self.with_org_mut(org, |state| {
            if state.roles.contains_key(&role) {
                return Err(Error::AlreadyExists(format!("role {role}")));
            }
            state.roles.insert(role.clone(), Role::new(role, display_name));
            Ok(())
        })
    }

    /// Deletes a resource, its actions, every role permission referencing it
    /// and every tuple naming it.
    pub fn delete_resource(&self, org: &OrgId, resource: &ResourceId) -> Result<Resource> {
        self.with_org_mut(org, |state| {
            let removed = state
                .resources
                .remove(resource)
                .ok_or_else(|| Error::not_found("resource", resource))?;
            for role in state.roles.values_mut() {
                role.permissions
                    .retain(|permission| &permission.resource != resource);
            }
            state.tuples.retain(|tuple| &tuple.resource != resource);
            Ok(removed)
        })
    }

    /// Deletes a role and the back-references pointing at it. Tuples are kept.
    pub fn delete_role(&self, org: &OrgId, role: &RoleId) -> Result<Role> {
        self.with_org_mut(org, |state| {
            let removed = state
                .roles
                .remove(role)
                .ok_or_else(|| Error::not_found("role", role))?;
            for user in &removed.users {
                if let Some(user) = state.users.get_mut(user) {
                    user.roles.remove(role);
                }
            }
            for group in &removed.groups {
                if let Some(group) = state.groups.get_mut(group) {
                    group.roles.remove(role);
                }
            }
            Ok(removed)
        })
    }

    /// Deletes a group and the references pointing at it.
    pub fn delete_group(&self, org: &OrgId, group: &GroupId) -> Result<Group> {
        self.with_org_mut(org, |state| {
            let removed = state
                .groups
                .remove(group)
                .ok_or_else(|| Error::not_found("group", group))?;
            for user in &removed.users {
                if let Some(user) = state.users.get_mut(user) {
                    user.groups.remove(group);
                }
            }
            for role in &removed.roles {
                if let Some(role) = state.roles.get_mut(role) {
                    role.groups.remove(group);
                }
            }
            Ok(removed)
        })
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn organization(
        &self,
        org: OrgId,
    ) -> std::result::Result<Option<Organization>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&org).map(|state| state.organization.clone()))
    }

    async fn organization_by_api_key(
        &self,
        api_key: String,
    ) -> std::result::Result<Option<OrgId>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .values()
            .find(|state| state.organization.api_key == api_key)
            .map(|state| state.organization.id.clone()))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn resource(
        &self,
        org: OrgId,
        resource: ResourceId,
    ) -> std::result::Result<Option<Resource>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .and_then(|state| state.resources.get(&resource).cloned()))
    }

    async fn action_declared(
        &self,
        org: OrgId,
        resource: ResourceId,
        action: ActionId,
    ) -> std::result::Result<bool, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .and_then(|state| state.resources.get(&resource))
            .is_some_and(|resource| resource.declares(&action)))
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn user(
        &self,
        org: OrgId,
        user: UserId,
    ) -> std::result::Result<Option<User>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .and_then(|state| state.users.get(&user).cloned()))
    }

    async fn user_by_username(
        &self,
        org: OrgId,
        username: Username,
    ) -> std::result::Result<Option<User>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&org).and_then(|state| {
            state
                .usernames
                .get(&username)
                .and_then(|id| state.users.get(id).cloned())
        }))
    }

    async fn user_exists(&self, org: OrgId, user: UserId) -> std::result::Result<bool, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .is_some_and(|state| state.users.contains_key(&user)))
    }

    async fn group(
        &self,
        org: OrgId,
        group: GroupId,
    ) -> std::result::Result<Option<Group>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .and_then(|state| state.groups.get(&group).cloned()))
    }

    async fn groups_with_user(
        &self,
        org: OrgId,
        user: UserId,
    ) -> std::result::Result<Vec<GroupId>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .map(|state| {
                state
                    .groups
                    .values()
                    .filter(|group| group.users.contains(&user))
                    .map(|group| group.id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn role(
        &self,
        org: OrgId,
        role: RoleId,
    ) -> std::result::Result<Option<Role>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .and_then(|state| state.roles.get(&role).cloned()))
    }

    async fn roles_with_members(
        &self,
        org: OrgId,
        users: Vec<UserId>,
        groups: Vec<GroupId>,
    ) -> std::result::Result<Vec<Role>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .map(|state| {
                state
                    .roles
                    .values()
                    .filter(|role| {
                        users.iter().any(|user| role.users.contains(user))
                            || groups.iter().any(|group| role.groups.contains(group))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn roles_granting(
        &self,
        org: OrgId,
        action: ActionId,
        resource: ResourceId,
    ) -> std::result::Result<Vec<Role>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .map(|state| {
                state
                    .roles
                    .values()
                    .filter(|role| role.grants(&action, &resource))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl TupleStore for MemoryStore {
    async fn tuple_exists(
        &self,
        org: OrgId,
        tuple: Tuple,
    ) -> std::result::Result<bool, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .is_some_and(|state| state.tuples.contains(&tuple)))
    }

    async fn insert_tuple(
        &self,
        org: OrgId,
        tuple: Tuple,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.write()?;
        Ok(guard
            .get_mut(&org)
            .is_some_and(|state| state.tuples.insert(tuple)))
    }

    async fn delete_tuple(
        &self,
        org: OrgId,
        tuple: Tuple,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.write()?;
        Ok(guard
            .get_mut(&org)
            .is_some_and(|state| state.tuples.remove(&tuple)))
    }

    async fn tuples_for_subject(
        &self,
        org: OrgId,
        subject: UserId,
        action: ActionId,
    ) -> std::result::Result<Vec<Tuple>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .map(|state| {
                state
                    .tuples
                    .iter()
                    .filter(|tuple| tuple.subject == subject && tuple.action == action)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tuples_for_object(
        &self,
        org: OrgId,
        resource: ResourceId,
        action: ActionId,
    ) -> std::result::Result<Vec<Tuple>, StoreError> {
        let guard = self.read()?;
        Ok(guard
            .get(&org)
            .map(|state| {
                state
                    .tuples
                    .iter()
                    .filter(|tuple| tuple.resource == resource && tuple.action == action)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl MutationStore for MemoryStore {
    async fn apply_role_permissions(
        &self,
        org: OrgId,
        role: RoleId,
        change: PermissionChange,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.write()?;
        let Some(role) = guard
            .get_mut(&org)
            .and_then(|state| state.roles.get_mut(&role))
        else {
            return Ok(false);
        };
        for permission in &change.removed {
            role.permissions.remove(permission);
        }
        role.permissions.extend(change.added);
        Ok(true)
    }

    async fn apply_role_membership(
        &self,
        org: OrgId,
        role_id: RoleId,
        change: RoleMembershipChange,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.write()?;
        let Some(state) = guard.get_mut(&org) else {
            return Ok(false);
        };
        let Some(role) = state.roles.get_mut(&role_id) else {
            return Ok(false);
        };

        if let Some(display_name) = change.display_name {
            role.display_name = display_name;
        }
        for user in &change.removed_users {
            role.users.remove(user);
        }
        role.users.extend(change.added_users.iter().cloned());
        for group in &change.removed_groups {
            role.groups.remove(group);
        }
        role.groups.extend(change.added_groups.iter().cloned());

        for user in &change.removed_users {
            if let Some(user) = state.users.get_mut(user) {
                user.roles.remove(&role_id);
            }
        }
        for user in &change.added_users {
            if let Some(user) = state.users.get_mut(user) {
                user.roles.insert(role_id.clone());
            }
        }
        for group in &change.removed_groups {
            if let Some(group) = state.groups.get_mut(group) {
                group.roles.remove(&role_id);
            }
        }
        for group in &change.added_groups {
            if let Some(group) = state.groups.get_mut(group) {
                group.roles.insert(role_id.clone());
            }
        }
        Ok(true)
    }

    async fn apply_group_membership(
        &self,
        org: OrgId,
        group_id: GroupId,
        change: GroupMembershipChange,
    ) -> std::result::Result<bool, StoreError> {
        let mut guard = self.write()?;
        let Some(state) = guard.get_mut(&org) else {
            return Ok(false);
        };
        let Some(group) = state.groups.get_mut(&group_id) else {
            return Ok(false);
        };

        for user in &change.removed_users {
            group.users.remove(user);
        }
        group.users.extend(change.added_users.iter().cloned());

        for user in &change.removed_users {
            if let Some(user) = state.users.get_mut(user) {
                user.groups.remove(&group_id);
            }
        }
        for user in &change.added_users {
            if let Some(user) = state.users.get_mut(user) {
                user.groups.insert(group_id.clone());
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Action;
    use crate::permission::Permission;
    use futures::executor::block_on;

    fn org() -> OrgId {
        OrgId::try_from("acme").unwrap()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_organization(Organization::new(org(), "Acme", "acme-key"))
            .unwrap();
        store
            .create_resource(
                &org(),
                Resource::new(ResourceId::try_from("invoices").unwrap(), "Invoices").with_action(
                    Action::new(ActionId::try_from("approve").unwrap(), "Approve"),
                ),
            )
            .unwrap();
        store
            .create_user(
                &org(),
                User::new(
                    UserId::try_from("u-alice").unwrap(),
                    Username::try_from("alice").unwrap(),
                ),
            )
            .unwrap();
        store
            .create_role(&org(), RoleId::try_from("finance").unwrap(), "Finance")
            .unwrap();
        store
    }

    #[test]
    fn role_membership_should_update_both_sides() {
        let store = seeded();
        let role = RoleId::try_from("finance").unwrap();
        let alice = UserId::try_from("u-alice").unwrap();

        let applied = block_on(store.apply_role_membership(
            org(),
            role.clone(),
            RoleMembershipChange {
                added_users: vec![alice.clone()],
                ..RoleMembershipChange::default()
            },
        ))
        .unwrap();
        assert!(applied);

        let user = block_on(store.user(org(), alice.clone())).unwrap().unwrap();
        assert!(user.roles.contains(&role));
        let stored_role = block_on(store.role(org(), role)).unwrap().unwrap();
        assert!(stored_role.users.contains(&alice));
    }

    #[test]
    fn delete_resource_should_cascade_to_permissions_and_tuples() {
        let store = seeded();
        let role = RoleId::try_from("finance").unwrap();
        let permission = Permission::parse("invoices:approve").unwrap();
        block_on(store.apply_role_permissions(
            org(),
            role.clone(),
            PermissionChange {
                added: vec![permission.clone()],
                removed: Vec::new(),
            },
        ))
        .unwrap();
        let tuple = Tuple::new(
            UserId::try_from("u-alice").unwrap(),
            permission.action.clone(),
            permission.resource.clone(),
        );
        assert!(block_on(store.insert_tuple(org(), tuple.clone())).unwrap());

        store.delete_resource(&org(), &permission.resource).unwrap();

        let stored_role = block_on(store.role(org(), role)).unwrap().unwrap();
        assert!(stored_role.permissions.is_empty());
        assert!(!block_on(store.tuple_exists(org(), tuple)).unwrap());
    }

    #[test]
    fn delete_role_should_keep_tuples() {
        let store = seeded();
        let tuple = Tuple::new(
            UserId::try_from("u-alice").unwrap(),
            ActionId::try_from("approve").unwrap(),
            ResourceId::try_from("invoices").unwrap(),
        );
        block_on(store.insert_tuple(org(), tuple.clone())).unwrap();

        store
            .delete_role(&org(), &RoleId::try_from("finance").unwrap())
            .unwrap();

        assert!(block_on(store.tuple_exists(org(), tuple)).unwrap());
    }

    #[test]
    fn lookups_should_not_cross_organizations() {
        let store = seeded();
        let other = OrgId::try_from("globex").unwrap();
        store
            .create_organization(Organization::new(other.clone(), "Globex", "globex-key"))
            .unwrap();

        let user = block_on(store.user(other, UserId::try_from("u-alice").unwrap())).unwrap();
        assert!(user.is_none());
    }

    #[test]
    fn duplicate_api_key_should_be_rejected() {
        let store = seeded();
        let err = store
            .create_organization(Organization::new(
                OrgId::try_from("globex").unwrap(),
                "Globex",
                "acme-key",
            ))
            .expect_err("must reject");
        assert!(matches!(err, Error::AlreadyExists(_)));
    }
}

//! Mutation gateway.
//!
//! Every write that can change a decision goes through here so the cache is
//! invalidated before and after the store write while the organization's
//! mutation fence is held.

use std::collections::BTreeSet;

use futures::future::try_join_all;
use futures::try_join;

use crate::cache::{Cache, Invalidation};
use crate::engine::{Engine, log_failure};
use crate::error::{Error, Result};
use crate::model::{Group, Role, Tuple};
use crate::permission::Permission;
use crate::request::{GroupPatchRequest, PermissionPatchRequest, RoleUpdateRequest, TupleRequest};
use crate::store::{GroupMembershipChange, PermissionChange, RoleMembershipChange, Store};
use crate::types::{GroupId, OrgId, RoleId, UserId};

impl<S, C> Engine<S, C>
where
    S: Store,
    C: Cache,
{
    /// Adds and removes permissions on a role in one atomic write.
    ///
    /// Every added pair must be declared; otherwise nothing is written and
    /// the first offending pair is reported.
    #[tracing::instrument(skip_all, fields(org = %org, role = %role))]
    pub async fn patch_permissions(
        &self,
        org: OrgId,
        role: RoleId,
        patch: PermissionPatchRequest,
    ) -> Result<()> {
        let _serial = self.fence.serialize(&org).await;
        let (_, current) = try_join!(
            self.ensure_organization(&org),
            self.ensure_role(&org, &role),
        )
        .inspect_err(reject)?;

        let declared = try_join_all(patch.added_permissions.iter().map(|permission| {
            self.store.action_declared(
                org.clone(),
                permission.resource.clone(),
                permission.action.clone(),
            )
        }))
        .await
        .map_err(Error::from)
        .inspect_err(log_failure)?;
        if let Some((permission, _)) = patch
            .added_permissions
            .iter()
            .zip(declared)
            .find(|(_, declared)| !declared)
        {
            let err = Error::InvalidInput(format!("permission {permission} is not declared"));
            reject(&err);
            return Err(err);
        }

        let added: BTreeSet<Permission> = patch
            .added_permissions
            .into_iter()
            .filter(|permission| !current.permissions.contains(permission))
            .collect();
        let removed: BTreeSet<Permission> = patch
            .removed_permissions
            .into_iter()
            .filter(|permission| current.permissions.contains(permission))
            .collect();
        let change = PermissionChange {
            added: added.iter().cloned().collect(),
            removed: removed.iter().cloned().collect(),
        };
        if change.is_empty() {
            tracing::debug!("permission patch is a no-op");
            return Ok(());
        }

        let mut invalidation = Invalidation::new(org.clone());
        invalidation.users = self.role_members(&org, &current).await?;
        invalidation.permissions = added.into_iter().chain(removed).collect();

        let applied = self
            .mutate(&invalidation, self.store.apply_role_permissions(org.clone(), role.clone(), change))
            .await?;
        if !applied {
            return Err(Error::not_found("role", &role));
        }
        tracing::info!(changed = invalidation.permissions.len(), "role permissions patched");
        Ok(())
    }

    /// Renames a role and changes its user and group membership.
    ///
    /// Referenced users and groups must exist. Adds of existing members and
    /// removals of non-members are dropped before writing.
    #[tracing::instrument(skip_all, fields(org = %org, role = %role))]
    pub async fn update_role(&self, org: OrgId, role: RoleId, update: RoleUpdateRequest) -> Result<()> {
        let _serial = self.fence.serialize(&org).await;
        let (_, current) = try_join!(
            self.ensure_organization(&org),
            self.ensure_role(&org, &role),
        )
        .inspect_err(reject)?;

        let users: Vec<UserId> = update
            .added_users
            .iter()
            .chain(&update.removed_users)
            .cloned()
            .collect();
        let groups: Vec<GroupId> = update
            .added_groups
            .iter()
            .chain(&update.removed_groups)
            .cloned()
            .collect();
        let (_, referenced_groups) = try_join!(
            self.ensure_users(&org, &users),
            self.ensure_groups(&org, &groups),
        )
        .inspect_err(reject)?;

        let change = RoleMembershipChange {
            display_name: update
                .display_name
                .filter(|name| name != &current.display_name),
            added_users: dedup(update.added_users, |user| !current.users.contains(user)),
            removed_users: dedup(update.removed_users, |user| current.users.contains(user)),
            added_groups: dedup(update.added_groups, |group| !current.groups.contains(group)),
            removed_groups: dedup(update.removed_groups, |group| current.groups.contains(group)),
        };
        if change.is_empty() {
            tracing::debug!("role update is a no-op");
            return Ok(());
        }

        let changed_groups: BTreeSet<&GroupId> = change
            .added_groups
            .iter()
            .chain(&change.removed_groups)
            .collect();
        let mut invalidation = Invalidation::new(org.clone());
        invalidation.users = change
            .added_users
            .iter()
            .chain(&change.removed_users)
            .cloned()
            .chain(
                referenced_groups
                    .iter()
                    .filter(|group| changed_groups.contains(&group.id))
                    .flat_map(|group| group.users.iter().cloned()),
            )
            .collect();
        if !invalidation.users.is_empty() {
            invalidation.permissions = current.permissions.clone();
        }

        let applied = self
            .mutate(&invalidation, self.store.apply_role_membership(org.clone(), role.clone(), change))
            .await?;
        if !applied {
            return Err(Error::not_found("role", &role));
        }
        tracing::info!(affected_users = invalidation.users.len(), "role updated");
        Ok(())
    }

    /// Changes a group's user membership.
    #[tracing::instrument(skip_all, fields(org = %org, group = %group))]
    pub async fn patch_group(&self, org: OrgId, group: GroupId, patch: GroupPatchRequest) -> Result<()> {
        let _serial = self.fence.serialize(&org).await;
        let (_, current) = try_join!(
            self.ensure_organization(&org),
            self.ensure_group(&org, &group),
        )
        .inspect_err(reject)?;

        let users: Vec<UserId> = patch
            .added_users
            .iter()
            .chain(&patch.removed_users)
            .cloned()
            .collect();
        self.ensure_users(&org, &users).await.inspect_err(reject)?;

        let change = GroupMembershipChange {
            added_users: dedup(patch.added_users, |user| !current.users.contains(user)),
            removed_users: dedup(patch.removed_users, |user| current.users.contains(user)),
        };
        if change.is_empty() {
            tracing::debug!("group patch is a no-op");
            return Ok(());
        }

        let roles = self
            .store
            .roles_with_members(org.clone(), Vec::new(), vec![group.clone()])
            .await
            .map_err(Error::from)
            .inspect_err(log_failure)?;
        let mut invalidation = Invalidation::new(org.clone());
        invalidation.users = change
            .added_users
            .iter()
            .chain(&change.removed_users)
            .cloned()
            .collect();
        invalidation.permissions = roles
            .into_iter()
            .flat_map(|role| role.permissions)
            .collect();

        let applied = self
            .mutate(&invalidation, self.store.apply_group_membership(org.clone(), group.clone(), change))
            .await?;
        if !applied {
            return Err(Error::not_found("group", &group));
        }
        tracing::info!(affected_users = invalidation.users.len(), "group patched");
        Ok(())
    }

    /// Records an explicit `(subject, action, resource)` grant.
    ///
    /// The subject is stored by its canonical user id, so a tuple created by
    /// username is found again by id and the other way round.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %request.subject))]
    pub async fn create_tuple(&self, org: OrgId, request: TupleRequest) -> Result<Tuple> {
        let _serial = self.fence.serialize(&org).await;
        let (_, resolved, _) = try_join!(
            self.ensure_organization(&org),
            self.resolve(&org, &request.subject),
            self.ensure_declared(&org, &request.action, &request.resource),
        )
        .inspect_err(reject)?;

        let tuple = Tuple::new(resolved.user, request.action, request.resource);
        let invalidation = tuple_invalidation(&org, &tuple);
        let inserted = self
            .mutate(&invalidation, self.store.insert_tuple(org.clone(), tuple.clone()))
            .await?;
        if !inserted {
            let err = Error::AlreadyExists(format!(
                "tuple ({}, {}, {})",
                tuple.subject, tuple.action, tuple.resource
            ));
            reject(&err);
            return Err(err);
        }
        Ok(tuple)
    }

    /// Removes an explicit grant.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %request.subject))]
    pub async fn delete_tuple(&self, org: OrgId, request: TupleRequest) -> Result<()> {
        let _serial = self.fence.serialize(&org).await;
        let (_, resolved) = try_join!(
            self.ensure_organization(&org),
            self.resolve(&org, &request.subject),
        )
        .inspect_err(reject)?;

        let tuple = Tuple::new(resolved.user, request.action, request.resource);
        let invalidation = tuple_invalidation(&org, &tuple);
        let removed = self
            .mutate(&invalidation, self.store.delete_tuple(org.clone(), tuple.clone()))
            .await?;
        if !removed {
            let err = Error::not_found(
                "tuple",
                format!("({}, {}, {})", tuple.subject, tuple.action, tuple.resource),
            );
            reject(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Runs `write` inside the organization's fence, invalidating before and
    /// after it.
    async fn mutate<T, F>(&self, invalidation: &Invalidation, write: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, crate::error::StoreError>>,
    {
        let _guard = self.fence.enter(&invalidation.org);
        self.cache.invalidate(invalidation).await;
        let result = write.await.map_err(Error::from).inspect_err(log_failure);
        self.cache.invalidate(invalidation).await;
        result
    }

    async fn ensure_role(&self, org: &OrgId, role: &RoleId) -> Result<Role> {
        self.store
            .role(org.clone(), role.clone())
            .await?
            .ok_or_else(|| Error::not_found("role", role))
    }

    async fn ensure_group(&self, org: &OrgId, group: &GroupId) -> Result<Group> {
        self.store
            .group(org.clone(), group.clone())
            .await?
            .ok_or_else(|| Error::not_found("group", group))
    }

    async fn ensure_users(&self, org: &OrgId, users: &[UserId]) -> Result<()> {
        let exists = try_join_all(
            users
                .iter()
                .map(|user| self.store.user_exists(org.clone(), user.clone())),
        )
        .await?;
        match users.iter().zip(exists).find(|(_, exists)| !exists) {
            Some((user, _)) => Err(Error::InvalidInput(format!("user {user} does not exist"))),
            None => Ok(()),
        }
    }

    async fn ensure_groups(&self, org: &OrgId, groups: &[GroupId]) -> Result<Vec<Group>> {
        let found = try_join_all(
            groups
                .iter()
                .map(|group| self.store.group(org.clone(), group.clone())),
        )
        .await?;
        groups
            .iter()
            .zip(found)
            .map(|(id, group)| {
                group.ok_or_else(|| Error::InvalidInput(format!("group {id} does not exist")))
            })
            .collect()
    }

    /// Direct users of `role` plus the users of its member groups.
    async fn role_members(&self, org: &OrgId, role: &Role) -> Result<BTreeSet<UserId>> {
        let groups = try_join_all(
            role.groups
                .iter()
                .map(|group| self.store.group(org.clone(), group.clone())),
        )
        .await
        .map_err(Error::from)
        .inspect_err(log_failure)?;

        Ok(role
            .users
            .iter()
            .cloned()
            .chain(groups.into_iter().flatten().flat_map(|group| group.users))
            .collect())
    }
}

fn reject(error: &Error) {
    match error {
        Error::Store(_) => log_failure(error),
        other => tracing::warn!(error = %other, "mutation rejected"),
    }
}

/// Keeps the first occurrence of each item accepted by `keep`.
fn dedup<T: Ord + Clone>(items: Vec<T>, keep: impl Fn(&T) -> bool) -> Vec<T> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| keep(item) && seen.insert(item.clone()))
        .collect()
}

fn tuple_invalidation(org: &OrgId, tuple: &Tuple) -> Invalidation {
    let mut invalidation = Invalidation::new(org.clone());
    invalidation.users.insert(tuple.subject.clone());
    invalidation.permissions.insert(tuple.permission());
    invalidation
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::memory_store::MemoryStore;
    use crate::model::{Action, Organization, Resource, User};
    use crate::store::DirectoryStore;
    use crate::types::{ActionId, ResourceId, SubjectRef, Username};
    use futures::executor::block_on;

    fn org() -> OrgId {
        OrgId::try_from("acme").unwrap()
    }

    fn finance() -> RoleId {
        RoleId::try_from("finance").unwrap()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_organization(Organization::new(org(), "Acme", "acme-key"))
            .unwrap();
        store
            .create_resource(
                &org(),
                Resource::new(ResourceId::try_from("invoices").unwrap(), "Invoices")
                    .with_action(Action::new(ActionId::try_from("view").unwrap(), "View"))
                    .with_action(Action::new(ActionId::try_from("approve").unwrap(), "Approve")),
            )
            .unwrap();
        for (id, name) in [("u-alice", "alice"), ("u-bob", "bob")] {
            store
                .create_user(
                    &org(),
                    User::new(UserId::try_from(id).unwrap(), Username::try_from(name).unwrap()),
                )
                .unwrap();
        }
        store.create_role(&org(), finance(), "Finance").unwrap();
        store
            .create_group(&org(), GroupId::try_from("auditors").unwrap(), "Auditors")
            .unwrap();
        store
    }

    fn permission(value: &str) -> Permission {
        Permission::parse(value).unwrap()
    }

    #[test]
    fn rejected_writes_should_not_leave_per_organization_state() {
        let engine = EngineBuilder::new(seeded()).build();

        for i in 0..500 {
            let ghost = OrgId::try_from(format!("ghost-{i}").as_str()).unwrap();
            let err = block_on(engine.patch_permissions(
                ghost.clone(),
                finance(),
                PermissionPatchRequest::default(),
            ))
            .unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
            let err = block_on(engine.invalidate_organization(&ghost)).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
            let err = block_on(engine.create_tuple(
                ghost,
                TupleRequest::new(
                    SubjectRef::username("alice").unwrap(),
                    ActionId::try_from("view").unwrap(),
                    ResourceId::try_from("invoices").unwrap(),
                ),
            ))
            .unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        }
        assert_eq!(engine.fence.tracked(), (0, 0));

        block_on(engine.patch_permissions(
            org(),
            finance(),
            PermissionPatchRequest {
                added_permissions: vec![permission("invoices:view")],
                removed_permissions: Vec::new(),
            },
        ))
        .unwrap();
        assert_eq!(engine.fence.tracked(), (1, 0));
    }

    #[test]
    fn patch_permissions_should_reject_undeclared_pair_without_writing() {
        let store = seeded();
        let engine = EngineBuilder::new(store.clone()).build();

        let err = block_on(engine.patch_permissions(
            org(),
            finance(),
            PermissionPatchRequest {
                added_permissions: vec![permission("invoices:view"), permission("invoices:delete")],
                removed_permissions: Vec::new(),
            },
        ))
        .expect_err("must fail");

        assert!(matches!(&err, Error::InvalidInput(message) if message.contains("invoices:delete")));
        let role = block_on(store.role(org(), finance())).unwrap().unwrap();
        assert!(role.permissions.is_empty());
    }

    #[test]
    fn patch_permissions_should_report_missing_role() {
        let engine = EngineBuilder::new(seeded()).build();

        let err = block_on(engine.patch_permissions(
            org(),
            RoleId::try_from("payroll").unwrap(),
            PermissionPatchRequest::default(),
        ))
        .expect_err("must fail");

        assert!(matches!(err, Error::NotFound { kind: "role", .. }));
    }

    #[test]
    fn update_role_should_reject_unknown_user() {
        let store = seeded();
        let engine = EngineBuilder::new(store.clone()).build();

        let err = block_on(engine.update_role(
            org(),
            finance(),
            RoleUpdateRequest {
                added_users: vec![
                    UserId::try_from("u-alice").unwrap(),
                    UserId::try_from("u-mallory").unwrap(),
                ],
                ..RoleUpdateRequest::default()
            },
        ))
        .expect_err("must fail");

        assert!(matches!(&err, Error::InvalidInput(message) if message.contains("u-mallory")));
        let role = block_on(store.role(org(), finance())).unwrap().unwrap();
        assert!(role.users.is_empty());
    }

    #[test]
    fn update_role_should_write_both_sides_and_rename() {
        let store = seeded();
        let engine = EngineBuilder::new(store.clone()).build();

        block_on(engine.update_role(
            org(),
            finance(),
            RoleUpdateRequest {
                display_name: Some("Finance team".to_string()),
                added_users: vec![
                    UserId::try_from("u-alice").unwrap(),
                    UserId::try_from("u-alice").unwrap(),
                ],
                added_groups: vec![GroupId::try_from("auditors").unwrap()],
                ..RoleUpdateRequest::default()
            },
        ))
        .unwrap();

        let role = block_on(store.role(org(), finance())).unwrap().unwrap();
        assert_eq!(role.display_name, "Finance team");
        assert_eq!(role.users.len(), 1);
        assert!(role.groups.contains(&GroupId::try_from("auditors").unwrap()));
        let alice = block_on(store.user(org(), UserId::try_from("u-alice").unwrap()))
            .unwrap()
            .unwrap();
        assert!(alice.roles.contains(&finance()));
        let auditors = block_on(store.group(org(), GroupId::try_from("auditors").unwrap()))
            .unwrap()
            .unwrap();
        assert!(auditors.roles.contains(&finance()));
    }

    #[test]
    fn tuple_should_be_found_by_either_subject_form() {
        let engine = EngineBuilder::new(seeded()).build();
        let by_name = TupleRequest::new(
            SubjectRef::username("bob").unwrap(),
            ActionId::try_from("view").unwrap(),
            ResourceId::try_from("invoices").unwrap(),
        );
        let by_id = TupleRequest {
            subject: SubjectRef::id("u-bob").unwrap(),
            ..by_name.clone()
        };

        let tuple = block_on(engine.create_tuple(org(), by_name.clone())).unwrap();
        assert_eq!(tuple.subject, UserId::try_from("u-bob").unwrap());

        assert!(block_on(engine.check_tuple(org(), by_id.clone(), true)).unwrap());
        assert!(!block_on(engine.check_tuple(org(), by_id.clone(), false)).unwrap());
        assert!(matches!(
            block_on(engine.create_tuple(org(), by_id.clone())),
            Err(Error::AlreadyExists(_))
        ));

        block_on(engine.delete_tuple(org(), by_name.clone())).unwrap();
        assert!(block_on(engine.check_tuple(org(), by_id, false)).unwrap());
        assert!(matches!(
            block_on(engine.delete_tuple(org(), by_name)),
            Err(Error::NotFound { kind: "tuple", .. })
        ));
    }

    #[test]
    fn create_tuple_should_reject_undeclared_pair_and_unknown_subject() {
        let engine = EngineBuilder::new(seeded()).build();

        let undeclared = block_on(engine.create_tuple(
            org(),
            TupleRequest::new(
                SubjectRef::username("bob").unwrap(),
                ActionId::try_from("archive").unwrap(),
                ResourceId::try_from("invoices").unwrap(),
            ),
        ));
        let unknown = block_on(engine.create_tuple(
            org(),
            TupleRequest::new(
                SubjectRef::username("mallory").unwrap(),
                ActionId::try_from("view").unwrap(),
                ResourceId::try_from("invoices").unwrap(),
            ),
        ));

        assert!(matches!(undeclared, Err(Error::InvalidInput(_))));
        assert!(matches!(unknown, Err(Error::NotFound { kind: "subject", .. })));
    }

    #[test]
    fn dedup_should_keep_first_accepted_occurrence() {
        let kept = dedup(vec![3, 1, 3, 2, 1], |item| *item != 2);
        assert_eq!(kept, vec![3, 1]);
    }
}

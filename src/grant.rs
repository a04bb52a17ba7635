//! Grant sources evaluated by the engine.
//!
//! A decision is the OR of every installed source. Each source also answers
//! the two reverse queries so listings stay consistent with point checks.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::pin;

use async_trait::async_trait;
use futures::future::{Either, select, try_join_all};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::Tuple;
use crate::store::Store;
use crate::subject::ResolvedSubject;
use crate::types::{ActionId, GroupId, OrgId, ResourceId, UserId};

/// Source of grants consulted by `Engine::check` and the reverse queries.
#[async_trait]
pub trait GrantSource<S>: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns whether this source grants `(action, resource)` to `subject`.
    async fn allows(
        &self,
        store: &S,
        org: &OrgId,
        subject: &ResolvedSubject,
        action: &ActionId,
        resource: &ResourceId,
    ) -> Result<bool>;

    /// Returns resources this source lets `subject` act on with `action`.
    async fn objects(
        &self,
        store: &S,
        org: &OrgId,
        subject: &ResolvedSubject,
        action: &ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<ResourceId>>;

    /// Returns users this source lets act on `resource` with `action`.
    async fn subjects(
        &self,
        store: &S,
        org: &OrgId,
        resource: &ResourceId,
        action: &ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<UserId>>;
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    Error: From<E>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let fut = pin!(fut);
    let cancelled = pin!(cancel.cancelled());
    match select(fut, cancelled).await {
        Either::Left((result, _)) => result.map_err(Error::from),
        Either::Right(((), _)) => Err(Error::Cancelled),
    }
}

/// Grants through role membership, direct or via a member group.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleGrants;

#[async_trait]
impl<S: Store> GrantSource<S> for RoleGrants {
    fn name(&self) -> &'static str {
        "roles"
    }

    async fn allows(
        &self,
        store: &S,
        org: &OrgId,
        subject: &ResolvedSubject,
        action: &ActionId,
        resource: &ResourceId,
    ) -> Result<bool> {
        let roles = store
            .roles_with_members(
                org.clone(),
                vec![subject.user.clone()],
                subject.groups.iter().cloned().collect(),
            )
            .await?;
        Ok(roles.iter().any(|role| role.grants(action, resource)))
    }

    async fn objects(
        &self,
        store: &S,
        org: &OrgId,
        subject: &ResolvedSubject,
        action: &ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<ResourceId>> {
        let roles = cancellable(
            cancel,
            store.roles_with_members(
                org.clone(),
                vec![subject.user.clone()],
                subject.groups.iter().cloned().collect(),
            ),
        )
        .await?;
        Ok(roles
            .iter()
            .flat_map(|role| role.permissions.iter())
            .filter(|permission| permission.has_action(action))
            .map(|permission| permission.resource.clone())
            .collect())
    }

    async fn subjects(
        &self,
        store: &S,
        org: &OrgId,
        resource: &ResourceId,
        action: &ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<UserId>> {
        let roles = cancellable(
            cancel,
            store.roles_granting(org.clone(), action.clone(), resource.clone()),
        )
        .await?;

        let mut users: HashSet<UserId> = roles
            .iter()
            .flat_map(|role| role.users.iter().cloned())
            .collect();
        let groups: BTreeSet<GroupId> = roles
            .iter()
            .flat_map(|role| role.groups.iter().cloned())
            .collect();

        let members = try_join_all(
            groups
                .into_iter()
                .map(|group| cancellable(cancel, store.group(org.clone(), group))),
        )
        .await?;
        users.extend(members.into_iter().flatten().flat_map(|group| group.users));
        Ok(users)
    }
}

/// Grants through explicit relation tuples. Matches the subject's own user id
/// only; tuples are not expanded through groups or roles.
#[derive(Debug, Default, Clone, Copy)]
pub struct TupleGrants;

#[async_trait]
impl<S: Store> GrantSource<S> for TupleGrants {
    fn name(&self) -> &'static str {
        "tuples"
    }

    async fn allows(
        &self,
        store: &S,
        org: &OrgId,
        subject: &ResolvedSubject,
        action: &ActionId,
        resource: &ResourceId,
    ) -> Result<bool> {
        let tuple = Tuple::new(subject.user.clone(), action.clone(), resource.clone());
        Ok(store.tuple_exists(org.clone(), tuple).await?)
    }

    async fn objects(
        &self,
        store: &S,
        org: &OrgId,
        subject: &ResolvedSubject,
        action: &ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<ResourceId>> {
        let tuples = cancellable(
            cancel,
            store.tuples_for_subject(org.clone(), subject.user.clone(), action.clone()),
        )
        .await?;
        Ok(tuples.into_iter().map(|tuple| tuple.resource).collect())
    }

    async fn subjects(
        &self,
        store: &S,
        org: &OrgId,
        resource: &ResourceId,
        action: &ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<UserId>> {
        let tuples = cancellable(
            cancel,
            store.tuples_for_object(org.clone(), resource.clone(), action.clone()),
        )
        .await?;
        Ok(tuples.into_iter().map(|tuple| tuple.subject).collect())
    }
}

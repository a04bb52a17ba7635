use crate::cache::{Cache, CacheKey, CachedValue, NoCache};
use crate::error::{Error, Result};
use crate::fence::{FenceToken, MutationFence};
use crate::grant::{GrantSource, RoleGrants, TupleGrants, cancellable};
use crate::model::{Organization, Resource, Tuple};
use crate::request::{
    CheckActionsRequest, CheckRequest, CheckRequestAll, CheckRequestWithPermissions, TupleRequest,
};
use crate::store::Store;
use crate::subject::{ResolvedSubject, resolve_subject};
use crate::types::{ActionId, OrgId, ResourceId, SubjectRef, UserId};
use futures::future::try_join_all;
use futures::try_join;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Authorization engine with pluggable store, cache and grant sources.
///
/// Decisions are deny-by-default: a subject is allowed only if at least one
/// installed [`GrantSource`] grants the pair.
pub struct Engine<S, C = NoCache> {
    pub(crate) store: S,
    pub(crate) cache: C,
    pub(crate) sources: Vec<Arc<dyn GrantSource<S>>>,
    pub(crate) fence: MutationFence,
    pub(crate) cache_listings: bool,
}

impl<S: fmt::Debug, C: fmt::Debug> fmt::Debug for Engine<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("cache", &self.cache)
            .field(
                "sources",
                &self.sources.iter().map(|source| source.name()).collect::<Vec<_>>(),
            )
            .field("cache_listings", &self.cache_listings)
            .finish()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S, C = NoCache> {
    store: S,
    cache: C,
    extra_sources: Vec<Arc<dyn GrantSource<S>>>,
    tuple_grants: bool,
    cache_listings: bool,
}

impl<S> EngineBuilder<S, NoCache> {
    /// Creates a new builder with default configuration.
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: NoCache,
            extra_sources: Vec::new(),
            tuple_grants: true,
            cache_listings: true,
        }
    }
}

impl<S, C> EngineBuilder<S, C> {
    /// Sets the cache implementation.
    pub fn cache<C2: Cache>(self, cache: C2) -> EngineBuilder<S, C2> {
        EngineBuilder {
            store: self.store,
            cache,
            extra_sources: self.extra_sources,
            tuple_grants: self.tuple_grants,
            cache_listings: self.cache_listings,
        }
    }

    /// Appends a grant source evaluated after the built-in ones.
    pub fn grant_source(mut self, source: impl GrantSource<S> + 'static) -> Self {
        self.extra_sources.push(Arc::new(source));
        self
    }

    /// Enables or disables relation tuples as a grant source.
    pub fn tuple_grants(mut self, on: bool) -> Self {
        self.tuple_grants = on;
        self
    }

    /// Enables or disables memoization of reverse listings.
    pub fn cache_listings(mut self, on: bool) -> Self {
        self.cache_listings = on;
        self
    }
}

impl<S: Store + 'static, C> EngineBuilder<S, C> {
    /// Builds the engine.
    pub fn build(self) -> Engine<S, C> {
        let mut sources: Vec<Arc<dyn GrantSource<S>>> = vec![Arc::new(RoleGrants)];
        if self.tuple_grants {
            sources.push(Arc::new(TupleGrants));
        }
        sources.extend(self.extra_sources);

        Engine {
            store: self.store,
            cache: self.cache,
            sources,
            fence: MutationFence::default(),
            cache_listings: self.cache_listings,
        }
    }
}

pub(crate) fn log_failure(error: &Error) {
    if let Error::Store(source) = error {
        tracing::error!(error = %source, "store call failed");
    }
}

impl<S, C> Engine<S, C>
where
    S: Store,
    C: Cache,
{
    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the configured cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Decides whether `subject` may perform `action` on `resource`.
    ///
    /// Fails with [`Error::InvalidInput`] if the action is not declared on the
    /// resource and [`Error::NotFound`] if the organization or subject is
    /// absent.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %subject, action = %action, resource = %resource))]
    pub async fn check(
        &self,
        org: OrgId,
        subject: SubjectRef,
        action: ActionId,
        resource: ResourceId,
    ) -> Result<bool> {
        let token = self.fence.token(&org);
        let (_, _, resolved) = try_join!(
            self.ensure_organization(&org),
            self.ensure_declared(&org, &action, &resource),
            self.resolve(&org, &subject),
        )
        .inspect_err(log_failure)?;
        self.decide(&org, token, &resolved, &action, &resource)
            .await
            .inspect_err(log_failure)
    }

    /// Checks several actions against one resource. Results keep the order
    /// of `request.actions`.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %request.subject, resource = %request.resource))]
    pub async fn check_permissions(
        &self,
        org: OrgId,
        request: CheckRequestWithPermissions,
    ) -> Result<Vec<(ActionId, bool)>> {
        let token = self.fence.token(&org);
        let (_, resolved) = try_join!(
            self.ensure_organization(&org),
            self.resolve(&org, &request.subject),
        )
        .inspect_err(log_failure)?;

        let decisions = try_join_all(
            request
                .actions
                .iter()
                .map(|action| self.check_resolved(&org, token, &resolved, action, &request.resource)),
        )
        .await
        .inspect_err(log_failure)?;
        Ok(request.actions.into_iter().zip(decisions).collect())
    }

    /// Checks independent `(action, resource)` pairs in parallel.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %request.subject, pairs = request.permissions.len()))]
    pub async fn check_all(&self, org: OrgId, request: CheckRequestAll) -> Result<Vec<bool>> {
        let token = self.fence.token(&org);
        let (_, resolved) = try_join!(
            self.ensure_organization(&org),
            self.resolve(&org, &request.subject),
        )
        .inspect_err(log_failure)?;

        try_join_all(request.permissions.iter().map(|permission| {
            self.check_resolved(&org, token, &resolved, &permission.action, &permission.resource)
        }))
        .await
        .inspect_err(log_failure)
    }

    /// Returns the declared actions of a resource that the subject may
    /// perform, in declaration order.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %request.subject, resource = %request.resource))]
    pub async fn check_actions(
        &self,
        org: OrgId,
        request: CheckActionsRequest,
    ) -> Result<Vec<ActionId>> {
        let token = self.fence.token(&org);
        let (_, resource, resolved) = try_join!(
            self.ensure_organization(&org),
            self.ensure_resource(&org, &request.resource),
            self.resolve(&org, &request.subject),
        )
        .inspect_err(log_failure)?;

        let decisions = try_join_all(
            resource
                .actions
                .iter()
                .map(|action| self.decide(&org, token, &resolved, &action.id, &resource.id)),
        )
        .await
        .inspect_err(log_failure)?;

        Ok(resource
            .actions
            .into_iter()
            .zip(decisions)
            .filter_map(|(action, allowed)| allowed.then_some(action.id))
            .collect())
    }

    /// Resolves a machine-caller API key to its organization.
    pub async fn organization_for_api_key(&self, api_key: &str) -> Result<OrgId> {
        if api_key.is_empty() {
            tracing::warn!("machine caller sent no api key");
            return Err(Error::Unauthorized);
        }
        let org = self
            .store
            .organization_by_api_key(api_key.to_string())
            .await
            .map_err(Error::from)
            .inspect_err(log_failure)?;
        org.ok_or_else(|| {
            tracing::warn!("machine caller sent an unknown api key");
            Error::Unauthorized
        })
    }

    /// Single check on the machine channel.
    ///
    /// `api_key` must belong to `org`; a missing organization or a key
    /// mismatch both yield [`Error::Unauthorized`].
    #[tracing::instrument(skip_all, fields(org = %org))]
    pub async fn check_by_api_key(
        &self,
        org: OrgId,
        api_key: &str,
        request: CheckRequest,
    ) -> Result<bool> {
        let organization = self
            .store
            .organization(org.clone())
            .await
            .map_err(Error::from)
            .inspect_err(log_failure)?;
        match organization {
            Some(organization) if !api_key.is_empty() && organization.api_key == api_key => {}
            _ => {
                tracing::warn!("machine caller rejected");
                return Err(Error::Unauthorized);
            }
        }
        self.check(org, request.subject, request.action, request.resource)
            .await
    }

    /// Returns resources the subject may act on with `action`.
    pub async fn objects_for_subject(
        &self,
        org: OrgId,
        subject: SubjectRef,
        action: ActionId,
    ) -> Result<HashSet<ResourceId>> {
        self.objects_for_subject_with_cancel(org, subject, action, &CancellationToken::new())
            .await
    }

    /// Like [`Engine::objects_for_subject`], failing with
    /// [`Error::Cancelled`] once `cancel` fires.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %subject, action = %action))]
    pub async fn objects_for_subject_with_cancel(
        &self,
        org: OrgId,
        subject: SubjectRef,
        action: ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<ResourceId>> {
        let token = self.fence.token(&org);
        let (_, resolved) = try_join!(
            cancellable(cancel, self.ensure_organization(&org)),
            cancellable(cancel, self.resolve(&org, &subject)),
        )
        .inspect_err(log_failure)?;

        let key = CacheKey::objects(&org, &resolved.user, &action);
        if self.cache_listings
            && let Some(CachedValue::Objects(resources)) = self.cache.get(&key).await
        {
            tracing::trace!("objects listing cache hit");
            return Ok(resources);
        }

        let parts = try_join_all(
            self.sources
                .iter()
                .map(|source| source.objects(&self.store, &org, &resolved, &action, cancel)),
        )
        .await
        .inspect_err(log_failure)?;
        let resources: HashSet<ResourceId> = parts.into_iter().flatten().collect();

        if self.cache_listings {
            self.populate(&org, token, key, CachedValue::Objects(resources.clone()))
                .await;
        }
        Ok(resources)
    }

    /// Returns users that may act on `resource` with `action`.
    pub async fn subjects_for_object(
        &self,
        org: OrgId,
        resource: ResourceId,
        action: ActionId,
    ) -> Result<HashSet<UserId>> {
        self.subjects_for_object_with_cancel(org, resource, action, &CancellationToken::new())
            .await
    }

    /// Like [`Engine::subjects_for_object`], failing with
    /// [`Error::Cancelled`] once `cancel` fires.
    #[tracing::instrument(skip_all, fields(org = %org, resource = %resource, action = %action))]
    pub async fn subjects_for_object_with_cancel(
        &self,
        org: OrgId,
        resource: ResourceId,
        action: ActionId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<UserId>> {
        let token = self.fence.token(&org);
        try_join!(
            cancellable(cancel, self.ensure_organization(&org)),
            cancellable(cancel, self.ensure_declared(&org, &action, &resource)),
        )
        .inspect_err(log_failure)?;

        let key = CacheKey::subjects(&org, &resource, &action);
        if self.cache_listings
            && let Some(CachedValue::Subjects(users)) = self.cache.get(&key).await
        {
            tracing::trace!("subjects listing cache hit");
            return Ok(users);
        }

        let parts = try_join_all(
            self.sources
                .iter()
                .map(|source| source.subjects(&self.store, &org, &resource, &action, cancel)),
        )
        .await
        .inspect_err(log_failure)?;
        let users: HashSet<UserId> = parts.into_iter().flatten().collect();

        if self.cache_listings {
            self.populate(&org, token, key, CachedValue::Subjects(users.clone()))
                .await;
        }
        Ok(users)
    }

    /// Tests for an explicit tuple. With `exists == false` the answer is
    /// negated.
    #[tracing::instrument(skip_all, fields(org = %org, subject = %request.subject))]
    pub async fn check_tuple(&self, org: OrgId, request: TupleRequest, exists: bool) -> Result<bool> {
        let (_, resolved) = try_join!(
            self.ensure_organization(&org),
            self.resolve(&org, &request.subject),
        )
        .inspect_err(log_failure)?;

        let tuple = Tuple::new(resolved.user, request.action, request.resource);
        let found = self
            .store
            .tuple_exists(org, tuple)
            .await
            .map_err(Error::from)
            .inspect_err(log_failure)?;
        Ok(found == exists)
    }

    /// Drops every cached entry of an organization.
    ///
    /// Call this after store-side changes that bypass the engine, such as
    /// deleting a resource, role or group.
    #[tracing::instrument(skip_all, fields(org = %org))]
    pub async fn invalidate_organization(&self, org: &OrgId) -> Result<()> {
        self.ensure_organization(org).await.inspect_err(log_failure)?;
        let _guard = self.fence.enter(org);
        self.cache.invalidate_organization(org).await;
        Ok(())
    }

    pub(crate) async fn ensure_organization(&self, org: &OrgId) -> Result<Organization> {
        self.store
            .organization(org.clone())
            .await?
            .ok_or_else(|| Error::not_found("organization", org))
    }

    pub(crate) async fn ensure_resource(&self, org: &OrgId, resource: &ResourceId) -> Result<Resource> {
        self.store
            .resource(org.clone(), resource.clone())
            .await?
            .ok_or_else(|| Error::not_found("resource", resource))
    }

    pub(crate) async fn ensure_declared(
        &self,
        org: &OrgId,
        action: &ActionId,
        resource: &ResourceId,
    ) -> Result<()> {
        if self
            .store
            .action_declared(org.clone(), resource.clone(), action.clone())
            .await?
        {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "action {action} is not declared on resource {resource}"
            )))
        }
    }

    pub(crate) async fn resolve(&self, org: &OrgId, subject: &SubjectRef) -> Result<ResolvedSubject> {
        resolve_subject(&self.store, org, subject).await
    }

    async fn check_resolved(
        &self,
        org: &OrgId,
        token: FenceToken,
        subject: &ResolvedSubject,
        action: &ActionId,
        resource: &ResourceId,
    ) -> Result<bool> {
        self.ensure_declared(org, action, resource).await?;
        self.decide(org, token, subject, action, resource).await
    }

    /// Cached decision for an already validated pair. `token` must be taken
    /// before `subject` was resolved.
    async fn decide(
        &self,
        org: &OrgId,
        token: FenceToken,
        subject: &ResolvedSubject,
        action: &ActionId,
        resource: &ResourceId,
    ) -> Result<bool> {
        let key = CacheKey::decision(org, &subject.user, action, resource);
        if let Some(CachedValue::Decision(allowed)) = self.cache.get(&key).await {
            tracing::trace!(user = %subject.user, %action, %resource, allowed, "decision cache hit");
            return Ok(allowed);
        }

        let grants = try_join_all(
            self.sources
                .iter()
                .map(|source| source.allows(&self.store, org, subject, action, resource)),
        )
        .await?;
        let allowed = grants.into_iter().any(|granted| granted);
        tracing::debug!(user = %subject.user, %action, %resource, allowed, "decision computed");

        self.populate(org, token, key, CachedValue::Decision(allowed))
            .await;
        Ok(allowed)
    }

    /// Writes a computed value, then evicts it again if a mutation raced the
    /// computation.
    async fn populate(&self, org: &OrgId, token: FenceToken, key: CacheKey, value: CachedValue) {
        self.cache.set(key.clone(), value).await;
        if self.fence.is_stale(org, token) {
            tracing::debug!("discarding result computed across a mutation");
            self.cache.remove(&key).await;
        }
    }
}

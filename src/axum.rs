//! Axum integration utilities.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::engine::Engine;
use crate::error::{Error, ErrorKind};
use crate::permission::Permission;
use crate::types::{OrgId, SubjectRef};

use ::axum::body::Body;
use ::axum::http::{Request, StatusCode};
use ::axum::response::{IntoResponse, Response};
use ::tower::{Layer, Service};

/// Header carrying a machine caller's API key. Header names are
/// case-insensitive, so this matches `API_KEY`.
pub const API_KEY_HEADER: &str = "api_key";

/// Caller identity attached to a request by an upstream authentication step.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Organization the request acts within.
    pub org: OrgId,
    /// Acting subject.
    pub subject: SubjectRef,
}

impl AuthContext {
    pub fn new(org: OrgId, subject: SubjectRef) -> Self {
        Self { org, subject }
    }
}

/// Organization authenticated through [`ApiKeyLayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineContext {
    pub org: OrgId,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if self.kind() == ErrorKind::Internal {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.public_message()).into_response()
    }
}

/// Middleware layer that authorizes a request using [`Engine`].
#[derive(Debug, Clone)]
pub struct AuthorizeLayer<S, C> {
    engine: Arc<Engine<S, C>>,
    permission: Permission,
}

impl<S, C> AuthorizeLayer<S, C> {
    /// Creates a layer enforcing `permission` on every request.
    pub fn new(engine: Arc<Engine<S, C>>, permission: Permission) -> Self {
        Self { engine, permission }
    }
}

impl<S, C, Inner> Layer<Inner> for AuthorizeLayer<S, C>
where
    S: crate::store::Store,
    C: crate::cache::Cache,
{
    type Service = AuthorizeService<Inner, S, C>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AuthorizeService {
            inner,
            engine: self.engine.clone(),
            permission: self.permission.clone(),
        }
    }
}

/// Middleware service that enforces a fixed `(action, resource)` pair.
#[derive(Debug, Clone)]
pub struct AuthorizeService<Inner, S, C> {
    inner: Inner,
    engine: Arc<Engine<S, C>>,
    permission: Permission,
}

impl<Inner, S, C> Service<Request<Body>> for AuthorizeService<Inner, S, C>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: crate::store::Store + 'static,
    C: crate::cache::Cache + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let engine = self.engine.clone();
        let permission = self.permission.clone();

        Box::pin(async move {
            let context = req.extensions().get::<AuthContext>().cloned();
            let Some(context) = context else {
                return Ok((StatusCode::UNAUTHORIZED, "missing auth context").into_response());
            };

            match engine
                .check(
                    context.org,
                    context.subject,
                    permission.action,
                    permission.resource,
                )
                .await
            {
                Ok(true) => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Ok(false) => Ok((StatusCode::FORBIDDEN, "forbidden").into_response()),
                Err(err) => Ok(err.into_response()),
            }
        })
    }
}

/// Middleware layer authenticating machine callers by API key.
///
/// On success the resolved organization is attached as a
/// [`MachineContext`] extension.
#[derive(Debug, Clone)]
pub struct ApiKeyLayer<S, C> {
    engine: Arc<Engine<S, C>>,
}

impl<S, C> ApiKeyLayer<S, C> {
    pub fn new(engine: Arc<Engine<S, C>>) -> Self {
        Self { engine }
    }
}

impl<S, C, Inner> Layer<Inner> for ApiKeyLayer<S, C>
where
    S: crate::store::Store,
    C: crate::cache::Cache,
{
    type Service = ApiKeyService<Inner, S, C>;

    fn layer(&self, inner: Inner) -> Self::Service {
        ApiKeyService {
            inner,
            engine: self.engine.clone(),
        }
    }
}

/// Middleware service that resolves the `API_KEY` header.
#[derive(Debug, Clone)]
pub struct ApiKeyService<Inner, S, C> {
    inner: Inner,
    engine: Arc<Engine<S, C>>,
}

impl<Inner, S, C> Service<Request<Body>> for ApiKeyService<Inner, S, C>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: crate::store::Store + 'static,
    C: crate::cache::Cache + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let engine = self.engine.clone();

        Box::pin(async move {
            let api_key = req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();

            match engine.organization_for_api_key(&api_key).await {
                Ok(org) => {
                    req.extensions_mut().insert(MachineContext { org });
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(err) => Ok(err.into_response()),
            }
        })
    }
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::memory_store::MemoryStore;
    use crate::model::{Action, Organization, Resource, User};
    use crate::request::{PermissionPatchRequest, RoleUpdateRequest};
    use crate::types::{ActionId, ResourceId, RoleId, UserId, Username};
    use futures::executor::block_on;
    use std::convert::Infallible;
    use std::future::{Ready, ready};

    #[derive(Clone)]
    struct Echo;

    impl Service<Request<Body>> for Echo {
        type Response = Response;
        type Error = Infallible;
        type Future = Ready<Result<Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Body>) -> Self::Future {
            let body = req
                .extensions()
                .get::<MachineContext>()
                .map(|context| context.org.to_string())
                .unwrap_or_default();
            ready(Ok((StatusCode::OK, body).into_response()))
        }
    }

    fn engine() -> Arc<Engine<MemoryStore>> {
        let org = OrgId::try_from("acme").unwrap();
        let store = MemoryStore::new();
        store
            .create_organization(Organization::new(org.clone(), "Acme", "acme-key"))
            .unwrap();
        store
            .create_resource(
                &org,
                Resource::new(ResourceId::try_from("invoices").unwrap(), "Invoices")
                    .with_action(Action::new(ActionId::try_from("approve").unwrap(), "Approve")),
            )
            .unwrap();
        for (id, name) in [("u-alice", "alice"), ("u-bob", "bob")] {
            store
                .create_user(
                    &org,
                    User::new(UserId::try_from(id).unwrap(), Username::try_from(name).unwrap()),
                )
                .unwrap();
        }
        store
            .create_role(&org, RoleId::try_from("finance").unwrap(), "Finance")
            .unwrap();
        let engine = EngineBuilder::new(store).build();
        block_on(engine.patch_permissions(
            org.clone(),
            RoleId::try_from("finance").unwrap(),
            PermissionPatchRequest {
                added_permissions: vec![Permission::parse("invoices:approve").unwrap()],
                removed_permissions: Vec::new(),
            },
        ))
        .unwrap();
        block_on(engine.update_role(
            org,
            RoleId::try_from("finance").unwrap(),
            RoleUpdateRequest {
                added_users: vec![UserId::try_from("u-alice").unwrap()],
                ..RoleUpdateRequest::default()
            },
        ))
        .unwrap();
        Arc::new(engine)
    }

    fn request_as(subject: &str) -> Request<Body> {
        let mut req = Request::new(Body::empty());
        req.extensions_mut().insert(AuthContext::new(
            OrgId::try_from("acme").unwrap(),
            SubjectRef::username(subject).unwrap(),
        ));
        req
    }

    #[test]
    fn authorize_should_pass_granted_subject_through() {
        let mut service = AuthorizeLayer::new(engine(), Permission::parse("invoices:approve").unwrap())
            .layer(Echo);

        let response = block_on(service.call(request_as("alice"))).unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn authorize_should_forbid_subject_without_grant() {
        let mut service = AuthorizeLayer::new(engine(), Permission::parse("invoices:approve").unwrap())
            .layer(Echo);

        let response = block_on(service.call(request_as("bob"))).unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn missing_auth_context_should_be_unauthorized() {
        let mut service = AuthorizeLayer::new(engine(), Permission::parse("invoices:approve").unwrap())
            .layer(Echo);

        let response = block_on(service.call(Request::new(Body::empty()))).unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn authorize_should_map_unknown_subject_to_internal_error() {
        let mut service = AuthorizeLayer::new(engine(), Permission::parse("invoices:approve").unwrap())
            .layer(Echo);

        let response = block_on(service.call(request_as("mallory"))).unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn authorize_should_map_undeclared_pair_to_bad_request() {
        let mut service = AuthorizeLayer::new(engine(), Permission::parse("invoices:delete").unwrap())
            .layer(Echo);

        let response = block_on(service.call(request_as("alice"))).unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn api_key_should_attach_machine_context() {
        let mut service = ApiKeyLayer::new(engine()).layer(Echo);
        let req = Request::builder()
            .header("API_KEY", "acme-key")
            .body(Body::empty())
            .unwrap();

        let response = block_on(service.call(req)).unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn wrong_api_key_should_be_forbidden() {
        let mut service = ApiKeyLayer::new(engine()).layer(Echo);
        let wrong = Request::builder()
            .header("API_KEY", "nope")
            .body(Body::empty())
            .unwrap();
        let missing = Request::new(Body::empty());

        assert_eq!(
            block_on(service.call(wrong)).unwrap().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            block_on(service.call(missing)).unwrap().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn store_error_response_should_hide_backend_text() {
        let response = Error::from(crate::error::StoreError::from("pg: relation users missing"))
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
